//! Domain models for CDR sync
//!
//! This module contains all the core domain models used throughout the pipeline.

pub mod cdr;
pub mod sync_log;

pub use cdr::{CallDirection, CdrRecord, RawCdr, RecordStats, UpsertSummary};
pub use sync_log::{SyncLogEntry, SyncProgress, SyncStatus, SyncType};
