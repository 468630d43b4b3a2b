//! CDR Sync Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the CDR sync pipeline. It includes:
//!
//! - Domain models (CdrRecord, RawCdr, SyncLogEntry, etc.)
//! - Repository and fetcher traits the pipeline is written against
//! - Unified error handling
//! - Application configuration
//! - Calendar-day helpers for the configured PBX timezone

pub mod config;
pub mod error;
pub mod models;
pub mod time;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
