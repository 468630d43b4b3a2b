//! CDR Sync Storage Layer
//!
//! This crate provides the record stores the sync pipeline writes to:
//!
//! - PostgreSQL connection pool management and embedded migrations (sqlx)
//! - `PgRecordStore`, the durable CDR table plus sync log ledger
//! - `MemoryRecordStore`, a process-local store with the same semantics

pub mod memory;
pub mod pool;
pub mod repositories;

pub use memory::MemoryRecordStore;
pub use pool::{create_pool, run_migrations};
pub use repositories::*;

// Re-export commonly used types
pub use cdrsync_core::{AppError, AppResult};
pub use sqlx::PgPool;
