//! Repository implementations
//!
//! `PgRecordStore` implements both repository traits defined in
//! cdrsync-core, using sqlx for PostgreSQL access. Record and ledger
//! operations live in separate modules.

pub mod cdr_repo;
pub mod pg_store;
pub mod sync_log_repo;

pub use pg_store::PgRecordStore;
