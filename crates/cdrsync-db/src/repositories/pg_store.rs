//! PostgreSQL record store

use chrono_tz::Tz;
use sqlx::PgPool;

/// PostgreSQL implementation of `CdrRepository` and `SyncLogRepository`
///
/// Uses runtime queries (not compile-time macros) so building does not
/// require a live database.
#[derive(Clone)]
pub struct PgRecordStore {
    pub(crate) pool: PgPool,
    pub(crate) tz: Tz,
}

impl PgRecordStore {
    /// Create a new store; `tz` defines the local day used by
    /// `record_ids_for_date`
    pub fn new(pool: PgPool, tz: Tz) -> Self {
        Self { pool, tz }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Counters are unsigned in the domain and BIGINT in the schema
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
