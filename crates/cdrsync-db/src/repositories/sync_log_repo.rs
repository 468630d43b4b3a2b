//! Sync log repository implementation
//!
//! The ledger is append-mostly: new rows per attempt plus single-row
//! updates keyed by id.

use super::pg_store::{to_i64, PgRecordStore};
use cdrsync_core::{
    models::{SyncLogEntry, SyncProgress, SyncStatus, SyncType},
    traits::SyncLogRepository,
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, error, instrument};

const SYNC_LOG_SELECT_COLUMNS: &str = r#"
    id, sync_type, status,
    date_from, date_to,
    start_time, end_time,
    total_records, success_count, failed_count,
    retry_count, error_message,
    created_at, updated_at
"#;

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| {
        error!("Database error: {}: {}", context, e);
        AppError::Database(format!("{}: {}", context, e))
    }
}

impl PgRecordStore {
    async fn fetch_sync_logs(&self, query: &str, binds: &[i64]) -> AppResult<Vec<SyncLogEntry>> {
        let mut q = sqlx::query_as::<sqlx::Postgres, SyncLogRow>(query);
        for value in binds {
            q = q.bind(*value);
        }

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to fetch sync logs"))?;

        rows.into_iter().map(SyncLogEntry::try_from).collect()
    }
}

#[async_trait]
impl SyncLogRepository for PgRecordStore {
    #[instrument(skip(self))]
    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> AppResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO cdr_sync_logs (sync_type, status, date_from, date_to, start_time)
            VALUES ($1, 'running', $2, $3, NOW())
            RETURNING id
            "#,
        )
        .bind(sync_type.as_str())
        .bind(date_from)
        .bind(date_to)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create sync log"))?;

        debug!("Created sync log {} ({})", id, sync_type);

        Ok(id)
    }

    #[instrument(skip(self, progress), fields(status = %progress.status))]
    async fn update_sync_log(&self, id: i64, progress: &SyncProgress) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE cdr_sync_logs
            SET status = $2,
                total_records = $3,
                success_count = $4,
                failed_count = $5,
                error_message = $6,
                end_time = CASE WHEN $7 THEN NOW() ELSE end_time END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(progress.status.as_str())
        .bind(to_i64(progress.total_records))
        .bind(to_i64(progress.success_count))
        .bind(to_i64(progress.failed_count))
        .bind(&progress.error_message)
        .bind(progress.status.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to update sync log"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("sync log {}", id)));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_retry_count(&self, id: i64) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE cdr_sync_logs
            SET retry_count = retry_count + 1,
                status = 'retrying',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to increment retry count"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("sync log {}", id)));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn settle_sync_log(&self, id: i64, status: SyncStatus) -> AppResult<()> {
        if !status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "cannot settle sync log {} to non-terminal status {}",
                id, status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE cdr_sync_logs
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'retrying'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to settle sync log"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("retrying sync log {}", id)));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_stale_retries(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cdr_sync_logs
            SET status = 'failed', updated_at = NOW()
            WHERE status = 'retrying' AND updated_at <= $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to release stale retries"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn failed_sync_logs(&self, max_retries: i32, limit: i64) -> AppResult<Vec<SyncLogEntry>> {
        let query = format!(
            r#"
            SELECT {} FROM cdr_sync_logs
            WHERE status IN ('failed', 'partial')
              AND retry_count < $1
              AND sync_type NOT IN ('retry', 'missing_check')
            ORDER BY id ASC
            LIMIT $2
            "#,
            SYNC_LOG_SELECT_COLUMNS
        );

        self.fetch_sync_logs(&query, &[i64::from(max_retries), limit])
            .await
    }

    #[instrument(skip(self))]
    async fn find_sync_log(&self, id: i64) -> AppResult<Option<SyncLogEntry>> {
        let query = format!(
            "SELECT {} FROM cdr_sync_logs WHERE id = $1",
            SYNC_LOG_SELECT_COLUMNS
        );

        Ok(self.fetch_sync_logs(&query, &[id]).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn recent_sync_logs(&self, limit: i64) -> AppResult<Vec<SyncLogEntry>> {
        let query = format!(
            "SELECT {} FROM cdr_sync_logs ORDER BY id DESC LIMIT $1",
            SYNC_LOG_SELECT_COLUMNS
        );

        self.fetch_sync_logs(&query, &[limit]).await
    }

    #[instrument(skip(self))]
    async fn last_sync_log(&self, sync_type: Option<SyncType>) -> AppResult<Option<SyncLogEntry>> {
        let row = match sync_type {
            Some(t) => {
                let query = format!(
                    "SELECT {} FROM cdr_sync_logs WHERE sync_type = $1 ORDER BY id DESC LIMIT 1",
                    SYNC_LOG_SELECT_COLUMNS
                );
                sqlx::query_as::<sqlx::Postgres, SyncLogRow>(&query)
                    .bind(t.as_str())
                    .fetch_optional(&self.pool)
                    .await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM cdr_sync_logs ORDER BY id DESC LIMIT 1",
                    SYNC_LOG_SELECT_COLUMNS
                );
                sqlx::query_as::<sqlx::Postgres, SyncLogRow>(&query)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(db_error("Failed to fetch last sync log"))?;

        row.map(SyncLogEntry::try_from).transpose()
    }
}

/// Helper struct for mapping database rows to domain model
#[derive(Debug, sqlx::FromRow)]
struct SyncLogRow {
    id: i64,
    sync_type: String,
    status: String,
    date_from: NaiveDate,
    date_to: NaiveDate,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    total_records: i64,
    success_count: i64,
    failed_count: i64,
    retry_count: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SyncLogRow> for SyncLogEntry {
    type Error = AppError;

    fn try_from(row: SyncLogRow) -> Result<Self, Self::Error> {
        let corrupt =
            |e: AppError| AppError::Database(format!("corrupt sync log {}: {}", row.id, e));

        Ok(Self {
            id: row.id,
            sync_type: row.sync_type.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            date_from: row.date_from,
            date_to: row.date_to,
            start_time: row.start_time,
            end_time: row.end_time,
            total_records: row.total_records,
            success_count: row.success_count,
            failed_count: row.failed_count,
            retry_count: row.retry_count,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
