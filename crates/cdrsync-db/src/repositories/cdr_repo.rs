//! CDR record repository implementation
//!
//! Records are upserted one statement at a time so a constraint violation
//! on one record leaves the rest of the batch untouched.

use super::pg_store::PgRecordStore;
use cdrsync_core::{
    models::{CallDirection, CdrRecord, RecordStats, UpsertSummary},
    time::day_bounds,
    traits::CdrRepository,
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, instrument, warn};

const CDR_SELECT_COLUMNS: &str = r#"
    uuid, direction,
    caller_number, outbound_caller_number, destination_number,
    start_epoch, answer_epoch, end_epoch,
    duration_seconds, billable_seconds,
    call_status, hangup_disposition, recording_path,
    raw_data
"#;

const CDR_UPSERT: &str = r#"
    INSERT INTO cdr_records (
        uuid, direction,
        caller_number, outbound_caller_number, destination_number,
        start_epoch, answer_epoch, end_epoch,
        duration_seconds, billable_seconds,
        call_status, hangup_disposition, recording_path,
        raw_data
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
    ON CONFLICT (uuid) DO UPDATE SET
        direction = EXCLUDED.direction,
        caller_number = EXCLUDED.caller_number,
        outbound_caller_number = EXCLUDED.outbound_caller_number,
        destination_number = EXCLUDED.destination_number,
        start_epoch = EXCLUDED.start_epoch,
        answer_epoch = EXCLUDED.answer_epoch,
        end_epoch = EXCLUDED.end_epoch,
        duration_seconds = EXCLUDED.duration_seconds,
        billable_seconds = EXCLUDED.billable_seconds,
        call_status = EXCLUDED.call_status,
        hangup_disposition = EXCLUDED.hangup_disposition,
        recording_path = EXCLUDED.recording_path,
        raw_data = EXCLUDED.raw_data,
        updated_at = NOW()
"#;

/// SQLSTATE classes caused by the row's own values: `22` data exception,
/// `23` integrity constraint violation. Anything else is the store failing.
fn is_record_rejection(code: Option<&str>) -> bool {
    matches!(code, Some(code) if code.starts_with("22") || code.starts_with("23"))
}

impl PgRecordStore {
    /// Upsert a single record. Rejections of this record alone come back as
    /// `RecordWrite`; any other error means the store itself is unavailable.
    async fn upsert_one(&self, record: &CdrRecord) -> AppResult<()> {
        record.check_invariants()?;

        let result = sqlx::query(CDR_UPSERT)
            .bind(&record.uuid)
            .bind(record.direction.as_str())
            .bind(&record.caller_number)
            .bind(&record.outbound_caller_number)
            .bind(&record.destination_number)
            .bind(record.start_epoch)
            .bind(record.answer_epoch)
            .bind(record.end_epoch)
            .bind(record.duration_seconds)
            .bind(record.billable_seconds)
            .bind(&record.call_status)
            .bind(&record.hangup_disposition)
            .bind(&record.recording_path)
            .bind(&record.raw)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if is_record_rejection(db_err.code().as_deref()) => {
                Err(AppError::RecordWrite {
                    uuid: record.uuid.clone(),
                    reason: db_err.to_string(),
                })
            }
            Err(e) => {
                error!("Database error upserting CDR {}: {}", record.uuid, e);
                Err(AppError::Database(format!("Failed to upsert CDR: {}", e)))
            }
        }
    }
}

#[async_trait]
impl CdrRepository for PgRecordStore {
    #[instrument(skip(self))]
    async fn exists(&self, uuid: &str) -> AppResult<bool> {
        let found: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM cdr_records WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error checking CDR {}: {}", uuid, e);
                AppError::Database(format!("Failed to check CDR: {}", e))
            })?;

        Ok(found.is_some())
    }

    #[instrument(skip(self))]
    async fn find_by_uuid(&self, uuid: &str) -> AppResult<Option<CdrRecord>> {
        debug!("Finding CDR by UUID: {}", uuid);

        let query = format!(
            "SELECT {} FROM cdr_records WHERE uuid = $1",
            CDR_SELECT_COLUMNS
        );

        let row = sqlx::query_as::<sqlx::Postgres, CdrRow>(&query)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Database error finding CDR by UUID: {}", e);
                AppError::Database(format!("Failed to find CDR: {}", e))
            })?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_batch(&self, records: &[CdrRecord]) -> AppResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();

        for record in records {
            match self.upsert_one(record).await {
                Ok(()) => summary.success += 1,
                Err(rejected) if rejected.is_record_level() => {
                    warn!("{}", rejected);
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "Upserted batch: {} success, {} failed",
            summary.success, summary.failed
        );

        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn record_ids_for_date(&self, date: NaiveDate) -> AppResult<HashSet<String>> {
        let (start, end) = day_bounds(date, self.tz);

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT uuid FROM cdr_records WHERE start_epoch >= $1 AND start_epoch < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error listing CDR ids for {}: {}", date, e);
            AppError::Database(format!("Failed to list CDR ids: {}", e))
        })?;

        Ok(rows.into_iter().map(|(uuid,)| uuid).collect())
    }

    #[instrument(skip(self))]
    async fn record_stats(&self) -> AppResult<RecordStats> {
        let db_err = |e: sqlx::Error| {
            error!("Database error computing CDR stats: {}", e);
            AppError::Database(format!("Failed to compute CDR stats: {}", e))
        };

        let (total, earliest, latest): (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(start_epoch), MAX(start_epoch) FROM cdr_records",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let by_direction: Vec<(String, i64)> = sqlx::query_as(
            "SELECT direction, COUNT(*) FROM cdr_records GROUP BY direction",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let by_call_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT call_status, COUNT(*) FROM cdr_records GROUP BY call_status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(RecordStats {
            total,
            by_direction: by_direction.into_iter().collect::<BTreeMap<_, _>>(),
            by_call_status: by_call_status.into_iter().collect::<BTreeMap<_, _>>(),
            earliest_start: earliest.and_then(|e| DateTime::<Utc>::from_timestamp(e, 0)),
            latest_start: latest.and_then(|e| DateTime::<Utc>::from_timestamp(e, 0)),
        })
    }
}

/// Helper struct for mapping database rows to domain model
#[derive(Debug, sqlx::FromRow)]
struct CdrRow {
    uuid: String,
    direction: String,
    caller_number: String,
    outbound_caller_number: Option<String>,
    destination_number: String,
    start_epoch: Option<i64>,
    answer_epoch: Option<i64>,
    end_epoch: Option<i64>,
    duration_seconds: i64,
    billable_seconds: i64,
    call_status: String,
    hangup_disposition: Option<String>,
    recording_path: Option<String>,
    raw_data: JsonValue,
}

impl From<CdrRow> for CdrRecord {
    fn from(row: CdrRow) -> Self {
        Self {
            uuid: row.uuid,
            direction: CallDirection::parse_lenient(&row.direction),
            caller_number: row.caller_number,
            outbound_caller_number: row.outbound_caller_number,
            destination_number: row.destination_number,
            start_epoch: row.start_epoch,
            answer_epoch: row.answer_epoch,
            end_epoch: row.end_epoch,
            duration_seconds: row.duration_seconds,
            billable_seconds: row.billable_seconds,
            call_status: row.call_status,
            hangup_disposition: row.hangup_disposition,
            recording_path: row.recording_path,
            raw: row.raw_data,
        }
    }
}
