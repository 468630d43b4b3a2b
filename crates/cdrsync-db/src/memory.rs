//! In-memory record store
//!
//! Same contract as `PgRecordStore`, held behind a single mutex. Used for
//! dry runs and by the pipeline tests.

use cdrsync_core::{
    models::{
        CdrRecord, RecordStats, SyncLogEntry, SyncProgress, SyncStatus, SyncType, UpsertSummary,
    },
    time::{day_bounds, parse_timezone},
    traits::{CdrRepository, SyncLogRepository},
    AppError, AppResult,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    records: HashMap<String, CdrRecord>,
    logs: BTreeMap<i64, SyncLogEntry>,
    next_id: i64,
}

/// Process-local `CdrRepository` + `SyncLogRepository`
pub struct MemoryRecordStore {
    tz: Tz,
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Store in the `Asia/Ho_Chi_Minh` timezone
    pub fn with_default_tz() -> AppResult<Self> {
        Ok(Self::new(parse_timezone("Asia/Ho_Chi_Minh")?))
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every ledger entry, oldest first
    pub fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.inner.lock().logs.values().cloned().collect()
    }
}

#[async_trait]
impl CdrRepository for MemoryRecordStore {
    async fn exists(&self, uuid: &str) -> AppResult<bool> {
        Ok(self.inner.lock().records.contains_key(uuid))
    }

    async fn find_by_uuid(&self, uuid: &str) -> AppResult<Option<CdrRecord>> {
        Ok(self.inner.lock().records.get(uuid).cloned())
    }

    async fn upsert_batch(&self, records: &[CdrRecord]) -> AppResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        let mut inner = self.inner.lock();

        for record in records {
            match record.check_invariants() {
                Ok(()) => {
                    inner.records.insert(record.uuid.clone(), record.clone());
                    summary.success += 1;
                }
                Err(rejected) => {
                    warn!("{}", rejected);
                    summary.failed += 1;
                }
            }
        }

        debug!(
            "Upserted batch: {} success, {} failed",
            summary.success, summary.failed
        );

        Ok(summary)
    }

    async fn record_ids_for_date(&self, date: NaiveDate) -> AppResult<HashSet<String>> {
        let (start, end) = day_bounds(date, self.tz);

        Ok(self
            .inner
            .lock()
            .records
            .values()
            .filter(|r| matches!(r.start_epoch, Some(e) if e >= start && e < end))
            .map(|r| r.uuid.clone())
            .collect())
    }

    async fn record_stats(&self) -> AppResult<RecordStats> {
        let inner = self.inner.lock();
        let mut stats = RecordStats {
            total: inner.records.len() as i64,
            ..RecordStats::default()
        };


        for record in inner.records.values() {
            *stats
                .by_direction
                .entry(record.direction.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_call_status
                .entry(record.call_status.clone())
                .or_insert(0) += 1;

            if let Some(start) = record.start_time() {
                stats.earliest_start = Some(stats.earliest_start.map_or(start, |e| e.min(start)));
                stats.latest_start = Some(stats.latest_start.map_or(start, |l| l.max(start)));
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl SyncLogRepository for MemoryRecordStore {
    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> AppResult<i64> {
        if date_from > date_to {
            return Err(AppError::InvalidInput(format!(
                "date_from {} is after date_to {}",
                date_from, date_to
            )));
        }

        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();

        inner.logs.insert(
            id,
            SyncLogEntry {
                id,
                sync_type,
                status: SyncStatus::Running,
                date_from,
                date_to,
                start_time: now,
                end_time: None,
                total_records: 0,
                success_count: 0,
                failed_count: 0,
                retry_count: 0,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(id)
    }

    async fn update_sync_log(&self, id: i64, progress: &SyncProgress) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .logs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("sync log {}", id)))?;

        let now = Utc::now();
        entry.status = progress.status;
        entry.total_records = clamp(progress.total_records);
        entry.success_count = clamp(progress.success_count);
        entry.failed_count = clamp(progress.failed_count);
        entry.error_message = progress.error_message.clone();
        if progress.status.is_terminal() {
            entry.end_time = Some(now);
        }
        entry.updated_at = now;

        Ok(())
    }

    async fn increment_retry_count(&self, id: i64) -> AppResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .logs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("sync log {}", id)))?;

        entry.retry_count += 1;
        entry.status = SyncStatus::Retrying;
        entry.updated_at = Utc::now();

        Ok(())
    }

    async fn settle_sync_log(&self, id: i64, status: SyncStatus) -> AppResult<()> {
        if !status.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "cannot settle sync log {} to non-terminal status {}",
                id, status
            )));
        }

        let mut inner = self.inner.lock();
        let entry = inner
            .logs
            .get_mut(&id)
            .filter(|e| e.status == SyncStatus::Retrying)
            .ok_or_else(|| AppError::NotFound(format!("retrying sync log {}", id)))?;

        entry.status = status;
        entry.updated_at = Utc::now();

        Ok(())
    }

    async fn release_stale_retries(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut released = 0u64;

        for entry in inner.logs.values_mut() {
            if entry.status == SyncStatus::Retrying && entry.updated_at <= older_than {
                entry.status = SyncStatus::Failed;
                entry.updated_at = now;
                released += 1;
            }
        }

        Ok(released)
    }

    async fn failed_sync_logs(&self, max_retries: i32, limit: i64) -> AppResult<Vec<SyncLogEntry>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        Ok(self
            .inner
            .lock()
            .logs
            .values()
            .filter(|e| {
                e.status.is_retryable()
                    && e.retry_count < max_retries
                    && !matches!(e.sync_type, SyncType::Retry | SyncType::MissingCheck)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_sync_log(&self, id: i64) -> AppResult<Option<SyncLogEntry>> {
        Ok(self.inner.lock().logs.get(&id).cloned())
    }

    async fn recent_sync_logs(&self, limit: i64) -> AppResult<Vec<SyncLogEntry>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        Ok(self
            .inner
            .lock()
            .logs
            .values()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn last_sync_log(&self, sync_type: Option<SyncType>) -> AppResult<Option<SyncLogEntry>> {
        Ok(self
            .inner
            .lock()
            .logs
            .values()
            .rev()
            .find(|e| sync_type.map_or(true, |t| e.sync_type == t))
            .cloned())
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdrsync_core::models::RawCdr;
    use serde_json::json;

    fn store() -> MemoryRecordStore {
        MemoryRecordStore::with_default_tz().unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, d).unwrap()
    }

    fn record(uuid: &str, start_epoch: i64, status: &str) -> CdrRecord {
        RawCdr::new(json!({
            "uuid": uuid,
            "direction": "inbound",
            "start_epoch": start_epoch,
            "duration": 30,
            "billsec": 20,
            "call_status": status,
        }))
        .normalize()
        .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_last_write_wins() {
        let store = store();
        let first = record("a", 1734652800, "ANSWERED");
        let mut second = first.clone();
        second.call_status = "BUSY".to_string();

        store.upsert_batch(&[first]).await.unwrap();
        let summary = store.upsert_batch(&[second]).await.unwrap();

        assert_eq!(summary, UpsertSummary { success: 1, failed: 0 });
        assert_eq!(store.len(), 1);
        let stored = store.find_by_uuid("a").await.unwrap().unwrap();
        assert_eq!(stored.call_status, "BUSY");
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_batch() {
        let store = store();
        let mut bad = record("bad", 1734652800, "ANSWERED");
        bad.billable_seconds = 99;

        let summary = store
            .upsert_batch(&[
                record("a", 1734652800, "ANSWERED"),
                bad,
                record("b", 1734652800, "ANSWERED"),
            ])
            .await
            .unwrap();

        assert_eq!(summary, UpsertSummary { success: 2, failed: 1 });
        assert!(!store.exists("bad").await.unwrap());
        assert!(store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_ids_use_local_day() {
        let store = store();
        // 2024-12-19T17:00:00Z is midnight of the 20th in UTC+7
        store
            .upsert_batch(&[
                record("before", 1734627599, "ANSWERED"),
                record("first", 1734627600, "ANSWERED"),
                record("last", 1734713999, "ANSWERED"),
                record("after", 1734714000, "ANSWERED"),
            ])
            .await
            .unwrap();

        let ids = store.record_ids_for_date(day(20)).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("first") && ids.contains("last"));
    }

    #[tokio::test]
    async fn test_record_stats() {
        let store = store();
        store
            .upsert_batch(&[
                record("a", 1734652800, "ANSWERED"),
                record("b", 1734652900, "ANSWERED"),
                record("c", 1734652700, "NO_ANSWER"),
            ])
            .await
            .unwrap();

        let stats = store.record_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_direction.get("inbound"), Some(&3));
        assert_eq!(stats.by_call_status.get("ANSWERED"), Some(&2));
        assert_eq!(stats.earliest_start.unwrap().timestamp(), 1734652700);
        assert_eq!(stats.latest_start.unwrap().timestamp(), 1734652900);
    }

    #[tokio::test]
    async fn test_sync_log_lifecycle() {
        let store = store();
        let id = store
            .create_sync_log(SyncType::Daily, day(20), day(20))
            .await
            .unwrap();

        store
            .update_sync_log(id, &SyncProgress::running(5, 5, 0))
            .await
            .unwrap();
        let entry = store.find_sync_log(id).await.unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::Running);
        assert!(entry.end_time.is_none());

        store
            .update_sync_log(id, &SyncProgress::finished(SyncStatus::Partial, 10, 7, 3))
            .await
            .unwrap();
        let entry = store.find_sync_log(id).await.unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::Partial);
        assert_eq!(entry.failed_count, 3);
        assert!(entry.end_time.is_some());
    }

    #[tokio::test]
    async fn test_failed_sync_logs_filters_and_orders() {
        let store = store();
        let mut ids = Vec::new();
        for (sync_type, status) in [
            (SyncType::Daily, SyncStatus::Failed),
            (SyncType::Manual, SyncStatus::Completed),
            (SyncType::Retry, SyncStatus::Failed),
            (SyncType::MissingCheck, SyncStatus::Partial),
        ] {
            let id = store
                .create_sync_log(sync_type, day(20), day(20))
                .await
                .unwrap();
            store
                .update_sync_log(id, &SyncProgress::finished(status, 0, 0, 0))
                .await
                .unwrap();
            ids.push(id);
        }

        let eligible: Vec<i64> = store
            .failed_sync_logs(3, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(eligible, vec![ids[0]]);

        let id = store
            .create_sync_log(SyncType::Manual, day(21), day(21))
            .await
            .unwrap();
        store
            .update_sync_log(id, &SyncProgress::finished(SyncStatus::Partial, 2, 1, 1))
            .await
            .unwrap();
        assert_eq!(store.failed_sync_logs(3, 10).await.unwrap().len(), 2);
        assert_eq!(store.failed_sync_logs(3, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling() {
        let store = store();
        let id = store
            .create_sync_log(SyncType::Daily, day(20), day(20))
            .await
            .unwrap();
        store
            .update_sync_log(id, &SyncProgress::finished(SyncStatus::Failed, 0, 0, 0))
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(store.failed_sync_logs(3, 10).await.unwrap().len(), 1);
            store.increment_retry_count(id).await.unwrap();
            store.settle_sync_log(id, SyncStatus::Failed).await.unwrap();
        }

        let entry = store.find_sync_log(id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 3);
        assert!(store.failed_sync_logs(3, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsettled_retry_is_released() {
        let store = store();
        let id = store
            .create_sync_log(SyncType::Daily, day(20), day(20))
            .await
            .unwrap();
        store
            .update_sync_log(id, &SyncProgress::finished(SyncStatus::Failed, 0, 0, 0))
            .await
            .unwrap();
        store.increment_retry_count(id).await.unwrap();
        assert!(store.failed_sync_logs(3, 10).await.unwrap().is_empty());

        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.release_stale_retries(an_hour_ago).await.unwrap(), 0);

        assert_eq!(store.release_stale_retries(Utc::now()).await.unwrap(), 1);
        let entry = store.find_sync_log(id).await.unwrap().unwrap();
        assert_eq!(entry.status, SyncStatus::Failed);
        assert_eq!(entry.retry_count, 1);
        assert_eq!(store.failed_sync_logs(3, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settle_requires_retrying_entry() {
        let store = store();
        let id = store
            .create_sync_log(SyncType::Daily, day(20), day(20))
            .await
            .unwrap();

        assert!(matches!(
            store.settle_sync_log(id, SyncStatus::Completed).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            store.settle_sync_log(id, SyncStatus::Retrying).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_entry_is_not_found() {
        let store = store();
        assert!(matches!(
            store.update_sync_log(42, &SyncProgress::running(0, 0, 0)).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            store.increment_retry_count(42).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recent_and_last_sync_logs() {
        let store = store();
        let daily = store
            .create_sync_log(SyncType::Daily, day(19), day(19))
            .await
            .unwrap();
        let manual = store
            .create_sync_log(SyncType::Manual, day(1), day(10))
            .await
            .unwrap();

        let recent = store.recent_sync_logs(10).await.unwrap();
        assert_eq!(recent[0].id, manual);
        assert_eq!(recent[1].id, daily);

        let last_daily = store.last_sync_log(Some(SyncType::Daily)).await.unwrap();
        assert_eq!(last_daily.map(|e| e.id), Some(daily));
        assert_eq!(
            store.last_sync_log(None).await.unwrap().map(|e| e.id),
            Some(manual)
        );
    }
}
