//! Sync run service
//!
//! One run covers one `[date_from, date_to]` window and owns exactly one
//! ledger entry. Pages are persisted as they arrive; the entry is
//! finalized once, after the fetch has finished or failed.

use async_trait::async_trait;
use cdrsync_core::{
    models::{RawCdr, SyncProgress, SyncStatus, SyncType, UpsertSummary},
    time::yesterday_in,
    traits::{BatchSink, CdrFetcher, RecordStore},
    AppError, AppResult,
};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Result of one sync run, mirrored in its ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub log_id: i64,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub total: u64,
    pub success: u64,
    pub failed: u64,

    /// Fetch error that failed the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == SyncStatus::Completed
    }
}

/// Runs syncs against a store and an upstream fetcher
pub struct SyncRunner<S: ?Sized, F: ?Sized> {
    store: Arc<S>,
    fetcher: Arc<F>,
    tz: Tz,
}

impl<S: ?Sized, F: ?Sized> Clone for SyncRunner<S, F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            tz: self.tz,
        }
    }
}

impl<S, F> SyncRunner<S, F>
where
    S: RecordStore + ?Sized,
    F: CdrFetcher + ?Sized,
{
    /// Create a new runner; `tz` decides which day is "yesterday"
    pub fn new(store: Arc<S>, fetcher: Arc<F>, tz: Tz) -> Self {
        Self { store, fetcher, tz }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Sync yesterday's window
    pub async fn run_daily(&self) -> AppResult<SyncOutcome> {
        let day = yesterday_in(self.tz);
        self.run(SyncType::Daily, day, day).await
    }

    /// Operator-requested sync of an explicit window
    pub async fn run_manual(&self, date_from: NaiveDate, date_to: NaiveDate) -> AppResult<SyncOutcome> {
        self.run(SyncType::Manual, date_from, date_to).await
    }

    /// Execute one sync of `[date_from, date_to]`
    ///
    /// # Errors
    ///
    /// Only ledger failures are returned as `Err`: creating the entry or
    /// writing its final status. Upstream failures end in a `failed`
    /// outcome instead.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        sync_type: SyncType,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> AppResult<SyncOutcome> {
        if date_from > date_to {
            return Err(AppError::InvalidInput(format!(
                "date_from {} is after date_to {}",
                date_from, date_to
            )));
        }

        let log_id = self
            .store
            .create_sync_log(sync_type, date_from, date_to)
            .await?;

        info!(
            "Starting {} sync {} for {} -> {}",
            sync_type, log_id, date_from, date_to
        );

        let mut sink = LedgerSink::new(&*self.store, log_id);
        let fetched = self.fetcher.fetch_all(date_from, date_to, &mut sink).await;

        let (progress, error) = match fetched {
            Err(e) => {
                error!(
                    error_code = e.error_code(),
                    "Sync {} failed while fetching: {}", log_id, e
                );
                let message = if e.is_transport() {
                    format!("PBX API unavailable: {}", e)
                } else {
                    e.to_string()
                };
                (
                    SyncProgress::finished(SyncStatus::Failed, 0, sink.success, sink.failed)
                        .with_error(message.clone()),
                    Some(message),
                )
            }
            Ok(_) if sink.total == 0 => (
                SyncProgress::finished(SyncStatus::Completed, 0, 0, 0),
                None,
            ),
            Ok(_) => (
                SyncProgress::finished(
                    SyncStatus::from_counts(sink.success, sink.failed),
                    sink.total,
                    sink.success,
                    sink.failed,
                ),
                None,
            ),
        };

        self.store.update_sync_log(log_id, &progress).await?;

        info!(
            "Sync {} finished: status={}, total={}, success={}, failed={}",
            log_id,
            progress.status,
            progress.total_records,
            progress.success_count,
            progress.failed_count
        );

        Ok(SyncOutcome {
            log_id,
            sync_type,
            status: progress.status,
            date_from,
            date_to,
            total: progress.total_records,
            success: progress.success_count,
            failed: progress.failed_count,
            error,
        })
    }
}

/// Persists each page and publishes running counters to the ledger
struct LedgerSink<'a, S: ?Sized> {
    store: &'a S,
    log_id: i64,
    total: u64,
    success: u64,
    failed: u64,
}

impl<'a, S: RecordStore + ?Sized> LedgerSink<'a, S> {
    fn new(store: &'a S, log_id: i64) -> Self {
        Self {
            store,
            log_id,
            total: 0,
            success: 0,
            failed: 0,
        }
    }
}

#[async_trait]
impl<'a, S: RecordStore + ?Sized> BatchSink for LedgerSink<'a, S> {
    async fn on_batch(&mut self, records: &[RawCdr]) -> AppResult<()> {
        let mut normalized = Vec::with_capacity(records.len());
        let mut rejected = 0u64;

        for raw in records {
            match raw.normalize() {
                Ok(record) => normalized.push(record),
                Err(e) => {
                    warn!("Skipping upstream record: {}", e);
                    rejected += 1;
                }
            }
        }

        let summary = if normalized.is_empty() {
            UpsertSummary::default()
        } else {
            match self.store.upsert_batch(&normalized).await {
                Ok(summary) => summary,
                Err(e) => {
                    error!(
                        error_code = e.error_code(),
                        "Sync {}: batch of {} records not stored: {}",
                        self.log_id,
                        normalized.len(),
                        e
                    );
                    UpsertSummary {
                        success: 0,
                        failed: normalized.len() as u64,
                    }
                }
            }
        };

        debug!(
            "Sync {}: page stored, {} of {} records written",
            self.log_id,
            summary.success,
            summary.total()
        );

        self.total += records.len() as u64;
        self.success += summary.success;
        self.failed += rejected + summary.failed;

        let progress = SyncProgress::running(self.total, self.success, self.failed);
        if let Err(e) = self.store.update_sync_log(self.log_id, &progress).await {
            warn!("Sync {}: progress update failed: {}", self.log_id, e);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bad_cdr, cdr, ScriptedFetcher};
    use cdrsync_core::traits::{CdrRepository, SyncLogRepository};
    use cdrsync_db::MemoryRecordStore;

    const DAY_START: i64 = 1734627600; // 2024-12-20T00:00:00+07:00

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 20).unwrap()
    }

    fn runner(fetcher: ScriptedFetcher) -> SyncRunner<MemoryRecordStore, ScriptedFetcher> {
        SyncRunner::new(
            Arc::new(MemoryRecordStore::with_default_tz().unwrap()),
            Arc::new(fetcher),
            chrono_tz::Asia::Ho_Chi_Minh,
        )
    }

    #[tokio::test]
    async fn test_partial_run() {
        let mut page: Vec<_> = (0..7).map(|i| cdr(&format!("ok-{i}"), DAY_START + i)).collect();
        page.extend((0..3).map(|i| bad_cdr(&format!("bad-{i}"), DAY_START)));
        let runner = runner(ScriptedFetcher::default().with_pages(day(), vec![page]));

        let outcome = runner.run_manual(day(), day()).await.unwrap();

        assert_eq!(outcome.status, SyncStatus::Partial);
        assert_eq!((outcome.total, outcome.success, outcome.failed), (10, 7, 3));

        let entry = runner.store().find_sync_log(outcome.log_id).await.unwrap().unwrap();
        assert_eq!(entry.sync_type, SyncType::Manual);
        assert_eq!(entry.status, SyncStatus::Partial);
        assert!(entry.end_time.is_some());
    }

    #[tokio::test]
    async fn test_unnormalizable_records_count_as_failed() {
        let page = vec![
            cdr("ok", DAY_START),
            RawCdr::new(serde_json::json!({ "direction": "inbound" })),
        ];
        let runner = runner(ScriptedFetcher::default().with_pages(day(), vec![page]));

        let outcome = runner.run_manual(day(), day()).await.unwrap();

        assert_eq!((outcome.total, outcome.success, outcome.failed), (2, 1, 1));
        assert_eq!(outcome.status, SyncStatus::Partial);
    }

    #[tokio::test]
    async fn test_fetch_error_fails_run_but_keeps_persisted_pages() {
        let pages = vec![
            vec![cdr("a", DAY_START), cdr("b", DAY_START)],
            vec![cdr("c", DAY_START)],
        ];
        let runner = runner(ScriptedFetcher::default().failing_at(day(), pages, 1));

        let outcome = runner.run_manual(day(), day()).await.unwrap();

        assert_eq!(outcome.status, SyncStatus::Failed);
        assert_eq!(outcome.total, 0);
        assert!(outcome
            .error
            .as_deref()
            .is_some_and(|m| m.starts_with("PBX API unavailable")));
        assert!(runner.store().exists("a").await.unwrap());

        let entry = runner.store().find_sync_log(outcome.log_id).await.unwrap().unwrap();
        assert_eq!(entry.total_records, 0);
        assert!(entry.error_message.is_some());
    }

    #[tokio::test]
    async fn test_reversed_window_is_rejected() {
        let runner = runner(ScriptedFetcher::default());
        let later = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();

        assert!(matches!(
            runner.run_manual(later, day()).await,
            Err(AppError::InvalidInput(_))
        ));
        assert!(runner.store().sync_logs().is_empty());
    }

    #[tokio::test]
    async fn test_daily_run_targets_yesterday() {
        let runner = runner(ScriptedFetcher::default());
        let outcome = runner.run_daily().await.unwrap();

        assert_eq!(outcome.sync_type, SyncType::Daily);
        assert_eq!(outcome.date_from, yesterday_in(chrono_tz::Asia::Ho_Chi_Minh));
        assert_eq!(outcome.date_from, outcome.date_to);
        assert!(outcome.is_completed());
    }
}
