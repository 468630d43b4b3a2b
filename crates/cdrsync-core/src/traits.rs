//! Common traits for repositories and the upstream fetcher
//!
//! The sync pipeline is written against these abstractions only; concrete
//! PostgreSQL, in-memory and HTTP implementations live in their own crates.

use crate::error::AppError;
use crate::models::{
    CdrRecord, RawCdr, RecordStats, SyncLogEntry, SyncProgress, SyncStatus, SyncType,
    UpsertSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use tracing::debug;

/// CDR record repository
#[async_trait]
pub trait CdrRepository: Send + Sync {
    /// Point lookup by call UUID
    async fn exists(&self, uuid: &str) -> Result<bool, AppError>;

    /// Find a stored record by call UUID
    async fn find_by_uuid(&self, uuid: &str) -> Result<Option<CdrRecord>, AppError>;

    /// Idempotent upsert keyed by uuid.
    ///
    /// Each record is written in isolation: a record that fails to write is
    /// counted in `failed` and never aborts the rest of the batch. `Err` is
    /// reserved for failures of the store itself.
    async fn upsert_batch(&self, records: &[CdrRecord]) -> Result<UpsertSummary, AppError>;

    /// UUIDs of records whose start falls within the local day `date`
    async fn record_ids_for_date(&self, date: NaiveDate) -> Result<HashSet<String>, AppError>;

    /// Aggregate statistics for status reporting
    async fn record_stats(&self) -> Result<RecordStats, AppError>;
}

/// Sync log (ledger) repository
#[async_trait]
pub trait SyncLogRepository: Send + Sync {
    /// Insert a new `running` entry and return its id
    async fn create_sync_log(
        &self,
        sync_type: SyncType,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<i64, AppError>;

    /// Progress or finalize an entry. `end_time` is stamped only for
    /// terminal statuses.
    async fn update_sync_log(&self, id: i64, progress: &SyncProgress) -> Result<(), AppError>;

    /// Bump `retry_count` and mark the entry `retrying`
    async fn increment_retry_count(&self, id: i64) -> Result<(), AppError>;

    /// Move a `retrying` entry back to a terminal status once its retry
    /// attempt has finished
    async fn settle_sync_log(&self, id: i64, status: SyncStatus) -> Result<(), AppError>;

    /// Return `retrying` entries last touched at or before `older_than` to
    /// `failed`, so an attempt that never settled becomes eligible again.
    /// Returns the number of entries released.
    async fn release_stale_retries(&self, older_than: DateTime<Utc>) -> Result<u64, AppError>;

    /// Failed/partial entries with `retry_count < max_retries`, oldest first.
    /// Entries of type `retry` are audit records and never returned, and
    /// `missing_check` entries are left to the next reconciliation pass.
    async fn failed_sync_logs(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<SyncLogEntry>, AppError>;

    async fn find_sync_log(&self, id: i64) -> Result<Option<SyncLogEntry>, AppError>;

    /// Most recent entries, newest first
    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<SyncLogEntry>, AppError>;

    /// Most recent entry, optionally of one type
    async fn last_sync_log(
        &self,
        sync_type: Option<SyncType>,
    ) -> Result<Option<SyncLogEntry>, AppError>;
}

/// Everything the sync pipeline needs from local storage
pub trait RecordStore: CdrRepository + SyncLogRepository {}

impl<T: CdrRepository + SyncLogRepository + ?Sized> RecordStore for T {}

/// One page of upstream records
#[derive(Debug, Clone, Default)]
pub struct CdrPage {
    pub records: Vec<RawCdr>,

    /// Advisory cursor; `None` means end of data
    pub next_offset: Option<i64>,

    /// Total reported by the upstream, if any
    pub total: Option<i64>,
}

/// Consumer of fetched pages
///
/// `fetch_all` awaits `on_batch` before requesting the next page, so
/// whatever the sink persists is durable before the cursor advances.
#[async_trait]
pub trait BatchSink: Send {
    async fn on_batch(&mut self, records: &[RawCdr]) -> Result<(), AppError>;
}

/// Sink that discards pages
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl BatchSink for NoopSink {
    async fn on_batch(&mut self, _records: &[RawCdr]) -> Result<(), AppError> {
        Ok(())
    }
}

/// Upstream CDR source
#[async_trait]
pub trait CdrFetcher: Send + Sync {
    /// Single upstream request for the inclusive day window `[date_from, date_to]`
    async fn fetch_page(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        offset: i64,
    ) -> Result<CdrPage, AppError>;

    /// Fetch every page of the window, handing each non-empty page to `sink`
    /// before advancing.
    ///
    /// Stops on an empty page, a missing cursor, or a cursor that does not
    /// move forward. Any page or sink error aborts the whole call.
    async fn fetch_all(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        sink: &mut dyn BatchSink,
    ) -> Result<Vec<RawCdr>, AppError> {
        let mut all = Vec::new();
        let mut offset = 0i64;

        loop {
            let page = self.fetch_page(date_from, date_to, offset).await?;

            if page.records.is_empty() {
                debug!("Empty page at offset {}, end of data", offset);
                break;
            }

            sink.on_batch(&page.records).await?;

            let fetched = page.records.len();
            all.extend(page.records);

            match page.next_offset {
                Some(next) if next > offset => {
                    debug!(
                        "Fetched {} records ({} so far), next_offset={}",
                        fetched,
                        all.len(),
                        next
                    );
                    offset = next;
                }
                Some(next) => {
                    debug!(
                        "Cursor did not advance ({} -> {}), stopping",
                        offset, next
                    );
                    break;
                }
                None => break,
            }
        }

        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Replays canned pages keyed by call order and logs every event
    struct ScriptedFetcher {
        pages: Vec<Result<(usize, Option<i64>), String>>,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CdrFetcher for ScriptedFetcher {
        async fn fetch_page(
            &self,
            _date_from: NaiveDate,
            _date_to: NaiveDate,
            offset: i64,
        ) -> Result<CdrPage, AppError> {
            let mut events = self.events.lock().unwrap();
            let call = events.iter().filter(|e| e.starts_with("fetch")).count();
            events.push(format!("fetch@{}", offset));

            match self.pages.get(call) {
                Some(Ok((count, next))) => Ok(CdrPage {
                    records: (0..*count)
                        .map(|i| RawCdr::new(json!({ "uuid": format!("p{}-{}", call, i) })))
                        .collect(),
                    next_offset: *next,
                    total: None,
                }),
                Some(Err(message)) => Err(AppError::Transport(message.clone())),
                None => Ok(CdrPage::default()),
            }
        }
    }

    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn on_batch(&mut self, records: &[RawCdr]) -> Result<(), AppError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("sink:{}", records.len()));
            if self.fail {
                return Err(AppError::Database("disk full".to_string()));
            }
            Ok(())
        }
    }

    fn harness(
        pages: Vec<Result<(usize, Option<i64>), String>>,
    ) -> (ScriptedFetcher, RecordingSink, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedFetcher {
                pages,
                events: events.clone(),
            },
            RecordingSink {
                events: events.clone(),
                fail: false,
            },
            events,
        )
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 12, 20).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_all_follows_cursor_until_none() {
        let (fetcher, mut sink, events) =
            harness(vec![Ok((3, Some(3))), Ok((2, Some(5))), Ok((1, None))]);

        let all = fetcher.fetch_all(day(), day(), &mut sink).await.unwrap();

        assert_eq!(all.len(), 6);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["fetch@0", "sink:3", "fetch@3", "sink:2", "fetch@5", "sink:1"]
        );
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_stuck_cursor() {
        // The cursor repeats 2, then would loop forever
        let (fetcher, mut sink, events) = harness(vec![
            Ok((2, Some(2))),
            Ok((2, Some(2))),
            Ok((2, Some(2))),
        ]);

        let all = fetcher.fetch_all(day(), day(), &mut sink).await.unwrap();

        assert_eq!(all.len(), 4);
        let fetches = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("fetch"))
            .count();
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_decreasing_cursor() {
        let (fetcher, mut sink, _) = harness(vec![Ok((2, Some(10))), Ok((2, Some(4)))]);

        let all = fetcher.fetch_all(day(), day(), &mut sink).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_empty_page() {
        let (fetcher, mut sink, events) = harness(vec![Ok((2, Some(2))), Ok((0, Some(4)))]);

        let all = fetcher.fetch_all(day(), day(), &mut sink).await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(*events.lock().unwrap(), vec!["fetch@0", "sink:2", "fetch@2"]);
    }

    #[tokio::test]
    async fn test_fetch_all_propagates_transport_error_after_streaming() {
        let (fetcher, mut sink, events) = harness(vec![
            Ok((3, Some(3))),
            Ok((3, Some(6))),
            Err("connection reset".to_string()),
        ]);

        let result = fetcher.fetch_all(day(), day(), &mut sink).await;

        assert!(matches!(result, Err(AppError::Transport(_))));
        let events = events.lock().unwrap();
        assert_eq!(
            events.iter().filter(|e| e.starts_with("sink")).count(),
            2,
            "pages before the failure were handed to the sink"
        );
    }

    #[tokio::test]
    async fn test_fetch_all_aborts_on_sink_error() {
        let (fetcher, mut sink, events) = harness(vec![Ok((3, Some(3))), Ok((3, None))]);
        sink.fail = true;

        let result = fetcher.fetch_all(day(), day(), &mut sink).await;

        assert!(matches!(result, Err(AppError::Database(_))));
        assert_eq!(*events.lock().unwrap(), vec!["fetch@0", "sink:3"]);
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let (fetcher, _, _) = harness(vec![Ok((1, None))]);
        let all = fetcher.fetch_all(day(), day(), &mut NoopSink).await.unwrap();
        assert_eq!(all[0].uuid(), Some("p0-0"));
    }
}
