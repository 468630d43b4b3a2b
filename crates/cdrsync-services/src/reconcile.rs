//! Missing-record reconciliation
//!
//! Compares the upstream's view of each recent day with what is stored
//! locally and upserts the records that only exist upstream. Local records
//! the upstream no longer reports are left alone.

use cdrsync_core::{
    models::{RawCdr, SyncProgress, SyncStatus, SyncType, UpsertSummary},
    time::today_in,
    traits::{CdrFetcher, NoopSink, RecordStore},
    AppError, AppResult,
};
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Reconciliation result for one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayReport {
    pub date: NaiveDate,

    /// Distinct uuids reported upstream
    pub remote: usize,

    /// Uuids stored locally for the day
    pub local: usize,

    /// Upstream uuids absent locally
    pub missing: usize,

    /// Missing records persisted by this pass
    pub synced: u64,

    /// Missing records that could not be persisted
    pub failed: u64,

    /// Why the day was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DayReport {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            remote: 0,
            local: 0,
            missing: 0,
            synced: 0,
            failed: 0,
            error: None,
        }
    }

    fn skipped(date: NaiveDate, error: &AppError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::empty(date)
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of a reconciliation scan, most recent day first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub days: Vec<DayReport>,
    pub total_missing: usize,
    pub total_synced: u64,
}

/// Fills gaps between upstream and local data for recent days
pub struct Reconciler<S: ?Sized, F: ?Sized> {
    store: Arc<S>,
    fetcher: Arc<F>,
    tz: Tz,
}

impl<S, F> Reconciler<S, F>
where
    S: RecordStore + ?Sized,
    F: CdrFetcher + ?Sized,
{
    pub fn new(store: Arc<S>, fetcher: Arc<F>, tz: Tz) -> Self {
        Self { store, fetcher, tz }
    }

    /// Scan the `days_back` days before today
    pub async fn run(&self, days_back: u32) -> AppResult<ReconcileSummary> {
        self.run_from(today_in(self.tz), days_back).await
    }

    /// Scan `today - 1` down to `today - days_back`
    ///
    /// A day whose fetch or local lookup fails is reported with its error
    /// and the scan moves on.
    #[instrument(skip(self))]
    pub async fn run_from(&self, today: NaiveDate, days_back: u32) -> AppResult<ReconcileSummary> {
        if days_back == 0 {
            return Err(AppError::InvalidInput(
                "days_back must be at least 1".to_string(),
            ));
        }

        let mut summary = ReconcileSummary::default();

        for n in 1..=i64::from(days_back) {
            let date = today - Duration::days(n);
            let report = self.reconcile_day(date).await;

            summary.total_missing += report.missing;
            summary.total_synced += report.synced;
            summary.days.push(report);
        }

        info!(
            "Reconciliation finished: {} days, {} missing, {} synced",
            summary.days.len(),
            summary.total_missing,
            summary.total_synced
        );

        Ok(summary)
    }

    async fn reconcile_day(&self, date: NaiveDate) -> DayReport {
        let remote = match self.fetcher.fetch_all(date, date, &mut NoopSink).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Skipping reconciliation of {}: fetch failed: {}", date, e);
                return DayReport::skipped(date, &e);
            }
        };

        let local = match self.store.record_ids_for_date(date).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Skipping reconciliation of {}: local lookup failed: {}", date, e);
                return DayReport::skipped(date, &e);
            }
        };

        let mut seen = HashSet::new();
        let mut missing: Vec<RawCdr> = Vec::new();
        for record in remote {
            let Some(uuid) = record.uuid() else {
                continue;
            };
            if !seen.insert(uuid.to_string()) {
                continue;
            }
            if !local.contains(uuid) {
                missing.push(record);
            }
        }

        let mut report = DayReport {
            remote: seen.len(),
            local: local.len(),
            missing: missing.len(),
            ..DayReport::empty(date)
        };

        if missing.is_empty() {
            debug!("{}: no missing records ({} remote)", date, report.remote);
            return report;
        }

        info!("{}: {} records missing locally", date, missing.len());

        let log_id = match self
            .store
            .create_sync_log(SyncType::MissingCheck, date, date)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("{}: could not record missing check: {}", date, e);
                None
            }
        };

        let (synced, failed, error) = self.persist(&missing).await;
        report.synced = synced;
        report.failed = failed;

        if let Some(log_id) = log_id {
            let mut progress = SyncProgress::finished(
                SyncStatus::from_counts(synced, failed),
                missing.len() as u64,
                synced,
                failed,
            );
            if let Some(message) = error {
                progress = progress.with_error(message);
            }
            if let Err(e) = self.store.update_sync_log(log_id, &progress).await {
                warn!("{}: could not finalize missing check {}: {}", date, log_id, e);
            }
        }

        report
    }

    /// Normalise and upsert; returns `(synced, failed, store error)`
    async fn persist(&self, missing: &[RawCdr]) -> (u64, u64, Option<String>) {
        let mut rejected = 0u64;
        let records: Vec<_> = missing
            .iter()
            .filter_map(|raw| match raw.normalize() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping upstream record: {}", e);
                    rejected += 1;
                    None
                }
            })
            .collect();

        if records.is_empty() {
            return (0, rejected, None);
        }

        match self.store.upsert_batch(&records).await {
            Ok(UpsertSummary { success, failed }) => (success, rejected + failed, None),
            Err(e) => {
                warn!("Missing records not stored: {}", e);
                (0, rejected + records.len() as u64, Some(e.to_string()))
            }
        }
    }
}
