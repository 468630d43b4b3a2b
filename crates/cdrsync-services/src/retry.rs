//! Retry scheduler
//!
//! Re-runs the windows of failed and partial ledger entries, a few per
//! pass. Each attempt bumps the original entry's retry count, so an entry
//! that keeps failing drops out once it reaches `max_retries`. Entries left
//! `retrying` by an attempt that never settled are released back to
//! `failed` at the start of a pass once they are older than the staleness
//! window.

use crate::sync_run::{SyncOutcome, SyncRunner};
use cdrsync_core::{
    config::SyncConfig,
    models::{SyncLogEntry, SyncStatus, SyncType},
    traits::{CdrFetcher, RecordStore},
    AppResult,
};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// One retried ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryAttempt {
    /// Entry that was retried
    pub original_id: i64,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,

    /// Retry count after this attempt
    pub retry_count: i32,

    /// Outcome of the `retry` run, absent if the run could not start
    pub outcome: Option<SyncOutcome>,

    /// Status the original entry was settled to
    pub settled_status: SyncStatus,
}

/// Result of one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempts: Vec<RetryAttempt>,

    /// Entries skipped because the ledger could not be updated
    pub skipped: Vec<i64>,
}

impl RetrySummary {
    pub fn resolved(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.settled_status == SyncStatus::Completed)
            .count()
    }
}

const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Bounded retry of failed sync windows
pub struct RetryScheduler<S: ?Sized, F: ?Sized> {
    runner: SyncRunner<S, F>,
    max_retries: i32,
    batch_limit: i64,
    stale_after: Duration,
}

impl<S, F> RetryScheduler<S, F>
where
    S: RecordStore + ?Sized,
    F: CdrFetcher + ?Sized,
{
    pub fn new(runner: SyncRunner<S, F>, max_retries: i32, batch_limit: i64) -> Self {
        Self {
            runner,
            max_retries,
            batch_limit,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn from_config(runner: SyncRunner<S, F>, config: &SyncConfig) -> Self {
        Self::new(runner, config.max_retries, config.retry_batch_limit)
            .with_stale_after(config.retry_stale_after())
    }

    /// Age at which an unsettled `retrying` entry is released
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Retry up to `batch_limit` eligible entries, oldest first
    ///
    /// # Errors
    ///
    /// Returns the store error if eligible entries cannot be listed.
    /// Failures on a single entry are logged and that entry is skipped.
    #[instrument(skip(self))]
    pub async fn run(&self) -> AppResult<RetrySummary> {
        self.release_stale().await;

        let entries = self
            .runner
            .store()
            .failed_sync_logs(self.max_retries, self.batch_limit)
            .await?;

        if entries.is_empty() {
            info!("No sync logs eligible for retry");
            return Ok(RetrySummary::default());
        }

        info!("Retrying {} sync logs", entries.len());

        let mut summary = RetrySummary::default();
        for entry in entries {
            match self.retry_entry(&entry).await {
                Ok(attempt) => summary.attempts.push(attempt),
                Err(e) => {
                    error!(
                        error_code = e.error_code(),
                        "Skipping retry of sync log {}: {}", entry.id, e
                    );
                    summary.skipped.push(entry.id);
                }
            }
        }

        info!(
            "Retry pass finished: {} attempted, {} resolved, {} skipped",
            summary.attempts.len(),
            summary.resolved(),
            summary.skipped.len()
        );

        Ok(summary)
    }

    async fn release_stale(&self) {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let cutoff = Utc::now() - window;

        match self.runner.store().release_stale_retries(cutoff).await {
            Ok(0) => {}
            Ok(released) => warn!(
                "Released {} sync logs left retrying since before {}",
                released, cutoff
            ),
            Err(e) => warn!(
                error_code = e.error_code(),
                "Could not release stale retries: {}", e
            ),
        }
    }

    async fn retry_entry(&self, entry: &SyncLogEntry) -> AppResult<RetryAttempt> {
        let store = self.runner.store();

        store.increment_retry_count(entry.id).await?;
        let retry_count = entry.retry_count + 1;

        info!(
            "Retry {}/{} of sync log {} ({} -> {})",
            retry_count, self.max_retries, entry.id, entry.date_from, entry.date_to
        );

        let outcome = match self
            .runner
            .run(SyncType::Retry, entry.date_from, entry.date_to)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Retry run for sync log {} did not complete: {}", entry.id, e);
                None
            }
        };

        let settled_status = outcome
            .as_ref()
            .map(|o| o.status)
            .unwrap_or(SyncStatus::Failed);

        store.settle_sync_log(entry.id, settled_status).await?;

        if retry_count >= self.max_retries && settled_status != SyncStatus::Completed {
            warn!(
                "Sync log {} reached the retry ceiling ({}), manual follow-up needed",
                entry.id, self.max_retries
            );
        }

        Ok(RetryAttempt {
            original_id: entry.id,
            date_from: entry.date_from,
            date_to: entry.date_to,
            retry_count,
            outcome,
            settled_status,
        })
    }
}
