//! Sync services for the CDR pipeline
//!
//! Every service is written against the `RecordStore` and `CdrFetcher`
//! traits and owns its collaborators through `Arc`, so the binary can
//! share one store and one client between them.
//!
//! # Services
//!
//! - `SyncRunner` - one end-to-end sync of a date window, one ledger entry
//! - `RetryScheduler` - bounded re-runs of failed/partial windows
//! - `Reconciler` - fills records the upstream omitted on earlier pulls

pub mod reconcile;
pub mod retry;
pub mod sync_run;

pub use reconcile::{DayReport, ReconcileSummary, Reconciler};
pub use retry::{RetryAttempt, RetryScheduler, RetrySummary};
pub use sync_run::{SyncOutcome, SyncRunner};

#[cfg(test)]
pub(crate) mod testing;
