//! Sync log model
//!
//! The sync log is the append-mostly ledger of every sync attempt.

use crate::AppError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What triggered a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Daily,
    Manual,
    Retry,
    MissingCheck,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Daily => "daily",
            SyncType::Manual => "manual",
            SyncType::Retry => "retry",
            SyncType::MissingCheck => "missing_check",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(SyncType::Daily),
            "manual" => Ok(SyncType::Manual),
            "retry" => Ok(SyncType::Retry),
            "missing_check" => Ok(SyncType::MissingCheck),
            other => Err(AppError::InvalidInput(format!("unknown sync type: {}", other))),
        }
    }
}

/// Sync log status
///
/// ```text
/// running -> completed | partial | failed        (terminal, exactly once)
/// failed | partial -> retrying                   (retry scheduler only)
/// retrying -> completed | partial | failed       (settled after the attempt)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Partial,
    Failed,
    Retrying,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
            SyncStatus::Retrying => "retrying",
        }
    }

    /// Terminal statuses close an entry and stamp its end time
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Partial | SyncStatus::Failed
        )
    }

    /// Statuses the retry scheduler picks up
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncStatus::Failed | SyncStatus::Partial)
    }

    /// Final status of a run whose pages were all fetched.
    ///
    /// An empty window (`0/0`) is `Completed`.
    pub fn from_counts(success: u64, failed: u64) -> Self {
        if failed == 0 {
            SyncStatus::Completed
        } else if success > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "partial" => Ok(SyncStatus::Partial),
            "failed" => Ok(SyncStatus::Failed),
            "retrying" => Ok(SyncStatus::Retrying),
            other => Err(AppError::InvalidInput(format!("unknown sync status: {}", other))),
        }
    }
}

/// One ledger entry per sync attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// Store-assigned, monotonic
    pub id: i64,

    pub sync_type: SyncType,

    pub status: SyncStatus,

    /// First day of the window (inclusive)
    pub date_from: NaiveDate,

    /// Last day of the window (inclusive)
    pub date_to: NaiveDate,

    pub start_time: DateTime<Utc>,

    /// Absent while the entry is running
    pub end_time: Option<DateTime<Utc>>,

    pub total_records: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub retry_count: i32,

    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counters written by `update_sync_log`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub total_records: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub error_message: Option<String>,
}

impl SyncProgress {
    /// In-flight counters for a running entry
    pub fn running(total: u64, success: u64, failed: u64) -> Self {
        Self {
            status: SyncStatus::Running,
            total_records: total,
            success_count: success,
            failed_count: failed,
            error_message: None,
        }
    }

    pub fn finished(status: SyncStatus, total: u64, success: u64, failed: u64) -> Self {
        Self {
            status,
            total_records: total,
            success_count: success,
            failed_count: failed,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
