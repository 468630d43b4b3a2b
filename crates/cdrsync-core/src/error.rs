//! Unified error handling for CDR sync
//!
//! One error type covers the three failure families the pipeline
//! distinguishes: upstream transport failures, single-record write failures
//! and local ledger/storage failures.

use thiserror::Error;

/// Main application error type
///
/// All errors in the pipeline should be converted to this type.
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Transport Errors ====================
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: upstream request took longer than {0}s")]
    Timeout(u64),

    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    // ==================== Record Errors ====================
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Failed to write record {uuid}: {reason}")]
    RecordWrite { uuid: String, reason: String },

    // ==================== Ledger / Storage Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Internal Errors ====================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the error code used in log fields and CLI output
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport_error",
            AppError::Timeout(_) => "timeout",
            AppError::UpstreamStatus { .. } => "upstream_status",
            AppError::Decode(_) => "decode_error",
            AppError::InvalidRecord(_) => "invalid_record",
            AppError::RecordWrite { .. } => "record_write_error",
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Migration(_) => "migration_error",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// True for failures talking to the upstream PBX API.
    ///
    /// These fail a whole `fetch_all` call and are recovered by a later
    /// retry of the entire window.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Transport(_)
                | AppError::Timeout(_)
                | AppError::UpstreamStatus { .. }
                | AppError::Decode(_)
        )
    }

    /// True for failures scoped to a single record
    pub fn is_record_level(&self) -> bool {
        matches!(self, AppError::InvalidRecord(_) | AppError::RecordWrite { .. })
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(AppError::Timeout(60).is_transport());
        assert!(AppError::UpstreamStatus {
            status: 502,
            body: "bad gateway".to_string()
        }
        .is_transport());
        assert!(!AppError::Database("disk full".to_string()).is_transport());
        assert!(!AppError::InvalidRecord("missing uuid".to_string()).is_transport());
    }

    #[test]
    fn test_record_level_classification() {
        let err = AppError::RecordWrite {
            uuid: "abc".to_string(),
            reason: "billsec exceeds duration".to_string(),
        };
        assert!(err.is_record_level());
        assert!(!AppError::Pool("closed".to_string()).is_record_level());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Timeout(1).error_code(), "timeout");
        assert_eq!(
            AppError::NotFound("sync log 7".to_string()).error_code(),
            "not_found"
        );
        assert_eq!(
            AppError::UpstreamStatus {
                status: 500,
                body: String::new()
            }
            .to_string(),
            "Upstream returned HTTP 500: "
        );
    }
}
