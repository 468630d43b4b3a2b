//! Application configuration
//!
//! This module provides centralized configuration management using the `config` crate.
//! Configuration can be loaded from environment variables and config files.

use crate::time::parse_timezone;
use crate::{AppError, AppResult};
use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub pbx: PbxConfig,

    #[validate(nested)]
    pub sync: SyncConfig,
}

/// Database configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[validate(length(min = 1))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1))]
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

/// PBX CDR API configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct PbxConfig {
    /// CDR endpoint URL
    #[serde(default = "default_api_url")]
    #[validate(url)]
    pub api_url: String,

    /// Tenant domain on the PBX
    #[validate(length(min = 1))]
    pub domain: String,

    /// Bearer token; sent only when non-empty
    #[serde(default)]
    pub api_key: Option<String>,

    /// Page size for CDR requests
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 5000))]
    pub batch_size: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Accept self-signed PBX certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_api_url() -> String {
    "https://pbx01.onepos.vn:8080/api/v2/cdrs".to_string()
}

fn default_batch_size() -> u32 {
    500
}

fn default_request_timeout() -> u64 {
    60
}

/// Sync pipeline configuration
#[derive(Debug, Deserialize, Clone, Validate)]
pub struct SyncConfig {
    /// Retry ceiling per ledger entry
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 0, max = 100))]
    pub max_retries: i32,

    /// Entries retried per retry pass
    #[serde(default = "default_retry_batch_limit")]
    #[validate(range(min = 1))]
    pub retry_batch_limit: i64,

    /// Age after which a `retrying` entry is treated as abandoned and
    /// released back to `failed`
    #[serde(default = "default_retry_stale_after")]
    #[validate(range(min = 1))]
    pub retry_stale_after_secs: u64,

    /// Days scanned by the reconciler
    #[serde(default = "default_days_back")]
    #[validate(range(min = 1, max = 90))]
    pub default_days_back: u32,

    /// IANA timezone the PBX reports local days in
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_batch_limit() -> i64 {
    3
}

fn default_retry_stale_after() -> u64 {
    3600
}

fn default_days_back() -> u32 {
    3
}

fn default_timezone() -> String {
    "Asia/Ho_Chi_Minh".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_batch_limit: default_retry_batch_limit(),
            retry_stale_after_secs: default_retry_stale_after(),
            default_days_back: default_days_back(),
            timezone: default_timezone(),
        }
    }
}

impl SyncConfig {
    /// Parsed timezone
    pub fn tz(&self) -> AppResult<Tz> {
        parse_timezone(&self.timezone)
    }

    pub fn retry_stale_after(&self) -> Duration {
        Duration::from_secs(self.retry_stale_after_secs)
    }
}

impl PbxConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// API key if one is configured
    pub fn bearer_token(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|key| !key.trim().is_empty())
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Self::builder_with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with CDRSYNC_ prefix
            .add_source(
                Environment::with_prefix("CDRSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Self::builder_with_defaults()?
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CDRSYNC").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    fn builder_with_defaults(
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("pbx.api_url", default_api_url())?
            .set_default("pbx.batch_size", 500)?
            .set_default("pbx.request_timeout_secs", 60)?
            .set_default("pbx.accept_invalid_certs", false)?
            .set_default("sync.max_retries", 3)?
            .set_default("sync.retry_batch_limit", 3)?
            .set_default("sync.retry_stale_after_secs", 3600)?
            .set_default("sync.default_days_back", 3)?
            .set_default("sync.timezone", default_timezone())
    }

    /// Field validation plus checks the derive cannot express
    pub fn validate_all(&self) -> AppResult<()> {
        self.validate()?;
        self.sync.tz()?;
        Ok(())
    }

    /// Load, then validate
    pub fn load_validated() -> AppResult<Self> {
        let config = Self::load().map_err(AppError::from)?;
        config.validate_all()?;
        Ok(config)
    }
}
