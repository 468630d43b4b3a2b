//! HTTP client for the PBX CDR API
//!
//! Low-level paging only. Every failure that is not a well-formed page
//! becomes a transport-class `AppError`, so a caller can never confuse
//! "no data" with "request failed".

use async_trait::async_trait;
use cdrsync_core::config::PbxConfig;
use cdrsync_core::traits::{CdrFetcher, CdrPage};
use cdrsync_core::{AppError, AppResult};
use chrono::NaiveDate;
use reqwest::{header, Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use super::types::{CdrApiResponse, CdrQuery};

/// Upper bound on the error body kept in `UpstreamStatus`
const MAX_ERROR_BODY: usize = 512;

/// Client for the PBX CDR endpoint
pub struct PbxClient {
    http_client: Client,
    api_url: String,
    domain: String,
    api_key: Option<String>,
    batch_size: u32,
    timeout_secs: u64,
}

impl PbxClient {
    /// Build a client from the `pbx` configuration section
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let client = PbxClient::new(&config.pbx)?;
    /// let page = client.fetch_page(day, day, 0).await?;
    /// ```
    pub fn new(config: &PbxConfig) -> AppResult<Self> {
        let http_client = ClientBuilder::new()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            api_url: config.api_url.clone(),
            domain: config.domain.clone(),
            api_key: config.bearer_token().map(str::to_string),
            batch_size: config.batch_size,
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// Query string for one page of the inclusive window `[date_from, date_to]`
    pub fn build_query(&self, date_from: NaiveDate, date_to: NaiveDate, offset: i64) -> CdrQuery {
        CdrQuery {
            domain: self.domain.clone(),
            from: format!("{} 00:00:00", date_from.format("%Y-%m-%d")),
            to: format!("{} 23:59:59", date_to.format("%Y-%m-%d")),
            limit: self.batch_size,
            offset,
        }
    }

    /// Fetch the first page of `day` and report how many records it held
    #[instrument(skip(self))]
    pub async fn test_connection(&self, day: NaiveDate) -> AppResult<usize> {
        let page = self.fetch_page(day, day, 0).await?;
        info!(
            "PBX API reachable: {} records on first page (total {:?})",
            page.records.len(),
            page.total
        );
        Ok(page.records.len())
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            error!("PBX request timed out after {}s", self.timeout_secs);
            AppError::Timeout(self.timeout_secs)
        } else {
            error!("PBX request failed: {}", e);
            AppError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl CdrFetcher for PbxClient {
    #[instrument(skip(self), fields(domain = %self.domain))]
    async fn fetch_page(
        &self,
        date_from: NaiveDate,
        date_to: NaiveDate,
        offset: i64,
    ) -> AppResult<CdrPage> {
        let query = self.build_query(date_from, date_to, offset);

        debug!(
            "PBX request: {} -> {}, offset={}, limit={}",
            query.from, query.to, query.offset, query.limit
        );

        let mut request = self
            .http_client
            .get(&self.api_url)
            .query(&query)
            .header(header::ACCEPT, "application/json");

        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;

        if !status.is_success() {
            error!("PBX HTTP error: status={}", status);
            return Err(AppError::UpstreamStatus {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let parsed: CdrApiResponse = serde_json::from_str(&body).map_err(|e| {
            error!("Failed to decode PBX response: {}", e);
            AppError::Decode(format!(
                "{} - Body: {}",
                e,
                truncate(&body, MAX_ERROR_BODY)
            ))
        })?;

        debug!(
            "PBX response: {} records, next_offset={:?}",
            parsed.data.len(),
            parsed.next_offset
        );

        Ok(CdrPage {
            records: parsed.data,
            next_offset: parsed.next_offset,
            total: parsed.total,
        })
    }
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
