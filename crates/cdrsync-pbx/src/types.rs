//! Wire types for the PBX CDR API

use cdrsync_core::models::RawCdr;
use serde::{Deserialize, Serialize};

/// Response body of `GET /api/v2/cdrs`
///
/// Only `data` and `next_offset` drive the pipeline; `total`, `limit`
/// and `offset` are informational.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdrApiResponse {
    #[serde(default)]
    pub data: Vec<RawCdr>,

    #[serde(default)]
    pub total: Option<i64>,

    #[serde(default)]
    pub limit: Option<i64>,

    #[serde(default)]
    pub offset: Option<i64>,

    /// Absent or null at the end of data
    #[serde(default)]
    pub next_offset: Option<i64>,
}

/// Query string of a CDR page request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CdrQuery {
    pub domain: String,

    /// `YYYY-MM-DD 00:00:00`
    pub from: String,

    /// `YYYY-MM-DD 23:59:59`
    pub to: String,

    pub limit: u32,
    pub offset: i64,
}
