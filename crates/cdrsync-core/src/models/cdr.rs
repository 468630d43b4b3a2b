//! CDR (Call Detail Record) model
//!
//! `RawCdr` is the verbatim upstream payload; `CdrRecord` is the typed shape
//! the rest of the pipeline works with. `RawCdr::normalize` is the only place
//! upstream field names are interpreted.

use crate::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Call direction as reported by the PBX
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Unknown,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
            CallDirection::Unknown => "unknown",
        }
    }

    /// Lenient parse: anything that is not inbound/outbound is `Unknown`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" => CallDirection::Inbound,
            "outbound" => CallDirection::Outbound,
            _ => CallDirection::Unknown,
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallDirection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_lenient(s))
    }
}

/// Normalized call detail record
///
/// `uuid` is the only identity. Every other field is overwritten by a later
/// upsert of the same uuid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdrRecord {
    /// Call unique identifier (from PBX)
    pub uuid: String,

    /// Call direction
    pub direction: CallDirection,

    /// Caller number / extension (may be empty)
    pub caller_number: String,

    /// Outbound caller id presented to the callee
    pub outbound_caller_number: Option<String>,

    /// Called number (may be empty)
    pub destination_number: String,

    /// Call start, epoch seconds (None if unknown)
    pub start_epoch: Option<i64>,

    /// Call answer, epoch seconds (None if unanswered)
    pub answer_epoch: Option<i64>,

    /// Call end, epoch seconds (None if unknown)
    pub end_epoch: Option<i64>,

    /// Total call duration in seconds
    pub duration_seconds: i64,

    /// Billable duration in seconds (from answer to hangup)
    pub billable_seconds: i64,

    /// PBX call status (ANSWERED, NO_ANSWER, BUSY, CANCELED, ...)
    pub call_status: String,

    /// SIP hangup disposition
    pub hangup_disposition: Option<String>,

    /// Path of the call recording on the PBX
    pub recording_path: Option<String>,

    /// Upstream payload, preserved verbatim
    pub raw: Value,
}

impl CdrRecord {
    /// Check if the call was answered
    #[inline]
    pub fn was_answered(&self) -> bool {
        self.answer_epoch.is_some()
    }

    /// Call start as a UTC timestamp
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_epoch
            .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
    }

    /// Check the invariants every store enforces on write
    pub fn check_invariants(&self) -> AppResult<()> {
        let reject = |reason: &str| AppError::RecordWrite {
            uuid: self.uuid.clone(),
            reason: reason.to_string(),
        };

        if self.uuid.trim().is_empty() {
            return Err(reject("uuid is empty"));
        }
        if self.duration_seconds < 0 || self.billable_seconds < 0 {
            return Err(reject("negative duration"));
        }
        if self.billable_seconds > self.duration_seconds {
            return Err(reject("billable seconds exceed duration"));
        }
        Ok(())
    }
}

/// Raw CDR as returned by the PBX API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawCdr(Value);

impl RawCdr {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Upstream identifier, if present and non-empty
    pub fn uuid(&self) -> Option<&str> {
        self.0
            .get("uuid")
            .and_then(Value::as_str)
            .filter(|uuid| !uuid.trim().is_empty())
    }

    /// Map the upstream payload onto a `CdrRecord`.
    ///
    /// Integer fields may arrive as JSON numbers or numeric strings;
    /// absent, null and `0` epochs all mean "unknown".
    pub fn normalize(&self) -> AppResult<CdrRecord> {
        let obj = self
            .0
            .as_object()
            .ok_or_else(|| AppError::InvalidRecord("record is not a JSON object".to_string()))?;

        let uuid = self
            .uuid()
            .ok_or_else(|| AppError::InvalidRecord("record has no uuid".to_string()))?
            .to_string();

        let epoch = |key: &str| -> AppResult<Option<i64>> {
            Ok(int_field(obj, key, &uuid)?.filter(|value| *value != 0))
        };

        Ok(CdrRecord {
            direction: str_field(obj, "direction")
                .map(|d| CallDirection::parse_lenient(&d))
                .unwrap_or(CallDirection::Unknown),
            caller_number: str_field(obj, "caller_id_number").unwrap_or_default(),
            outbound_caller_number: str_field(obj, "outbound_caller_id_number"),
            destination_number: str_field(obj, "destination_number").unwrap_or_default(),
            start_epoch: epoch("start_epoch")?,
            answer_epoch: epoch("answer_epoch")?,
            end_epoch: epoch("end_epoch")?,
            duration_seconds: int_field(obj, "duration", &uuid)?.unwrap_or(0),
            billable_seconds: int_field(obj, "billsec", &uuid)?.unwrap_or(0),
            call_status: str_field(obj, "call_status").unwrap_or_default(),
            hangup_disposition: str_field(obj, "sip_hangup_disposition"),
            recording_path: str_field(obj, "record_path"),
            raw: self.0.clone(),
            uuid,
        })
    }
}

impl From<Value> for RawCdr {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(obj: &Map<String, Value>, key: &str, uuid: &str) -> AppResult<Option<i64>> {
    let invalid = || AppError::InvalidRecord(format!("{}: field '{}' is not an integer", uuid, key));

    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                .map(Some)
                .map_err(|_| invalid())
        }
        Some(_) => Err(invalid()),
    }
}

/// Per-batch write outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub success: u64,
    pub failed: u64,
}

impl UpsertSummary {
    pub fn total(&self) -> u64 {
        self.success + self.failed
    }
}

/// Aggregate statistics over the stored records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total: i64,
    pub by_direction: BTreeMap<String, i64>,
    pub by_call_status: BTreeMap<String, i64>,
    pub earliest_start: Option<DateTime<Utc>>,
    pub latest_start: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "uuid": "c0ffee-01",
            "direction": "outbound",
            "caller_id_number": "1001",
            "outbound_caller_id_number": "02838000000",
            "destination_number": "0909123456",
            "start_epoch": 1734652800,
            "answer_epoch": "1734652805",
            "end_epoch": 1734652865,
            "duration": 65,
            "billsec": "60",
            "sip_hangup_disposition": "send_bye",
            "call_status": "ANSWERED",
            "record_path": "2024/12/20/c0ffee-01.wav"
        })
    }

    #[test]
    fn test_normalize_full_record() {
        let raw = RawCdr::new(sample());
        let record = raw.normalize().unwrap();

        assert_eq!(record.uuid, "c0ffee-01");
        assert_eq!(record.direction, CallDirection::Outbound);
        assert_eq!(record.caller_number, "1001");
        assert_eq!(record.answer_epoch, Some(1734652805));
        assert_eq!(record.billable_seconds, 60);
        assert_eq!(record.call_status, "ANSWERED");
        assert_eq!(record.hangup_disposition.as_deref(), Some("send_bye"));
        assert_eq!(record.raw, sample());
        assert!(record.was_answered());
    }

    #[test]
    fn test_normalize_unanswered_call() {
        let raw = RawCdr::new(json!({
            "uuid": "c0ffee-02",
            "direction": "local",
            "start_epoch": 1734652800,
            "answer_epoch": 0,
            "duration": 12,
            "call_status": "NO_ANSWER"
        }));
        let record = raw.normalize().unwrap();

        assert_eq!(record.direction, CallDirection::Unknown);
        assert_eq!(record.answer_epoch, None);
        assert_eq!(record.end_epoch, None);
        assert_eq!(record.billable_seconds, 0);
        assert_eq!(record.destination_number, "");
        assert!(!record.was_answered());
    }

    #[test]
    fn test_normalize_rejects_missing_uuid() {
        let raw = RawCdr::new(json!({ "uuid": "", "duration": 3 }));
        assert!(raw.uuid().is_none());
        assert!(matches!(raw.normalize(), Err(AppError::InvalidRecord(_))));

        let raw = RawCdr::new(json!(["not", "an", "object"]));
        assert!(matches!(raw.normalize(), Err(AppError::InvalidRecord(_))));
    }

    #[test]
    fn test_normalize_rejects_garbage_integer() {
        let raw = RawCdr::new(json!({ "uuid": "x", "duration": "forever" }));
        assert!(matches!(raw.normalize(), Err(AppError::InvalidRecord(_))));
    }

    #[test]
    fn test_invariants() {
        let mut record = RawCdr::new(sample()).normalize().unwrap();
        assert!(record.check_invariants().is_ok());

        record.billable_seconds = record.duration_seconds + 1;
        assert!(matches!(
            record.check_invariants(),
            Err(AppError::RecordWrite { .. })
        ));
    }
}
