//! Persisted record types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace prefix for probe records in the key/value store.
pub const URL_KEY_PREFIX: &str = "url:";

/// Build the store key for a probed target.
pub fn url_key(target: &str) -> String {
    format!("{}{}", URL_KEY_PREFIX, target)
}

/// A single value in a persisted record.
///
/// HTTP probes record numbers, TCP and DNS probes record descriptive text
/// such as `"tcp handshake success"` or `"N/A"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RecordValue {
    /// Whether the value counts as present in a history summary.
    ///
    /// Zero and empty text are treated as absent.
    pub fn is_present(&self) -> bool {
        match self {
            RecordValue::Int(v) => *v != 0,
            RecordValue::Float(v) => *v != 0.0,
            RecordValue::Text(v) => !v.is_empty(),
        }
    }
}

impl fmt::Display for RecordValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordValue::Int(v) => write!(f, "{}", v),
            RecordValue::Float(v) => write!(f, "{}", v),
            RecordValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<u16> for RecordValue {
    fn from(v: u16) -> Self {
        RecordValue::Int(v as i64)
    }
}

impl From<f64> for RecordValue {
    fn from(v: f64) -> Self {
        RecordValue::Float(v)
    }
}

impl From<&str> for RecordValue {
    fn from(v: &str) -> Self {
        RecordValue::Text(v.to_string())
    }
}

impl From<String> for RecordValue {
    fn from(v: String) -> Self {
        RecordValue::Text(v)
    }
}

/// The persisted summary of the latest probe against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRecord {
    pub response_time_ms: Option<RecordValue>,
    pub response_code: Option<RecordValue>,
}

impl PingRecord {
    pub fn new(code: impl Into<RecordValue>, time_ms: impl Into<RecordValue>) -> Self {
        Self {
            response_time_ms: Some(time_ms.into()),
            response_code: Some(code.into()),
        }
    }

    /// Human readable summary shown on the history listing.
    ///
    /// Empty unless both fields are present.
    pub fn summary(&self) -> String {
        match (&self.response_code, &self.response_time_ms) {
            (Some(code), Some(time)) if code.is_present() && time.is_present() => {
                format!("code: {} response time: {}ms", code, time)
            }
            _ => String::new(),
        }
    }
}
