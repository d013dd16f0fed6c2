//! ==============================================================================
//! domain.rs - readings and ingest payload decoding
//! ==============================================================================
//!
//! purpose:
//!     the one record that flows through the whole system: a water quality
//!     sample (tds + temperature) stamped by the server at accept time.
//!     also owns the rules for turning an untrusted json payload from the
//!     probe into numbers.
//!
//! relationships:
//!     - used by: server.rs (cache slot, ingest), store.rs (csv rows),
//!       poller.rs (rolling series), recorder.rs (recording rows)
//!     - uses: error.rs (IngestError)
//!
//! ==============================================================================

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;

/// timestamp placed in the cache before the first reading arrives
pub const NO_READING_TIMESTAMP: &str = "N/A";

/// timestamp used for the series entry injected when the server is unreachable
pub const NO_DATA_TIMESTAMP: &str = "No Data";

/// server stamp format; lexical order matches chronological order
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// one accepted sensor sample
///
/// field order is the csv column order: `timestamp,tds_value,temperature`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// server-assigned stamp (see [`TIMESTAMP_FORMAT`]) or a sentinel
    pub timestamp: String,
    /// total dissolved solids, ppm
    pub tds_value: f64,
    /// water temperature, celsius
    pub temperature: f64,
}

impl Reading {
    /// stamp a decoded payload
    pub fn stamped(at: NaiveDateTime, tds_value: f64, temperature: f64) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            tds_value,
            temperature,
        }
    }

    /// the "no reading yet" cache value
    pub fn sentinel() -> Self {
        Self {
            timestamp: NO_READING_TIMESTAMP.to_string(),
            tds_value: 0.0,
            temperature: 0.0,
        }
    }

    /// the placeholder series entry for a monitor that has never reached the server
    pub fn no_data() -> Self {
        Self {
            timestamp: NO_DATA_TIMESTAMP.to_string(),
            tds_value: 0.0,
            temperature: 0.0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.timestamp == NO_READING_TIMESTAMP
    }

    pub fn is_no_data(&self) -> bool {
        self.timestamp == NO_DATA_TIMESTAMP
    }
}

impl Default for Reading {
    fn default() -> Self {
        Self::sentinel()
    }
}

// ==============================================================================
// payload decoding
// ==============================================================================
// the probe firmware sends `{"tds_value": .., "temperature": ..}`. numbers may
// arrive as json numbers or numeric strings depending on the firmware build.

/// what to do when the probe leaves a field out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// reject with MalformedInput
    #[default]
    Strict,
    /// treat the field as 0.0
    Permissive,
}

/// numeric fields of an ingest body, not yet stamped
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub tds_value: f64,
    pub temperature: f64,
}

impl Measurement {
    /// decode a raw request body
    pub fn from_body(body: &[u8], policy: MissingFieldPolicy) -> Result<Self, IngestError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(IngestError::MalformedInput("No JSON data received".into()));
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| IngestError::MalformedInput(format!("body is not valid JSON: {}", e)))?;
        Self::from_json(&value, policy)
    }

    /// decode an already-parsed json value
    pub fn from_json(value: &Value, policy: MissingFieldPolicy) -> Result<Self, IngestError> {
        let object = value
            .as_object()
            .ok_or_else(|| IngestError::MalformedInput("expected a JSON object".into()))?;

        // tds first: a bad tds value is reported even when temperature is absent
        let tds_value = field(object, "tds_value", policy)?;
        let temperature = field(object, "temperature", policy)?;

        Ok(Self { tds_value, temperature })
    }
}

fn field(
    object: &serde_json::Map<String, Value>,
    name: &'static str,
    policy: MissingFieldPolicy,
) -> Result<f64, IngestError> {
    match object.get(name) {
        None => match policy {
            MissingFieldPolicy::Strict => {
                Err(IngestError::MalformedInput(format!("missing field `{}`", name)))
            }
            MissingFieldPolicy::Permissive => Ok(0.0),
        },
        Some(raw) => coerce(raw).ok_or(IngestError::InvalidFormat { field: name }),
    }
}

/// json number or numeric string -> finite f64
fn coerce(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}
