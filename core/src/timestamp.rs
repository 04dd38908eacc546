//! Lenient timestamp decoding for inbound frames
//!
//! Clients in the wild send RFC 3339 strings, unix seconds or unix
//! milliseconds, sometimes quoted. Anything we cannot make sense of falls back
//! to the receive time rather than failing the frame.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Values above this are interpreted as milliseconds since the epoch
const MILLIS_THRESHOLD: f64 = 1e12;

/// Parse a JSON value as a timestamp
///
/// Returns `None` for values that are neither RFC 3339 nor numeric epochs.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_str(s),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn parse_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    s.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let millis = if raw > MILLIS_THRESHOLD {
        raw as i64
    } else {
        (raw * 1000.0) as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Serde adapter: decode any timestamp shape, defaulting to now
pub(crate) fn deserialize_lenient<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or_else(Utc::now))
}
