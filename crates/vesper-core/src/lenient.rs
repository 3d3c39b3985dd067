//! Deserializers for loosely typed server fields
//!
//! Ids arrive as strings or integers depending on the server, and progress
//! as an integer or a float.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Id carried by a JSON value, if it is a non-empty string or a number
#[must_use]
pub fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Required string-or-integer id
pub fn id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_value(&value).ok_or_else(|| serde::de::Error::custom("expected a string or integer id"))
}

/// Optional string-or-integer id; anything else reads as `None`
pub fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_value))
}

/// Progress clamped to `0..=100`
#[must_use]
pub fn clamp_progress(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// Optional progress as an integer or a float
pub fn opt_progress<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.map(clamp_progress))
}

/// Progress as an integer or a float, `0` when null
pub fn progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    opt_progress(deserializer).map(Option::unwrap_or_default)
}
