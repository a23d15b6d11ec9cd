//! Coercion of raw vendor values into typed resolutions.
//!
//! Every provider funnels its raw flag value through these functions, so all providers agree on
//! how a string, number or structured value is read as another type. A missing or `null` raw value
//! always yields the caller's default.

use serde_json::{Number, Value};

/// Read `raw` as a boolean.
///
/// Booleans pass through, strings compare case-insensitively to `"true"`, numbers are `true` when
/// non-zero. Anything else falls back to `default`.
pub fn to_boolean(raw: Option<&Value>, default: bool) -> bool {
    raw.and_then(as_boolean).unwrap_or(default)
}

/// Read `raw` as a string. Non-string values are stringified.
pub fn to_string(raw: Option<&Value>, default: &str) -> String {
    raw.and_then(as_string).unwrap_or_else(|| default.to_owned())
}

/// Read `raw` as a number.
///
/// Numbers pass through (including `0`), strings are parsed after trimming. Strings that are empty,
/// unparsable or not finite fall back to `default`, so `NaN` never leaks out.
pub fn to_number(raw: Option<&Value>, default: f64) -> f64 {
    raw.and_then(as_number).unwrap_or(default)
}

/// Read `raw` as a structured value. Present values pass through unmodified.
pub fn to_object(raw: Option<&Value>, default: &Value) -> Value {
    raw.and_then(as_object).unwrap_or_else(|| default.clone())
}

/// The boolean reading of `value`, or `None` if the caller's default applies.
pub fn as_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}

/// The string reading of `value`, or `None` if it is `null`.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(format_number(n)),
        value => Some(value.to_string()),
    }
}

/// The numeric reading of `value`, or `None` if the caller's default applies.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// `value` itself, or `None` if it is `null`.
pub fn as_object(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        value => Some(value.clone()),
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

// Whole floats print without a trailing ".0".
fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{:.0}", f),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}
