//! Derived leaves: decimal trimming and mile to kilometre conversion

use serde_json::{Number, Value};

const MILES_TO_KM: f64 = 1.609344;

/// Fields stored with two decimals
const TRIM_TO_TWO_DECIMALS: &[&str] = &[
    "percentage_charged",
    "battery_power",
    "energy_left",
    "load_power",
    "grid_power",
    "solar_power",
    "battery",
    "solar",
];

/// Fields holding a distance (or speed) in miles
const DISTANCE_KEYS: &[&str] = &["odometer", "range", "speed"];

pub fn trims_decimals(key: &str) -> bool {
    TRIM_TO_TWO_DECIMALS.contains(&key) || key.contains("_imported") || key.contains("_exported")
}

pub fn is_distance_key(key: &str) -> bool {
    DISTANCE_KEYS.contains(&key) || key.ends_with("_range")
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Numeric reading of a value; numeric strings count, booleans do not
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// JSON number for a float, integral values stay integers
pub fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

/// Round power/energy readings to two decimals; other keys pass through
pub fn trim_decimals(key: &str, value: Value) -> Value {
    if !trims_decimals(key) {
        return value;
    }
    match as_f64(&value) {
        Some(f) => number_value(round2(f)),
        None => value,
    }
}

/// Kilometre value for a distance key, if the value is numeric
pub fn distance_in_km(key: &str, value: &Value) -> Option<f64> {
    if !is_distance_key(key) {
        return None;
    }
    as_f64(value).map(|miles| round2(miles * MILES_TO_KM))
}

pub fn companion_path(path: &str, key: &str) -> String {
    format!("{}.{}_km", path, key)
}
