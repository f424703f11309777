//! Value sniffing: base64 payloads, embedded JSON and sensitive key names

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

// Anchored at the start only: a canonical base64 prefix ending in padding is enough.
static BASE64_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-zA-Z+/]{4})*(([0-9a-zA-Z+/]{2}==)|([0-9a-zA-Z+/]{3}=))").unwrap()
});

const SENSITIVE_MARKER: &str = "password";

/// Check whether a value is a string shaped like base64
pub fn is_base64(value: &Value) -> bool {
    match value {
        Value::String(s) => !s.is_empty() && BASE64_REGEX.is_match(s),
        _ => false,
    }
}

/// Parse a string as JSON, if it is JSON
pub fn parse_json_string(s: &str) -> Option<Value> {
    serde_json::from_str(s).ok()
}

/// Decode a base64 string value.
///
/// The decoded text replaces the value; if that text is itself JSON the
/// parsed structure replaces it instead. On failure the original value is
/// returned unchanged.
pub fn decode_base64(path: &str, value: Value) -> Value {
    let Value::String(encoded) = &value else {
        return value;
    };

    match STANDARD.decode(encoded.as_bytes()) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            parse_json_string(&text).unwrap_or(Value::String(text))
        }
        Err(error) => {
            warn!(path = %path, %error, "Cannot parse base64");
            value
        }
    }
}

/// Case-insensitive check for "password" in a key or dotted path
pub fn is_sensitive(name: &str) -> bool {
    name.to_lowercase().contains(SENSITIVE_MARKER)
}
