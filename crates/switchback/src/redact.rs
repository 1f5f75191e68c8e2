//! Write-time redaction of event metadata.
//!
//! Runs before anything is stored so raw sensitive values never persist,
//! even transiently. Two rules: keys matching a denylist (credentials,
//! tokens, identifiers, contact info) are replaced wholesale, and string
//! values shaped like a national identity number are replaced wherever they
//! appear, including inside nested objects and arrays.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Marker written in place of redacted keys and values.
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Lowercase substrings that mark a metadata key as sensitive.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "credential",
    "authorization",
    "auth",
    "email",
    "phone",
    "address",
    "username",
    "user_id",
    "userid",
    "session_id",
    "sessionid",
    "device_id",
    "deviceid",
    "ssn",
    "personnummer",
];

/// National identity number shapes: six or eight digits, optional century
/// separator, four digits (e.g. `YYMMDD-NNNN`).
static NATIONAL_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{8}|\d{6})[-+]?\d{4}\b").expect("national id pattern is valid")
});

/// Redact a metadata map for storage.
pub fn redact_metadata(metadata: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    metadata
        .into_iter()
        .map(|(key, value)| {
            if is_sensitive_key(&key) {
                (key, Value::String(REDACTED_MARKER.to_string()))
            } else {
                let value = redact_value(value);
                (key, value)
            }
        })
        .collect()
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS.iter().any(|fragment| key.contains(fragment))
}

fn redact_value(value: Value) -> Value {
    match value {
        Value::String(s) if NATIONAL_ID_PATTERN.is_match(&s) => {
            Value::String(REDACTED_MARKER.to_string())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive_key(&key) {
                        (key, Value::String(REDACTED_MARKER.to_string()))
                    } else {
                        (key, redact_value(value))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn redacted() -> Value {
        json!(REDACTED_MARKER)
    }

    #[test]
    fn test_denylisted_keys_replaced() {
        let metadata = BTreeMap::from([
            ("auth_token".to_string(), json!("abc123")),
            ("userEmail".to_string(), json!("someone@example.com")),
            ("retry_count".to_string(), json!(3)),
        ]);
        let out = redact_metadata(metadata);
        assert_eq!(out["auth_token"], redacted());
        assert_eq!(out["userEmail"], redacted());
        assert_eq!(out["retry_count"], json!(3));
    }

    #[test]
    fn test_national_id_shaped_values_replaced() {
        let metadata = BTreeMap::from([
            ("note".to_string(), json!("caller 900101-1234 reported lag")),
            ("other".to_string(), json!("19900101+1234")),
            ("version".to_string(), json!("1.2.3")),
        ]);
        let out = redact_metadata(metadata);
        assert_eq!(out["note"], redacted());
        assert_eq!(out["other"], redacted());
        assert_eq!(out["version"], json!("1.2.3"));
    }

    #[test]
    fn test_nested_structures_are_walked() {
        let metadata = BTreeMap::from([(
            "context".to_string(),
            json!({
                "password": "hunter2",
                "ids": ["900101-1234", "ok"],
                "depth": { "api_key": "k" }
            }),
        )]);
        let out = redact_metadata(metadata);
        assert_eq!(out["context"]["password"], redacted());
        assert_eq!(out["context"]["ids"][0], redacted());
        assert_eq!(out["context"]["ids"][1], json!("ok"));
        assert_eq!(out["context"]["depth"]["api_key"], redacted());
    }

    #[test]
    fn test_plain_durations_and_flags_untouched() {
        let metadata = BTreeMap::from([
            ("duration_ms".to_string(), json!(120)),
            ("used_cache".to_string(), json!(true)),
        ]);
        let out = redact_metadata(metadata.clone());
        assert_eq!(out, metadata);
    }
}
