//! Opaque call arguments.
//!
//! Server calls carry loosely-typed arguments. They are modelled as a small
//! variant type with explicit coercion rules instead of runtime downcasts.

use base64::Engine as _;

/// A single argument of a hub call, or the result of a client invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    /// Plain text.
    Text(String),
    /// Raw bytes (binary transports only; the JSON transport never produces these).
    Bytes(Vec<u8>),
    /// Any other structured value: numbers, booleans, arrays, objects.
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Json(serde_json::Value::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Coerce to text for decoding and logging.
    ///
    /// Order: text passes through, bytes are read as (lossy) UTF-8, a JSON
    /// array contributes its first element, maps and anything else are
    /// re-serialized.
    pub fn coerce_to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Json(json) => json_to_text(json, true),
        }
    }

    /// Wire representation for JSON transports. Bytes become base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Json(json) => json.clone(),
        }
    }
}

fn json_to_text(json: &serde_json::Value, unwrap_sequence: bool) -> String {
    match json {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) if unwrap_sequence => items
            .first()
            .map(|first| json_to_text(first, false))
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Json(other),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Json(serde_json::Value::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Json(n.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_strings_become_text() {
        assert_eq!(Value::from(serde_json::json!("abc")), Value::Text("abc".into()));
        assert_eq!(Value::from(serde_json::Value::Null), Value::Null);
        assert!(matches!(Value::from(serde_json::json!(5)), Value::Json(_)));
    }

    #[test]
    fn coerce_text_and_bytes() {
        assert_eq!(Value::from("a~b").coerce_to_text(), "a~b");
        assert_eq!(Value::Bytes(b"raw".to_vec()).coerce_to_text(), "raw");
        assert_eq!(Value::Null.coerce_to_text(), "");
    }

    #[test]
    fn coerce_sequence_takes_first_element() {
        let v = Value::Json(serde_json::json!(["first", "second"]));
        assert_eq!(v.coerce_to_text(), "first");

        let nested = Value::Json(serde_json::json!([{"k": 1}]));
        assert_eq!(nested.coerce_to_text(), r#"{"k":1}"#);

        let empty = Value::Json(serde_json::json!([]));
        assert_eq!(empty.coerce_to_text(), "");
    }

    #[test]
    fn coerce_map_reserializes() {
        let v = Value::Json(serde_json::json!({"data": "x"}));
        assert_eq!(v.coerce_to_text(), r#"{"data":"x"}"#);
    }

    #[test]
    fn bytes_go_over_json_as_base64() {
        let v = Value::Bytes(b"hello".to_vec());
        assert_eq!(v.to_json(), serde_json::json!("aGVsbG8="));
    }

    #[test]
    fn null_detection() {
        assert!(Value::Null.is_null());
        assert!(Value::Json(serde_json::Value::Null).is_null());
        assert!(!Value::from("").is_null());
    }
}
