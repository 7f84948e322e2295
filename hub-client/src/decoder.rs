//! Payload recovery for well-known data events.
//!
//! Price and status payloads arrive in one of several shapes: a JSON
//! envelope with a `data` field, raw Brotli, base64-wrapped Brotli, or an
//! already-plain tilde-delimited record. [`decode`] tries each in turn and
//! always produces something deliverable.

use std::io::Read;

use base64::Engine as _;

use crate::value::Value;

/// Field separator of the telemetry record format.
pub const FIELD_DELIMITER: char = '~';

/// Cap on decompressed output, guarding against decompression bombs.
const MAX_DECOMPRESSED_BYTES: u64 = 16 * 1024 * 1024;
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Result of decoding a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A tilde-delimited record, split into its ordered fields.
    Fields(Vec<String>),
    /// A JSON object or array.
    Structured(serde_json::Value),
    /// Opaque text: either plain text or a payload no strategy could decode.
    Text(String),
}

impl Decoded {
    pub fn fields(&self) -> Option<&[String]> {
        match self {
            Decoded::Fields(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Decode a single opaque value.
pub fn decode(value: &Value) -> Decoded {
    if let Value::Bytes(bytes) = value
        && let Some(text) = brotli_to_text(bytes)
    {
        return parse_record(text);
    }
    decode_text(&value.coerce_to_text())
}

/// Decode a payload that has already been coerced to text.
pub fn decode_text(raw: &str) -> Decoded {
    let candidate = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(obj)) => match obj.get("data") {
            Some(serde_json::Value::String(inner)) => inner.clone(),
            _ => return Decoded::Structured(serde_json::Value::Object(obj)),
        },
        Ok(json @ serde_json::Value::Array(_)) => return Decoded::Structured(json),
        _ => raw.to_string(),
    };

    match recover(&candidate) {
        Some(text) => parse_record(text),
        None => {
            tracing::warn!(
                len = candidate.len(),
                preview = %truncate(&candidate, 100),
                "payload matched no decode strategy, delivering as text"
            );
            Decoded::Text(candidate)
        }
    }
}

/// Try decompression strategies in order, returning the first plain text.
fn recover(candidate: &str) -> Option<String> {
    if let Some(text) = brotli_to_text(candidate.as_bytes()) {
        tracing::trace!("payload was raw brotli");
        return Some(text);
    }
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(candidate.trim())
        && let Some(text) = brotli_to_text(&bytes)
    {
        tracing::trace!("payload was base64 + brotli");
        return Some(text);
    }
    if candidate.contains(FIELD_DELIMITER) {
        return Some(candidate.to_string());
    }
    None
}

/// Decompress Brotli bytes. Empty or non-UTF-8 output counts as failure, since
/// short plain-text inputs can happen to parse as an empty Brotli stream.
fn brotli_to_text(input: &[u8]) -> Option<String> {
    let mut out = Vec::new();
    brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE)
        .take(MAX_DECOMPRESSED_BYTES)
        .read_to_end(&mut out)
        .ok()?;
    if out.is_empty() {
        return None;
    }
    String::from_utf8(out).ok()
}

fn parse_record(text: String) -> Decoded {
    if text.contains(FIELD_DELIMITER) {
        return Decoded::Fields(text.split(FIELD_DELIMITER).map(str::to_string).collect());
    }
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Decoded::Structured(json)
        }
        _ => Decoded::Text(text),
    }
}

/// Truncate on a char boundary for log previews.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s.get(..idx).unwrap_or(s)),
        None => s.to_string(),
    }
}
