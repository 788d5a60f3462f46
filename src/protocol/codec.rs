//! Frame codec
//!
//! Outbound: command → JSON → base64. Inbound: base64 → JSON, with the short
//! field names (`s`, `m`, `p`, `a`) folded into the long ones so nothing past
//! this module ever sees them.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::command::Command;

/// A decoded response frame with canonical field names
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseFrame {
    pub status: Option<String>,
    pub message: Option<String>,
    pub payload: Value,
    pub action: Option<String>,
}

impl ResponseFrame {
    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or_default()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// String field of the payload, if present and non-empty
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn payload_flag(&self, key: &str) -> bool {
        match self.payload.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// Both historical field-naming schemes, read side by side
#[derive(Debug, Deserialize)]
struct RawFrame {
    status: Option<Value>,
    s: Option<Value>,
    message: Option<Value>,
    m: Option<Value>,
    payload: Option<Value>,
    p: Option<Value>,
    action: Option<Value>,
    a: Option<Value>,
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid base64 frame: {0}")]
    Base64(String),

    #[error("Frame is not valid UTF-8")]
    Utf8,

    #[error("Invalid JSON frame: {0}")]
    Json(String),

    #[error("Malformed chunk header: {0}")]
    MalformedChunkHeader(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Encode a command into the base64 value written to the command characteristic
pub fn encode(command: &Command) -> Result<String, CodecError> {
    let json = serde_json::to_string(command).map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(STANDARD.encode(json.as_bytes()))
}

/// Undo the transport encoding of one notification value
pub fn unwrap_transport(value: &str) -> Result<String, CodecError> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| CodecError::Utf8)
}

/// Parse one complete JSON response into its canonical shape
pub fn parse_frame(text: &str) -> Result<ResponseFrame, CodecError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))?;

    Ok(ResponseFrame {
        status: first_text(raw.status, raw.s),
        message: first_text(raw.message, raw.m),
        payload: first_value(raw.payload, raw.p).unwrap_or(Value::Null),
        action: first_text(raw.action, raw.a),
    })
}

/// Decode a base64 notification value carrying a whole (unchunked) frame
pub fn decode(value: &str) -> Result<ResponseFrame, CodecError> {
    parse_frame(&unwrap_transport(value)?)
}

// The long name wins when both are present and meaningful
fn first_value(long: Option<Value>, short: Option<Value>) -> Option<Value> {
    long.filter(is_present).or(short.filter(is_present))
}

fn first_text(long: Option<Value>, short: Option<Value>) -> Option<String> {
    first_value(long, short).map(|value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
