//! Argument marshalling.
//!
//! Every argument travels as one field. JSON values are written as their
//! text encoding; binary buffers are written as a base64 JSON string, or in
//! the zero-copy encoding once that capability has been negotiated.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{FrameError, Result};
use crate::writer::FrameWriter;

/// Declared kind of a positional argument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ArgKind {
    #[default]
    Json,
    Binary,
}

impl ArgKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgKind::Json => "json",
            ArgKind::Binary => "binary",
        }
    }

    /// Kind declared for position `idx`, defaulting to JSON past the end.
    pub fn at(kinds: &[ArgKind], idx: usize) -> ArgKind {
        kinds.get(idx).copied().unwrap_or_default()
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArgKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ArgKind::Json),
            "binary" => Ok(ArgKind::Binary),
            other => Err(format!("unknown argument kind '{other}'")),
        }
    }
}

/// A decoded or to-be-encoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Json(Value),
    Binary(Bytes),
}

impl Arg {
    pub fn null() -> Self {
        Arg::Json(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Arg::Json(Value::Null))
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Json(_) => ArgKind::Json,
            Arg::Binary(_) => ArgKind::Binary,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Arg::Json(value) => Some(value),
            Arg::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Arg::Binary(data) => Some(data),
            Arg::Json(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Json(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Json(Value::String(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Json(Value::String(value))
    }
}

impl From<Bytes> for Arg {
    fn from(value: Bytes) -> Self {
        Arg::Binary(value)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Binary(Bytes::from(value))
    }
}

/// Per-channel argument encoding options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgCodec {
    /// Zero-copy was negotiated with the peer.
    pub zero_copy: bool,
    /// Decode integers that do not fit in 64 bits as JSON strings.
    pub big_num_as_string: bool,
}

impl ArgCodec {
    /// Write one argument as a field.
    pub fn encode(&self, arg: &Arg, writer: &mut FrameWriter) -> Result<()> {
        match arg {
            Arg::Json(value) => writer.write_field(&serde_json::to_string(value)?),
            Arg::Binary(data) if self.zero_copy && !data.is_empty() => {
                writer.write_zero_copy(data)
            }
            Arg::Binary(data) => {
                let text = serde_json::to_string(&STANDARD.encode(data))?;
                writer.write_field(&text)
            }
        }
    }

    /// Decode one raw field received at `offset` according to its declared kind.
    ///
    /// An empty field and the literal `null` both decode to JSON null.
    pub fn decode(&self, raw: &[u8], kind: ArgKind, offset: usize) -> Result<Arg> {
        if raw.is_empty() || raw == b"null" {
            return Ok(Arg::null());
        }
        match kind {
            ArgKind::Binary => {
                if raw[0] == b'(' {
                    return Err(FrameError::ZeroCopyUnsupported { offset });
                }
                match serde_json::from_slice::<Value>(raw)? {
                    Value::Null => Ok(Arg::null()),
                    Value::String(text) => Ok(Arg::Binary(Bytes::from(STANDARD.decode(text)?))),
                    other => Ok(Arg::Json(other)),
                }
            }
            ArgKind::Json => {
                let mut value = serde_json::from_slice::<Value>(raw)?;
                if self.big_num_as_string {
                    stringify_big_numbers(&mut value);
                }
                Ok(Arg::Json(value))
            }
        }
    }
}

/// Replace integers outside the 64-bit range with their decimal text.
fn stringify_big_numbers(value: &mut Value) {
    match value {
        Value::Number(n) if !(n.is_i64() || n.is_u64() || n.is_f64()) => {
            *value = Value::String(n.to_string());
        }
        Value::Array(items) => items.iter_mut().for_each(stringify_big_numbers),
        Value::Object(map) => map.values_mut().for_each(stringify_big_numbers),
        _ => {}
    }
}
