use crate::codec::Marker;

/// Errors that can occur while encoding or decoding the wire format.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer ended in the middle of a field or escape sequence.
    #[error("truncated input at byte {offset}")]
    Truncated { offset: usize },

    /// A message or stream boundary appeared inside a field.
    #[error("unexpected {marker} at byte {offset}")]
    UnexpectedMarker { marker: Marker, offset: usize },

    /// An escape byte was followed by an unknown tag.
    #[error("invalid escape tag {tag:#04x} at byte {offset}")]
    InvalidEscape { tag: u8, offset: usize },

    /// A zero-copy binary buffer was received; decoding those is not supported.
    #[error("zero-copy buffer at byte {offset} is not supported")]
    ZeroCopyUnsupported { offset: usize },

    /// A text field was not valid UTF-8.
    #[error("invalid UTF-8 in field at byte {offset}")]
    InvalidUtf8 { offset: usize },

    /// The message type field is not one of `C`, `R`, `P`, `N`, `E`.
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    /// The message does not fit in the output buffer.
    #[error("output buffer overflow ({needed} bytes, capacity {capacity})")]
    OutputOverflow { needed: usize, capacity: usize },

    /// An argument was not valid JSON, or could not be serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary argument was not valid base64.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A message was requested but no complete message is buffered.
    #[error("no complete message buffered")]
    NoPendingMessage,
}

pub type Result<T> = std::result::Result<T, FrameError>;
