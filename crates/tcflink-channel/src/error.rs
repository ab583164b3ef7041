use tcflink_frame::FrameError;
use tcflink_transport::TransportError;

use crate::handshake::ConnectionState;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Malformed framing or an undecodable message. Fatal to the channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// A reply arrived for a token with no command in flight. Fatal to the channel.
    #[error("protocol error: reply for unknown token {0:?}")]
    UnknownToken(String),

    /// A well-framed message with content the channel cannot use. Fatal to the channel.
    #[error("protocol error: {0}")]
    Malformed(String),

    /// The channel was disconnected before the operation completed.
    #[error("channel closed")]
    ChannelClosed,

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A local command handler failed.
    #[error("application error: {0}")]
    Application(String),

    /// The peer answered `N`: it does not know the command.
    #[error("command {service}.{method} not recognized by peer")]
    NotRecognized { service: String, method: String },

    /// The operation is not valid in the current connection state.
    #[error("invalid channel state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: ConnectionState,
    },

    /// A handler for this (service, event) pair is already registered.
    #[error("event handler for {service}.{event} already registered")]
    DuplicateEventHandler { service: String, event: String },
}

pub type Result<T> = std::result::Result<T, ChannelError>;
