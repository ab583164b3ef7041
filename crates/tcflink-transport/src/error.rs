/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has already been closed.
    #[error("transport closed")]
    Closed,

    /// An I/O error occurred on the underlying connection.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No transport factory is registered under the requested name.
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),

    /// The transport refused the connection parameters.
    #[error("connection rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
