use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Peer attribute naming the transport to use.
pub const ATTR_TRANSPORT_NAME: &str = "TransportName";

/// Transport used when a peer does not name one.
pub const DEFAULT_TRANSPORT: &str = "TCP";

/// Outbound half of a link, implemented by the transport.
///
/// The channel calls [`flush_output`](Self::flush_output) once per complete
/// message, synchronously, from inside its own processing turn. Implementations
/// must not call back into the same channel from either method.
pub trait TransportSink: Send + Sync {
    /// Push one framed buffer onto the wire.
    fn flush_output(&self, data: Bytes) -> Result<()>;

    /// Close the underlying connection.
    fn close_connection(&self);
}

/// Inbound half of a link, implemented by the channel.
///
/// A transport drives these hooks as bytes arrive or the connection ends.
pub trait Endpoint: Send + Sync {
    /// A chunk of bytes arrived. Chunk boundaries carry no meaning.
    fn on_data(&self, chunk: Bytes);

    /// The connection was closed by the remote side or the transport.
    fn on_closed(&self);

    /// The transport failed.
    fn on_error(&self, err: TransportError);

    /// Hand the endpoint the sink it must use for output.
    fn attach(&self, sink: Arc<dyn TransportSink>);
}

/// Creates links for one transport kind.
pub trait TransportFactory: Send + Sync {
    /// Registry name, matched case-insensitively.
    fn name(&self) -> &str;

    /// Establish a link described by `attrs` and wire it to `endpoint`.
    ///
    /// On success the endpoint has been given its sink and will receive
    /// `on_data`/`on_closed`/`on_error` calls from now on.
    fn connect(&self, attrs: &PeerAttributes, endpoint: Arc<dyn Endpoint>) -> Result<()>;
}

/// Connection parameters of a peer, as an ordered attribute map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAttributes {
    attrs: BTreeMap<String, String>,
}

impl PeerAttributes {
    /// Create an empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Transport name, falling back to [`DEFAULT_TRANSPORT`].
    pub fn transport_name(&self) -> &str {
        self.get(ATTR_TRANSPORT_NAME).unwrap_or(DEFAULT_TRANSPORT)
    }

    /// Look up a required attribute.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| TransportError::Rejected(format!("missing peer attribute '{key}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PeerAttributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Self::new();
        for (key, value) in iter {
            attrs.insert(key, value);
        }
        attrs
    }
}
