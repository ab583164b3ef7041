use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tcflink_transport::{
    pipe, pipe_with_chunk_size, Endpoint, PeerAttributes, TransportError, TransportFactory,
};
use tracing::info;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::events::LifecycleEvent;
use crate::protocol::Protocol;

/// Transport name [`MemoryServer`] registers under by default.
pub const MEMORY_TRANSPORT: &str = "MEM";

/// In-process listener: every `connect` creates and starts a server-side
/// channel serving `protocol`, piped to the connecting endpoint.
pub struct MemoryServer {
    name: String,
    protocol: Arc<dyn Protocol>,
    config: ChannelConfig,
    chunk_size: Option<usize>,
    accepted: Arc<Mutex<Vec<Channel>>>,
}

impl MemoryServer {
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self {
            name: MEMORY_TRANSPORT.to_string(),
            protocol,
            config: ChannelConfig::default(),
            chunk_size: None,
            accepted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register under a different transport name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Configuration for accepted channels.
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver traffic in both directions in chunks of at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Server-side channels accepted and not yet closed.
    pub fn channels(&self) -> Vec<Channel> {
        self.accepted.lock().clone()
    }
}

impl TransportFactory for MemoryServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(
        &self,
        _attrs: &PeerAttributes,
        endpoint: Arc<dyn Endpoint>,
    ) -> tcflink_transport::Result<()> {
        let server = Channel::spawn(Some(Arc::clone(&self.protocol)), self.config.clone());
        let id = server.id();
        let accepted: Weak<Mutex<Vec<Channel>>> = Arc::downgrade(&self.accepted);
        server.add_handler(LifecycleEvent::Close, move |_| {
            if let Some(accepted) = accepted.upgrade() {
                accepted.lock().retain(|channel| channel.id() != id);
            }
        });
        self.accepted.lock().push(server.clone());

        let server_end: Arc<dyn Endpoint> = Arc::new(server.clone());
        match self.chunk_size {
            Some(size) => pipe_with_chunk_size(endpoint, server_end, size),
            None => pipe(endpoint, server_end),
        }
        if let Err(err) = server.start() {
            server.close();
            return Err(TransportError::Rejected(err.to_string()));
        }
        info!(
            channel = id,
            transport = %self.name,
            "accepted memory connection"
        );
        Ok(())
    }
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryServer")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("accepted", &self.accepted.lock().len())
            .finish()
    }
}
