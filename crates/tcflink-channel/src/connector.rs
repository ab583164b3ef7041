use std::sync::Arc;

use tcflink_transport::{Endpoint, PeerAttributes, TransportRegistry};
use tracing::debug;

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::protocol::Protocol;

/// Open a channel to the peer described by `attrs` and start its handshake.
///
/// The transport is picked by the `TransportName` attribute, `TCP` when
/// absent. The channel's driver is spawned on the current tokio runtime.
/// Await [`Channel::wait_connected`] to know when the handshake finishes.
pub fn connect(
    registry: &TransportRegistry,
    attrs: &PeerAttributes,
    protocol: Option<Arc<dyn Protocol>>,
    config: ChannelConfig,
) -> Result<Channel> {
    let factory = registry.resolve(attrs.transport_name())?;
    let channel = Channel::spawn(protocol, config);
    debug!(
        channel = channel.id(),
        transport = factory.name(),
        "connecting channel"
    );
    let endpoint: Arc<dyn Endpoint> = Arc::new(channel.clone());
    factory.connect(attrs, endpoint)?;
    channel.start()?;
    Ok(channel)
}
