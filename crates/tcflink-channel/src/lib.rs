//! Channel engine for tcflink.
//!
//! A [`Channel`] is one framed, stateful connection to a peer. It negotiates
//! capabilities with the `Locator`/`Hello` exchange, correlates outbound
//! commands with their replies by token, and routes inbound events to
//! registered handlers. Transports drive it through the
//! [`Endpoint`](tcflink_transport::Endpoint) hooks; a [`ChannelDriver`]
//! processes the resulting turns in wire order.

pub mod channel;
pub mod config;
pub mod connector;
pub mod correlator;
pub mod error;
pub mod events;
pub mod handshake;
pub mod protocol;
pub mod server;

pub use channel::{Channel, ChannelDriver};
pub use config::ChannelConfig;
pub use connector::connect;
pub use correlator::{ProgressStream, ReplyFuture};
pub use error::{ChannelError, Result};
pub use events::{EventHandler, LifecycleCallback, LifecycleEvent};
pub use handshake::{ConnectionState, Handshake, HelloOutcome, HELLO, LOCATOR, ZERO_COPY};
pub use protocol::{CommandError, CommandFuture, CommandTable, Protocol};
pub use server::{MemoryServer, MEMORY_TRANSPORT};
