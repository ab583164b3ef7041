//! Transport seam for tcflink channels.
//!
//! A channel never owns a socket. A transport pushes received bytes into the
//! channel through [`Endpoint`] and is handed a [`TransportSink`] it must
//! implement so the channel can flush framed output and close the link.
//!
//! This is the lowest layer of tcflink. Concrete transports are looked up by
//! name in a [`TransportRegistry`]; the [`memory`] module provides an
//! in-process pipe used by tests and demos.

pub mod error;
pub mod memory;
pub mod registry;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::{pipe, pipe_with_chunk_size, MemorySink};
pub use registry::TransportRegistry;
pub use traits::{
    Endpoint, PeerAttributes, TransportFactory, TransportSink, ATTR_TRANSPORT_NAME,
    DEFAULT_TRANSPORT,
};
