//! Peer-to-peer command/event channels over an escape-coded wire protocol.
//!
//! Two peers exchange commands, replies and events on one framed byte
//! stream. Each side announces its services in a `Locator`/`Hello`
//! exchange, then either side may call the other.
//!
//! # Crate Structure
//!
//! - [`transport`]: transport seam, registry and in-memory pipe
//! - [`frame`]: wire codec, argument marshalling and input reassembly
//! - [`channel`]: handshake, command/reply correlation, event dispatch

/// Re-export transport types.
pub mod transport {
    pub use tcflink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tcflink_frame::*;
}

/// Re-export channel types.
pub mod channel {
    pub use tcflink_channel::*;
}
