use std::fmt;

use tcflink_frame::{Arg, ArgCodec, ArgKind, RawArg};
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};

/// Service that carries the capability exchange.
pub const LOCATOR: &str = "Locator";
/// Event announcing the sender's services.
pub const HELLO: &str = "Hello";
/// Capability name advertised when zero-copy binary encoding is enabled.
pub const ZERO_COPY: &str = "ZeroCopy";

/// Lifecycle of a channel.
///
/// Transitions only move forward:
/// ```text
/// Idle -> Started -> HelloSent     -> Connected -> Disconnected
///                 \> HelloReceived /
/// ```
/// Any state may jump to `Disconnected`. A listener-side channel that got
/// the peer's Hello while still `Idle` walks `Started -> HelloReceived` on
/// `start`, before its own Hello goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Started,
    HelloSent,
    HelloReceived,
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Started => "started",
            ConnectionState::HelloSent => "hello-sent",
            ConnectionState::HelloReceived => "hello-received",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What receiving a peer Hello did to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// Our own Hello is still to be sent.
    Waiting,
    /// Both Hellos are exchanged.
    Connected,
    /// Received before `start`; applied when the channel starts.
    Deferred,
    /// Duplicate or late Hello, dropped.
    Ignored,
}

/// Pure state machine for the `Locator`/`Hello` exchange.
///
/// A channel becomes connected once it has both sent and received a Hello,
/// in either order. A listener-side channel may see the peer's Hello before
/// it starts; that Hello is remembered and applied on `start`.
#[derive(Debug)]
pub struct Handshake {
    state: ConnectionState,
    early_hello: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            early_hello: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }

    /// Leave `Idle`. The caller applies any early Hello, then sends its own.
    pub fn start(&mut self) -> Result<()> {
        self.require(ConnectionState::Idle, "idle")?;
        self.state = ConnectionState::Started;
        Ok(())
    }

    /// Apply a Hello remembered from before `start`. Returns `true` if there was one.
    pub fn apply_early_hello(&mut self) -> bool {
        if self.state != ConnectionState::Started || !self.early_hello {
            return false;
        }
        self.early_hello = false;
        self.state = ConnectionState::HelloReceived;
        debug!("applied hello received before start");
        true
    }

    /// Record that our Hello went out. Returns `true` if that connected the channel.
    pub fn hello_sent(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::Started => {
                self.state = ConnectionState::HelloSent;
                Ok(false)
            }
            ConnectionState::HelloReceived => {
                self.state = ConnectionState::Connected;
                Ok(true)
            }
            actual => Err(ChannelError::InvalidState {
                expected: "started or hello-received",
                actual,
            }),
        }
    }

    /// Record a Hello from the peer.
    pub fn hello_received(&mut self) -> HelloOutcome {
        match self.state {
            ConnectionState::Idle if !self.early_hello => {
                self.early_hello = true;
                HelloOutcome::Deferred
            }
            ConnectionState::Started => {
                self.state = ConnectionState::HelloReceived;
                HelloOutcome::Waiting
            }
            ConnectionState::HelloSent => {
                self.state = ConnectionState::Connected;
                HelloOutcome::Connected
            }
            state => {
                warn!(%state, "ignoring duplicate hello");
                HelloOutcome::Ignored
            }
        }
    }

    /// Enter `Disconnected`. Returns the previous state, or `None` if already there.
    pub fn disconnect(&mut self) -> Option<ConnectionState> {
        if self.is_disconnected() {
            return None;
        }
        let previous = self.state;
        self.state = ConnectionState::Disconnected;
        Some(previous)
    }

    fn require(&self, wanted: ConnectionState, expected: &'static str) -> Result<()> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(ChannelError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

/// Build the single argument of our Hello: the local service names, plus the
/// zero-copy capability when requested.
pub fn hello_args(services: &[String], zero_copy: bool) -> Vec<Arg> {
    let mut names: Vec<serde_json::Value> = services
        .iter()
        .map(|s| serde_json::Value::String(s.clone()))
        .collect();
    if zero_copy && !services.iter().any(|s| s == ZERO_COPY) {
        names.push(serde_json::Value::String(ZERO_COPY.to_string()));
    }
    vec![Arg::Json(serde_json::Value::Array(names))]
}

/// Read the peer's service list from a received Hello.
///
/// A missing or null argument is an empty list. Non-string entries are skipped.
pub fn parse_hello(args: &[RawArg], codec: &ArgCodec) -> Result<Vec<String>> {
    let Some(first) = args.first() else {
        return Ok(Vec::new());
    };
    match codec.decode(&first.data, ArgKind::Json, first.offset)? {
        Arg::Json(serde_json::Value::Array(items)) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect()),
        Arg::Json(serde_json::Value::Null) => Ok(Vec::new()),
        other => Err(ChannelError::Malformed(format!(
            "hello payload is not a list: {other:?}"
        ))),
    }
}
