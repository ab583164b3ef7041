//! The channel and its turn driver.
//!
//! Transport callbacks only reassemble input and queue turns. The
//! [`ChannelDriver`] takes turns off the queue one at a time, so messages are
//! handled strictly in wire order no matter how the bytes were chunked.
//! Output is written and flushed synchronously under the channel lock.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{self, FutureExt};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tcflink_frame::{
    write_command, write_event, write_reply, Arg, ArgCodec, ArgKind, Boundary, FrameError,
    FrameWriter, Message, RawArg, Reassembler, ReplyKind,
};
use tcflink_transport::{Endpoint, TransportError, TransportSink};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::correlator::{Correlator, ProgressStream, ReplyFuture};
use crate::error::{ChannelError, Result};
use crate::events::{EventDispatcher, LifecycleEvent, Listeners};
use crate::handshake::{
    hello_args, parse_hello, ConnectionState, Handshake, HelloOutcome, HELLO, LOCATOR, ZERO_COPY,
};
use crate::protocol::{CommandError, Protocol};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of work for the driver.
enum Turn {
    /// A complete message is buffered.
    Message,
    /// The peer sent end-of-stream.
    EndOfStream,
    /// A local command handler finished.
    CommandDone {
        token: String,
        outcome: std::result::Result<Vec<Arg>, CommandError>,
    },
    /// The transport reported the link closed.
    TransportClosed,
    /// The transport failed.
    TransportFailed(TransportError),
    /// The channel was torn down.
    Shutdown,
}

type Deferred = Box<dyn FnOnce() + Send>;

struct Core {
    handshake: Handshake,
    writer: FrameWriter,
    correlator: Correlator,
    events: EventDispatcher,
    protocol: Option<Arc<dyn Protocol>>,
    local_services: Vec<String>,
    peer_services: Vec<String>,
    zero_copy_requested: bool,
    zero_copy_enabled: bool,
}

struct Shared {
    id: u64,
    config: ChannelConfig,
    core: Mutex<Core>,
    // Separate from `core`: a flush under our lock may deliver straight into
    // a peer channel, and that peer may flush back to us.
    input: Mutex<Reassembler>,
    sink: RwLock<Option<Arc<dyn TransportSink>>>,
    listeners: Mutex<Listeners>,
    turns: mpsc::UnboundedSender<Turn>,
}

/// What is left to do once the lock is released.
struct Teardown {
    sink: Option<Arc<dyn TransportSink>>,
}

/// Handle to one framed, stateful connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Create an idle channel and the driver that processes its input.
    ///
    /// The driver must be run (or pumped with
    /// [`run_pending`](ChannelDriver::run_pending)) inside a tokio runtime.
    pub fn new(protocol: Option<Arc<dyn Protocol>>, config: ChannelConfig) -> (Channel, ChannelDriver) {
        let (turns, rx) = mpsc::unbounded_channel();
        let local_services = protocol
            .as_ref()
            .map(|p| p.service_names())
            .unwrap_or_default();
        let core = Core {
            handshake: Handshake::new(),
            writer: FrameWriter::new(config.output_capacity),
            correlator: Correlator::default(),
            events: EventDispatcher::default(),
            protocol,
            local_services,
            peer_services: Vec::new(),
            zero_copy_requested: config.zero_copy,
            zero_copy_enabled: false,
        };
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            config,
            core: Mutex::new(core),
            input: Mutex::new(Reassembler::new()),
            sink: RwLock::new(None),
            listeners: Mutex::new(Listeners::default()),
            turns,
        });
        debug!(channel = id, "channel created");

        let driver = ChannelDriver {
            id,
            shared: Arc::downgrade(&shared),
            turns: rx,
            deferred: VecDeque::new(),
        };
        (Channel { shared }, driver)
    }

    /// Create a channel and run its driver on the current tokio runtime.
    pub fn spawn(protocol: Option<Arc<dyn Protocol>>, config: ChannelConfig) -> Channel {
        let (channel, driver) = Self::new(protocol, config);
        tokio::spawn(driver.run());
        channel
    }

    /// Process-unique identifier, assigned in creation order.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().handshake.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Services the peer announced in its Hello.
    pub fn peer_services(&self) -> Vec<String> {
        self.shared.core.lock().peer_services.clone()
    }

    /// Services we announce in our Hello.
    pub fn local_services(&self) -> Vec<String> {
        self.shared.core.lock().local_services.clone()
    }

    /// Whether binary arguments are sent in the zero-copy encoding.
    pub fn is_zero_copy_enabled(&self) -> bool {
        self.shared.core.lock().zero_copy_enabled
    }

    /// Commands sent and not yet answered.
    pub fn pending_commands(&self) -> usize {
        self.shared.core.lock().correlator.len()
    }

    /// Complete messages received and not yet processed.
    pub fn pending_messages(&self) -> usize {
        self.shared.input.lock().pending_messages()
    }

    /// Whether the peer has sent end-of-stream.
    pub fn eof_received(&self) -> bool {
        self.shared.input.lock().is_eof()
    }

    /// Replace the local protocol. Only valid before `start` or after teardown.
    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) -> Result<()> {
        let mut core = self.shared.core.lock();
        match core.handshake.state() {
            ConnectionState::Idle | ConnectionState::Disconnected => {}
            actual => {
                return Err(ChannelError::InvalidState {
                    expected: "idle or disconnected",
                    actual,
                })
            }
        }
        core.local_services = protocol.service_names();
        core.protocol = Some(protocol);
        Ok(())
    }

    /// Request zero-copy binary encoding. Takes effect at the handshake, and
    /// only if the peer advertises it as well.
    pub fn enable_zero_copy(&self, enable: bool) {
        self.shared.core.lock().zero_copy_requested = enable;
    }

    /// Begin the handshake by sending our Hello.
    pub fn start(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        core.handshake.start()?;
        core.handshake.apply_early_hello();
        debug!(channel = self.id(), state = %core.handshake.state(), "channel starting");

        let args = hello_args(&core.local_services, core.zero_copy_requested);
        let codec = self.codec(&core);
        let bytes = match write_event(&mut core.writer, &codec, LOCATOR, HELLO, &args) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.write_failed(core, err)),
        };
        self.flush_locked(bytes);

        let connected = core.handshake.hello_sent()?;
        if connected {
            self.on_connected_locked(&mut core);
        }
        drop(core);
        if connected {
            self.notify(LifecycleEvent::Connect, None);
        }
        Ok(())
    }

    /// Send a command. The reply arguments are decoded with `result_kinds`.
    pub fn send_command(
        &self,
        service: &str,
        method: &str,
        args: &[Arg],
        result_kinds: &[ArgKind],
    ) -> ReplyFuture {
        self.send_command_inner(service, method, args, result_kinds, false)
            .0
    }

    /// Send a command whose `P` replies are delivered on a stream.
    pub fn send_command_with_progress(
        &self,
        service: &str,
        method: &str,
        args: &[Arg],
        result_kinds: &[ArgKind],
    ) -> (ReplyFuture, ProgressStream) {
        let (reply, progress) = self.send_command_inner(service, method, args, result_kinds, true);
        (reply, progress.unwrap_or_else(ProgressStream::closed))
    }

    fn send_command_inner(
        &self,
        service: &str,
        method: &str,
        args: &[Arg],
        result_kinds: &[ArgKind],
        with_progress: bool,
    ) -> (ReplyFuture, Option<ProgressStream>) {
        let mut core = self.shared.core.lock();
        if core.handshake.is_disconnected() {
            return (ReplyFuture::failed(ChannelError::ChannelClosed), None);
        }
        let token = core.correlator.next_token();
        let codec = self.codec(&core);
        match write_command(&mut core.writer, &codec, &token.to_string(), service, method, args) {
            Ok(bytes) => {
                let handles = core.correlator.register(
                    token,
                    service,
                    method,
                    result_kinds.to_vec(),
                    with_progress,
                );
                trace!(channel = self.id(), token, service, method, "command sent");
                self.flush_locked(bytes);
                handles
            }
            Err(err) => (ReplyFuture::failed(self.write_failed(core, err)), None),
        }
    }

    /// Send an event to the peer.
    pub fn send_event(&self, service: &str, name: &str, args: &[Arg]) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.handshake.is_disconnected() {
            return Err(ChannelError::ChannelClosed);
        }
        let codec = self.codec(&core);
        match write_event(&mut core.writer, &codec, service, name, args) {
            Ok(bytes) => {
                self.flush_locked(bytes);
                Ok(())
            }
            Err(err) => Err(self.write_failed(core, err)),
        }
    }

    /// Register the handler for one (service, event) pair.
    ///
    /// Arguments are decoded with `arg_kinds`. Handlers run on the driver,
    /// after the turn that received the event.
    pub fn add_event_handler<F>(
        &self,
        service: &str,
        name: &str,
        arg_kinds: Vec<ArgKind>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Vec<Arg>) + Send + Sync + 'static,
    {
        self.shared
            .core
            .lock()
            .events
            .add(service, name, arg_kinds, Arc::new(handler))
    }

    /// Subscribe to a lifecycle notification.
    pub fn add_handler<F>(&self, event: LifecycleEvent, callback: F)
    where
        F: Fn(Option<&ChannelError>) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().add(event, Arc::new(callback));
    }

    /// Resolve once the handshake completes, or fail if the channel closes first.
    ///
    /// The listeners this installs are removed again when the wait ends or is dropped.
    pub async fn wait_connected(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let mut guard = ListenerGuard {
            channel: self,
            ids: Vec::with_capacity(2),
        };
        for (event, connected) in [(LifecycleEvent::Connect, true), (LifecycleEvent::Close, false)] {
            let slot = Arc::clone(&slot);
            let id = self.shared.listeners.lock().add(
                event,
                Arc::new(move |_| {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(connected);
                    }
                }),
            );
            guard.ids.push(id);
        }
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => return Err(ChannelError::ChannelClosed),
            _ => {}
        }
        match rx.await {
            Ok(true) => Ok(()),
            _ => Err(ChannelError::ChannelClosed),
        }
    }

    /// Send end-of-stream and tear the channel down.
    pub fn close(&self) {
        let teardown = self.teardown_locked(&mut self.shared.core.lock(), true);
        self.finish_teardown(teardown, true, None);
    }

    fn codec(&self, core: &Core) -> ArgCodec {
        ArgCodec {
            zero_copy: core.zero_copy_enabled,
            big_num_as_string: self.shared.config.big_num_as_string,
        }
    }

    fn on_connected_locked(&self, core: &mut Core) {
        core.zero_copy_enabled =
            core.zero_copy_requested && core.peer_services.iter().any(|s| s == ZERO_COPY);
        info!(
            channel = self.id(),
            peer_services = ?core.peer_services,
            zero_copy = core.zero_copy_enabled,
            "channel connected"
        );
    }

    fn flush_locked(&self, bytes: Bytes) {
        let sink = self.shared.sink.read().clone();
        match sink {
            Some(sink) => match sink.flush_output(bytes) {
                Ok(()) => {}
                // The peer hung up first; its close turn is already queued.
                Err(TransportError::Closed) => {
                    debug!(channel = self.id(), "flush after transport closed")
                }
                Err(err) => warn!(channel = self.id(), error = %err, "flush failed"),
            },
            None => warn!(
                channel = self.id(),
                len = bytes.len(),
                "no transport attached, dropping output"
            ),
        }
    }

    /// A message could not be written. Overflowing the output buffer is fatal.
    fn write_failed(&self, mut core: MutexGuard<'_, Core>, err: FrameError) -> ChannelError {
        error!(channel = self.id(), error = %err, "message write failed");
        if matches!(err, FrameError::OutputOverflow { .. }) {
            let teardown = self.teardown_locked(&mut core, true);
            drop(core);
            self.finish_teardown(teardown, true, None);
        }
        err.into()
    }

    fn teardown_locked(&self, core: &mut Core, send_eos: bool) -> Option<Teardown> {
        let previous = core.handshake.disconnect()?;
        if send_eos {
            core.writer.reset();
            match core.writer.write_close() {
                Ok(bytes) => self.flush_locked(bytes),
                Err(err) => warn!(channel = self.id(), error = %err, "could not write end-of-stream"),
            }
        }
        let rejected = core.correlator.reject_all();
        let handlers = core.events.len();
        core.events.clear();
        let sink = self.shared.sink.write().take();
        debug!(
            channel = self.id(),
            from = %previous,
            rejected,
            handlers,
            "channel disconnected"
        );
        Some(Teardown { sink })
    }

    fn finish_teardown(
        &self,
        teardown: Option<Teardown>,
        close_transport: bool,
        error: Option<ChannelError>,
    ) {
        let Some(teardown) = teardown else {
            return;
        };
        if let Some(sink) = teardown.sink {
            if close_transport {
                sink.close_connection();
            }
        }
        let _ = self.shared.turns.send(Turn::Shutdown);
        if let Some(err) = &error {
            self.notify(LifecycleEvent::Error, Some(err));
        }
        self.notify(LifecycleEvent::Close, None);
    }

    fn notify(&self, event: LifecycleEvent, err: Option<&ChannelError>) {
        let callbacks = self.shared.listeners.lock().for_event(event);
        for callback in callbacks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                error!(channel = self.id(), %event, "lifecycle listener panicked");
            }
        }
    }

    fn protocol_fault(&self, err: ChannelError) {
        warn!(channel = self.id(), error = %err, "protocol error, closing channel");
        self.close();
    }

    fn process_turn(&self, turn: Turn) -> Option<Deferred> {
        match turn {
            Turn::Message => self.process_message(),
            Turn::EndOfStream => {
                debug!(channel = self.id(), "end of stream received");
                self.close();
                None
            }
            Turn::CommandDone { token, outcome } => {
                self.finish_command(&token, outcome);
                None
            }
            Turn::TransportClosed => {
                self.transport_closed();
                None
            }
            Turn::TransportFailed(err) => {
                self.transport_failed(err);
                None
            }
            Turn::Shutdown => None,
        }
    }

    fn transport_closed(&self) {
        let teardown = self.teardown_locked(&mut self.shared.core.lock(), false);
        if teardown.is_some() {
            debug!(channel = self.id(), "transport closed");
        }
        self.finish_teardown(teardown, false, None);
    }

    fn transport_failed(&self, err: TransportError) {
        warn!(channel = self.id(), error = %err, "transport error");
        let teardown = self.teardown_locked(&mut self.shared.core.lock(), false);
        self.finish_teardown(teardown, true, Some(err.into()));
    }

    fn process_message(&self) -> Option<Deferred> {
        if self.state() == ConnectionState::Disconnected {
            return None;
        }
        let next = self.shared.input.lock().next_message();
        let handled = next.map_err(ChannelError::from).and_then(|msg| {
            trace!(channel = self.id(), message = %msg, "message received");
            self.dispatch(msg)
        });
        match handled {
            Ok(deferred) => deferred,
            Err(err) => {
                self.protocol_fault(err);
                None
            }
        }
    }

    fn dispatch(&self, msg: Message) -> Result<Option<Deferred>> {
        match msg {
            Message::Command {
                token,
                service,
                method,
                args,
            } => {
                self.exec_inbound(token, &service, &method, &args)?;
                Ok(None)
            }
            Message::Reply { kind, token, args } => {
                self.resolve_reply(kind, &token, &args)?;
                Ok(None)
            }
            Message::Event {
                service,
                name,
                args,
            } => self.route_event(&service, &name, &args),
            // Already acted on when the boundary was scanned.
            Message::EndOfStream => Ok(None),
        }
    }

    fn exec_inbound(&self, token: String, service: &str, method: &str, raw: &[RawArg]) -> Result<()> {
        let (protocol, codec) = {
            let core = self.shared.core.lock();
            (core.protocol.clone(), self.codec(&core))
        };
        let pending = match protocol {
            Some(protocol) => {
                let kinds = protocol.command_arg_kinds(service, method);
                let args = decode_args(&codec, &kinds, raw)?;
                protocol.exec_command(self, service, method, args)
            }
            None => future::ready(Err(CommandError::NotRecognized)).boxed(),
        };
        trace!(channel = self.id(), %token, service, method, "executing command");

        let turns = self.shared.turns.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(pending)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(CommandError::Failed("command handler panicked".to_string())));
            let _ = turns.send(Turn::CommandDone { token, outcome });
        });
        Ok(())
    }

    fn finish_command(&self, token: &str, outcome: std::result::Result<Vec<Arg>, CommandError>) {
        let mut core = self.shared.core.lock();
        if core.handshake.is_disconnected() {
            debug!(channel = self.id(), token, "dropping command result for closed channel");
            return;
        }
        let codec = self.codec(&core);
        let written = match outcome {
            Ok(results) => write_reply(&mut core.writer, &codec, ReplyKind::Result, token, &results),
            Err(CommandError::NotRecognized) => {
                debug!(channel = self.id(), token, "command not recognized");
                write_reply(&mut core.writer, &codec, ReplyKind::NotRecognized, token, &[])
            }
            Err(CommandError::Failed(reason)) => {
                warn!(channel = self.id(), token, error = %reason, "command failed, closing channel");
                let teardown = self.teardown_locked(&mut core, true);
                drop(core);
                self.finish_teardown(teardown, true, None);
                return;
            }
        };
        match written {
            Ok(bytes) => self.flush_locked(bytes),
            Err(err) => {
                self.write_failed(core, err);
            }
        }
    }

    fn resolve_reply(&self, kind: ReplyKind, token: &str, raw: &[RawArg]) -> Result<()> {
        let mut core = self.shared.core.lock();
        let Some(kinds) = core.correlator.result_kinds(token) else {
            return Err(ChannelError::UnknownToken(token.to_string()));
        };
        let codec = self.codec(&core);
        let args = decode_args(&codec, &kinds, raw)?;
        match kind {
            ReplyKind::Progress => {
                core.correlator.progress(token, args);
            }
            ReplyKind::Result => {
                if let Some(record) = core.correlator.take(token) {
                    trace!(channel = self.id(), token, "command completed");
                    record.complete(Ok(args));
                }
            }
            ReplyKind::NotRecognized => {
                if let Some(record) = core.correlator.take(token) {
                    let err = ChannelError::NotRecognized {
                        service: record.service.clone(),
                        method: record.method.clone(),
                    };
                    record.complete(Err(err));
                }
            }
        }
        Ok(())
    }

    fn route_event(&self, service: &str, name: &str, raw: &[RawArg]) -> Result<Option<Deferred>> {
        let mut core = self.shared.core.lock();
        let codec = self.codec(&core);

        if service == LOCATOR && name == HELLO {
            let peer_services = parse_hello(raw, &codec)?;
            let connected = match core.handshake.hello_received() {
                HelloOutcome::Ignored => false,
                HelloOutcome::Waiting | HelloOutcome::Deferred => {
                    debug!(channel = self.id(), "peer hello received");
                    core.peer_services = peer_services;
                    false
                }
                HelloOutcome::Connected => {
                    core.peer_services = peer_services;
                    self.on_connected_locked(&mut core);
                    true
                }
            };
            drop(core);
            if connected {
                self.notify(LifecycleEvent::Connect, None);
            }
            return Ok(None);
        }

        let Some((kinds, handler)) = core.events.find(service, name) else {
            trace!(channel = self.id(), service, event = name, "no handler for event");
            return Ok(None);
        };
        drop(core);
        let args = decode_args(&codec, &kinds, raw)?;
        Ok(Some(Box::new(move || handler(args))))
    }
}

fn decode_args(codec: &ArgCodec, kinds: &[ArgKind], raw: &[RawArg]) -> Result<Vec<Arg>> {
    raw.iter()
        .enumerate()
        .map(|(idx, arg)| {
            codec
                .decode(&arg.data, ArgKind::at(kinds, idx), arg.offset)
                .map_err(ChannelError::from)
        })
        .collect()
}

impl Endpoint for Channel {
    fn on_data(&self, chunk: Bytes) {
        let boundaries = self.shared.input.lock().push(chunk);
        for boundary in boundaries {
            let turn = match boundary {
                Boundary::Message => Turn::Message,
                Boundary::EndOfStream => Turn::EndOfStream,
            };
            let _ = self.shared.turns.send(turn);
        }
    }

    // Close and error are turns too, so messages that arrived before them
    // are still processed. Without a driver they are handled in place.
    fn on_closed(&self) {
        if self.shared.turns.send(Turn::TransportClosed).is_err() {
            self.transport_closed();
        }
    }

    fn on_error(&self, err: TransportError) {
        if let Err(mpsc::error::SendError(Turn::TransportFailed(err))) =
            self.shared.turns.send(Turn::TransportFailed(err))
        {
            self.transport_failed(err);
        }
    }

    fn attach(&self, sink: Arc<dyn TransportSink>) {
        *self.shared.sink.write() = Some(sink);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("listeners", &self.shared.listeners.lock().len())
            .finish()
    }
}

/// Removes `wait_connected` listeners when the wait ends.
struct ListenerGuard<'a> {
    channel: &'a Channel,
    ids: Vec<u64>,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        let mut listeners = self.channel.shared.listeners.lock();
        for id in self.ids.drain(..) {
            listeners.remove(id);
        }
    }
}

/// Processes a channel's turns in order.
///
/// Each buffered message, end-of-stream, finished local command and
/// transport close or failure is one turn. Event handlers queued during a turn run before the next turn
/// starts. Inbound commands are spawned onto the tokio runtime.
pub struct ChannelDriver {
    id: u64,
    shared: Weak<Shared>,
    turns: mpsc::UnboundedReceiver<Turn>,
    deferred: VecDeque<Deferred>,
}

impl ChannelDriver {
    /// Run until the channel is torn down or every handle to it is dropped.
    pub async fn run(mut self) {
        debug!(channel = self.id, "channel driver started");
        while let Some(turn) = self.turns.recv().await {
            if !self.handle(turn) {
                break;
            }
        }
        debug!(channel = self.id, "channel driver stopped");
    }

    /// Process every turn already queued without waiting for more.
    /// Returns how many turns were taken.
    pub fn run_pending(&mut self) -> usize {
        let mut taken = 0;
        while let Ok(turn) = self.turns.try_recv() {
            taken += 1;
            if !self.handle(turn) {
                break;
            }
        }
        taken
    }

    fn handle(&mut self, turn: Turn) -> bool {
        if matches!(turn, Turn::Shutdown) {
            return false;
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let channel = Channel { shared };
        if let Some(task) = channel.process_turn(turn) {
            self.deferred.push_back(task);
        }
        drop(channel);

        while let Some(task) = self.deferred.pop_front() {
            if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!(channel = self.id, "event handler panicked");
            }
        }
        true
    }
}

impl fmt::Debug for ChannelDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelDriver")
            .field("id", &self.id)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use futures::StreamExt;
    use serde_json::json;
    use tcflink_frame::split_messages;

    use super::*;
    use crate::protocol::CommandTable;

    #[derive(Default)]
    struct CaptureSink {
        frames: Mutex<Vec<Bytes>>,
        closed: AtomicBool,
    }

    impl CaptureSink {
        fn messages(&self) -> Vec<Message> {
            let mut all = Vec::new();
            for frame in self.frames.lock().iter() {
                all.extend_from_slice(frame);
            }
            let (messages, err) = split_messages(Bytes::from(all));
            assert!(err.is_none(), "captured output did not decode: {err:?}");
            messages
        }

        fn last(&self) -> Message {
            self.messages().pop().expect("no output captured")
        }
    }

    impl TransportSink for CaptureSink {
        fn flush_output(&self, data: Bytes) -> std::result::Result<(), TransportError> {
            self.frames.lock().push(data);
            Ok(())
        }

        fn close_connection(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn attached(protocol: Option<Arc<dyn Protocol>>) -> (Channel, ChannelDriver, Arc<CaptureSink>) {
        attached_with(protocol, ChannelConfig::default())
    }

    fn attached_with(
        protocol: Option<Arc<dyn Protocol>>,
        config: ChannelConfig,
    ) -> (Channel, ChannelDriver, Arc<CaptureSink>) {
        let (channel, driver) = Channel::new(protocol, config);
        let sink = Arc::new(CaptureSink::default());
        channel.attach(sink.clone());
        (channel, driver, sink)
    }

    fn peer_hello(services: &[&str]) -> Bytes {
        let mut writer = FrameWriter::default();
        write_event(
            &mut writer,
            &ArgCodec::default(),
            LOCATOR,
            HELLO,
            &[Arg::Json(json!(services))],
        )
        .unwrap()
    }

    fn peer_reply(kind: ReplyKind, token: &str, args: &[Arg]) -> Bytes {
        let mut writer = FrameWriter::default();
        write_reply(&mut writer, &ArgCodec::default(), kind, token, args).unwrap()
    }

    fn connected(protocol: Option<Arc<dyn Protocol>>) -> (Channel, ChannelDriver, Arc<CaptureSink>) {
        let (channel, mut driver, sink) = attached(protocol);
        channel.start().unwrap();
        channel.on_data(peer_hello(&[]));
        driver.run_pending();
        assert!(channel.is_connected());
        (channel, driver, sink)
    }

    fn counter(channel: &Channel, event: LifecycleEvent) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&hits);
        channel.add_handler(event, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    async fn settle(driver: &mut ChannelDriver) {
        for _ in 0..16 {
            driver.run_pending();
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn ids_increase() {
        let (a, _) = Channel::new(None, ChannelConfig::default());
        let (b, _) = Channel::new(None, ChannelConfig::default());
        assert!(b.id() > a.id());
    }

    #[test]
    fn start_sends_hello() {
        let mut table = CommandTable::new();
        table.add_service("Pong");
        let (channel, _driver, sink) = attached(Some(Arc::new(table)));

        channel.start().unwrap();
        assert_eq!(channel.state(), ConnectionState::HelloSent);
        match sink.last() {
            Message::Event { service, name, args } => {
                assert_eq!(service, LOCATOR);
                assert_eq!(name, HELLO);
                assert_eq!(args[0].data, br#"["Pong"]"#);
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert!(channel.start().is_err());
    }

    #[test]
    fn peer_hello_connects_once() {
        let (channel, mut driver, _sink) = attached(None);
        let connects = counter(&channel, LifecycleEvent::Connect);

        channel.start().unwrap();
        channel.on_data(peer_hello(&["RunControl"]));
        channel.on_data(peer_hello(&["RunControl"]));
        driver.run_pending();

        assert!(channel.is_connected());
        assert_eq!(channel.peer_services(), vec!["RunControl".to_string()]);
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_hello_connects_on_start() {
        let (channel, mut driver, _sink) = attached(None);
        let connects = counter(&channel, LifecycleEvent::Connect);

        channel.on_data(peer_hello(&["Memory"]));
        driver.run_pending();
        assert_eq!(channel.state(), ConnectionState::Idle);
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        channel.start().unwrap();
        assert!(channel.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_copy_needs_both_sides() {
        let config = ChannelConfig {
            zero_copy: true,
            ..ChannelConfig::default()
        };
        let (channel, mut driver, sink) = attached_with(None, config.clone());
        channel.start().unwrap();
        assert!(matches!(
            sink.last(),
            Message::Event { ref args, .. } if args[0].data == br#"["ZeroCopy"]"#
        ));
        channel.on_data(peer_hello(&["ZeroCopy"]));
        driver.run_pending();
        assert!(channel.is_zero_copy_enabled());

        let (other, mut driver, _sink) = attached_with(None, config);
        other.start().unwrap();
        other.on_data(peer_hello(&["Memory"]));
        driver.run_pending();
        assert!(other.is_connected());
        assert!(!other.is_zero_copy_enabled());
    }

    #[test]
    fn set_protocol_only_before_start() {
        let (channel, _driver, _sink) = attached(None);
        let mut table = CommandTable::new();
        table.add_service("Pong");
        channel.set_protocol(Arc::new(table.clone())).unwrap();
        assert_eq!(channel.local_services(), vec!["Pong".to_string()]);

        channel.start().unwrap();
        assert!(matches!(
            channel.set_protocol(Arc::new(table)),
            Err(ChannelError::InvalidState {
                actual: ConnectionState::HelloSent,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn replies_resolve_in_any_order() {
        let (channel, mut driver, sink) = connected(None);
        let first = channel.send_command("Svc", "a", &[], &[]);
        let second = channel.send_command("Svc", "b", &[], &[]);
        assert_eq!(first.token(), Some(1));
        assert_eq!(second.token(), Some(2));
        assert!(matches!(
            sink.last(),
            Message::Command { ref token, ref method, .. } if token == "2" && method == "b"
        ));

        channel.on_data(peer_reply(ReplyKind::Result, "2", &[Arg::from("b")]));
        channel.on_data(peer_reply(ReplyKind::Result, "1", &[Arg::from("a")]));
        driver.run_pending();

        assert_eq!(first.await.unwrap(), vec![Arg::from("a")]);
        assert_eq!(second.await.unwrap(), vec![Arg::from("b")]);
        assert_eq!(channel.pending_commands(), 0);
    }

    #[tokio::test]
    async fn reply_arguments_use_declared_kinds() {
        let (channel, mut driver, _sink) = connected(None);
        let reply = channel.send_command("Memory", "get", &[], &[ArgKind::Binary]);
        channel.on_data(peer_reply(
            ReplyKind::Result,
            "1",
            &[Arg::Binary(Bytes::from_static(b"\x00\x03")), Arg::from("done")],
        ));
        driver.run_pending();
        assert_eq!(
            reply.await.unwrap(),
            vec![Arg::Binary(Bytes::from_static(b"\x00\x03")), Arg::from("done")]
        );
    }

    #[tokio::test]
    async fn progress_then_result() {
        let (channel, mut driver, _sink) = connected(None);
        let (reply, mut progress) = channel.send_command_with_progress("Svc", "slow", &[], &[]);
        channel.on_data(peer_reply(ReplyKind::Progress, "1", &[Arg::Json(json!(50))]));
        channel.on_data(peer_reply(ReplyKind::Result, "1", &[Arg::from("done")]));
        driver.run_pending();

        assert_eq!(progress.next().await, Some(vec![Arg::Json(json!(50))]));
        assert_eq!(progress.next().await, None);
        assert_eq!(reply.await.unwrap(), vec![Arg::from("done")]);
    }

    #[tokio::test]
    async fn not_recognized_reply_rejects_command() {
        let (channel, mut driver, _sink) = connected(None);
        let reply = channel.send_command("Svc", "missing", &[], &[]);
        channel.on_data(peer_reply(ReplyKind::NotRecognized, "1", &[]));
        driver.run_pending();

        assert!(matches!(
            reply.await,
            Err(ChannelError::NotRecognized { ref service, ref method })
                if service == "Svc" && method == "missing"
        ));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn unknown_token_is_fatal() {
        let (channel, mut driver, sink) = connected(None);
        let closes = counter(&channel, LifecycleEvent::Close);
        let pending = channel.send_command("Svc", "m", &[], &[]);

        channel.on_data(peer_reply(ReplyKind::Result, "5", &[]));
        driver.run_pending();

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(sink.last(), Message::EndOfStream);
        assert!(sink.closed.load(Ordering::SeqCst));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(pending.await, Err(ChannelError::ChannelClosed)));
    }

    #[tokio::test]
    async fn teardown_rejects_pending_and_later_commands() {
        let (channel, _driver, _sink) = connected(None);
        let closes = counter(&channel, LifecycleEvent::Close);
        let a = channel.send_command("Svc", "a", &[], &[]);
        let b = channel.send_command("Svc", "b", &[], &[]);

        channel.close();
        channel.close();
        channel.on_closed();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(a.await, Err(ChannelError::ChannelClosed)));
        assert!(matches!(b.await, Err(ChannelError::ChannelClosed)));
        assert!(matches!(
            channel.send_command("Svc", "c", &[], &[]).await,
            Err(ChannelError::ChannelClosed)
        ));
        assert!(matches!(
            channel.send_event("Svc", "e", &[]),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn transport_error_notifies_error_then_close() {
        let (channel, mut driver, sink) = connected(None);
        let order = Arc::new(Mutex::new(Vec::new()));
        for event in [LifecycleEvent::Error, LifecycleEvent::Close] {
            let order = Arc::clone(&order);
            channel.add_handler(event, move |err| {
                order.lock().push((event, err.is_some()));
            });
        }

        channel.on_error(TransportError::Closed);
        assert!(order.lock().is_empty());
        driver.run_pending();
        assert_eq!(
            *order.lock(),
            vec![(LifecycleEvent::Error, true), (LifecycleEvent::Close, false)]
        );
        assert!(sink.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn end_of_stream_closes_and_answers() {
        let (channel, mut driver, sink) = connected(None);
        let mut writer = FrameWriter::default();
        channel.on_data(writer.write_close().unwrap());
        assert!(channel.eof_received());
        driver.run_pending();

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(sink.last(), Message::EndOfStream);
    }

    #[test]
    fn events_reach_their_handler_after_the_turn() {
        let (channel, mut driver, _sink) = connected(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        channel
            .add_event_handler("RunControl", "contextSuspended", Vec::new(), move |args| {
                log.lock().push(args);
            })
            .unwrap();

        let mut writer = FrameWriter::default();
        let codec = ArgCodec::default();
        let mut wire = Vec::new();
        wire.extend_from_slice(
            &write_event(&mut writer, &codec, "RunControl", "contextSuspended", &[Arg::from("ctx")])
                .unwrap(),
        );
        wire.extend_from_slice(
            &write_event(&mut writer, &codec, "RunControl", "contextResumed", &[]).unwrap(),
        );
        channel.on_data(Bytes::from(wire));
        assert_eq!(channel.pending_messages(), 2);
        driver.run_pending();

        assert_eq!(*seen.lock(), vec![vec![Arg::from("ctx")]]);
        assert_eq!(channel.pending_messages(), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_driver() {
        let (channel, mut driver, _sink) = connected(None);
        let hits = Arc::new(AtomicUsize::new(0));
        channel
            .add_event_handler("Svc", "boom", Vec::new(), |_| panic!("handler failure"))
            .unwrap();
        let c = Arc::clone(&hits);
        channel
            .add_event_handler("Svc", "ok", Vec::new(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut writer = FrameWriter::default();
        let codec = ArgCodec::default();
        channel.on_data(write_event(&mut writer, &codec, "Svc", "boom", &[]).unwrap());
        channel.on_data(write_event(&mut writer, &codec, "Svc", "ok", &[]).unwrap());
        assert_eq!(driver.run_pending(), 2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn inbound_command_gets_result() {
        let mut table = CommandTable::new();
        table.add_sync_command("Pong", "echo", Vec::new(), |_, args| Ok(args));
        let (channel, mut driver, sink) = connected(Some(Arc::new(table)));

        let mut writer = FrameWriter::default();
        channel.on_data(
            write_command(&mut writer, &ArgCodec::default(), "9", "Pong", "echo", &[Arg::from("ok")])
                .unwrap(),
        );
        settle(&mut driver).await;

        match sink.last() {
            Message::Reply { kind, token, args } => {
                assert_eq!(kind, ReplyKind::Result);
                assert_eq!(token, "9");
                assert_eq!(args[0].data, b"\"ok\"");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_command_is_answered_not_recognized() {
        let (channel, mut driver, sink) = connected(Some(Arc::new(CommandTable::new())));
        let mut writer = FrameWriter::default();
        channel.on_data(
            write_command(&mut writer, &ArgCodec::default(), "3", "Nope", "nothing", &[]).unwrap(),
        );
        settle(&mut driver).await;

        assert!(matches!(
            sink.last(),
            Message::Reply { kind: ReplyKind::NotRecognized, ref token, .. } if token == "3"
        ));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn failing_command_closes_channel() {
        let mut table = CommandTable::new();
        table.add_sync_command("Pong", "fail", Vec::new(), |_, _| {
            Err(CommandError::Failed("no luck".to_string()))
        });
        let (channel, mut driver, sink) = connected(Some(Arc::new(table)));
        let mut writer = FrameWriter::default();
        channel.on_data(
            write_command(&mut writer, &ArgCodec::default(), "1", "Pong", "fail", &[]).unwrap(),
        );
        settle(&mut driver).await;

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(sink.last(), Message::EndOfStream);
    }

    #[test]
    fn output_overflow_is_fatal() {
        let config = ChannelConfig {
            output_capacity: 64,
            ..ChannelConfig::default()
        };
        let (channel, mut driver, sink) = attached_with(None, config);
        channel.start().unwrap();
        channel.on_data(peer_hello(&[]));
        driver.run_pending();

        let err = channel
            .send_event("Svc", "big", &[Arg::from("x".repeat(100))])
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Protocol(FrameError::OutputOverflow { .. })
        ));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(sink.last(), Message::EndOfStream);
    }

    #[tokio::test]
    async fn reply_framed_before_peer_close_still_resolves() {
        let mut table = CommandTable::new();
        table.add_sync_command("Pong", "echo", Vec::new(), |_, args| Ok(args));
        let (client, mut client_driver) = Channel::new(None, ChannelConfig::default());
        let (server, mut server_driver) =
            Channel::new(Some(Arc::new(table)), ChannelConfig::default());
        tcflink_transport::pipe(Arc::new(client.clone()), Arc::new(server.clone()));

        client.start().unwrap();
        server.start().unwrap();
        client_driver.run_pending();
        server_driver.run_pending();
        assert!(client.is_connected());
        assert!(server.is_connected());

        let reply = client.send_command("Pong", "echo", &[Arg::from("x")], &[]);
        settle(&mut server_driver).await;
        assert_eq!(client.pending_messages(), 1);

        server.close();
        assert_eq!(client.state(), ConnectionState::Connected);
        client_driver.run_pending();

        assert_eq!(reply.await.unwrap(), vec![Arg::from("x")]);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_close_waits_behind_buffered_events() {
        let (channel, mut driver, _sink) = connected(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&seen);
        channel
            .add_event_handler("Svc", "last", Vec::new(), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut writer = FrameWriter::default();
        channel.on_data(write_event(&mut writer, &ArgCodec::default(), "Svc", "last", &[]).unwrap());
        channel.on_closed();
        assert!(channel.is_connected());

        driver.run_pending();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_close_without_driver_tears_down_in_place() {
        let (channel, driver, _sink) = connected(None);
        drop(driver);
        channel.on_closed();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wait_connected_removes_its_listeners() {
        let (channel, mut driver, _sink) = attached(None);
        channel.start().unwrap();

        let (waited, ()) = tokio::join!(channel.wait_connected(), async {
            channel.on_data(peer_hello(&[]));
            driver.run_pending();
        });
        waited.unwrap();
        for _ in 0..3 {
            channel.wait_connected().await.unwrap();
        }
        assert_eq!(channel.shared.listeners.lock().len(), 0);
    }

    #[test]
    fn malformed_input_is_fatal() {
        let (channel, mut driver, sink) = connected(None);
        channel.on_data(Bytes::from_static(b"Q\x00\x03\x01"));
        driver.run_pending();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(sink.last(), Message::EndOfStream);
    }
}
