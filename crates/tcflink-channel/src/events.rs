use std::fmt;
use std::sync::Arc;

use tcflink_frame::{Arg, ArgKind};

use crate::error::{ChannelError, Result};

/// Callback for one (service, event) pair. Receives the decoded arguments.
pub type EventHandler = Arc<dyn Fn(Vec<Arg>) + Send + Sync>;

/// Callback for a channel lifecycle notification.
///
/// The error is set for [`LifecycleEvent::Error`] and `None` otherwise.
pub type LifecycleCallback = Arc<dyn Fn(Option<&ChannelError>) + Send + Sync>;

/// Channel-level notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The handshake completed.
    Connect,
    /// The channel was torn down. Fires once per channel.
    Close,
    /// The transport failed. Followed by `Close`.
    Error,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleEvent::Connect => "connect",
            LifecycleEvent::Close => "close",
            LifecycleEvent::Error => "error",
        })
    }
}

struct EventEntry {
    service: String,
    name: String,
    arg_kinds: Vec<ArgKind>,
    handler: EventHandler,
}

/// Registered inbound event handlers, at most one per (service, event) pair.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    entries: Vec<EventEntry>,
}

impl EventDispatcher {
    pub(crate) fn add(
        &mut self,
        service: &str,
        name: &str,
        arg_kinds: Vec<ArgKind>,
        handler: EventHandler,
    ) -> Result<()> {
        if self.find(service, name).is_some() {
            return Err(ChannelError::DuplicateEventHandler {
                service: service.to_string(),
                event: name.to_string(),
            });
        }
        self.entries.push(EventEntry {
            service: service.to_string(),
            name: name.to_string(),
            arg_kinds,
            handler,
        });
        Ok(())
    }

    /// Declared argument kinds and handler for an event.
    pub(crate) fn find(&self, service: &str, name: &str) -> Option<(Vec<ArgKind>, EventHandler)> {
        self.entries
            .iter()
            .find(|e| e.service == service && e.name == name)
            .map(|e| (e.arg_kinds.clone(), Arc::clone(&e.handler)))
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Lifecycle subscribers, notified in registration order.
#[derive(Default)]
pub(crate) struct Listeners {
    last_id: u64,
    entries: Vec<(u64, LifecycleEvent, LifecycleCallback)>,
}

impl Listeners {
    /// Subscribe `callback`. The returned id can be passed to [`remove`](Self::remove).
    pub(crate) fn add(&mut self, event: LifecycleEvent, callback: LifecycleCallback) -> u64 {
        self.last_id += 1;
        self.entries.push((self.last_id, event, callback));
        self.last_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _, _)| *entry != id);
        self.entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of the callbacks for `event`, so they can run without the lock.
    pub(crate) fn for_event(&self, event: LifecycleEvent) -> Vec<LifecycleCallback> {
        self.entries
            .iter()
            .filter(|(_, e, _)| *e == event)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect()
    }
}
