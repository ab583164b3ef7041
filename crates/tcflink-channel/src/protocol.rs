//! Local command execution.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use tcflink_frame::{Arg, ArgKind};

use crate::channel::Channel;

/// Why a local command produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// No handler for this (service, method). Answered with `N`.
    #[error("command not recognized")]
    NotRecognized,

    /// The handler failed. Fatal to the channel.
    #[error("{0}")]
    Failed(String),
}

/// Pending outcome of one inbound command.
pub type CommandFuture = BoxFuture<'static, Result<Vec<Arg>, CommandError>>;

/// Services a channel offers to its peer.
pub trait Protocol: Send + Sync {
    /// Names advertised in our Hello.
    fn service_names(&self) -> Vec<String>;

    /// Declared kinds of the command's positional arguments. Positions past
    /// the end decode as JSON.
    fn command_arg_kinds(&self, service: &str, method: &str) -> Vec<ArgKind>;

    /// Run a command received from the peer.
    fn exec_command(
        &self,
        channel: &Channel,
        service: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> CommandFuture;
}

type CommandHandler = Arc<dyn Fn(Channel, Vec<Arg>) -> CommandFuture + Send + Sync>;

#[derive(Clone)]
struct CommandEntry {
    arg_kinds: Vec<ArgKind>,
    handler: CommandHandler,
}

/// Table-driven [`Protocol`]: handlers keyed by (service, method).
#[derive(Clone, Default)]
pub struct CommandTable {
    services: BTreeSet<String>,
    commands: HashMap<(String, String), CommandEntry>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertise a service without registering commands for it.
    pub fn add_service(&mut self, service: impl Into<String>) -> &mut Self {
        self.services.insert(service.into());
        self
    }

    /// Register an async handler. Replaces any handler for the same pair.
    pub fn add_command<F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        arg_kinds: Vec<ArgKind>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Channel, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Arg>, CommandError>> + Send + 'static,
    {
        self.services.insert(service.to_string());
        self.commands.insert(
            (service.to_string(), method.to_string()),
            CommandEntry {
                arg_kinds,
                handler: Arc::new(move |channel, args| handler(channel, args).boxed()),
            },
        );
        self
    }

    /// Register a handler that completes immediately.
    pub fn add_sync_command<F>(
        &mut self,
        service: &str,
        method: &str,
        arg_kinds: Vec<ArgKind>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&Channel, Vec<Arg>) -> Result<Vec<Arg>, CommandError> + Send + Sync + 'static,
    {
        self.add_command(service, method, arg_kinds, move |channel, args| {
            future::ready(handler(&channel, args))
        })
    }

    pub fn has_command(&self, service: &str, method: &str) -> bool {
        self.commands
            .contains_key(&(service.to_string(), method.to_string()))
    }

    fn entry(&self, service: &str, method: &str) -> Option<&CommandEntry> {
        self.commands.get(&(service.to_string(), method.to_string()))
    }
}

impl Protocol for CommandTable {
    fn service_names(&self) -> Vec<String> {
        self.services.iter().cloned().collect()
    }

    fn command_arg_kinds(&self, service: &str, method: &str) -> Vec<ArgKind> {
        self.entry(service, method)
            .map(|e| e.arg_kinds.clone())
            .unwrap_or_default()
    }

    fn exec_command(
        &self,
        channel: &Channel,
        service: &str,
        method: &str,
        args: Vec<Arg>,
    ) -> CommandFuture {
        match self.entry(service, method) {
            Some(entry) => (entry.handler)(channel.clone(), args),
            None => future::ready(Err(CommandError::NotRecognized)).boxed(),
        }
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<String> = self
            .commands
            .keys()
            .map(|(service, method)| format!("{service}.{method}"))
            .collect();
        commands.sort();
        f.debug_struct("CommandTable")
            .field("services", &self.services)
            .field("commands", &commands)
            .finish()
    }
}
