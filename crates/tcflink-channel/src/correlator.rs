//! Outbound command bookkeeping.
//!
//! Every command gets a fresh token. The pending record holds what is needed
//! to decode and deliver the reply: the declared result kinds, a completion
//! sender and, for commands that report progress, a progress sender.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tcflink_frame::{Arg, ArgKind};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ChannelError, Result};

/// A command awaiting its reply.
#[derive(Debug)]
pub(crate) struct PendingReply {
    pub(crate) service: String,
    pub(crate) method: String,
    pub(crate) result_kinds: Vec<ArgKind>,
    completion: oneshot::Sender<Result<Vec<Arg>>>,
    progress: Option<mpsc::UnboundedSender<Vec<Arg>>>,
}

impl PendingReply {
    /// Resolve the command. A caller that dropped its future is not an error.
    pub(crate) fn complete(self, outcome: Result<Vec<Arg>>) {
        let _ = self.completion.send(outcome);
    }
}

/// Token allocation plus the table of commands in flight.
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    last_token: u64,
    pending: BTreeMap<u64, PendingReply>,
}

impl Correlator {
    /// Allocate the next token. The first token is 1.
    pub(crate) fn next_token(&mut self) -> u64 {
        self.last_token += 1;
        self.last_token
    }

    /// Record a command sent under `token` and hand back its reply handles.
    pub(crate) fn register(
        &mut self,
        token: u64,
        service: &str,
        method: &str,
        result_kinds: Vec<ArgKind>,
        with_progress: bool,
    ) -> (ReplyFuture, Option<ProgressStream>) {
        let (tx, rx) = oneshot::channel();
        let (progress, stream) = if with_progress {
            let (ptx, prx) = mpsc::unbounded_channel();
            (Some(ptx), Some(ProgressStream { rx: prx }))
        } else {
            (None, None)
        };
        self.pending.insert(
            token,
            PendingReply {
                service: service.to_string(),
                method: method.to_string(),
                result_kinds,
                completion: tx,
                progress,
            },
        );
        (ReplyFuture::waiting(token, rx), stream)
    }

    /// Declared result kinds for the command sent under `token`.
    pub(crate) fn result_kinds(&self, token: &str) -> Option<Vec<ArgKind>> {
        let token = token.parse::<u64>().ok()?;
        self.pending.get(&token).map(|p| p.result_kinds.clone())
    }

    /// Remove the record for a terminal reply.
    pub(crate) fn take(&mut self, token: &str) -> Option<PendingReply> {
        let token = token.parse::<u64>().ok()?;
        self.pending.remove(&token)
    }

    /// Forward a progress report. Returns `false` if the token is unknown.
    pub(crate) fn progress(&self, token: &str, args: Vec<Arg>) -> bool {
        let Some(record) = token
            .parse::<u64>()
            .ok()
            .and_then(|t| self.pending.get(&t))
        else {
            return false;
        };
        if let Some(progress) = &record.progress {
            let _ = progress.send(args);
        }
        true
    }

    /// Reject every command in flight with [`ChannelError::ChannelClosed`].
    pub(crate) fn reject_all(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for (_, record) in pending {
            record.complete(Err(ChannelError::ChannelClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

enum ReplyState {
    Failed(Option<ChannelError>),
    Waiting(oneshot::Receiver<Result<Vec<Arg>>>),
}

/// Resolves with the decoded result arguments of one command.
///
/// Fails with [`ChannelError::ChannelClosed`] if the channel is torn down
/// first, or [`ChannelError::NotRecognized`] if the peer answers `N`.
#[must_use = "a command's outcome is only observed by awaiting its reply"]
pub struct ReplyFuture {
    token: Option<u64>,
    state: ReplyState,
}

impl ReplyFuture {
    pub(crate) fn failed(err: ChannelError) -> Self {
        Self {
            token: None,
            state: ReplyState::Failed(Some(err)),
        }
    }

    fn waiting(token: u64, rx: oneshot::Receiver<Result<Vec<Arg>>>) -> Self {
        Self {
            token: Some(token),
            state: ReplyState::Waiting(rx),
        }
    }

    /// Token the command was sent under, if it was sent at all.
    pub fn token(&self) -> Option<u64> {
        self.token
    }
}

impl Future for ReplyFuture {
    type Output = Result<Vec<Arg>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(ChannelError::ChannelClosed)))
            }
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::ChannelClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("token", &self.token)
            .finish()
    }
}

/// Progress reports (`P` replies) of one command. Ends when the command completes.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<Vec<Arg>>,
}

impl ProgressStream {
    /// A stream that has already ended.
    pub(crate) fn closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self { rx }
    }
}

impl Stream for ProgressStream {
    type Item = Vec<Arg>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
