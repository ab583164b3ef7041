use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::codec::{WireCursor, ESC, TAG_EOM, TAG_EOS};
use crate::error::{FrameError, Result};
use crate::message::Message;

/// A message boundary seen while scanning delivered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// A complete message is now buffered.
    Message,
    /// The peer signalled end-of-stream.
    EndOfStream,
}

/// Accumulates transport chunks and hands out complete messages.
///
/// Chunk boundaries are arbitrary: an escape sequence or a message may be
/// split across any number of deliveries. Each delivery is scanned once, so
/// the caller learns about every boundary exactly when its last byte arrives.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Bytes,
    pos: usize,
    pending_messages: usize,
    eof: bool,
    /// The previous chunk ended with an unpaired ESC byte.
    in_escape: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take in one transport chunk, returning the boundaries it completes.
    pub fn push(&mut self, chunk: Bytes) -> Vec<Boundary> {
        let boundaries = self.scan(&chunk);

        if self.pos >= self.buf.len() {
            self.buf = chunk;
        } else {
            let tail = &self.buf[self.pos..];
            let mut joined = BytesMut::with_capacity(tail.len() + chunk.len());
            joined.put_slice(tail);
            joined.put_slice(&chunk);
            self.buf = joined.freeze();
        }
        self.pos = 0;

        trace!(
            buffered = self.buf.len(),
            pending = self.pending_messages,
            "input chunk reassembled"
        );
        boundaries
    }

    /// Decode the oldest complete message.
    pub fn next_message(&mut self) -> Result<Message> {
        if self.pending_messages == 0 {
            return Err(FrameError::NoPendingMessage);
        }
        let mut cursor = WireCursor::new(&self.buf, self.pos).with_eof(self.eof);
        let msg = Message::decode(&mut cursor)?;
        self.pos = cursor.pos();
        self.pending_messages -= 1;
        Ok(msg)
    }

    /// Decode every complete message, stopping at the first error.
    ///
    /// Bytes after the last boundary stay buffered.
    pub fn drain_messages(&mut self) -> (Vec<Message>, Option<FrameError>) {
        let mut messages = Vec::with_capacity(self.pending_messages);
        while self.pending_messages > 0 {
            match self.next_message() {
                Ok(msg) => messages.push(msg),
                Err(err) => return (messages, Some(err)),
            }
        }
        (messages, None)
    }

    /// Framed messages not yet taken with [`next_message`](Self::next_message).
    pub fn pending_messages(&self) -> usize {
        self.pending_messages
    }

    /// Whether the peer has signalled end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Unread bytes held in the buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn scan(&mut self, chunk: &[u8]) -> Vec<Boundary> {
        let mut boundaries = Vec::new();
        for &b in chunk {
            if self.in_escape {
                self.in_escape = false;
                match b {
                    TAG_EOM => {
                        self.pending_messages += 1;
                        boundaries.push(Boundary::Message);
                    }
                    TAG_EOS => {
                        self.eof = true;
                        boundaries.push(Boundary::EndOfStream);
                    }
                    _ => {}
                }
            } else if b == ESC {
                self.in_escape = true;
            }
        }
        boundaries
    }
}

/// Split a complete capture into messages.
///
/// Stops at the first decode error, returning the messages read before it
/// alongside the error.
pub fn split_messages(data: Bytes) -> (Vec<Message>, Option<FrameError>) {
    let mut reassembler = Reassembler::new();
    reassembler.push(data);
    reassembler.drain_messages()
}
