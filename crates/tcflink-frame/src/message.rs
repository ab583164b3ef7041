//! Protocol messages.
//!
//! Wire layout, one field per line, each NUL-terminated, closed by EOM:
//! ```text
//! C  token  service  method  arg...
//! R  token  arg...            (also P = progress, N = not recognized)
//! E  service  event  arg...
//! ```

use std::fmt;

use bytes::Bytes;

use crate::arg::{Arg, ArgCodec};
use crate::codec::{Marker, WireCursor};
use crate::error::{FrameError, Result};
use crate::writer::FrameWriter;

/// Kind of a reply message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// `R`: final result.
    Result,
    /// `P`: progress report, more replies follow.
    Progress,
    /// `N`: the peer does not recognize the command.
    NotRecognized,
}

impl ReplyKind {
    pub fn tag(self) -> &'static str {
        match self {
            ReplyKind::Result => "R",
            ReplyKind::Progress => "P",
            ReplyKind::NotRecognized => "N",
        }
    }

    /// Whether the reply completes the command.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReplyKind::Progress)
    }
}

/// One undecoded argument field and the buffer offset it started at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArg {
    pub offset: usize,
    pub data: Vec<u8>,
}

/// A complete message as read from the wire.
///
/// Arguments are kept raw: how they decode depends on parser tables the
/// channel looks up after reading the header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command {
        token: String,
        service: String,
        method: String,
        args: Vec<RawArg>,
    },
    Reply {
        kind: ReplyKind,
        token: String,
        args: Vec<RawArg>,
    },
    Event {
        service: String,
        name: String,
        args: Vec<RawArg>,
    },
    /// The peer terminated the stream.
    EndOfStream,
}

impl Message {
    /// Decode one message, consuming its EOM.
    pub fn decode(cursor: &mut WireCursor<'_>) -> Result<Self> {
        if cursor.peek_marker()? == Marker::Eos {
            cursor.read_marker()?;
            cursor.skip_to_eom()?;
            return Ok(Message::EndOfStream);
        }

        let msg_type = cursor.read_string_field()?;
        let msg = match msg_type.as_str() {
            "C" => {
                let token = cursor.read_string_field()?;
                let service = cursor.read_string_field()?;
                let method = cursor.read_string_field()?;
                Message::Command {
                    token,
                    service,
                    method,
                    args: read_args(cursor)?,
                }
            }
            "R" | "P" | "N" => {
                let kind = match msg_type.as_str() {
                    "R" => ReplyKind::Result,
                    "P" => ReplyKind::Progress,
                    _ => ReplyKind::NotRecognized,
                };
                let token = cursor.read_string_field()?;
                Message::Reply {
                    kind,
                    token,
                    args: read_args(cursor)?,
                }
            }
            "E" => {
                let service = cursor.read_string_field()?;
                let name = cursor.read_string_field()?;
                Message::Event {
                    service,
                    name,
                    args: read_args(cursor)?,
                }
            }
            _ => return Err(FrameError::UnknownMessageType(msg_type)),
        };
        Ok(msg)
    }

    /// Single-letter type tag (`"EOS"` for end-of-stream).
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::Command { .. } => "C",
            Message::Reply { kind, .. } => kind.tag(),
            Message::Event { .. } => "E",
            Message::EndOfStream => "EOS",
        }
    }

    pub fn args(&self) -> &[RawArg] {
        match self {
            Message::Command { args, .. }
            | Message::Reply { args, .. }
            | Message::Event { args, .. } => args,
            Message::EndOfStream => &[],
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Command {
                token,
                service,
                method,
                args,
            } => write!(f, "C {token} {service} {method} ({} args)", args.len()),
            Message::Reply { kind, token, args } => {
                write!(f, "{} {token} ({} args)", kind.tag(), args.len())
            }
            Message::Event {
                service,
                name,
                args,
            } => write!(f, "E {service} {name} ({} args)", args.len()),
            Message::EndOfStream => f.write_str("EOS"),
        }
    }
}

fn read_args(cursor: &mut WireCursor<'_>) -> Result<Vec<RawArg>> {
    let mut args = Vec::new();
    while cursor.peek_marker()? != Marker::Eom {
        let offset = cursor.pos();
        let data = cursor.read_field()?;
        args.push(RawArg { offset, data });
    }
    cursor.read_marker()?;
    Ok(args)
}

/// Write a complete command message and take its bytes.
pub fn write_command(
    writer: &mut FrameWriter,
    codec: &ArgCodec,
    token: &str,
    service: &str,
    method: &str,
    args: &[Arg],
) -> Result<Bytes> {
    finish(writer, |w| {
        w.write_field("C")?;
        w.write_field(token)?;
        w.write_field(service)?;
        w.write_field(method)?;
        write_args(w, codec, args)
    })
}

/// Write a complete reply message and take its bytes.
pub fn write_reply(
    writer: &mut FrameWriter,
    codec: &ArgCodec,
    kind: ReplyKind,
    token: &str,
    args: &[Arg],
) -> Result<Bytes> {
    finish(writer, |w| {
        w.write_field(kind.tag())?;
        w.write_field(token)?;
        write_args(w, codec, args)
    })
}

/// Write a complete event message and take its bytes.
pub fn write_event(
    writer: &mut FrameWriter,
    codec: &ArgCodec,
    service: &str,
    name: &str,
    args: &[Arg],
) -> Result<Bytes> {
    finish(writer, |w| {
        w.write_field("E")?;
        w.write_field(service)?;
        w.write_field(name)?;
        write_args(w, codec, args)
    })
}

fn write_args(writer: &mut FrameWriter, codec: &ArgCodec, args: &[Arg]) -> Result<()> {
    for arg in args {
        codec.encode(arg, writer)?;
    }
    Ok(())
}

fn finish(
    writer: &mut FrameWriter,
    body: impl FnOnce(&mut FrameWriter) -> Result<()>,
) -> Result<Bytes> {
    let written = body(writer).and_then(|()| writer.write_eom());
    if written.is_err() {
        writer.reset();
    }
    written
}
