//! Escape-coded message framing for tcflink.
//!
//! Messages are sequences of NUL-terminated fields closed by an escape-coded
//! end-of-message marker:
//! - `0x03` (ESC) always starts a two-byte escape
//! - `ESC 0x00` is a literal ESC byte, `ESC 0x01` ends a message,
//!   `ESC 0x02` ends the stream, `ESC 0x03` introduces a zero-copy buffer
//!
//! The [`Reassembler`] turns arbitrary transport chunks into complete
//! [`Message`]s; the [`FrameWriter`] builds outbound messages in a fixed
//! capacity buffer.

pub mod arg;
pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use arg::{Arg, ArgCodec, ArgKind};
pub use codec::{
    Marker, WireCursor, DEFAULT_OUTPUT_CAPACITY, ESC, TAG_EOM, TAG_EOS, TAG_LITERAL_ESC,
    TAG_ZERO_COPY, ZERO_COPY_INLINE_MAX,
};
pub use error::{FrameError, Result};
pub use message::{write_command, write_event, write_reply, Message, RawArg, ReplyKind};
pub use reader::{split_messages, Boundary, Reassembler};
pub use writer::FrameWriter;
