use std::fmt;

use crate::error::{FrameError, Result};

/// Escape byte. Always the first byte of a two-byte escape sequence.
pub const ESC: u8 = 3;

/// Escape tag: literal ESC byte.
pub const TAG_LITERAL_ESC: u8 = 0;
/// Escape tag: end of message.
pub const TAG_EOM: u8 = 1;
/// Escape tag: end of stream.
pub const TAG_EOS: u8 = 2;
/// Escape tag: zero-copy binary buffer follows.
pub const TAG_ZERO_COPY: u8 = 3;

/// Default output buffer capacity: 512 KiB.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 512 * 1024;

/// Largest binary buffer written inline (escaped) on the zero-copy path.
pub const ZERO_COPY_INLINE_MAX: usize = 32;

/// One logical unit of the byte stream after escape expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A data byte. `ESC 0x00` expands to `Byte(ESC)`.
    Byte(u8),
    /// End of message.
    Eom,
    /// End of stream.
    Eos,
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Byte(b) => write!(f, "byte {b:#04x}"),
            Marker::Eom => f.write_str("end-of-message"),
            Marker::Eos => f.write_str("end-of-stream"),
        }
    }
}

/// Read cursor over a received byte buffer.
///
/// `peek_marker` never moves the cursor; every other read does.
#[derive(Debug)]
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    eof: bool,
}

impl<'a> WireCursor<'a> {
    /// Create a cursor positioned at `pos`.
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos,
            eof: false,
        }
    }

    /// Treat the end of the buffer as end-of-stream instead of truncation.
    pub fn with_eof(mut self, eof: bool) -> Self {
        self.eof = eof;
        self
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Inspect the next unit without consuming it.
    pub fn peek_marker(&self) -> Result<Marker> {
        self.decode_at(self.pos).map(|(marker, _)| marker)
    }

    /// Consume the next unit.
    pub fn read_marker(&mut self) -> Result<Marker> {
        let (marker, width) = self.decode_at(self.pos)?;
        self.pos += width;
        Ok(marker)
    }

    /// Consume one NUL-terminated field, expanding literal escapes.
    ///
    /// A boundary marker inside the field is an error; callers peek first.
    pub fn read_field(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let offset = self.pos;
            match self.read_marker()? {
                Marker::Byte(0) => return Ok(out),
                Marker::Byte(b) => out.push(b),
                marker => return Err(FrameError::UnexpectedMarker { marker, offset }),
            }
        }
    }

    /// Consume one field and interpret it as UTF-8 text.
    pub fn read_string_field(&mut self) -> Result<String> {
        let offset = self.pos;
        let raw = self.read_field()?;
        String::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8 { offset })
    }

    /// Consume everything up to and including the next end-of-message.
    pub fn skip_to_eom(&mut self) -> Result<()> {
        loop {
            match self.read_marker()? {
                Marker::Eom => return Ok(()),
                // Synthetic end-of-stream past the buffer end never advances.
                Marker::Eos if self.remaining() == 0 && self.eof => return Ok(()),
                _ => {}
            }
        }
    }

    fn decode_at(&self, pos: usize) -> Result<(Marker, usize)> {
        let Some(&byte) = self.buf.get(pos) else {
            if self.eof {
                return Ok((Marker::Eos, 0));
            }
            return Err(FrameError::Truncated { offset: pos });
        };
        if byte != ESC {
            return Ok((Marker::Byte(byte), 1));
        }
        let tag = *self
            .buf
            .get(pos + 1)
            .ok_or(FrameError::Truncated { offset: pos + 1 })?;
        let marker = match tag {
            TAG_LITERAL_ESC => Marker::Byte(ESC),
            TAG_EOM => Marker::Eom,
            TAG_EOS => Marker::Eos,
            TAG_ZERO_COPY => return Err(FrameError::ZeroCopyUnsupported { offset: pos }),
            other => {
                return Err(FrameError::InvalidEscape {
                    tag: other,
                    offset: pos + 1,
                })
            }
        };
        Ok((marker, 2))
    }
}

/// Append `value` as a base-128 varint, low group first, high bit = continuation.
pub fn encode_varint(mut value: usize, dst: &mut Vec<u8>) {
    while value > 0x7f {
        dst.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_does_not_advance() {
        let buf = [b'C', 0];
        let cursor = WireCursor::new(&buf, 0);
        assert_eq!(cursor.peek_marker().unwrap(), Marker::Byte(b'C'));
        assert_eq!(cursor.peek_marker().unwrap(), Marker::Byte(b'C'));
        assert_eq!(cursor.pos(), 0);
    }

    #[test]
    fn escapes_expand() {
        let buf = [ESC, TAG_LITERAL_ESC, ESC, TAG_EOM, ESC, TAG_EOS];
        let mut cursor = WireCursor::new(&buf, 0);
        assert_eq!(cursor.read_marker().unwrap(), Marker::Byte(ESC));
        assert_eq!(cursor.read_marker().unwrap(), Marker::Eom);
        assert_eq!(cursor.peek_marker().unwrap(), Marker::Eos);
        assert_eq!(cursor.read_marker().unwrap(), Marker::Eos);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn read_field_keeps_literal_escape() {
        let buf = [b'a', ESC, TAG_LITERAL_ESC, b'b', 0, b'z'];
        let mut cursor = WireCursor::new(&buf, 0);
        assert_eq!(cursor.read_field().unwrap(), vec![b'a', ESC, b'b']);
        assert_eq!(cursor.pos(), 5);
    }

    #[test]
    fn read_field_rejects_boundary() {
        let buf = [b'a', ESC, TAG_EOM];
        let mut cursor = WireCursor::new(&buf, 0);
        assert!(matches!(
            cursor.read_field(),
            Err(FrameError::UnexpectedMarker {
                marker: Marker::Eom,
                offset: 1
            })
        ));
    }

    #[test]
    fn zero_copy_tag_fails() {
        let buf = [ESC, TAG_ZERO_COPY, 4];
        let cursor = WireCursor::new(&buf, 0);
        assert!(matches!(
            cursor.peek_marker(),
            Err(FrameError::ZeroCopyUnsupported { offset: 0 })
        ));
    }

    #[test]
    fn unknown_tag_fails() {
        let buf = [ESC, 9];
        let mut cursor = WireCursor::new(&buf, 0);
        assert!(matches!(
            cursor.read_marker(),
            Err(FrameError::InvalidEscape { tag: 9, offset: 1 })
        ));
    }

    #[test]
    fn split_escape_is_truncated() {
        let buf = [b'x', ESC];
        let mut cursor = WireCursor::new(&buf, 1);
        assert!(matches!(
            cursor.read_marker(),
            Err(FrameError::Truncated { offset: 2 })
        ));
    }

    #[test]
    fn end_of_buffer_reads_as_eos_after_eof() {
        let buf = [b'x'];
        let mut cursor = WireCursor::new(&buf, 1).with_eof(true);
        assert_eq!(cursor.read_marker().unwrap(), Marker::Eos);
    }

    #[test]
    fn varint_groups() {
        let mut out = Vec::new();
        encode_varint(0x7f, &mut out);
        assert_eq!(out, vec![0x7f]);

        out.clear();
        encode_varint(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);
    }
}
