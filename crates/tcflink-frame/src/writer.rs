use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    encode_varint, DEFAULT_OUTPUT_CAPACITY, ESC, TAG_EOM, TAG_EOS, TAG_LITERAL_ESC, TAG_ZERO_COPY,
    ZERO_COPY_INLINE_MAX,
};
use crate::error::{FrameError, Result};

/// Fixed-capacity output buffer that accumulates one message at a time.
///
/// Bytes are escaped as they are written. [`write_eom`](Self::write_eom)
/// closes the message and hands back the buffered bytes for flushing,
/// leaving the buffer empty.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

impl FrameWriter {
    /// Create a writer whose buffer never grows past `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append one data byte, escaping ESC.
    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        if value == ESC {
            self.put(&[ESC, TAG_LITERAL_ESC])
        } else {
            self.put(&[value])
        }
    }

    /// Append bytes verbatim, without escaping.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.put(data)
    }

    /// Append a text field followed by its NUL terminator.
    pub fn write_field(&mut self, text: &str) -> Result<()> {
        self.write_field_bytes(text.as_bytes())
    }

    /// Append a byte field followed by its NUL terminator.
    pub fn write_field_bytes(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            self.write_byte(b)?;
        }
        self.put(&[0])
    }

    /// Append a binary buffer in the zero-copy encoding.
    ///
    /// Layout: `(` decimal length `)`, then either the bytes escaped inline
    /// (up to [`ZERO_COPY_INLINE_MAX`]) or `ESC 0x03`, a varint length and
    /// the raw bytes, then a NUL terminator.
    pub fn write_zero_copy(&mut self, data: &[u8]) -> Result<()> {
        self.put(format!("({})", data.len()).as_bytes())?;
        if data.len() > ZERO_COPY_INLINE_MAX {
            let mut header = vec![ESC, TAG_ZERO_COPY];
            encode_varint(data.len(), &mut header);
            self.put(&header)?;
            self.put(data)?;
        } else {
            for &b in data {
                self.write_byte(b)?;
            }
        }
        self.put(&[0])
    }

    /// Append the end-of-stream marker.
    pub fn write_eos(&mut self) -> Result<()> {
        self.put(&[ESC, TAG_EOS])
    }

    /// Append the end-of-message marker and take the finished message.
    pub fn write_eom(&mut self) -> Result<Bytes> {
        self.put(&[ESC, TAG_EOM])?;
        Ok(self.buf.split().freeze())
    }

    /// Build the stream-termination message: EOS, an empty field, EOM.
    pub fn write_close(&mut self) -> Result<Bytes> {
        self.write_eos()?;
        self.put(&[0])?;
        self.write_eom()
    }

    /// Drop a partially written message.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes of the message in progress.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn put(&mut self, data: &[u8]) -> Result<()> {
        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            return Err(FrameError::OutputOverflow {
                needed,
                capacity: self.capacity,
            });
        }
        self.buf.put_slice(data);
        Ok(())
    }
}
