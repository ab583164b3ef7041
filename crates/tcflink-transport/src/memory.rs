//! In-process pipe between two endpoints.
//!
//! Every flush on one side is delivered as `on_data` on the other side, in
//! call order. An optional chunk size splits each flush into several
//! deliveries, which exercises the receiver's reassembly path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{Endpoint, TransportSink};

/// Sink half handed to one side of a memory pipe.
pub struct MemorySink {
    local: Arc<dyn Endpoint>,
    remote: Arc<dyn Endpoint>,
    closed: Arc<AtomicBool>,
    chunk_size: Option<usize>,
}

impl MemorySink {
    /// Whether either side has closed the pipe.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportSink for MemorySink {
    fn flush_output(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        trace!(len = data.len(), "memory pipe flush");
        match self.chunk_size {
            Some(size) if size > 0 && data.len() > size => {
                let mut rest = data;
                while !rest.is_empty() {
                    let take = size.min(rest.len());
                    self.remote.on_data(rest.split_to(take));
                }
            }
            _ => self.remote.on_data(data),
        }
        Ok(())
    }

    fn close_connection(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("memory pipe closed");
        self.remote.on_closed();
        self.local.on_closed();
    }
}

impl fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySink")
            .field("closed", &self.is_closed())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Wire two endpoints to each other.
pub fn pipe(left: Arc<dyn Endpoint>, right: Arc<dyn Endpoint>) {
    pipe_inner(left, right, None);
}

/// Wire two endpoints, delivering every flush in chunks of at most `chunk_size` bytes.
pub fn pipe_with_chunk_size(left: Arc<dyn Endpoint>, right: Arc<dyn Endpoint>, chunk_size: usize) {
    pipe_inner(left, right, Some(chunk_size));
}

fn pipe_inner(left: Arc<dyn Endpoint>, right: Arc<dyn Endpoint>, chunk_size: Option<usize>) {
    let closed = Arc::new(AtomicBool::new(false));
    let left_sink = MemorySink {
        local: Arc::clone(&left),
        remote: Arc::clone(&right),
        closed: Arc::clone(&closed),
        chunk_size,
    };
    let right_sink = MemorySink {
        local: Arc::clone(&right),
        remote: Arc::clone(&left),
        closed,
        chunk_size,
    };
    left.attach(Arc::new(left_sink));
    right.attach(Arc::new(right_sink));
}
