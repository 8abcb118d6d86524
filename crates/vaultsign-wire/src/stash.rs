//! Bounded reassembly buffer feeding the streaming frame decoder.
//!
//! The broker's read loop appends raw transport bytes here and then drains
//! complete frames. Capacity is bounded: when a write would overflow, the
//! oldest bytes are dropped (the decoder resynchronizes at the next magic).

use crate::frame::{self, DecodeStep, Frame, HEADER_LEN, MAX_PAYLOAD};
use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

/// Default capacity: several maximum-size frames.
pub const DEFAULT_CAPACITY: usize = 4 * (HEADER_LEN + MAX_PAYLOAD);

/// Bounded byte queue over the streaming decoder.
#[derive(Debug)]
pub struct Stash {
    buf: BytesMut,
    capacity: usize,
}

impl Stash {
    /// Create a stash holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity: capacity.max(HEADER_LEN),
        }
    }

    /// Append bytes, dropping the oldest data when over capacity.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            let dropped = self.buf.len() + bytes.len() - self.capacity;
            warn!(dropped, "stash overflow; keeping only newest bytes");
            self.buf.clear();
            self.buf
                .extend_from_slice(&bytes[bytes.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            warn!(dropped = overflow, "stash overflow; dropping oldest bytes");
            self.buf.advance(overflow);
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Drain the next complete frame, skipping over corrupt stretches.
    ///
    /// Returns `None` once the decoder needs more bytes.
    pub fn read_frame(&mut self) -> Option<Frame> {
        loop {
            match frame::decode_frame(&mut self.buf) {
                Ok(DecodeStep::Frame(frame)) => return Some(frame),
                Ok(DecodeStep::NeedMore) => return None,
                Err(err) => {
                    debug!(%err, "skipping corrupt frame data");
                    continue;
                }
            }
        }
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
