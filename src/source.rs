//! Consumer-side stream endpoint.
//!
//! A [`MarkedSource`] is owned by exactly one thread. It pops filled buffers
//! from the FIFO, reads them dry, then recycles them into the pool. Because
//! sinks never split a logical region across buffers, a consumer that knows
//! the framing convention always finds whole messages in contiguous bytes of
//! the in-flight buffer.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::fifo::{BufferFifo, DEFAULT_POP_WAIT_US};

/// Wait slice while blocking for data in [`MarkedSource::is_ready`].
const READY_POLL: Duration = Duration::from_millis(50);

const OPEN: &str = "source buffer present until close";

/// Read-only stream endpoint bound to one FIFO.
///
/// Registers itself as a reader on first use and deregisters when dropped.
pub struct MarkedSource {
    fifo: Arc<BufferFifo>,
    buf: Option<Buffer>,
    registered: bool,
    prev_bytes: u64,
}

impl MarkedSource {
    pub fn new(fifo: Arc<BufferFifo>) -> Self {
        let buf = fifo.acquire_buffer();
        Self {
            fifo,
            buf: Some(buf),
            registered: false,
            prev_bytes: 0,
        }
    }

    #[inline]
    fn ensure_registered(&mut self) {
        if !self.registered {
            self.fifo.register_reader();
            self.registered = true;
        }
    }

    /// Copy up to `dst.len()` bytes out of the in-flight buffer.
    ///
    /// When the buffer is dry a new one is popped from the FIFO first, but a
    /// single call never reads across a buffer boundary. Returns 0 when no
    /// data is available (including end-of-stream).
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.ensure_registered();
        if self.buf.as_ref().expect(OPEN).gremainder() == 0 {
            self.underflow(DEFAULT_POP_WAIT_US);
        }
        self.buf.as_mut().expect(OPEN).read(dst)
    }

    /// Readable bytes in the in-flight buffer.
    pub fn available(&self) -> usize {
        self.buf.as_ref().map_or(0, Buffer::gremainder)
    }

    /// Report whether data can be read right now.
    ///
    /// Attempts an underflow when the in-flight buffer is dry. With `block`,
    /// waits on the FIFO in 50 ms slices, re-attempting the underflow on
    /// every wakeup, until data arrives or end-of-stream is observed.
    pub fn is_ready(&mut self, block: bool) -> bool {
        self.ensure_registered();
        if self.available() > 0 {
            return true;
        }
        self.underflow(0);
        if block {
            while self.available() == 0 && !self.fifo.is_eof() {
                self.fifo.wait_for_data(READY_POLL);
                self.underflow(0);
            }
        }
        self.available() > 0
    }

    /// Force an underflow attempt if the in-flight buffer is dry.
    pub fn sync(&mut self) {
        self.ensure_registered();
        if self.available() == 0 {
            self.underflow(DEFAULT_POP_WAIT_US);
        }
    }

    /// End-of-stream: the FIFO is flagged and drained, and the in-flight
    /// buffer has been read dry.
    pub fn at_eof(&self) -> bool {
        self.available() == 0 && self.fifo.is_eof()
    }

    /// Bytes consumed by this source so far, across all recycled buffers.
    pub fn position(&self) -> u64 {
        self.prev_bytes + self.buf.as_ref().map_or(0, |b| b.consumed() as u64)
    }

    /// Swap the drained in-flight buffer for the next one in the FIFO.
    /// Returns whether a new buffer was adopted.
    fn underflow(&mut self, wait_us: u64) -> bool {
        match self.fifo.pop(wait_us) {
            Some(next) => {
                let old = self.buf.replace(next).expect(OPEN);
                self.prev_bytes += old.consumed() as u64;
                self.fifo.return_buffer(old);
                true
            }
            None => false,
        }
    }

    fn close(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.fifo.return_buffer(buf);
            if self.registered {
                self.fifo.deregister_reader();
            }
        }
    }
}

impl Drop for MarkedSource {
    fn drop(&mut self) {
        self.close();
    }
}
