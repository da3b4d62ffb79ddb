//! Producer-side stream endpoint.
//!
//! A [`MarkedSink`] is owned by exactly one thread and holds exactly one
//! in-flight [`Buffer`] borrowed from the FIFO's pool. Writes append to that
//! buffer; [`mark`](MarkedSink::mark) declares everything since the previous
//! mark to be one indivisible logical region. When the buffer fills, the sink
//! hands it to the FIFO and carries any uncommitted tail into a fresh buffer,
//! so a region is never split across two transfers.

use std::sync::Arc;

use tracing::warn;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::fifo::BufferFifo;

/// Wait budget for pushing a full buffer into the FIFO, per retry round.
const PUSH_WAIT_US: u64 = 1000;

const OPEN: &str = "sink buffer present until close";

/// Write-only stream endpoint bound to one FIFO.
///
/// Registers itself as a writer on first write and deregisters when dropped.
/// Dropping the sink flushes committed content; bytes written past the last
/// mark are discarded with a warning (see
/// [`flush_unmarked`](MarkedSink::flush_unmarked) for the escape hatch).
pub struct MarkedSink {
    fifo: Arc<BufferFifo>,
    buf: Option<Buffer>,
    registered: bool,
    prev_bytes: u64,
}

impl MarkedSink {
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
            self.fifo.register_writer();
            self.registered = true;
        }
    }

    /// Append `bytes` to the current logical region.
    ///
    /// If the in-flight buffer lacks space and holds a committed region, the
    /// buffer is handed off first to free space. A region that cannot fit in
    /// a single buffer even after handoff is refused with
    /// [`Error::OversizedMessage`], leaving the buffer untouched.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure_registered();
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() > self.buf.as_ref().expect(OPEN).premainder() {
            if self.buf.as_ref().expect(OPEN).mark() > 0 {
                self.overflow();
            }
            let buf = self.buf.as_ref().expect(OPEN);
            if bytes.len() > buf.premainder() {
                return Err(Error::OversizedMessage {
                    len: buf.mark_remainder() + bytes.len(),
                    capacity: buf.capacity(),
                });
            }
        }
        let n = self.buf.as_mut().expect(OPEN).write(bytes);
        debug_assert_eq!(n, bytes.len());
        Ok(n)
    }

    /// Declare the end of the current logical region, returning its size.
    ///
    /// With `flush`, or when the just-closed region is at least as large as
    /// the remaining writable space, the buffer is handed to the FIFO so a
    /// following region of similar size cannot end up split. A zero-length
    /// region never triggers a handoff on its own.
    pub fn mark(&mut self, flush: bool) -> usize {
        self.ensure_registered();
        let buf = self.buf.as_mut().expect(OPEN);
        let delta = buf.set_mark();
        if flush || (delta > 0 && delta >= buf.premainder()) {
            self.overflow();
        }
        delta
    }

    /// Hand all committed content to the FIFO. Equivalent to `mark(true)`.
    pub fn flush(&mut self) {
        self.mark(true);
    }

    /// Commit any unmarked tail as its own region, then flush. The escape
    /// hatch for tearing a sink down without losing trailing bytes.
    pub fn flush_unmarked(&mut self) -> usize {
        self.mark(true)
    }

    /// Bytes accepted by this sink so far, across all handed-off buffers.
    pub fn position(&self) -> u64 {
        self.prev_bytes + self.buf.as_ref().map_or(0, |b| b.len() as u64)
    }

    /// Uncommitted bytes in the in-flight buffer.
    pub fn mark_remainder(&self) -> usize {
        self.buf.as_ref().map_or(0, Buffer::mark_remainder)
    }

    /// Hand the in-flight buffer to the FIFO and adopt a fresh one.
    ///
    /// The uncommitted tail `[mark, put)` is copied into the fresh buffer
    /// before the old one (truncated at its mark) is pushed, keeping the
    /// in-progress region contiguous.
    fn overflow(&mut self) {
        let buf = self.buf.as_mut().expect(OPEN);
        if buf.is_empty() {
            // Nothing committed and no tail; keep the buffer we have.
            return;
        }

        let mut next = self.fifo.acquire_buffer();
        let tail = buf.mark_remainder();
        if tail > 0 {
            let copied = next.write(buf.marked_tail());
            debug_assert_eq!(copied, tail, "fresh buffer must hold the whole tail");
            let mark = buf.mark();
            buf.clear(mark);
        }
        self.prev_bytes += buf.len() as u64;

        let old = self.buf.replace(next).expect(OPEN);
        self.fifo.push(old, PUSH_WAIT_US);
    }

    fn close(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        let tail = buf.mark_remainder();
        if tail > 0 {
            warn!(
                bytes = tail,
                "discarding unmarked bytes on sink close; mark() or flush_unmarked() them first"
            );
            let mark = buf.mark();
            buf.clear(mark);
        }
        if buf.is_empty() {
            self.fifo.return_buffer(buf);
        } else {
            self.prev_bytes += buf.len() as u64;
            self.fifo.push(buf, PUSH_WAIT_US);
        }
        if self.registered {
            self.fifo.deregister_writer();
        }
    }
}

impl Drop for MarkedSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(fifo: &BufferFifo) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(buf) = fifo.pop(0) {
            out.extend_from_slice(buf.readable());
            fifo.return_buffer(buf);
        }
        out
    }

    #[test]
    fn write_and_flush_delivers_committed_bytes() {
        let fifo = Arc::new(BufferFifo::new(128, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        assert_eq!(sink.mark(false), 11);
        sink.flush();
        assert_eq!(read_all(&fifo), b"hello world");
    }

    #[test]
    fn mark_of_zero_bytes_does_not_flush() {
        let fifo = Arc::new(BufferFifo::new(128, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        sink.write(b"abc").unwrap();
        sink.mark(false);
        assert_eq!(sink.mark(false), 0);
        assert_eq!(fifo.state().pushed, 0);
    }

    #[test]
    fn large_region_closes_out_the_buffer() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        // Region consumes more than half the buffer: the mark hands it off.
        sink.write(&[7u8; 40]).unwrap();
        sink.mark(false);
        assert_eq!(fifo.state().pushed, 1);
        let buf = fifo.pop(0).unwrap();
        assert_eq!(buf.readable(), &[7u8; 40][..]);
    }

    #[test]
    fn tail_is_carried_whole_into_the_next_buffer() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));

        sink.write(&[1u8; 30]).unwrap();
        sink.mark(false);
        // 30 committed + 30 tail; the next write cannot fit, so the sink
        // hands off the committed region and carries the tail forward.
        sink.write(&[2u8; 30]).unwrap();
        sink.write(&[2u8; 30]).unwrap();
        sink.mark(false);
        sink.flush();

        let first = fifo.pop(0).unwrap();
        assert_eq!(first.readable(), &[1u8; 30][..]);
        let second = fifo.pop(0).unwrap();
        assert_eq!(second.readable(), &[2u8; 60][..]);
    }

    #[test]
    fn oversized_region_is_refused() {
        let fifo = Arc::new(BufferFifo::new(1024, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        let err = sink.write(&[0u8; 2048]).unwrap_err();
        assert_eq!(
            err,
            Error::OversizedMessage {
                len: 2048,
                capacity: 1024
            }
        );
        // Nothing reached the FIFO and the buffer is still usable.
        assert_eq!(fifo.state().pushed, 0);
        assert_eq!(sink.write(&[0u8; 512]).unwrap(), 512);
    }

    #[test]
    fn oversized_tail_plus_write_is_refused_after_handoff() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        sink.write(&[1u8; 16]).unwrap();
        sink.mark(false);
        sink.write(&[2u8; 32]).unwrap();
        // 32 tail bytes + 48 new bytes can never fit a 64-byte buffer.
        let err = sink.write(&[2u8; 48]).unwrap_err();
        assert_eq!(
            err,
            Error::OversizedMessage {
                len: 80,
                capacity: 64
            }
        );
        // The committed region was still handed off intact.
        assert_eq!(fifo.pop(0).unwrap().readable(), &[1u8; 16][..]);
    }

    #[test]
    fn write_of_exactly_premainder_needs_no_handoff() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        sink.write(&[9u8; 64]).unwrap();
        assert_eq!(fifo.state().pushed, 0);
        sink.mark(false);
        // The region now occupies the whole buffer, which forces a handoff.
        assert_eq!(fifo.state().pushed, 1);
    }

    #[test]
    fn drop_discards_unmarked_tail() {
        let fifo = Arc::new(BufferFifo::new(128, 4));
        {
            let mut sink = MarkedSink::new(Arc::clone(&fifo));
            sink.write(b"committed").unwrap();
            sink.mark(false);
            sink.write(b"abandoned").unwrap();
        }
        assert_eq!(read_all(&fifo), b"committed");
        assert_eq!(fifo.active_writer_count(), 0);
        assert_eq!(fifo.writer_count(), 1);
    }

    #[test]
    fn flush_unmarked_commits_the_tail() {
        let fifo = Arc::new(BufferFifo::new(128, 4));
        {
            let mut sink = MarkedSink::new(Arc::clone(&fifo));
            sink.write(b"committed ").unwrap();
            sink.mark(false);
            sink.write(b"and tail").unwrap();
            assert_eq!(sink.flush_unmarked(), 8);
        }
        assert_eq!(read_all(&fifo), b"committed and tail");
    }

    #[test]
    fn position_accumulates_across_handoffs() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        let mut sink = MarkedSink::new(Arc::clone(&fifo));
        for _ in 0..4 {
            sink.write(&[3u8; 40]).unwrap();
            sink.mark(false);
        }
        assert_eq!(sink.position(), 160);
    }

    #[test]
    fn unused_sink_never_registers() {
        let fifo = Arc::new(BufferFifo::new(64, 4));
        {
            let _sink = MarkedSink::new(Arc::clone(&fifo));
        }
        assert_eq!(fifo.writer_count(), 0);
        assert_eq!(fifo.state().pushed, 0);
    }
}
