//! Bounded MPMC queue transporting filled buffers from sinks to sources.
//!
//! The [`BufferFifo`] wraps a lock-free queue with the counters, the
//! reader/writer census and the end-of-stream flag that the stream endpoints
//! coordinate through, and owns the [`BufferPool`] the buffers recycle into.
//! Producers that outrun the pool are throttled by
//! [`wait_for_buffer`](BufferFifo::wait_for_buffer), a wait that grows with
//! the cube of the oversubscription ratio, so exhaustion shows up as producer
//! latency instead of unbounded memory growth.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::warn;

use crate::buffer::Buffer;
use crate::pool::BufferPool;

/// Buffer sizes are kept at cache-line granularity.
const BUFFER_SIZE_ALIGN: usize = 64;

/// Default wait budget for a blocking pop, in microseconds.
pub const DEFAULT_POP_WAIT_US: u64 = 1000;

/// Condition variables are hints only; waits re-poll the lock-free
/// operation at least this often so a missed notify costs bounded latency.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[inline]
fn align_buffer_size(size: usize) -> usize {
    (size + (BUFFER_SIZE_ALIGN - 1)) & !(BUFFER_SIZE_ALIGN - 1)
}

/// Counter snapshot of a FIFO and its pool, for logging and assertions.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FifoState {
    pub pushed: u64,
    pub popped: u64,
    pub pushed_attempts: u64,
    pub popped_attempts: u64,
    pub queue_delay_us: u64,
    pub allocated: u64,
    pub deallocated: u64,
    pub buffer_delay_us: u64,
    pub is_eof: bool,
}

impl fmt::Display for FifoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pushed: {}/{} popped: {}/{} queueDelay: {}us allocated: {} deallocated: {} bufferDelay: {}us isEOF: {}",
            self.pushed,
            self.pushed_attempts,
            self.popped,
            self.popped_attempts,
            self.queue_delay_us,
            self.allocated,
            self.deallocated,
            self.buffer_delay_us,
            self.is_eof
        )
    }
}

/// Bounded MPMC queue of filled buffers with EOF signalling and adaptive
/// backpressure.
///
/// Shared across threads behind an `Arc`; one `MarkedSink` or `MarkedSource`
/// per thread binds to it. FIFO order is preserved as pushed; there is no
/// fairness or ordering guarantee across distinct producers.
pub struct BufferFifo {
    queue: ArrayQueue<Buffer>,
    pool: BufferPool,
    pushed: AtomicU64,
    popped: AtomicU64,
    pushed_attempts: AtomicU64,
    popped_attempts: AtomicU64,
    queue_delay_us: AtomicU64,
    total_readers: AtomicU64,
    closed_readers: AtomicU64,
    total_writers: AtomicU64,
    closed_writers: AtomicU64,
    eof: AtomicBool,
    initial_pool_capacity: usize,
    initial_buffer_size: usize,
    warning_threshold: AtomicU64,
    rendezvous: Mutex<()>,
    /// Signalled when a buffer enters the queue.
    push_cond: Condvar,
    /// Signalled when a buffer leaves the queue.
    pop_cond: Condvar,
}

impl BufferFifo {
    /// Create a FIFO of `num_buffers` slots whose pool hands out buffers of
    /// `buffer_size` bytes, rounded up to a multiple of 64.
    pub fn new(buffer_size: usize, num_buffers: usize) -> Self {
        let buffer_size = align_buffer_size(buffer_size.max(1));
        let num_buffers = num_buffers.max(1);
        Self {
            queue: ArrayQueue::new(num_buffers),
            pool: BufferPool::new(num_buffers, buffer_size),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            pushed_attempts: AtomicU64::new(0),
            popped_attempts: AtomicU64::new(0),
            queue_delay_us: AtomicU64::new(0),
            total_readers: AtomicU64::new(0),
            closed_readers: AtomicU64::new(0),
            total_writers: AtomicU64::new(0),
            closed_writers: AtomicU64::new(0),
            eof: AtomicBool::new(false),
            initial_pool_capacity: num_buffers,
            initial_buffer_size: buffer_size,
            warning_threshold: AtomicU64::new(4),
            rendezvous: Mutex::new(()),
            push_cond: Condvar::new(),
            pop_cond: Condvar::new(),
        }
    }

    /// Transfer ownership of a filled buffer into the queue.
    ///
    /// Blocks until the buffer is placed. Transient lock-free failures are
    /// retried; with `wait_us > 0` each retry round is paced by a timed wait
    /// for a consumer to free a slot, otherwise the retry spins.
    pub fn push(&self, mut buf: Buffer, wait_us: u64) {
        self.pushed.fetch_add(1, Ordering::SeqCst);
        let mut attempts = 1u64;
        let deadline = (wait_us > 0).then(|| Instant::now() + Duration::from_micros(wait_us));
        loop {
            match self.queue.push(buf) {
                Ok(()) => break,
                Err(b) => {
                    buf = b;
                    attempts += 1;
                    match deadline {
                        Some(d) if Instant::now() < d => {
                            let wait_start = Instant::now();
                            let mut guard = self.rendezvous.lock();
                            let _ = self
                                .pop_cond
                                .wait_for(&mut guard, (d - wait_start).min(WAIT_SLICE));
                            drop(guard);
                            self.queue_delay_us
                                .fetch_add(wait_start.elapsed().as_micros() as u64, Ordering::Relaxed);
                        }
                        _ => std::hint::spin_loop(),
                    }
                }
            }
        }
        self.push_cond.notify_one();
        self.pushed_attempts.fetch_add(attempts, Ordering::Relaxed);
    }

    /// Pop the oldest buffer.
    ///
    /// While pushes are in flight (`pushed > popped`) the queue is re-polled;
    /// otherwise the call waits on the push condition up to the remaining
    /// budget. Returns `None` once `wait_us` elapses without a buffer, or
    /// immediately when EOF is set and the queue has drained.
    pub fn pop(&self, wait_us: u64) -> Option<Buffer> {
        let mut got: Option<Buffer> = None;
        let mut attempts = 0u64;
        let deadline = (wait_us > 0).then(|| Instant::now() + Duration::from_micros(wait_us));
        while got.is_none() && !(self.eof.load(Ordering::SeqCst) && self.is_empty()) {
            if wait_us == 0 || self.pushed.load(Ordering::SeqCst) > self.popped.load(Ordering::SeqCst)
            {
                attempts += 1;
                got = self.queue.pop();
            }
            if got.is_none() {
                let Some(d) = deadline else { break };
                let now = Instant::now();
                if now >= d {
                    break;
                }
                let wait_start = now;
                let mut guard = self.rendezvous.lock();
                let _ = self
                    .push_cond
                    .wait_for(&mut guard, (d - wait_start).min(WAIT_SLICE));
                drop(guard);
                self.queue_delay_us
                    .fetch_add(wait_start.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
        }
        if got.is_some() {
            self.popped.fetch_add(1, Ordering::SeqCst);
            self.pop_cond.notify_one();
        }
        self.popped_attempts.fetch_add(attempts, Ordering::Relaxed);
        got
    }

    /// True when the queue holds nothing and no push is in flight.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
            && self.pushed.load(Ordering::SeqCst) == self.popped.load(Ordering::SeqCst)
    }

    /// End-of-stream as seen by a source: the flag is set and the queue has
    /// drained.
    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst) && self.is_empty()
    }

    /// Declare end-of-stream. To be called exactly once, after the last
    /// writer has closed; every blocked consumer is woken so it can drain
    /// and terminate.
    pub fn set_eof(&self) {
        if self.eof.swap(true, Ordering::SeqCst) {
            warn!("set_eof called more than once; call it once per pipeline, not per thread");
        }
        let writers = self.active_writer_count();
        if writers != 0 {
            warn!(
                active_writers = writers,
                "set_eof with active writers; their output past this point is undefined"
            );
        }
        self.push_cond.notify_all();
    }

    /// Adaptive wait budget for pool traffic, in microseconds.
    ///
    /// Zero while the pool is within its configured capacity. Once
    /// outstanding buffers exceed it the wait grows with the cube of the
    /// oversubscription ratio, throttling producers instead of letting the
    /// pool grow without bound. Crossing the (doubling) warning threshold
    /// logs a pool-sizing warning.
    pub fn wait_for_buffer(&self) -> u64 {
        let outstanding = self.pool.outstanding();
        let capacity = self.initial_pool_capacity as u64;
        if self.eof.load(Ordering::SeqCst) || outstanding <= capacity {
            return 0;
        }
        let threshold = self.warning_threshold.load(Ordering::Relaxed);
        if outstanding > threshold.saturating_mul(capacity)
            && self
                .warning_threshold
                .compare_exchange(threshold, threshold * 2, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                outstanding,
                pool_capacity = self.initial_pool_capacity,
                "pool capacity eclipsed by outstanding buffers; consider a larger initial capacity"
            );
        }
        let o = outstanding as u128;
        let c = capacity as u128;
        ((10 * o * o * o) / (c * c * c)) as u64
    }

    /// Borrow a buffer from the pool, paced by [`wait_for_buffer`] and
    /// falling back to allocation so the call always yields a buffer.
    pub fn acquire_buffer(&self) -> Buffer {
        self.pool
            .acquire(self.wait_for_buffer(), true)
            .expect("acquire with allocation enabled always yields a buffer")
    }

    /// Recycle a drained buffer into the pool, paced by [`wait_for_buffer`]
    /// and allowed to grow so the buffer is rarely freed.
    pub fn return_buffer(&self, buf: Buffer) -> bool {
        self.pool.release(buf, self.wait_for_buffer(), true)
    }

    /// Raise the pool's buffer size, rounded up to a multiple of 64.
    pub fn set_buffer_size(&self, new_size: usize) {
        let rounded = align_buffer_size(new_size);
        if rounded > 128 * self.initial_buffer_size {
            warn!(
                requested = rounded,
                initial = self.initial_buffer_size,
                "requested buffer size is far over the initial size; mark more often or start larger"
            );
        }
        self.pool.set_buffer_size(rounded);
    }

    /// Current pool buffer size.
    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    /// The pool this FIFO recycles buffers through.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn register_reader(&self) -> u64 {
        self.total_readers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deregister_reader(&self) -> u64 {
        self.closed_readers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register_writer(&self) -> u64 {
        self.total_writers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deregister_writer(&self) -> u64 {
        self.closed_writers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reader_count(&self) -> u64 {
        self.total_readers.load(Ordering::SeqCst)
    }

    pub fn active_reader_count(&self) -> u64 {
        self.total_readers.load(Ordering::SeqCst) - self.closed_readers.load(Ordering::SeqCst)
    }

    pub fn writer_count(&self) -> u64 {
        self.total_writers.load(Ordering::SeqCst)
    }

    pub fn active_writer_count(&self) -> u64 {
        self.total_writers.load(Ordering::SeqCst) - self.closed_writers.load(Ordering::SeqCst)
    }

    /// Snapshot the counters for logging or assertions.
    pub fn state(&self) -> FifoState {
        FifoState {
            pushed: self.pushed.load(Ordering::SeqCst),
            popped: self.popped.load(Ordering::SeqCst),
            pushed_attempts: self.pushed_attempts.load(Ordering::Relaxed),
            popped_attempts: self.popped_attempts.load(Ordering::Relaxed),
            queue_delay_us: self.queue_delay_us.load(Ordering::Relaxed),
            allocated: self.pool.alloc_count(),
            deallocated: self.pool.dealloc_count(),
            buffer_delay_us: self.pool.stash_delay(),
            is_eof: self.eof.load(Ordering::SeqCst),
        }
    }

    /// Park the calling thread until a push lands or `timeout` elapses.
    /// A hint only; callers re-test the queue after waking.
    pub(crate) fn wait_for_data(&self, timeout: Duration) {
        let mut guard = self.rendezvous.lock();
        let _ = self.push_cond.wait_for(&mut guard, timeout);
    }
}

impl Drop for BufferFifo {
    fn drop(&mut self) {
        // Account for buffers stranded in the queue; the pool clears itself.
        while let Some(buf) = self.queue.pop() {
            self.pool.discard(buf);
        }
    }
}
