//! Bounded cache of recyclable buffers.
//!
//! The pool keeps a lock-free stash of cleared [`Buffer`]s so the hot path
//! never touches the allocator. Acquire and release are lock-free
//! first-attempt operations; when the caller supplies a wait budget they fall
//! back to timed condition-variable waits, and only then to allocation
//! (acquire) or growth / deallocation (release). The condition variables are
//! wake-up hints only: the queue operations remain the source of truth.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::{ArrayQueue, SegQueue};
use parking_lot::{Condvar, Mutex};

use crate::buffer::Buffer;

/// Condition variables are hints only; waits re-poll the lock-free
/// operation at least this often so a missed notify costs bounded latency.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Bounded, lock-free pool of recyclable buffers.
///
/// `buffer_size` is the target capacity for buffers handed out; it only ever
/// grows, and stale buffers are resized up before handoff so every buffer the
/// pool returns satisfies `capacity >= buffer_size`.
pub struct BufferPool {
    /// Primary bounded stash.
    stash: ArrayQueue<Buffer>,
    /// Overflow store used when a release is allowed to grow past the bound.
    overflow: SegQueue<Buffer>,
    buffer_size: AtomicUsize,
    alloc_count: AtomicU64,
    dealloc_count: AtomicU64,
    stash_delay_us: AtomicU64,
    rendezvous: Mutex<()>,
    /// Signalled when a buffer lands in the pool.
    push_cond: Condvar,
    /// Signalled when a buffer leaves the pool.
    pop_cond: Condvar,
}

impl BufferPool {
    /// Create a pool with `capacity` stash slots handing out buffers of
    /// `buffer_size` bytes. The pool starts empty; buffers are fabricated on
    /// demand by [`acquire`](Self::acquire).
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            stash: ArrayQueue::new(capacity.max(1)),
            overflow: SegQueue::new(),
            buffer_size: AtomicUsize::new(buffer_size),
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            stash_delay_us: AtomicU64::new(0),
            rendezvous: Mutex::new(()),
            push_cond: Condvar::new(),
            pop_cond: Condvar::new(),
        }
    }

    #[inline]
    fn try_pop(&self) -> Option<Buffer> {
        // Drain growth overflow first so the pool trends back to its bound.
        self.overflow.pop().or_else(|| self.stash.pop())
    }

    /// Take a buffer out of the pool.
    ///
    /// Attempts a lock-free pop; on failure waits up to `wait_us`
    /// microseconds for a release to land, re-testing the pop on every
    /// wakeup. If the pool is still empty and `allow_allocate` is set, a
    /// fresh buffer of the current `buffer_size` is fabricated. Returns
    /// `None` only when allocation is disallowed and the wait timed out.
    ///
    /// Any buffer returned has capacity at least `buffer_size`.
    pub fn acquire(&self, wait_us: u64, allow_allocate: bool) -> Option<Buffer> {
        let mut buf = self.try_pop();
        if buf.is_none() && wait_us > 0 {
            let start = Instant::now();
            let deadline = start + Duration::from_micros(wait_us);
            let mut guard = self.rendezvous.lock();
            loop {
                if let Some(b) = self.try_pop() {
                    buf = Some(b);
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let _ = self
                    .push_cond
                    .wait_for(&mut guard, (deadline - now).min(WAIT_SLICE));
            }
            drop(guard);
            self.stash_delay_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }
        if buf.is_some() {
            self.pop_cond.notify_one();
        }
        if buf.is_none() && allow_allocate {
            buf = Some(self.allocate());
        }
        if let Some(b) = buf.as_mut() {
            let want = self.buffer_size();
            if b.capacity() < want {
                b.resize(want);
            }
        }
        buf
    }

    /// Fabricate a fresh buffer, bypassing the stash.
    pub fn allocate(&self) -> Buffer {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        Buffer::new(self.buffer_size())
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is cleared, then placed with a bounded push. On failure the
    /// call waits up to `wait_us` microseconds for an acquire to free a slot;
    /// on continued failure and `allow_growth` the buffer is parked in the
    /// unbounded overflow store. A buffer that can be placed nowhere is
    /// dropped and counted as deallocated, and `false` is returned.
    pub fn release(&self, mut buf: Buffer, wait_us: u64, allow_growth: bool) -> bool {
        buf.clear(0);

        let mut pending = match self.stash.push(buf) {
            Ok(()) => None,
            Err(b) => Some(b),
        };

        if pending.is_some() && wait_us > 0 {
            let start = Instant::now();
            let deadline = start + Duration::from_micros(wait_us);
            let mut guard = self.rendezvous.lock();
            while let Some(b) = pending.take() {
                match self.stash.push(b) {
                    Ok(()) => break,
                    Err(b) => pending = Some(b),
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let _ = self
                    .pop_cond
                    .wait_for(&mut guard, (deadline - now).min(WAIT_SLICE));
            }
            drop(guard);
            self.stash_delay_us
                .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        }

        if let Some(b) = pending.take() {
            if allow_growth {
                self.overflow.push(b);
            } else {
                self.discard(b);
                return false;
            }
        }

        self.push_cond.notify_one();
        true
    }

    /// Drop a buffer on the floor, recording the deallocation.
    pub(crate) fn discard(&self, buf: Buffer) {
        drop(buf);
        self.dealloc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Free every pooled buffer. Buffers currently held by endpoints or in
    /// flight through a FIFO are unaffected.
    pub fn clear(&self) {
        while let Some(buf) = self.try_pop() {
            self.discard(buf);
        }
    }

    /// Raise the target capacity for handed-out buffers. Monotonic:
    /// concurrent calls settle on the largest requested value.
    pub fn set_buffer_size(&self, new_size: usize) {
        self.buffer_size.fetch_max(new_size, Ordering::AcqRel);
    }

    /// Current target buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Acquire)
    }

    /// Buffers fabricated over the pool's lifetime.
    pub fn alloc_count(&self) -> u64 {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Buffers freed over the pool's lifetime.
    pub fn dealloc_count(&self) -> u64 {
        self.dealloc_count.load(Ordering::Relaxed)
    }

    /// Buffers currently live, inside the pool or out.
    pub fn outstanding(&self) -> u64 {
        self.alloc_count().saturating_sub(self.dealloc_count())
    }

    /// Cumulative microseconds spent in acquire/release waits.
    pub fn stash_delay(&self) -> u64 {
        self.stash_delay_us.load(Ordering::Relaxed)
    }

    /// Buffers currently parked in the pool.
    pub fn pooled(&self) -> usize {
        self.stash.len() + self.overflow.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.clear();
    }
}
