//! In-process, many-producer / many-consumer byte pipeline with
//! message-atomic buffer handoff.
//!
//! Producer threads write through a [`MarkedSink`] and call
//! [`mark`](MarkedSink::mark) at message boundaries; consumer threads read
//! through a [`MarkedSource`]. Between them a shared [`BufferFifo`] moves
//! whole buffers from writers to readers and recycles them through its
//! [`BufferPool`], so payload bytes are copied once into a buffer and once
//! out, and a logical region is never split across two transfers.

pub mod buffer;
pub mod error;
pub mod fifo;
pub mod pool;
pub mod sink;
pub mod source;

pub use buffer::Buffer;
pub use error::Error;
pub use fifo::{BufferFifo, FifoState};
pub use pool::BufferPool;
pub use sink::MarkedSink;
pub use source::MarkedSource;
