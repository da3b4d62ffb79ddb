//! Error type shared by the stream endpoints.

use thiserror::Error;

/// Errors surfaced to callers of the sink API.
///
/// Transient lock-free failures are retried internally and never reach the
/// caller; pool exhaustion and pop timeouts are reported as `None` by the
/// operations that can experience them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A logical region grew past the capacity of a single buffer. The
    /// region cannot be delivered atomically, so the write is refused and
    /// the buffer is left untouched.
    #[error("message of {len} bytes cannot fit a buffer of capacity {capacity}")]
    OversizedMessage { len: usize, capacity: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
