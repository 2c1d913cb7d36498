use thiserror::Error;

/// Runtime outcome of a non-blocking queue operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueError {
    /// Queue full on enqueue, empty on dequeue. Retry later.
    #[error("temporarily unavailable")]
    TemporarilyUnavailable,
}

/// Construction-time rejection. A queue that would be misconfigured is never built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("bad capacity {0}: must be within 2..=2^30")]
    InvalidCapacity(usize),

    #[error("bad capacity order {0}: must be within 1..=30")]
    InvalidOrder(u32),

    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}
