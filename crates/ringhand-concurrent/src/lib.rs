//! Lock-free handle hand-off between threads
//!
//! - `ring`: bounded lock-free MPMC ring of machine words (round-tagged slots)
//! - `queue`: producer/consumer contracts, typed queue endpoints, blocking helpers
//! - `handle`: word-sized handle types the queue can carry
//! - `atomic`: double-word CAS, fetch-and, fetch-or
//! - `pause`, `spin_wait`: spin hints and adaptive backoff
//! - `spin_lock`: counting spinlock for short critical sections

pub mod atomic;
pub mod error;
pub mod handle;
pub mod pause;
pub mod queue;
pub mod ring;
pub mod spin_lock;
pub mod spin_wait;

mod sync;

pub use atomic::{compare_and_swap_u128, fetch_and, fetch_or, DoubleWord};
pub use error::{BuildError, QueueError};
pub use handle::{Handle, RawHandle, NIL_FLAG};
pub use pause::{pause, DEFAULT_PAUSE_CYCLES};
pub use queue::{
    dequeue_wait, enqueue_wait, new_indirect_queue, new_mpmc_queue, new_queue, Closer, Consumer,
    IndirectConsumer, IndirectProducer, MpmcQueue, Producer, QueueConsumer, QueueOptions,
    QueueProducer,
};
pub use ring::RingBuffer;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use spin_wait::{yield_backoff, SpinWait};
