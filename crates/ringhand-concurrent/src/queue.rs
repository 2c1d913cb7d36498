//! Producer/consumer contracts and the MPMC queue built on [`RingBuffer`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BuildError, QueueError};
use crate::handle::Handle;
use crate::ring::RingBuffer;
use crate::spin_wait::SpinWait;

/// Enqueue side of a queue.
pub trait Producer<H> {
    /// Push `handle`; `TemporarilyUnavailable` when the queue is full.
    fn enqueue(&self, handle: H) -> Result<(), QueueError>;
}

/// Dequeue side of a queue.
pub trait Consumer<H> {
    /// Pop the oldest handle; `TemporarilyUnavailable` when the queue is empty.
    fn dequeue(&self) -> Result<H, QueueError>;
}

/// Shutdown hook. Enqueue and dequeue after `close` are unspecified; callers
/// synchronize shutdown themselves.
pub trait Closer {
    fn close(&self) -> Result<(), QueueError>;
}

/// Enqueue, backing off with [`SpinWait`] until there is room.
pub fn enqueue_wait<H, P>(producer: &P, handle: H) -> Result<(), QueueError>
where
    H: Copy,
    P: Producer<H> + ?Sized,
{
    let mut sw = SpinWait::new();
    loop {
        match producer.enqueue(handle) {
            Err(QueueError::TemporarilyUnavailable) => sw.once(),
            res => return res,
        }
    }
}

/// Dequeue, backing off with [`SpinWait`] until a handle arrives.
pub fn dequeue_wait<H, C>(consumer: &C) -> Result<H, QueueError>
where
    C: Consumer<H> + ?Sized,
{
    let mut sw = SpinWait::new();
    loop {
        match consumer.dequeue() {
            Err(QueueError::TemporarilyUnavailable) => sw.once(),
            res => return res,
        }
    }
}

/// Construction options.
///
/// `single_producer`, `single_consumer` and `low_contention` are hints; the
/// MPMC ring serves all of them. Queued handles must be distinct, so turning
/// `distinct_values` off is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub single_producer: bool,
    pub single_consumer: bool,
    pub low_contention: bool,
    pub distinct_values: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            single_producer: false,
            single_consumer: false,
            low_contention: false,
            distinct_values: true,
        }
    }
}

impl QueueOptions {
    pub fn single_producer(mut self, yes: bool) -> Self {
        self.single_producer = yes;
        self
    }

    pub fn single_consumer(mut self, yes: bool) -> Self {
        self.single_consumer = yes;
        self
    }

    pub fn low_contention(mut self, yes: bool) -> Self {
        self.low_contention = yes;
        self
    }

    pub fn distinct_values(mut self, yes: bool) -> Self {
        self.distinct_values = yes;
        self
    }
}

/// Bounded lock-free multi-producer multi-consumer queue of handles.
pub struct MpmcQueue<H> {
    ring: RingBuffer,
    closed: AtomicBool,
    _marker: PhantomData<fn(H) -> H>,
}

impl<H: Handle> MpmcQueue<H> {
    /// Capacity rounds up to a power of two within `2..=2^30`.
    pub fn with_capacity(capacity: usize) -> Result<Self, BuildError> {
        Ok(Self {
            ring: RingBuffer::with_capacity(capacity)?,
            closed: AtomicBool::new(false),
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn try_enqueue(&self, handle: H) -> Result<(), QueueError> {
        if self.ring.offer(handle.into_word()) {
            Ok(())
        } else {
            Err(QueueError::TemporarilyUnavailable)
        }
    }

    #[inline]
    pub fn try_dequeue(&self) -> Result<H, QueueError> {
        match self.ring.poll() {
            // Safety: every word in the ring came from `H::into_word`
            Some(word) => Ok(unsafe { H::from_word(word) }),
            None => Err(QueueError::TemporarilyUnavailable),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<H: Handle> Producer<H> for MpmcQueue<H> {
    fn enqueue(&self, handle: H) -> Result<(), QueueError> {
        self.try_enqueue(handle)
    }
}

impl<H: Handle> Consumer<H> for MpmcQueue<H> {
    fn dequeue(&self) -> Result<H, QueueError> {
        self.try_dequeue()
    }
}

impl<H> Closer for MpmcQueue<H> {
    fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(len = self.ring.len(), "queue closed");
        }
        Ok(())
    }
}

impl<H> fmt::Debug for MpmcQueue<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("ring", &self.ring)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Cloneable enqueue endpoint.
pub struct QueueProducer<H> {
    inner: Arc<MpmcQueue<H>>,
}

/// Cloneable dequeue endpoint.
pub struct QueueConsumer<H> {
    inner: Arc<MpmcQueue<H>>,
}

impl<H> Clone for QueueProducer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H> Clone for QueueConsumer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: Handle> QueueProducer<H> {
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<H: Handle> QueueConsumer<H> {
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<H: Handle> Producer<H> for QueueProducer<H> {
    #[inline]
    fn enqueue(&self, handle: H) -> Result<(), QueueError> {
        self.inner.try_enqueue(handle)
    }
}

impl<H: Handle> Consumer<H> for QueueConsumer<H> {
    #[inline]
    fn dequeue(&self) -> Result<H, QueueError> {
        self.inner.try_dequeue()
    }
}

impl<H> Closer for QueueProducer<H> {
    fn close(&self) -> Result<(), QueueError> {
        self.inner.close()
    }
}

impl<H> Closer for QueueConsumer<H> {
    fn close(&self) -> Result<(), QueueError> {
        self.inner.close()
    }
}

impl<H> fmt::Debug for QueueProducer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueueProducer").field(&self.inner).finish()
    }
}

impl<H> fmt::Debug for QueueConsumer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueueConsumer").field(&self.inner).finish()
    }
}

/// Build a queue for `capacity` handles and split it into its two endpoints.
pub fn new_queue<H: Handle>(
    capacity: usize,
    options: QueueOptions,
) -> Result<(QueueConsumer<H>, QueueProducer<H>), BuildError> {
    if !options.distinct_values {
        warn!(?options, "rejected queue options");
        return Err(BuildError::Unimplemented("queues admitting duplicate in-flight values"));
    }
    if options.single_producer || options.single_consumer || options.low_contention {
        debug!(?options, "specialization hints served by the MPMC ring");
    }
    new_mpmc_queue(capacity)
}

/// Build an MPMC queue for `capacity` handles.
pub fn new_mpmc_queue<H: Handle>(
    capacity: usize,
) -> Result<(QueueConsumer<H>, QueueProducer<H>), BuildError> {
    let inner = Arc::new(MpmcQueue::with_capacity(capacity)?);
    Ok((
        QueueConsumer {
            inner: inner.clone(),
        },
        QueueProducer { inner },
    ))
}

/// Producer of raw machine-word handles (indices, tokens).
pub type IndirectProducer = QueueProducer<usize>;

/// Consumer of raw machine-word handles.
pub type IndirectConsumer = QueueConsumer<usize>;

/// [`new_queue`] over raw `usize` handles. Enqueueing a word with the sign bit
/// set panics.
pub fn new_indirect_queue(
    capacity: usize,
    options: QueueOptions,
) -> Result<(IndirectConsumer, IndirectProducer), BuildError> {
    new_queue::<usize>(capacity, options)
}
