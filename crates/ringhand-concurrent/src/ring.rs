//! Bounded lock-free MPMC ring of machine words.
//!
//! Each slot holds either a payload word or an empty sentinel
//! `NIL_FLAG | round`, where `round` is the generation expected to fill it
//! next. A producer claiming logical position `o` may only replace the
//! sentinel of `o`'s round; a consumer at `p` swaps the payload for the next
//! round's sentinel. Both sides advance their counter with a CAS whether or
//! not their slot CAS won, so the counters always make progress.
//!
//! Logical positions are remapped so consecutive indices land on different
//! cache lines:
//! `physical = (logical & 63) * index_skip + (logical >> 6)`.

use std::fmt;

use crossbeam_utils::CachePadded;
use tracing::{debug, warn};

use crate::error::BuildError;
use crate::handle::NIL_FLAG;
use crate::sync::{self, AtomicU64, AtomicUsize, Ordering};

pub const MIN_ORDER: u32 = 1;
pub const MAX_ORDER: u32 = 30;

const MODULE_BIT: u32 = 6;
const MODULE_MASK: u64 = (1 << MODULE_BIT) - 1;
const ROUND_MASK: u64 = (NIL_FLAG - 1) as u64;

/// Smallest order whose capacity holds `capacity` items.
pub fn order_for(capacity: usize) -> Result<u32, BuildError> {
    if capacity < 2 {
        warn!(capacity, "rejected queue capacity");
        return Err(BuildError::InvalidCapacity(capacity));
    }
    let order = usize::BITS - (capacity - 1).leading_zeros();
    if order > MAX_ORDER {
        warn!(capacity, order, "rejected queue capacity");
        return Err(BuildError::InvalidCapacity(capacity));
    }
    Ok(order)
}

pub struct RingBuffer {
    slots: Box<[AtomicUsize]>,
    order: u32,
    capacity: u64,
    index_skip: u64,
    offers: CachePadded<AtomicU64>,
    polls: CachePadded<AtomicU64>,
}

impl RingBuffer {
    /// Ring of `2^order` slots, `order` within `MIN_ORDER..=MAX_ORDER`.
    pub fn with_order(order: u32) -> Result<Self, BuildError> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
            warn!(order, "rejected ring buffer order");
            return Err(BuildError::InvalidOrder(order));
        }
        let capacity = 1u64 << order;
        let index_skip = 1u64 << order.saturating_sub(MODULE_BIT);
        let slots: Box<[AtomicUsize]> = (0..capacity).map(|_| AtomicUsize::new(NIL_FLAG)).collect();

        debug!(capacity, order, index_skip, "ring buffer created");
        Ok(Self {
            slots,
            order,
            capacity,
            index_skip,
            offers: CachePadded::new(AtomicU64::new(0)),
            polls: CachePadded::new(AtomicU64::new(0)),
        })
    }

    /// Ring holding at least `capacity` items, rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> Result<Self, BuildError> {
        Self::with_order(order_for(capacity)?)
    }

    /// Append `word`; `false` when full. Never blocks.
    ///
    /// # Panics
    ///
    /// If `word` has [`NIL_FLAG`] set; it would read back as an empty slot.
    pub fn offer(&self, word: usize) -> bool {
        assert!(
            word & NIL_FLAG == 0,
            "payload {:#x} collides with the empty sentinel",
            word
        );
        loop {
            let o = self.offers.load(Ordering::SeqCst);
            let p = self.polls.load(Ordering::SeqCst);
            if o != self.offers.load(Ordering::SeqCst) {
                continue;
            }
            if o >= p + self.capacity {
                return false;
            }

            let slot = self.slot(o);
            let empty = NIL_FLAG | self.round(o);
            let won = slot
                .compare_exchange(empty, word, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            let _ = self
                .offers
                .compare_exchange(o, o + 1, Ordering::SeqCst, Ordering::SeqCst);

            if won {
                return true;
            }
            sync::spin_hint();
        }
    }

    /// Take the oldest word; `None` when empty. Never blocks.
    pub fn poll(&self) -> Option<usize> {
        loop {
            let p = self.polls.load(Ordering::SeqCst);
            let o = self.offers.load(Ordering::SeqCst);
            if p != self.polls.load(Ordering::SeqCst) {
                continue;
            }
            if p >= o {
                return None;
            }

            let slot = self.slot(p);
            let next_round = self.round(p + self.capacity);
            let next = NIL_FLAG | next_round;
            let current = slot.load(Ordering::SeqCst);

            if current & NIL_FLAG != 0 {
                // Already drained by a racing poller. A sentinel lagging behind
                // this round was left by a preempted one; move it forward so the
                // next producer of this slot can claim it.
                if current != next && round_lags(current & !NIL_FLAG, next_round) {
                    let _ = slot.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst);
                }
                self.advance_polls(p);
                continue;
            }
            if p != self.polls.load(Ordering::SeqCst) {
                continue;
            }

            let won = slot
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            self.advance_polls(p);
            if won {
                return Some(current);
            }
            sync::spin_hint();
        }
    }

    #[inline]
    fn advance_polls(&self, p: u64) {
        let _ = self
            .polls
            .compare_exchange(p, p + 1, Ordering::SeqCst, Ordering::SeqCst);
    }

    #[inline]
    fn slot(&self, counter: u64) -> &AtomicUsize {
        &self.slots[self.entry(counter & (self.capacity - 1))]
    }

    #[inline]
    fn round(&self, counter: u64) -> usize {
        ((counter >> self.order) & ROUND_MASK) as usize
    }

    /// Physical slot for a logical index in `0..capacity`.
    #[inline]
    pub(crate) fn entry(&self, index: u64) -> usize {
        ((index & MODULE_MASK) * self.index_skip + (index >> MODULE_BIT)) as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Items currently queued. Approximate while other threads are active.
    pub fn len(&self) -> usize {
        let p = self.polls.load(Ordering::SeqCst);
        let o = self.offers.load(Ordering::SeqCst);
        o.saturating_sub(p).min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

#[inline]
fn round_lags(round: usize, next_round: usize) -> bool {
    let lag = next_round.wrapping_sub(round) & (NIL_FLAG - 1);
    lag != 0 && lag < NIL_FLAG >> 1
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("order", &self.order)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn order_bounds() {
        assert!(matches!(RingBuffer::with_order(0), Err(BuildError::InvalidOrder(0))));
        assert!(matches!(RingBuffer::with_order(31), Err(BuildError::InvalidOrder(31))));
        assert_eq!(RingBuffer::with_order(1).unwrap().capacity(), 2);
    }

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(order_for(2).unwrap(), 1);
        assert_eq!(order_for(4).unwrap(), 2);
        assert_eq!(order_for(5).unwrap(), 3);
        assert_eq!(order_for(1 << 30).unwrap(), 30);
        assert_eq!(order_for(1), Err(BuildError::InvalidCapacity(1)));
        assert_eq!(order_for(0), Err(BuildError::InvalidCapacity(0)));
        assert_eq!(
            order_for((1 << 30) + 1),
            Err(BuildError::InvalidCapacity((1 << 30) + 1))
        );
        assert_eq!(RingBuffer::with_capacity(100).unwrap().capacity(), 128);
    }

    #[test]
    fn remap_is_a_bijection() {
        for order in 1..=14 {
            let ring = RingBuffer::with_order(order).unwrap();
            let cap = ring.capacity() as u64;
            let seen: HashSet<usize> = (0..cap).map(|i| ring.entry(i)).collect();
            assert_eq!(seen.len(), ring.capacity(), "order {}", order);
            assert!(seen.iter().all(|&e| e < ring.capacity()));
        }
    }

    #[test]
    fn remap_spreads_neighbours() {
        let ring = RingBuffer::with_order(12).unwrap();
        assert_eq!(ring.entry(0), 0);
        assert_eq!(ring.entry(1), 64);
        assert_eq!(ring.entry(64), 1);
        let small = RingBuffer::with_order(4).unwrap();
        assert!((0..16).all(|i| small.entry(i) == i as usize));
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let ring = RingBuffer::with_order(2).unwrap();
        assert_eq!(ring.poll(), None);
        for v in 100..104 {
            assert!(ring.offer(v));
        }
        assert!(ring.is_full());
        assert!(!ring.offer(104));
        for v in 100..104 {
            assert_eq!(ring.poll(), Some(v));
        }
        assert_eq!(ring.poll(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn rounds_wrap_many_times() {
        let ring = RingBuffer::with_order(3).unwrap();
        let mut next_in = 0usize;
        let mut next_out = 0usize;
        for step in 0..1_000 {
            let burst = step % 7 + 1;
            for _ in 0..burst {
                if ring.offer(next_in) {
                    next_in += 1;
                }
            }
            for _ in 0..(step % 5 + 1) {
                match ring.poll() {
                    Some(v) => {
                        assert_eq!(v, next_out);
                        next_out += 1;
                    }
                    None => break,
                }
            }
            assert_eq!(ring.len(), next_in - next_out);
        }
        while let Some(v) = ring.poll() {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_in, next_out);
    }

    #[test]
    fn lagging_sentinel_is_skipped_and_repaired() {
        let ring = RingBuffer::with_order(2).unwrap();
        assert!(ring.offer(7));
        // position 0 emptied behind the consumers' back, as a preempted poller would
        ring.slot(0).store(NIL_FLAG, Ordering::SeqCst);

        assert_eq!(ring.poll(), None);
        assert_eq!(ring.slot(0).load(Ordering::SeqCst), NIL_FLAG | 1);

        for v in 1..=4 {
            assert!(ring.offer(v));
        }
        for v in 1..=4 {
            assert_eq!(ring.poll(), Some(v));
        }
    }

    #[test]
    #[should_panic(expected = "collides with the empty sentinel")]
    fn sentinel_shaped_payload_is_refused() {
        let ring = RingBuffer::with_order(2).unwrap();
        ring.offer(NIL_FLAG | 5);
    }

    #[test]
    fn refused_payload_leaves_the_ring_untouched() {
        let ring = RingBuffer::with_order(2).unwrap();
        assert!(ring.offer(1));
        let refused = std::panic::catch_unwind(|| ring.offer(NIL_FLAG | 5));
        assert!(refused.is_err());
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.poll(), Some(1));
        assert_eq!(ring.poll(), None);
    }

    #[test]
    fn round_lag_handles_wraparound() {
        assert!(round_lags(0, 1));
        assert!(!round_lags(1, 1));
        assert!(!round_lags(2, 1));
        assert!(round_lags(NIL_FLAG - 1, 0));
    }
}
