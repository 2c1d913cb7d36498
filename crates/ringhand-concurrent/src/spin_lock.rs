//! Minimal counting spinlock for short critical sections.

use crate::pause::{pause_n, DEFAULT_PAUSE_CYCLES};
use crate::sync::{self, AtomicUsize, Ordering};

/// Spinlock over a single atomic counter.
///
/// Every acquisition attempt increments the counter; the attempt that observes
/// zero owns the lock. The next two contenders pause briefly before retrying,
/// later ones yield to the scheduler. `unlock` resets the counter to zero, so
/// a late arriver can overtake an earlier waiter: fairness is best-effort.
///
/// Not reentrant. Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct SpinLock {
    n: AtomicUsize,
}

impl SpinLock {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self {
            n: AtomicUsize::new(0),
        }
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self {
            n: AtomicUsize::new(0),
        }
    }

    pub fn lock(&self) {
        loop {
            let prev = self.n.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                return;
            } else if prev < 3 {
                pause_n(DEFAULT_PAUSE_CYCLES);
                continue;
            }
            sync::yield_now();
        }
    }

    pub fn unlock(&self) {
        self.n.store(0, Ordering::SeqCst);
    }

    /// Lock and release on drop.
    pub fn guard(&self) -> SpinLockGuard<'_> {
        self.lock();
        SpinLockGuard { lock: self }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
