//! CPU spin hints for busy-wait loops.

use crate::sync;

pub use ringhand_core::DEFAULT_PAUSE_CYCLES;

/// Issue `cycles` spin hints. `0` means [`DEFAULT_PAUSE_CYCLES`].
///
/// Purely advisory: on x86_64 this lowers to `pause`, on aarch64 to the
/// architecture's spin hint. Targets without one yield to the scheduler instead.
#[inline]
pub fn pause(cycles: u32) {
    match cycles {
        0 => pause_n(DEFAULT_PAUSE_CYCLES),
        1 => pause_1(),
        n => pause_n(n),
    }
}

/// Pause burst sized by the process-wide backoff settings.
#[inline]
pub fn pause_default() {
    pause_n(ringhand_core::backoff().pause_cycles)
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
#[inline(always)]
fn pause_1() {
    sync::spin_hint();
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64"))]
#[inline]
pub(crate) fn pause_n(cycles: u32) {
    for _ in 0..cycles {
        sync::spin_hint();
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
#[inline]
fn pause_1() {
    sync::yield_now();
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
#[inline]
pub(crate) fn pause_n(cycles: u32) {
    for _ in 0..cycles {
        sync::yield_now();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn pause_variants_return() {
        pause(0);
        pause(1);
        pause(40);
        pause_default();
    }

    #[test]
    fn long_pause_is_bounded() {
        let start = Instant::now();
        for _ in 0..1_000 {
            pause(DEFAULT_PAUSE_CYCLES);
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
