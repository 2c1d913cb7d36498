//! Adaptive spin-then-yield backoff.

use std::thread;

use crate::pause::pause_default;
use crate::sync;

/// Lightweight backoff for low-level wait loops. `Default` is ready to use.
///
/// Early calls to [`once`](SpinWait::once) spin on pause bursts; every 16th
/// call yields the thread instead. Each four yields halve that period, so a
/// long wait ends up yielding on every call.
#[derive(Debug, Default, Clone)]
pub struct SpinWait {
    attempts: u32,
    yields: u32,
}

impl SpinWait {
    pub const fn new() -> Self {
        Self {
            attempts: 0,
            yields: 0,
        }
    }

    /// One backoff step.
    pub fn once(&mut self) {
        self.attempts = self.attempts.wrapping_add(1);
        if self.will_yield() {
            self.yields = self.yields.saturating_add(1);
            sync::yield_now();
            return;
        }
        pause_default();
    }

    /// Whether the next [`once`](SpinWait::once) yields the thread rather than spinning.
    #[inline]
    pub fn will_yield(&self) -> bool {
        let shift = 4 - (self.yields >> 2).min(4);
        let mask = (1u32 << shift) - 1;
        self.attempts.wrapping_add(1) & mask == 0
    }

    /// Start a new wait episode.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.yields = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn yields(&self) -> u32 {
        self.yields
    }
}

/// Coarse backoff outside tight loops: sleeps `level² × base unit`.
///
/// The base unit is the process-wide yield duration from
/// [`ringhand_core::backoff`]; a zero unit degrades to a scheduler yield.
/// `level` 0 is treated as 1.
pub fn yield_backoff(level: u32) {
    let level = level.max(1);
    let unit = ringhand_core::backoff().yield_duration;
    let duration = unit.saturating_mul(level.saturating_mul(level));
    if duration.is_zero() {
        thread::yield_now();
        return;
    }
    thread::sleep(duration);
}
