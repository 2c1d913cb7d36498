//! Double-word compare-and-swap and single-word fetch-and / fetch-or.
//!
//! The implementation is picked once per process, on first use, and exposed
//! as a `&'static dyn AtomicOps`:
//! - `NativeOps`: `lock cmpxchg16b` on x86_64 (when the CPU has it) and an
//!   `ldaxp`/`stlxp` exclusive-pair loop on aarch64
//! - `PortableOps`: everything else; double-word CAS under a striped
//!   spinlock table, fetch-and/or as single-word CAS loops

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::spin_lock::SpinLock;

/// Two adjacent `u64` words, always 16-byte aligned.
///
/// The type's alignment is what makes it a valid double-word CAS target; all
/// access after construction goes through the selected [`AtomicOps`].
#[repr(C, align(16))]
pub struct DoubleWord {
    words: UnsafeCell<[u64; 2]>,
}

// Safety: shared access only happens through the atomic ops below
unsafe impl Sync for DoubleWord {}

impl DoubleWord {
    pub const fn new(first: u64, second: u64) -> Self {
        Self {
            words: UnsafeCell::new([first, second]),
        }
    }

    /// Atomically replace the pair with `new` if it equals `old`.
    #[inline]
    pub fn compare_and_swap(&self, old: [u64; 2], new: [u64; 2]) -> bool {
        // Safety: the pointer comes from `self`, which is aligned and live
        unsafe { ops().compare_and_swap_u128(self.as_ptr(), old, new) }
    }

    /// Atomic snapshot of both words.
    #[inline]
    pub fn load(&self) -> [u64; 2] {
        // Safety: as above
        unsafe { ops().load_u128(self.as_ptr()) }
    }

    pub fn get_mut(&mut self) -> &mut [u64; 2] {
        self.words.get_mut()
    }

    pub fn into_inner(self) -> [u64; 2] {
        self.words.into_inner()
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u64 {
        self.words.get().cast()
    }
}

impl Default for DoubleWord {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl fmt::Debug for DoubleWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DoubleWord").field(&self.load()).finish()
    }
}

/// Platform atomic capabilities.
pub trait AtomicOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Safety
    ///
    /// `ptr` must be 16-byte aligned, valid for reads and writes of two
    /// `u64`, and only accessed through this implementation while shared.
    unsafe fn compare_and_swap_u128(&self, ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> bool;

    /// # Safety
    ///
    /// Same contract as [`AtomicOps::compare_and_swap_u128`].
    unsafe fn load_u128(&self, ptr: *mut u64) -> [u64; 2];

    fn fetch_and(&self, target: &AtomicU64, mask: u64) -> u64;

    fn fetch_or(&self, target: &AtomicU64, mask: u64) -> u64;
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOps;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
impl AtomicOps for NativeOps {
    fn name(&self) -> &'static str {
        if cfg!(target_arch = "x86_64") {
            "native-cmpxchg16b"
        } else {
            "native-ldaxp-stlxp"
        }
    }

    unsafe fn compare_and_swap_u128(&self, ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> bool {
        cas_pair(ptr, old, new).1
    }

    unsafe fn load_u128(&self, ptr: *mut u64) -> [u64; 2] {
        // A CAS of (0, 0) -> (0, 0) either fails and reports the current pair,
        // or succeeds on a pair that already was (0, 0).
        cas_pair(ptr, [0, 0], [0, 0]).0
    }

    #[inline]
    fn fetch_and(&self, target: &AtomicU64, mask: u64) -> u64 {
        target.fetch_and(mask, Ordering::SeqCst)
    }

    #[inline]
    fn fetch_or(&self, target: &AtomicU64, mask: u64) -> u64 {
        target.fetch_or(mask, Ordering::SeqCst)
    }
}

/// Returns the pair observed before the operation and whether the swap ran.
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn cas_pair(ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> ([u64; 2], bool) {
    let prev_lo: u64;
    let prev_hi: u64;
    let swapped: u64;
    // rbx is reserved by LLVM, so `new[0]` is swapped in and out around the instruction
    core::arch::asm!(
        "xchg {rbx_tmp}, rbx",
        "lock cmpxchg16b xmmword ptr [{dst}]",
        "sete cl",
        "mov rbx, {rbx_tmp}",
        dst = in(reg) ptr,
        rbx_tmp = inout(reg) new[0] => _,
        inout("rcx") new[1] => swapped,
        inout("rax") old[0] => prev_lo,
        inout("rdx") old[1] => prev_hi,
        options(nostack),
    );
    ([prev_lo, prev_hi], swapped as u8 != 0)
}

#[cfg(target_arch = "aarch64")]
#[inline]
unsafe fn cas_pair(ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> ([u64; 2], bool) {
    let prev_lo: u64;
    let prev_hi: u64;
    let failed: u32;
    // On mismatch the observed pair is written back so the read itself is atomic
    core::arch::asm!(
        "2:",
        "ldaxp {prev_lo}, {prev_hi}, [{dst}]",
        "cmp {prev_lo}, {old_lo}",
        "ccmp {prev_hi}, {old_hi}, #0, eq",
        "b.ne 3f",
        "stlxp {failed:w}, {new_lo}, {new_hi}, [{dst}]",
        "cbnz {failed:w}, 2b",
        "b 4f",
        "3:",
        "stlxp {failed:w}, {prev_lo}, {prev_hi}, [{dst}]",
        "cbnz {failed:w}, 2b",
        "mov {failed:w}, #1",
        "4:",
        dst = in(reg) ptr,
        old_lo = in(reg) old[0],
        old_hi = in(reg) old[1],
        new_lo = in(reg) new[0],
        new_hi = in(reg) new[1],
        prev_lo = out(reg) prev_lo,
        prev_hi = out(reg) prev_hi,
        failed = out(reg) failed,
        options(nostack),
    );
    ([prev_lo, prev_hi], failed == 0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PortableOps;

const LOCK_STRIPES: usize = 64;

static STRIPES: Lazy<[SpinLock; LOCK_STRIPES]> =
    Lazy::new(|| std::array::from_fn(|_| SpinLock::new()));

#[inline]
fn stripe(ptr: *mut u64) -> &'static SpinLock {
    &STRIPES[(ptr as usize >> 4) % LOCK_STRIPES]
}

impl AtomicOps for PortableOps {
    fn name(&self) -> &'static str {
        "portable-striped-lock"
    }

    unsafe fn compare_and_swap_u128(&self, ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> bool {
        let _guard = stripe(ptr).guard();
        let pair = ptr.cast::<[u64; 2]>();
        if *pair != old {
            return false;
        }
        *pair = new;
        true
    }

    unsafe fn load_u128(&self, ptr: *mut u64) -> [u64; 2] {
        let _guard = stripe(ptr).guard();
        *ptr.cast::<[u64; 2]>()
    }

    fn fetch_and(&self, target: &AtomicU64, mask: u64) -> u64 {
        let mut current = target.load(Ordering::Relaxed);
        loop {
            match target.compare_exchange_weak(
                current,
                current & mask,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }

    fn fetch_or(&self, target: &AtomicU64, mask: u64) -> u64 {
        let mut current = target.load(Ordering::Relaxed);
        loop {
            match target.compare_exchange_weak(
                current,
                current | mask,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return prev,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn resolve() -> &'static dyn AtomicOps {
    if std::arch::is_x86_feature_detected!("cmpxchg16b") {
        &NativeOps
    } else {
        &PortableOps
    }
}

#[cfg(target_arch = "aarch64")]
fn resolve() -> &'static dyn AtomicOps {
    &NativeOps
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn resolve() -> &'static dyn AtomicOps {
    &PortableOps
}

static OPS: Lazy<&'static dyn AtomicOps> = Lazy::new(|| {
    let ops = resolve();
    debug!(backend = ops.name(), "atomic backend resolved");
    ops
});

/// The process-wide atomic implementation.
#[inline]
pub fn ops() -> &'static dyn AtomicOps {
    *OPS
}

/// Name of the selected implementation, for diagnostics.
pub fn backend() -> &'static str {
    ops().name()
}

/// Atomically compare both words of `target` with `old` and, on match, store `new`.
#[inline]
pub fn compare_and_swap_u128(target: &DoubleWord, old: [u64; 2], new: [u64; 2]) -> bool {
    target.compare_and_swap(old, new)
}

/// Raw-address form of [`compare_and_swap_u128`].
///
/// # Panics
///
/// If `ptr` is not 16-byte aligned.
///
/// # Safety
///
/// `ptr` must be valid for reads and writes of two `u64` and every concurrent
/// access to them must go through this module.
pub unsafe fn compare_and_swap_u128_raw(ptr: *mut u64, old: [u64; 2], new: [u64; 2]) -> bool {
    assert!(
        ptr as usize & 0xf == 0,
        "double-word CAS target {:p} is not 16-byte aligned",
        ptr
    );
    ops().compare_and_swap_u128(ptr, old, new)
}

/// Atomic `*target &= mask`; returns the previous value.
#[inline]
pub fn fetch_and(target: &AtomicU64, mask: u64) -> u64 {
    ops().fetch_and(target, mask)
}

/// Atomic `*target |= mask`; returns the previous value.
#[inline]
pub fn fetch_or(target: &AtomicU64, mask: u64) -> u64 {
    ops().fetch_or(target, mask)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn backends() -> Vec<&'static dyn AtomicOps> {
        vec![ops(), &PortableOps]
    }

    #[test]
    fn double_word_is_aligned() {
        for _ in 0..1 << 12 {
            let dw = Box::new(DoubleWord::new(1, 2));
            assert_eq!(dw.as_ptr() as usize & 0xf, 0);
            assert_eq!(dw.load(), [1, 2]);
        }
        let many: Vec<DoubleWord> = (0..17).map(|i| DoubleWord::new(i, i)).collect();
        assert!(many.iter().all(|dw| dw.as_ptr() as usize & 0xf == 0));
    }

    #[test]
    fn cas_u128_compares_both_words() {
        let dw = DoubleWord::new(2, 4);
        let new = [5, 10];

        assert!(!compare_and_swap_u128(&dw, [1, 4], new));
        assert_eq!(dw.load(), [2, 4]);
        assert!(!compare_and_swap_u128(&dw, [2, 3], new));
        assert_eq!(dw.load(), [2, 4]);
        assert!(compare_and_swap_u128(&dw, [2, 4], new));
        assert_eq!(dw.load(), new);
        assert!(!compare_and_swap_u128(&dw, [2, 4], [3, 6]));
        assert_eq!(dw.into_inner(), new);
    }

    #[test]
    fn every_backend_agrees() {
        for backend in backends() {
            let dw = DoubleWord::new(2, 4);
            unsafe {
                assert!(!backend.compare_and_swap_u128(dw.as_ptr(), [1, 3], [3, 6]));
                assert_eq!(backend.load_u128(dw.as_ptr()), [2, 4]);
                assert!(backend.compare_and_swap_u128(dw.as_ptr(), [2, 4], [3, 6]));
                assert_eq!(backend.load_u128(dw.as_ptr()), [3, 6]);
            }

            let zero = DoubleWord::default();
            unsafe {
                assert_eq!(backend.load_u128(zero.as_ptr()), [0, 0]);
            }
        }
    }

    #[test]
    fn raw_cas_on_aligned_pointer() {
        let mut dw = DoubleWord::new(7, 8);
        let ok = unsafe { compare_and_swap_u128_raw(dw.as_ptr(), [7, 8], [9, 10]) };
        assert!(ok);
        assert_eq!(*dw.get_mut(), [9, 10]);
    }

    #[test]
    #[should_panic(expected = "not 16-byte aligned")]
    fn raw_cas_rejects_misaligned_pointer() {
        let mut buf = [0u64; 4];
        let base = buf.as_mut_ptr();
        let ptr = if base as usize & 0xf == 0 {
            unsafe { base.add(1) }
        } else {
            base
        };
        unsafe {
            compare_and_swap_u128_raw(ptr, [0, 0], [1, 1]);
        }
    }

    #[test]
    fn concurrent_pair_increments_stay_consistent() {
        for backend in backends() {
            let dw = Arc::new(DoubleWord::new(0, 0));
            let threads = 4;
            let per_thread = 5_000u64;

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let dw = dw.clone();
                    thread::spawn(move || {
                        for _ in 0..per_thread {
                            loop {
                                let cur = unsafe { backend.load_u128(dw.as_ptr()) };
                                assert_eq!(cur[0] * 2, cur[1]);
                                let next = [cur[0] + 1, cur[1] + 2];
                                if unsafe { backend.compare_and_swap_u128(dw.as_ptr(), cur, next) }
                                {
                                    break;
                                }
                            }
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            let total = threads * per_thread;
            assert_eq!(dw.load(), [total, total * 2]);
        }
    }

    #[test]
    fn fetch_or_accumulates_bits() {
        for backend in backends() {
            let word = AtomicU64::new(0);
            backend.fetch_or(&word, 0);
            assert_eq!(word.load(Ordering::SeqCst), 0);
            backend.fetch_or(&word, 0x0000_00ff);
            assert_eq!(word.load(Ordering::SeqCst), 0x0000_00ff);
            let prev = backend.fetch_or(&word, 0xff0f_f000);
            assert_eq!(prev, 0x0000_00ff);
            assert_eq!(word.load(Ordering::SeqCst), 0xff0f_f0ff);
            backend.fetch_or(&word, 0x00f0_0f00);
            assert_eq!(word.load(Ordering::SeqCst), 0xffff_ffff);
        }
        let word = AtomicU64::new(1);
        assert_eq!(fetch_or(&word, 2), 1);
        assert_eq!(word.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fetch_and_clears_bits() {
        for backend in backends() {
            let word = AtomicU64::new(0xffff_ffff);
            backend.fetch_and(&word, 0xffff_ff00);
            assert_eq!(word.load(Ordering::SeqCst), 0xffff_ff00);
            let prev = backend.fetch_and(&word, 0x00f0_0ff0);
            assert_eq!(prev, 0xffff_ff00);
            assert_eq!(word.load(Ordering::SeqCst), 0x00f0_0f00);
            backend.fetch_and(&word, 0);
            assert_eq!(word.load(Ordering::SeqCst), 0);
        }
        let word = AtomicU64::new(0b1110);
        assert_eq!(fetch_and(&word, 0b0110), 0b1110);
        assert_eq!(word.load(Ordering::SeqCst), 0b0110);
    }

    #[test]
    fn concurrent_fetch_or_sets_every_bit() {
        let word = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..64u32)
            .map(|bit| {
                let word = word.clone();
                thread::spawn(move || {
                    fetch_or(&word, 1 << bit);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(word.load(Ordering::SeqCst), u64::MAX);
        assert!(!backend().is_empty());
    }
}
