//! Word-sized handles carried by the queue.

use std::fmt;
use std::ptr::NonNull;

/// Sign bit of the machine word; reserved for empty-slot sentinels.
pub const NIL_FLAG: usize = 1 << (usize::BITS - 1);

/// A fixed-width value the queue can carry as a single machine word.
///
/// The queue never interprets, dereferences, copies behind or frees a handle:
/// whatever a handle refers to stays owned by the caller.
///
/// # Safety
///
/// `into_word` must never set [`NIL_FLAG`], and `from_word(h.into_word())`
/// must give back `h` bit-for-bit.
pub unsafe trait Handle: Copy + Send + 'static {
    fn into_word(self) -> usize;

    /// # Safety
    ///
    /// `word` must have come from [`Handle::into_word`] of the same type.
    unsafe fn from_word(word: usize) -> Self;
}

unsafe impl Handle for usize {
    /// # Panics
    ///
    /// If the sign bit is set; such values are outside the handle domain.
    #[inline]
    fn into_word(self) -> usize {
        assert!(self & NIL_FLAG == 0, "handle {:#x} uses the reserved sign bit", self);
        self
    }

    #[inline]
    unsafe fn from_word(word: usize) -> Self {
        word
    }
}

macro_rules! small_handle {
    ($($ty:ty),*) => {$(
        unsafe impl Handle for $ty {
            #[inline]
            fn into_word(self) -> usize {
                self as usize
            }

            #[inline]
            unsafe fn from_word(word: usize) -> Self {
                word as $ty
            }
        }
    )*};
}

small_handle!(u8, u16);

#[cfg(target_pointer_width = "64")]
small_handle!(u32);

/// Opaque, non-owning pointer handle.
///
/// Copying a `RawHandle` copies the address only. The queue never touches the
/// pointee; dereferencing it after a hand-off is the caller's `unsafe`
/// responsibility, as is keeping the pointee alive until then.
pub struct RawHandle<T> {
    ptr: NonNull<T>,
}

impl<T> RawHandle<T> {
    pub fn new(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    pub fn from_ref(value: &T) -> Self {
        Self {
            ptr: NonNull::from(value),
        }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(self) -> NonNull<T> {
        self.ptr
    }

    /// # Safety
    ///
    /// The pointee must still be alive and not mutably aliased.
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        self.ptr.as_ref()
    }
}

impl<T> Clone for RawHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawHandle<T> {}

impl<T> PartialEq for RawHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for RawHandle<T> {}

impl<T> fmt::Debug for RawHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:p})", self.ptr)
    }
}

// Safety: a RawHandle is an inert address; only `unsafe` code can reach the pointee
unsafe impl<T> Send for RawHandle<T> {}
// Safety: sharing a RawHandle shares the address only, never the pointee
unsafe impl<T> Sync for RawHandle<T> {}

unsafe impl<T: 'static> Handle for RawHandle<T> {
    #[inline]
    fn into_word(self) -> usize {
        let word = self.ptr.as_ptr() as usize;
        assert!(word & NIL_FLAG == 0, "pointer {:#x} uses the reserved sign bit", word);
        word
    }

    #[inline]
    unsafe fn from_word(word: usize) -> Self {
        Self {
            ptr: NonNull::new_unchecked(word as *mut T),
        }
    }
}
