//! The heap growth primitive.

use crate::AllocError;
use core::ptr::NonNull;
use memory_units::Bytes;

/// A contiguous, grow-only region of memory that a [`SegAlloc`] carves its
/// heap out of. This is `sbrk`, and nothing else: the allocator never asks for
/// memory back.
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// * `base()` is aligned to at least 16 bytes once the first `sbrk` succeeded,
///   and the `size()` bytes starting at `base()` are readable and writable.
///
/// * A successful `sbrk(n)` returns `base() + old_size`, and afterwards
///   `size() == old_size + n`. Growth is contiguous and never moves the bytes
///   that were already handed out relative to `base()`.
///
/// * A failed `sbrk` leaves `base()` and `size()` unchanged.
///
/// [`SegAlloc`]: crate::SegAlloc
pub unsafe trait Memory {
    /// Grow the region by `increment` bytes, returning a pointer to the first
    /// new byte.
    fn sbrk(&mut self, increment: Bytes) -> Result<NonNull<u8>, AllocError>;

    /// The first byte of the region. May be null before the first successful
    /// `sbrk`.
    fn base(&self) -> *mut u8;

    /// The number of bytes handed out so far.
    fn size(&self) -> Bytes;
}
