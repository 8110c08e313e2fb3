//! Address arithmetic shared by the growers and the heap.

use core::ptr::{null_mut, NonNull};

/// Rounds `addr` up to a multiple of `align`, `None` if that overflows.
///
/// # Panics
/// Panics in debug builds if `align` is not a power of two.
#[inline]
pub(crate) fn align_up(addr: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two(), "Alignments are powers of two.");
    let mask = align - 1;
    Some(addr.checked_add(mask)? & !mask)
}

/// Moves `ptr` up to the next `align` boundary, keeping its provenance.
#[inline]
pub(crate) fn align_ptr_up(ptr: *mut u8, align: usize) -> Option<*mut u8> {
    let aligned = align_up(ptr as usize, align)?;
    Some(ptr.wrapping_add(aligned - ptr as usize))
}

/// Address right after `len` bytes starting at `ptr`, `None` if the span wraps around.
#[inline(always)]
pub(crate) fn span_end(ptr: *const u8, len: usize) -> Option<usize> {
    (ptr as usize).checked_add(len)
}

#[inline(always)]
pub(crate) fn raw_ptr<T>(p: Option<NonNull<T>>) -> *mut T {
    p.map_or(null_mut(), |p| p.as_ptr())
}
