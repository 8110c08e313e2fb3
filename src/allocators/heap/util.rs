//! Size arithmetic specific to the [`Heap`](super::Heap).

use crate::tag::{ALIGNMENT, MIN_BLOCK_SIZE, TAG_OVERHEAD};
use crate::util::align_up;

/// Returns the smallest multiple of [`ALIGNMENT`] that is greater or equal to `size`
/// or `None` if that multiple can not be contained in a `usize`.
#[inline]
pub fn round_up(size: usize) -> Option<usize> {
    align_up(size, ALIGNMENT as usize)
}

/// Returns the block size needed to serve a request for `size` payload bytes
/// or `None` if no block could be that big.
///
/// The result covers both tags, is rounded up to [`ALIGNMENT`]
/// and is never below [`MIN_BLOCK_SIZE`].
#[inline]
pub fn adjusted_size(size: usize) -> Option<u32> {
    let rounded = round_up(size.checked_add(TAG_OVERHEAD as usize)?)?;
    let rounded = u32::try_from(rounded).ok()?;
    Some(rounded.max(MIN_BLOCK_SIZE))
}

/// Returns how much the region has to grow by to hold a block of at least `size` bytes.
/// Growth is kept a multiple of [`ALIGNMENT`] (an even number of words) so that every
/// growth keeps the region end aligned.
#[inline]
pub fn growth_size(size: usize) -> Option<u32> {
    let rounded = round_up(size)?.max(MIN_BLOCK_SIZE as usize);
    u32::try_from(rounded).ok()
}
