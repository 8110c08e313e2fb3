//! Defines the [`Tag`] struct and the size constants of the heap layout.

use core::mem::size_of;

use static_assertions::const_assert;

/// Size of a boundary tag in bytes.
pub const WORD_SIZE: u32 = size_of::<Tag>() as u32;
/// Every block size and every payload address is a multiple of this.
pub const ALIGNMENT: u32 = 2 * WORD_SIZE;
/// Header plus footer.
pub const TAG_OVERHEAD: u32 = 2 * WORD_SIZE;
/// A free block must hold a header, a footer and two free list links.
pub const MIN_BLOCK_SIZE: u32 = 2 * ALIGNMENT;
/// Largest block size a tag can encode.
pub const MAX_BLOCK_SIZE: u32 = u32::MAX & !(ALIGNMENT - 1);

const ALLOCATED_BIT: u32 = 1;
const FLAG_MASK: u32 = ALIGNMENT - 1;

// Tagging needs the low bits of every size to be zero.
const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(ALLOCATED_BIT < ALIGNMENT);
const_assert!(MIN_BLOCK_SIZE >= TAG_OVERHEAD + 2 * WORD_SIZE);

/// A boundary tag, the word found at both ends of every block.
///
/// # Tagging
/// Block sizes are always multiples of [`ALIGNMENT`], so the low three bits of the size are
/// always zero. The lowest of them holds the allocated flag: a set bit denotes an allocated
/// block and a clear bit a free one.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(u32);

impl Tag {
    /// Packs a block size and allocation status into a tag.
    #[inline(always)]
    pub const fn new(size: u32, allocated: bool) -> Tag {
        debug_assert!(size & FLAG_MASK == 0, "size should be a multiple of ALIGNMENT.");
        Tag(size | allocated as u32)
    }

    /// Reinterprets a raw word read from the heap.
    #[inline(always)]
    pub const fn from_word(word: u32) -> Tag {
        Tag(word)
    }

    #[inline(always)]
    pub const fn to_word(self) -> u32 {
        self.0
    }

    /// Returns the total size of the block, tags included.
    #[inline(always)]
    pub const fn size(self) -> u32 {
        self.0 & !FLAG_MASK
    }

    #[inline(always)]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }
}

impl core::fmt::Debug for Tag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}
