//! Block handles and the address arithmetic between neighbouring blocks.
//!
//! A [`Block`] is the offset of a block's payload from the start of the region.
//! Offsets rather than pointers are used so that free list links fit into a single
//! tag-sized word, which keeps the minimum block at 16 bytes.
//!
//! ```text
//!            header             payload                footer
//!         +----------+-------------------------------+----------+
//!  ...    | size | a |  data, or prev/next when free | size | a |    ...
//!         +----------+-------------------------------+----------+
//!         ^          ^                               ^
//!    block - 4     block                  block + size - 8
//! ```

use core::num::NonZeroU32;
use core::ptr::NonNull;

use crate::tag::{Tag, ALIGNMENT, TAG_OVERHEAD, WORD_SIZE};

/// Payload offset of a block. Offset 0 is the alignment padding word, never a payload,
/// so a handle is never zero and `Option<Block>` is a single word.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Block(NonZeroU32);

impl Block {
    #[inline(always)]
    pub const fn new(offset: u32) -> Option<Block> {
        match NonZeroU32::new(offset) {
            Some(offset) => Some(Block(offset)),
            None => None,
        }
    }

    #[inline(always)]
    pub const fn offset(self) -> u32 {
        self.0.get()
    }
}

/// A view over the tags of an initialized region.
///
/// All methods are unsafe since the view cannot tell whether an offset
/// actually points at a block of the region it was created for.
#[derive(Copy, Clone, Debug)]
pub struct Chain {
    base: NonNull<u8>,
}

impl Chain {
    /// # Safety
    /// `base` must be [`ALIGNMENT`]-aligned and stay valid for as long as the chain is used.
    #[inline(always)]
    pub const unsafe fn new(base: NonNull<u8>) -> Chain {
        Chain { base }
    }

    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Reads the word at `offset`.
    ///
    /// # Safety
    /// `offset` must be word-aligned and lie within the region.
    #[inline(always)]
    pub unsafe fn read_word(&self, offset: u32) -> u32 {
        debug_assert_eq!(offset % WORD_SIZE, 0);
        self.base.as_ptr().add(offset as usize).cast::<u32>().read()
    }

    /// Writes the word at `offset`.
    ///
    /// # Safety
    /// `offset` must be word-aligned and lie within the region.
    #[inline(always)]
    pub unsafe fn write_word(&self, offset: u32, word: u32) {
        debug_assert_eq!(offset % WORD_SIZE, 0);
        self.base.as_ptr().add(offset as usize).cast::<u32>().write(word)
    }

    /// # Safety
    /// `block` must be a block of this region.
    #[inline(always)]
    pub unsafe fn header(&self, block: Block) -> Tag {
        Tag::from_word(self.read_word(block.offset() - WORD_SIZE))
    }

    /// Reads the footer, located through the size stored in the header.
    ///
    /// # Safety
    /// `block` must be a block of this region with a valid header.
    #[inline(always)]
    pub unsafe fn footer(&self, block: Block) -> Tag {
        Tag::from_word(self.read_word(self.footer_offset(block, self.header(block).size())))
    }

    /// Writes `tag` into both the header and the footer of `block`.
    /// The footer location is derived from the size in `tag`.
    ///
    /// # Safety
    /// The span described by `block` and `tag` must lie within the region
    /// and must not overlap any block still in use.
    #[inline(always)]
    pub unsafe fn set_tags(&self, block: Block, tag: Tag) {
        debug_assert!(tag.size() >= TAG_OVERHEAD);
        self.write_word(block.offset() - WORD_SIZE, tag.to_word());
        self.write_word(self.footer_offset(block, tag.size()), tag.to_word());
    }

    /// Writes only the header of `block`, used for the epilogue.
    ///
    /// # Safety
    /// See [`set_tags`](Chain::set_tags).
    #[inline(always)]
    pub unsafe fn set_header(&self, block: Block, tag: Tag) {
        self.write_word(block.offset() - WORD_SIZE, tag.to_word());
    }

    /// Returns the block right after `block`.
    ///
    /// # Safety
    /// `block` must not be the epilogue.
    #[inline(always)]
    pub unsafe fn next(&self, block: Block) -> Block {
        let size = self.header(block).size();
        debug_assert_ne!(size, 0, "The epilogue has no successor.");
        Block(NonZeroU32::new_unchecked(block.offset() + size))
    }

    /// Returns the block right before `block`, found through the predecessor's footer.
    ///
    /// # Safety
    /// `block` must not be the prologue.
    #[inline(always)]
    pub unsafe fn prev(&self, block: Block) -> Block {
        let size = self.prev_footer(block).size();
        debug_assert_ne!(size, 0);
        Block(NonZeroU32::new_unchecked(block.offset() - size))
    }

    /// Reads the footer of the block preceding `block`.
    ///
    /// # Safety
    /// `block` must not be the prologue.
    #[inline(always)]
    pub unsafe fn prev_footer(&self, block: Block) -> Tag {
        Tag::from_word(self.read_word(block.offset() - TAG_OVERHEAD))
    }

    /// Returns a pointer to the payload of `block`.
    #[inline(always)]
    pub fn payload(&self, block: Block) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.offset() as usize)) }
    }

    /// Converts a payload pointer handed out by the heap back into a block handle.
    ///
    /// # Safety
    /// `ptr` must be a payload pointer of this region.
    #[inline(always)]
    pub unsafe fn block_of(&self, ptr: NonNull<u8>) -> Block {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert_eq!(offset % ALIGNMENT as usize, 0);
        debug_assert!(offset <= u32::MAX as usize);
        Block(NonZeroU32::new_unchecked(offset as u32))
    }

    #[inline(always)]
    fn footer_offset(&self, block: Block, size: u32) -> u32 {
        block.offset() + size - TAG_OVERHEAD
    }
}
