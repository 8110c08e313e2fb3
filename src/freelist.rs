//! Defines the [`Freelist`] struct.
//!
//! The list is embedded in the free blocks themselves: the first word of a free block's
//! payload holds the offset of the previous node and the second word the offset of the
//! next one, 0 standing for "none". Nothing outside this module reads or writes those words.

use crate::block::{Block, Chain};
use crate::tag::WORD_SIZE;

const PREV_LINK: u32 = 0;
const NEXT_LINK: u32 = WORD_SIZE;

#[derive(Debug)]
pub struct Freelist {
    head: Option<Block>,
    /// Resume point of a next-fit search. Kept pointing at a listed block (or nothing)
    /// across removals.
    rover: Option<Block>,
    len: usize,
}

impl Freelist {
    /// Creates an empty Freelist.
    #[inline]
    pub const fn new() -> Self {
        Freelist {
            head: None,
            rover: None,
            len: 0,
        }
    }

    /// Adds `block` to the front of the list.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `block` must be a block of `chain` that is tagged free, large enough to hold two
    /// links and not already in the list.
    pub unsafe fn push_front(&mut self, chain: &Chain, block: Block) {
        debug_assert!(!chain.header(block).is_allocated(), "Only free blocks can be listed.");

        set_prev(chain, block, None);
        set_next(chain, block, self.head);
        if let Some(head) = self.head {
            set_prev(chain, head, Some(block));
        }
        self.head = Some(block);
        self.len += 1;
    }

    /// Removes `block` from the list.
    /// This operation has a time complexity of *O*(1).
    ///
    /// Blocks tagged allocated are never listed, so for those this is a no-op.
    ///
    /// # Safety
    /// If `block` is tagged free it must be part of the list.
    pub unsafe fn remove(&mut self, chain: &Chain, block: Block) {
        if chain.header(block).is_allocated() {
            return;
        }

        let prev = prev(chain, block);
        let next = next(chain, block);
        match prev {
            None => self.head = next,
            Some(prev) => set_next(chain, prev, next),
        }
        if let Some(next) = next {
            set_prev(chain, next, prev);
        }
        set_prev(chain, block, None);
        set_next(chain, block, None);

        if self.rover == Some(block) {
            self.rover = next;
        }
        self.len -= 1;
    }

    /// Returns the head of the list or `None` if the list is empty.
    #[inline]
    pub fn head(&self) -> Option<Block> {
        self.head
    }

    /// Returns the node following `block`.
    ///
    /// # Safety
    /// `block` must be part of the list.
    #[inline]
    pub unsafe fn next(&self, chain: &Chain, block: Block) -> Option<Block> {
        next(chain, block)
    }

    /// Returns the node preceding `block`.
    ///
    /// # Safety
    /// `block` must be part of the list.
    #[inline]
    pub unsafe fn prev(&self, chain: &Chain, block: Block) -> Option<Block> {
        prev(chain, block)
    }

    #[inline]
    pub fn rover(&self) -> Option<Block> {
        self.rover
    }

    #[inline]
    pub fn set_rover(&mut self, rover: Option<Block>) {
        self.rover = rover;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Forgets every node. The blocks themselves are left untouched.
    pub fn clear(&mut self) {
        *self = Freelist::new();
    }
}

impl Default for Freelist {
    fn default() -> Self {
        Freelist::new()
    }
}

#[inline(always)]
unsafe fn prev(chain: &Chain, block: Block) -> Option<Block> {
    Block::new(chain.read_word(block.offset() + PREV_LINK))
}

#[inline(always)]
unsafe fn next(chain: &Chain, block: Block) -> Option<Block> {
    Block::new(chain.read_word(block.offset() + NEXT_LINK))
}

#[inline(always)]
unsafe fn set_prev(chain: &Chain, block: Block, prev: Option<Block>) {
    chain.write_word(block.offset() + PREV_LINK, prev.map_or(0, Block::offset));
}

#[inline(always)]
unsafe fn set_next(chain: &Chain, block: Block, next: Option<Block>) {
    chain.write_word(block.offset() + NEXT_LINK, next.map_or(0, Block::offset));
}
