//! A single-threaded boundary-tag heap.
//!
// For a general view of the heap's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Region layout
// The region starts with one padding word so that payloads land on ALIGNMENT boundaries,
// followed by the prologue (an allocated block with no payload), the chain of regular blocks
// and finally the epilogue header (an allocated block of size 0):
//
//  0      4      8      12              len - 4   len
//  +------+------+------+---- ... ------+---------+
//  | pad  | 8/1  | 8/1  |    blocks     |   0/1   |
//  +------+------+------+---- ... ------+---------+
//         prologue                       epilogue
//
// The epilogue's payload offset is always the region length, so every growth turns the old
// epilogue header into the header of the newly added block.
//
// ## Invariants
// Between public calls every block has matching header and footer, no two free blocks are
// adjacent, and a block is on the free list exactly when its tag says free.

use self::util::{adjusted_size, growth_size};
use crate::block::{Block, Chain};
use crate::error::{HeapCheckError, OutOfMemory};
use crate::fit::FitStrategy;
use crate::freelist::Freelist;
use crate::growers::Grower;
use crate::tag::{Tag, ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, TAG_OVERHEAD};
use crate::util::raw_ptr;

use core::fmt::Debug;
use core::ptr::{copy_nonoverlapping, null_mut, NonNull};

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

mod util;

/// Default amount the region grows by when no free block fits.
pub const CHUNK_SIZE: usize = 1 << 12;

/// The prologue block, its payload sits right after the padding word and its header.
const PROLOGUE: Block = match Block::new(ALIGNMENT) {
    Some(block) => block,
    None => panic!("the prologue offset is non-zero"),
};

/// Padding word, prologue header and footer, epilogue header.
const INITIAL_LEN: u32 = 2 * ALIGNMENT;

const_assert!(CHUNK_SIZE % ALIGNMENT as usize == 0);
const_assert!(CHUNK_SIZE >= MIN_BLOCK_SIZE as usize);

/// Tunables of a [`Heap`], fixed when the heap is built.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum number of bytes requested from the grower whenever the heap has to grow.
    /// Rounded up to [`ALIGNMENT`] when used.
    pub chunk_size: usize,
    /// How free blocks are picked for new allocations.
    pub fit: FitStrategy,
}

impl HeapConfig {
    pub const DEFAULT: HeapConfig = HeapConfig {
        chunk_size: CHUNK_SIZE,
        fit: FitStrategy::FirstFit,
    };

    pub const fn with_fit(mut self, fit: FitStrategy) -> Self {
        self.fit = fit;
        self
    }

    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig::DEFAULT
    }
}

/// Block counts and byte totals of a heap, sentinels excluded.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the grower so far.
    pub region_len: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
}

impl HeapStats {
    pub fn blocks(&self) -> usize {
        self.free_blocks + self.allocated_blocks
    }
}

/// A single-threaded memory allocator.
pub struct Heap<G: Grower> {
    /// `None` until the sentinels have been written.
    chain: Option<Chain>,
    /// Set once the first chunk has been added behind the sentinels.
    seeded: bool,
    /// Bytes of the region in use, which is also the payload offset of the epilogue.
    len: u32,
    freelist: Freelist,
    config: HeapConfig,
    grower: G,
}

// The heap owns its region through the grower.
unsafe impl<G: Grower + Send> Send for Heap<G> {}

impl<G: Grower> Debug for Heap<G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Heap")
            .field("len", &self.len)
            .field("free_blocks", &self.freelist.len())
            .field("fit", &self.config.fit)
            .finish()
    }
}

impl<G: Grower> Heap<G> {
    /// Creates a heap with the default configuration on top of `grower`.
    /// Nothing is requested from the grower until the heap is first used.
    ///
    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying region for the lifetime of the returned heap.
    pub const unsafe fn with_grower(grower: G) -> Self {
        Heap::with_config(grower, HeapConfig::DEFAULT)
    }

    /// Creates a heap with the given configuration on top of `grower`.
    ///
    /// # Safety
    /// See [`with_grower`](Heap::with_grower).
    pub const unsafe fn with_config(grower: G, config: HeapConfig) -> Self {
        Heap {
            chain: None,
            seeded: false,
            len: 0,
            freelist: Freelist::new(),
            config,
            grower,
        }
    }

    /// Writes the prologue and epilogue and seeds the heap with one chunk of free space.
    /// Does nothing if the heap is already initialized. If seeding fails the heap reports
    /// itself uninitialized and the next call grows it again.
    ///
    /// Heap operations initialize the heap on demand, calling this is only needed to
    /// front-load the work or to find out early whether the grower works at all.
    #[instrument(level = "info", err(Debug, level = Level::ERROR))]
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.seeded {
            return Ok(());
        }
        if self.chain.is_none() {
            self.write_sentinels()?;
        }

        self.extend(self.growth_request(0))?;
        self.seeded = true;
        Ok(())
    }

    fn write_sentinels(&mut self) -> Result<(), OutOfMemory> {
        let base = unsafe { self.grower.grow(INITIAL_LEN as usize)? };
        if base.as_ptr() as usize % ALIGNMENT as usize != 0 {
            error!(?base, "Grower handed out a misaligned region.");
            return Err(OutOfMemory);
        }

        let chain = unsafe { Chain::new(base) };
        unsafe {
            chain.write_word(0, 0);
            chain.set_tags(PROLOGUE, Tag::new(ALIGNMENT, true));
            chain.set_header(Block::new(INITIAL_LEN).ok_or(OutOfMemory)?, Tag::new(0, true));
        }
        self.chain = Some(chain);
        self.len = INITIAL_LEN;
        self.freelist.clear();
        debug!(?base, "Sentinels written.");
        Ok(())
    }

    /// Allocates a block with room for at least `size` bytes and returns its payload,
    /// or null if `size` is 0 or the region cannot grow enough.
    ///
    /// The payload is always [`ALIGNMENT`]-aligned.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        raw_ptr(self.__allocate(size).ok())
    }

    /// Frees the block whose payload is `ptr`. Null is ignored.
    ///
    /// Freeing a block that is already free is detected on a best-effort basis,
    /// reported as an error event and otherwise ignored.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer returned by this heap.
    #[instrument(level = "info")]
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let Some(chain) = self.chain else {
            error!(?ptr, "Free on a heap that was never initialized.");
            return;
        };

        let block = chain.block_of(ptr);
        let tag = chain.header(block);
        if !tag.is_allocated() {
            error!(?block, "Block is already free, ignoring.");
            return;
        }

        chain.set_tags(block, Tag::new(tag.size(), false));
        self.coalesce(block);
    }

    /// Moves the contents of the block at `ptr` into a block with room for `size` bytes.
    ///
    /// A null `ptr` makes this an [`allocate`](Heap::allocate), a zero `size` a
    /// [`free`](Heap::free) returning null. Otherwise a new block is allocated, the first
    /// `min(usable_size(ptr), size)` bytes are copied over and the old block is freed.
    /// If the new block can't be allocated null is returned and the old block is left alone.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer returned by this heap.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(size);
        };
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }
        raw_ptr(self.__resize(old, size).ok())
    }

    /// Returns how many bytes can be written to the payload at `ptr`, 0 for null.
    ///
    /// # Safety
    /// `ptr` must be null or a payload pointer of a live block of this heap.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        match (NonNull::new(ptr as *mut u8), self.chain) {
            (Some(ptr), Some(chain)) => {
                let tag = chain.header(chain.block_of(ptr));
                debug_assert!(tag.is_allocated(), "Payloads should be preceded by allocated tags.");
                (tag.size() - TAG_OVERHEAD) as usize
            }
            _ => 0,
        }
    }

    /// Returns how many bytes have been requested from the grower so far.
    pub fn region_len(&self) -> usize {
        self.len as usize
    }

    pub fn config(&self) -> HeapConfig {
        self.config
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }

    /// Walks every block and the whole free list, verifying the heap invariants.
    ///
    /// Never allocates, so it can be used on a heap serving as the global allocator.
    /// An uninitialized heap is trivially consistent.
    pub fn check(&self) -> Result<HeapStats, HeapCheckError> {
        let mut stats = HeapStats {
            region_len: self.len as usize,
            ..HeapStats::default()
        };
        let Some(chain) = self.chain else {
            return Ok(stats);
        };

        unsafe {
            let prologue = Tag::new(ALIGNMENT, true);
            if chain.header(PROLOGUE) != prologue || chain.footer(PROLOGUE) != prologue {
                return Err(HeapCheckError::BadPrologue);
            }

            let mut prev_free = false;
            let mut block = chain.next(PROLOGUE);
            loop {
                let offset = block.offset();
                if offset > self.len {
                    return Err(HeapCheckError::Overrun { offset });
                }
                let header = chain.header(block);
                if header.size() == 0 {
                    if offset != self.len || !header.is_allocated() {
                        return Err(HeapCheckError::BadEpilogue { offset });
                    }
                    break;
                }
                if header.to_word() & (ALIGNMENT - 2) != 0
                    || chain.payload(block).as_ptr() as usize % ALIGNMENT as usize != 0
                {
                    return Err(HeapCheckError::Misaligned { offset });
                }
                if header.size() < MIN_BLOCK_SIZE {
                    return Err(HeapCheckError::Undersized { offset });
                }
                if offset as u64 + header.size() as u64 > self.len as u64 {
                    return Err(HeapCheckError::Overrun { offset });
                }
                if chain.footer(block) != header {
                    return Err(HeapCheckError::TagMismatch { offset });
                }

                if header.is_allocated() {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += header.size() as usize;
                    prev_free = false;
                } else {
                    if prev_free {
                        return Err(HeapCheckError::AdjacentFree { offset });
                    }
                    self.check_links(&chain, block)?;
                    stats.free_blocks += 1;
                    stats.free_bytes += header.size() as usize;
                    prev_free = true;
                }
                block = chain.next(block);
            }

            let mut in_list = 0;
            let mut prev = None;
            let mut p = self.freelist.head();
            while let Some(block) = p {
                if in_list > stats.free_blocks {
                    return Err(HeapCheckError::Cycle);
                }
                if !self.is_payload_offset(block.offset()) {
                    return Err(HeapCheckError::BrokenLink { offset: block.offset() });
                }
                if chain.header(block).is_allocated() {
                    return Err(HeapCheckError::ListedAllocated { offset: block.offset() });
                }
                if self.freelist.prev(&chain, block) != prev {
                    return Err(HeapCheckError::BrokenLink { offset: block.offset() });
                }
                in_list += 1;
                prev = Some(block);
                p = self.freelist.next(&chain, block);
            }
            if in_list != stats.free_blocks || self.freelist.len() != in_list {
                return Err(HeapCheckError::FreeCountMismatch {
                    in_chain: stats.free_blocks,
                    in_list,
                });
            }
        }

        Ok(stats)
    }
}

impl<G: Grower> Heap<G> {
    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    fn __allocate(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert_ne!(size, 0);
        self.init()?;
        let Some(chain) = self.chain else {
            return Err(OutOfMemory);
        };

        let Some(block_size) = adjusted_size(size) else {
            error!(size, "Request can't be encoded in a block.");
            return Err(OutOfMemory);
        };
        debug!(block_size, "Request adjusted.");

        let block = match unsafe { self.config.fit.find(&mut self.freelist, &chain, block_size) } {
            Some(block) => {
                debug!(?block, "Found free block to accommodate object.");
                block
            }
            None => {
                debug!("Couldn't find free block to accommodate object, requesting heap growth.");
                self.extend(self.growth_request(block_size as usize))?
            }
        };

        unsafe { self.place(block, block_size) };
        Ok(chain.payload(block))
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    unsafe fn __resize(&mut self, old: NonNull<u8>, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let new = self.__allocate(size)?;
        let count = self.usable_size(old.as_ptr()).min(size);
        debug!(count, "Copying contents to the new block.");
        copy_nonoverlapping(old.as_ptr(), new.as_ptr(), count);
        self.free(old.as_ptr());
        Ok(new)
    }

    /// Returns how much to grow by to make room for a block of `size` bytes: a whole chunk,
    /// unless the configured chunk could never fit in the region.
    fn growth_request(&self, size: usize) -> usize {
        let wanted = size.max(self.config.chunk_size);
        match growth_size(wanted) {
            Some(chunk) if chunk <= MAX_BLOCK_SIZE - self.len => wanted,
            _ => {
                debug!(
                    chunk_size = self.config.chunk_size,
                    "Chunk can't be encoded, growing by the request only."
                );
                size
            }
        }
    }

    /// Grows the region by at least `size` bytes, formats the new space as a free block,
    /// merges it with a trailing free block if there is one and returns the result.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn extend(&mut self, size: usize) -> Result<Block, OutOfMemory> {
        let Some(chain) = self.chain else {
            return Err(OutOfMemory);
        };
        let size = match growth_size(size) {
            Some(size) if size <= MAX_BLOCK_SIZE - self.len => size,
            _ => {
                error!(size, len = self.len, "Growth failure, region would exceed offset range.");
                return Err(OutOfMemory);
            }
        };

        let old_end = unsafe { self.grower.grow(size as usize) }
            .inspect_err(|_| error!(size, "Growth failure, no memory."))?;
        debug_assert_eq!(
            old_end.as_ptr() as usize,
            chain.base().as_ptr() as usize + self.len as usize,
            "Growers must extend the region contiguously."
        );

        let block = Block::new(self.len).ok_or(OutOfMemory)?;
        self.len += size;
        let epilogue = Block::new(self.len).ok_or(OutOfMemory)?;
        unsafe {
            chain.set_tags(block, Tag::new(size, false));
            chain.set_header(epilogue, Tag::new(0, true));
            debug!(?block, size, "Heap grown.");
            Ok(self.coalesce(block))
        }
    }

    /// Turns the front of the free `block` into an allocated block of `size` bytes.
    /// The rest is split off as a new free block unless it would be smaller than
    /// [`MIN_BLOCK_SIZE`], in which case the whole block is handed out.
    ///
    /// # Safety
    /// `block` must be a listed free block of at least `size` bytes.
    #[instrument(level = "debug")]
    unsafe fn place(&mut self, block: Block, size: u32) {
        let Some(chain) = self.chain else {
            return;
        };
        let block_size = chain.header(block).size();
        debug_assert!(block_size >= size);

        self.freelist.remove(&chain, block);

        if block_size - size >= MIN_BLOCK_SIZE {
            chain.set_tags(block, Tag::new(size, true));
            let rest = chain.next(block);
            chain.set_tags(rest, Tag::new(block_size - size, false));
            debug!(?rest, rest_size = block_size - size, "Split off remainder.");
            self.coalesce(rest);
        } else {
            debug!(slack = block_size - size, "No room for a remainder, taking the whole block.");
            chain.set_tags(block, Tag::new(block_size, true));
        }
    }

    /// Merges the unlisted free `block` with its free neighbours and lists the result.
    /// Returns the merged block, which starts at the predecessor if that was free.
    ///
    /// # Safety
    /// `block` must be tagged free and must not be on the free list.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        let Some(chain) = self.chain else {
            return block;
        };
        let size = chain.header(block).size();
        let next = chain.next(block);
        let prev_allocated = chain.prev_footer(block).is_allocated();
        let next_allocated = chain.header(next).is_allocated();

        let (merged, merged_size) = match (prev_allocated, next_allocated) {
            (true, true) => (block, size),
            (true, false) => {
                let next_size = chain.header(next).size();
                self.freelist.remove(&chain, next);
                (block, size + next_size)
            }
            (false, true) => {
                let prev = chain.prev(block);
                let prev_size = chain.header(prev).size();
                self.freelist.remove(&chain, prev);
                (prev, prev_size + size)
            }
            (false, false) => {
                let prev = chain.prev(block);
                let prev_size = chain.header(prev).size();
                let next_size = chain.header(next).size();
                self.freelist.remove(&chain, prev);
                self.freelist.remove(&chain, next);
                (prev, prev_size + size + next_size)
            }
        };

        chain.set_tags(merged, Tag::new(merged_size, false));
        self.freelist.push_front(&chain, merged);
        merged
    }

    /// Checks the free list links of a free block from the block's side.
    unsafe fn check_links(&self, chain: &Chain, block: Block) -> Result<(), HeapCheckError> {
        let broken = HeapCheckError::BrokenLink { offset: block.offset() };
        match self.freelist.prev(chain, block) {
            None if self.freelist.head() != Some(block) => return Err(broken),
            Some(prev) if !self.is_payload_offset(prev.offset()) => return Err(broken),
            Some(prev) if self.freelist.next(chain, prev) != Some(block) => return Err(broken),
            _ => {}
        }
        match self.freelist.next(chain, block) {
            Some(next) if !self.is_payload_offset(next.offset()) => Err(broken),
            Some(next) if self.freelist.prev(chain, next) != Some(block) => Err(broken),
            _ => Ok(()),
        }
    }

    /// Whether `offset` could be the payload offset of a regular block.
    fn is_payload_offset(&self, offset: u32) -> bool {
        offset > PROLOGUE.offset() && offset < self.len && offset % ALIGNMENT == 0
    }
}

#[cfg(test)]
mod tests;
