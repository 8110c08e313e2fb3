//! A boundary-tag memory allocator with an explicit free list.
//!
//! The allocator manages one contiguous region that only ever grows, in the spirit of
//! a classic `sbrk`-backed `malloc`. It can serve as a local heap, a global allocator
//! or the subject of a trace-driven test harness.
//!
//! # Usage
//! ```no_run
//! use boundary_malloc::LockedHeap;
//! use boundary_malloc::growers::BrkGrower;
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedHeap<BrkGrower> = unsafe { LockedHeap::with_grower(BrkGrower::new()) };
//!
//! fn main() {
//!     let v: Vec<u32> = vec![1, 2, 3];
//!     println!("Served by brk: {:?}", v);
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`Heap`] and [`LockedHeap`].
//! [`Heap`] is single-threaded and operated through `&mut self`,
//! [`LockedHeap`] is a `Mutex` wrapper over it implementing [`GlobalAlloc`].
//!
//! # Mode of operation
//! - An allocation request is padded with room for two tags and rounded up to
//!   [`ALIGNMENT`]. The free list is then searched for a block that is large enough, using
//!   the [`FitStrategy`] the heap was configured with.
//! - If no block fits, the region is grown by at least one chunk through the heap's
//!   [grower](#growers) and the new space is merged with a free block ending the region.
//! - The chosen block is split if the leftover can form a block of its own.
//! - A freed block is merged with its free neighbours right away and the result is
//!   pushed to the front of the free list.
//!
//! ## Blocks
//! The region is a chain of blocks, each starting with a header and ending with a footer.
//! Both tags are a single 32-bit word holding the block size and an allocated bit
//! (the size is a multiple of 8, so its low bits are free to use).
//! The footer lets a block find its predecessor in constant time, which is what makes
//! immediate coalescing cheap.
//!
//! ```text
//!   header                payload                   footer
//!  +-------+----------------------------------------+-------+
//!  | size|a|  ...                                   | size|a|
//!  +-------+----------------------------------------+-------+
//! ```
//!
//! The chain is framed by two allocated sentinels, a prologue block without payload and an
//! epilogue header of size 0, so that merging never has to check for the region's ends.
//!
//! ## Free list
//! Free blocks store two links in the first words of their payload: the previous and the
//! next free block. Links are 32-bit offsets from the start of the region, which caps the
//! region at 4 GiB but lets every block fit in 16 bytes.
//!
//! ## Growers
//! A grower is the heap's backing store, anything that can hand out a contiguous region
//! which grows at its end. [`BrkGrower`] moves the program break, [`ArenaGrower`] carves
//! a caller-provided buffer and [`MemGrower`] owns a boxed buffer, which is handy in tests.
//!
//! # Checking and tracing
//! [`Heap::check`] walks the whole region and free list and reports the first broken
//! invariant. The [`trace`] module replays allocation traces against a heap while
//! verifying every payload, which is how fit strategies are compared.
//!
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc
//! [`BrkGrower`]: growers::BrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower
//! [`MemGrower`]: growers::MemGrower

pub use crate::allocators::{Heap, HeapConfig, HeapStats, LockedHeap};
pub use crate::error::{HeapCheckError, OutOfMemory};
pub use crate::fit::FitStrategy;
pub use crate::tag::{ALIGNMENT, MIN_BLOCK_SIZE};

pub mod allocators;
mod block;
pub mod error;
pub mod fit;
mod freelist;
pub mod growers;
mod tag;
pub mod trace;
mod util;
