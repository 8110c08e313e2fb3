//! Error types shared by the heap, its growers and the trace harness.

use core::fmt;

/// The region backing a heap could not be extended.
///
/// This is the only way an allocation can fail. It is never fatal to the heap itself,
/// smaller requests may still succeed afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the heap region cannot grow any further")
    }
}

impl std::error::Error for OutOfMemory {}

/// A violated heap invariant, as reported by [`Heap::check`](crate::Heap::check).
///
/// Offsets are payload offsets from the start of the region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapCheckError {
    /// The prologue block is missing or was overwritten.
    BadPrologue,
    /// The chain does not end with an epilogue at the end of the region.
    BadEpilogue { offset: u32 },
    /// A block's header and footer disagree.
    TagMismatch { offset: u32 },
    /// A block's size or payload address is not a multiple of the alignment unit.
    Misaligned { offset: u32 },
    /// A block is smaller than the minimum block size.
    Undersized { offset: u32 },
    /// A block runs past the end of the region.
    Overrun { offset: u32 },
    /// Two free blocks are next to each other.
    AdjacentFree { offset: u32 },
    /// The free list contains a block that is tagged allocated.
    ListedAllocated { offset: u32 },
    /// A free list link points to a block whose back-link does not point back.
    BrokenLink { offset: u32 },
    /// The free list has a cycle.
    Cycle,
    /// The number of free blocks in the chain and in the free list differ.
    FreeCountMismatch { in_chain: usize, in_list: usize },
}

impl fmt::Display for HeapCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapCheckError::BadPrologue => write!(f, "prologue block is corrupted"),
            HeapCheckError::BadEpilogue { offset } => {
                write!(f, "chain ends at {offset:#x} instead of the region end")
            }
            HeapCheckError::TagMismatch { offset } => {
                write!(f, "block at {offset:#x} has mismatching header and footer")
            }
            HeapCheckError::Misaligned { offset } => write!(f, "block at {offset:#x} is misaligned"),
            HeapCheckError::Undersized { offset } => {
                write!(f, "block at {offset:#x} is below the minimum block size")
            }
            HeapCheckError::Overrun { offset } => {
                write!(f, "block at {offset:#x} extends past the region end")
            }
            HeapCheckError::AdjacentFree { offset } => {
                write!(f, "free block at {offset:#x} follows another free block")
            }
            HeapCheckError::ListedAllocated { offset } => {
                write!(f, "allocated block at {offset:#x} is on the free list")
            }
            HeapCheckError::BrokenLink { offset } => {
                write!(f, "free list links around {offset:#x} are inconsistent")
            }
            HeapCheckError::Cycle => write!(f, "free list contains a cycle"),
            HeapCheckError::FreeCountMismatch { in_chain, in_list } => write!(
                f,
                "{in_chain} free blocks in the chain but {in_list} on the free list"
            ),
        }
    }
}

impl std::error::Error for HeapCheckError {}
