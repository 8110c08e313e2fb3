//! The [`Heap`] allocator and its thread-safe [`LockedHeap`] wrapper.

pub mod heap;
pub mod locked_heap;

pub use heap::{Heap, HeapConfig, HeapStats};
pub use locked_heap::LockedHeap;
