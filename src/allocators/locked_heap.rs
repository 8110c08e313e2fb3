//! A multithreaded memory allocator.

use crate::allocators::Heap;
use crate::growers::Grower;
use crate::tag::ALIGNMENT;

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{copy_nonoverlapping, null_mut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A multithreaded memory allocator.
///
/// This allocator is just a `Mutex` wrapper over [`Heap`]. Every operation holds the lock
/// for its whole duration: splitting and coalescing touch blocks reachable from anywhere
/// on the free list, so anything finer grained would not be sound.
pub struct LockedHeap<G: Grower> {
    inner: Mutex<Heap<G>>,
}

impl<G: Grower> LockedHeap<G> {
    pub const fn new(heap: Heap<G>) -> Self {
        LockedHeap {
            inner: Mutex::new(heap),
        }
    }

    /// # Safety
    /// Callers must make sure that the provided grower will be the only object
    /// managing it's underlying region for the lifetime of the returned allocator.
    pub const unsafe fn with_grower(grower: G) -> Self {
        LockedHeap::new(Heap::with_grower(grower))
    }

    /// Locks the heap for direct use.
    ///
    /// A panic while the lock was held can only come from a failed debug assertion,
    /// so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Heap<G>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> Heap<G> {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

//---------------impl GlobalAlloc for LockedHeap---------------//

// Layouts aligned beyond ALIGNMENT are served from a larger block: the payload is moved up
// to the next suitably aligned address and the original payload address is stored in the
// word right before it.
//
//   raw                  aligned - 8   aligned
//   +-------- ... -------+-------------+---------------------+
//   |      unused        |     raw     |   size bytes ...    |
//   +-------- ... -------+-------------+---------------------+

const RAW_SLOT: usize = size_of::<usize>();

#[inline(always)]
fn over_aligned(layout: Layout) -> bool {
    layout.align() > ALIGNMENT as usize
}

impl<G: Grower> LockedHeap<G> {
    unsafe fn alloc_over_aligned(heap: &mut Heap<G>, layout: Layout) -> *mut u8 {
        let Some(size) = layout.size().checked_add(layout.align()) else {
            return null_mut();
        };
        let raw = heap.allocate(size);
        if raw.is_null() {
            return null_mut();
        }
        // `raw` is ALIGNMENT-aligned and the alignment is larger, so there is always a gap
        // of at least RAW_SLOT bytes in front of the aligned address.
        let offset = raw.align_offset(layout.align());
        let offset = if offset == 0 { layout.align() } else { offset };
        debug_assert!(offset >= RAW_SLOT);
        let aligned = raw.add(offset);
        aligned.sub(RAW_SLOT).cast::<usize>().write_unaligned(raw as usize);
        aligned
    }

    #[inline(always)]
    unsafe fn raw_of(ptr: *mut u8) -> *mut u8 {
        ptr.sub(RAW_SLOT).cast::<usize>().read_unaligned() as *mut u8
    }
}

unsafe impl<G: Grower> GlobalAlloc for LockedHeap<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.lock();
        if over_aligned(layout) {
            Self::alloc_over_aligned(&mut heap, layout)
        } else {
            heap.allocate(layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut heap = self.lock();
        if over_aligned(layout) {
            heap.free(Self::raw_of(ptr));
        } else {
            heap.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let mut heap = self.lock();
        if !over_aligned(layout) {
            return heap.resize(ptr, new_size);
        }

        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = Self::alloc_over_aligned(&mut heap, new_layout);
        if !new_ptr.is_null() {
            copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            heap.free(Self::raw_of(ptr));
        }
        new_ptr
    }
}
