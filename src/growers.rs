//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait allows users to easily change the underlying
//! region on which a [`Heap`](crate::Heap) operates.

use crate::error::OutOfMemory;
use crate::tag::ALIGNMENT;
use crate::util::{align_ptr_up, span_end};

use core::ptr::{self, NonNull};

use libc::{intptr_t, sbrk};
use tracing::{debug, error};

/// A trait for types that act as if they were a contiguous growable region.
///
/// # Safety
/// * Growth must be contiguous: the pointer returned by a successful `grow` must be the end
///   of the region as left by the previous successful `grow`.
/// * The first byte of the region must be [`ALIGNMENT`]-aligned.
/// * Copying, cloning, or moving the grower must not invalidate any pointers to the region
///   managed by the grower. This generally means that growers should not own their regions
///   inline.
pub unsafe trait Grower {
    /// Grows the underlying region by exactly `size` bytes.
    /// Returns the old end of the region or `Err(OutOfMemory)` if the growth failed,
    /// in which case the region is left as it was.
    ///
    /// # Safety
    /// Implementors should ensure that `grow(0)` does not grow the region.
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory>;

    /// Returns the start of the region or `None` if it has not been established yet.
    fn base(&self) -> Option<NonNull<u8>>;

    /// Returns the current end of the region or `None` if it has not been established yet.
    fn end(&self) -> Option<NonNull<u8>>;
}

/// A grower that internally uses [`libc::sbrk`] to operate
/// on the end of the process's data segment.
#[derive(Debug)]
pub struct BrkGrower {
    base: Option<NonNull<u8>>,
    heap_end: Option<NonNull<u8>>,
}

impl BrkGrower {
    #[inline(always)]
    pub const fn new() -> Self {
        BrkGrower {
            base: None,
            heap_end: None,
        }
    }

    /// Tries to initialize the grower by calling `sbrk(0)` to get the initial program break,
    /// padding the break up to [`ALIGNMENT`] if needed.
    ///
    /// # Safety
    /// This function is unsafe since it assumes that the grower wasn't previously initialized.
    unsafe fn try_init(&mut self) -> Result<(), OutOfMemory> {
        debug_assert!(self.heap_end.is_none());
        let brk = sbrk(0);
        if brk as isize == -1 {
            error!("Couldn't read the program break.");
            return Err(OutOfMemory);
        }
        let brk: *mut u8 = brk.cast();
        let aligned = align_ptr_up(brk, ALIGNMENT as usize).ok_or(OutOfMemory)?;
        let padding = aligned as usize - brk as usize;
        if padding != 0 && sbrk(padding as intptr_t) as isize == -1 {
            error!(padding, "Couldn't align the program break.");
            return Err(OutOfMemory);
        }
        let start = NonNull::new(aligned).ok_or(OutOfMemory)?;
        debug!(?start, padding, "Program break initialized.");
        self.base = Some(start);
        self.heap_end = Some(start);
        Ok(())
    }
}

// The program break is process-wide, any thread may move it.
unsafe impl Send for BrkGrower {}

impl Default for BrkGrower {
    fn default() -> Self {
        BrkGrower::new()
    }
}

unsafe impl Grower for BrkGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if self.heap_end.is_none() {
            self.try_init()?;
        }
        let heap_end = self.heap_end.ok_or(OutOfMemory)?;
        if size == 0 {
            return Ok(heap_end);
        }
        let increment = intptr_t::try_from(size).map_err(|_| OutOfMemory)?;
        span_end(heap_end.as_ptr(), size).ok_or(OutOfMemory)?;

        let old_brk = sbrk(increment);
        if old_brk as isize == -1 {
            return Err(OutOfMemory);
        }
        if old_brk.cast::<u8>() != heap_end.as_ptr() {
            // Someone else moved the break, the region would no longer be contiguous.
            error!(?old_brk, ?heap_end, "Program break moved behind the grower's back.");
            sbrk(-increment);
            return Err(OutOfMemory);
        }
        self.heap_end = Some(NonNull::new_unchecked(heap_end.as_ptr().add(size)));
        Ok(heap_end)
    }

    fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    fn end(&self) -> Option<NonNull<u8>> {
        self.heap_end
    }
}

/// A grower that operates on a caller-provided buffer of fixed size.
#[derive(Debug)]
pub struct ArenaGrower {
    start: *mut u8,
    heap_end: *mut u8,
    arena_end: *mut u8,
}

impl ArenaGrower {
    /// Creates a new arena that operates on the provided buffer.
    /// Leading bytes are skipped if `buf` is not [`ALIGNMENT`]-aligned.
    ///
    /// # Safety
    /// `buf` must be valid for reads and writes of `len` bytes for as long as the grower
    /// and any heap built on it are in use, and nothing else may access the buffer meanwhile.
    pub unsafe fn new(buf: *mut u8, len: usize) -> Self {
        let arena_end = buf.wrapping_add(len);
        let start = match align_ptr_up(buf, ALIGNMENT as usize) {
            Some(start) if start as usize <= arena_end as usize => start,
            _ => arena_end,
        };
        ArenaGrower {
            start,
            heap_end: start,
            arena_end,
        }
    }

    /// Returns how many more bytes the arena can hand out.
    pub fn remaining(&self) -> usize {
        self.arena_end as usize - self.heap_end as usize
    }
}

// `new` demands exclusive access to the buffer.
unsafe impl Send for ArenaGrower {}

unsafe impl Grower for ArenaGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let heap_end = NonNull::new(self.heap_end).ok_or(OutOfMemory)?;
        if size > self.remaining() {
            return Err(OutOfMemory);
        }
        self.heap_end = self.heap_end.add(size);
        Ok(heap_end)
    }

    fn base(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.start)
    }

    fn end(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.heap_end)
    }
}

/// A grower that owns a fixed-capacity region on the system heap.
///
/// This simulates a process whose break can only move up to a fixed maximum, which is handy
/// for tests and for running several independent heaps side by side.
pub struct MemGrower {
    start: NonNull<u8>,
    capacity: usize,
    len: usize,
}

impl MemGrower {
    /// Creates a region that can grow up to `capacity` bytes (rounded up to a multiple of 8).
    pub fn with_capacity(capacity: usize) -> Self {
        let buf: Box<[u64]> = vec![0_u64; capacity.div_ceil(8)].into_boxed_slice();
        let capacity = buf.len() * 8;
        // Box pointers are never null, even for empty slices.
        let start = unsafe { NonNull::new_unchecked(Box::into_raw(buf).cast::<u8>()) };
        MemGrower {
            start,
            capacity,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns how many bytes have been handed out so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MemGrower {
    fn drop(&mut self) {
        let words = ptr::slice_from_raw_parts_mut(self.start.as_ptr().cast::<u64>(), self.capacity / 8);
        drop(unsafe { Box::from_raw(words) });
    }
}

impl core::fmt::Debug for MemGrower {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemGrower")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

// The grower owns its buffer outright.
unsafe impl Send for MemGrower {}

unsafe impl Grower for MemGrower {
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if size > self.capacity - self.len {
            return Err(OutOfMemory);
        }
        let old_end = self.start.as_ptr().add(self.len);
        self.len += size;
        Ok(NonNull::new_unchecked(old_end))
    }

    fn base(&self) -> Option<NonNull<u8>> {
        Some(self.start)
    }

    fn end(&self) -> Option<NonNull<u8>> {
        Some(unsafe { NonNull::new_unchecked(self.start.as_ptr().add(self.len)) })
    }
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        (**self).grow(size)
    }

    fn base(&self) -> Option<NonNull<u8>> {
        (**self).base()
    }

    fn end(&self) -> Option<NonNull<u8>> {
        (**self).end()
    }
}
