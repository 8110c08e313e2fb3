use crate::error::HeapCheckError;
use crate::growers::{ArenaGrower, MemGrower};

use core::cell::Cell;

use self::format::init_logging;

use super::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};


const STRATEGIES: [FitStrategy; 3] = [FitStrategy::FirstFit, FitStrategy::NextFit, FitStrategy::BestFit];

fn heap(capacity: usize) -> Heap<MemGrower> {
    heap_with(capacity, HeapConfig::DEFAULT)
}

fn heap_with(capacity: usize, config: HeapConfig) -> Heap<MemGrower> {
    let mut heap = unsafe { Heap::with_config(MemGrower::with_capacity(capacity), config) };
    heap.init().unwrap();
    heap
}

fn stats(heap: &Heap<MemGrower>) -> HeapStats {
    stats_of(heap)
}

fn stats_of<G: Grower>(heap: &Heap<G>) -> HeapStats {
    heap.check().unwrap_or_else(|e| panic!("heap is inconsistent: {e}"))
}

/// Payload offset of `p` from the start of the region.
fn offset(heap: &Heap<MemGrower>, p: *mut u8) -> usize {
    p as usize - heap.grower().base().unwrap().as_ptr() as usize
}

#[test]
fn init_seeds_one_chunk() {
    let heap = heap(64 * 1024);
    let stats = stats(&heap);
    assert_eq!(stats.region_len, INITIAL_LEN as usize + CHUNK_SIZE);
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.free_bytes, CHUNK_SIZE);
    assert_eq!(stats.allocated_blocks, 0);
}

#[test]
fn init_is_idempotent() {
    let mut heap = heap(64 * 1024);
    let len = heap.region_len();
    heap.init().unwrap();
    assert_eq!(heap.region_len(), len);
    assert_eq!(heap.grower().len(), len);
}

#[test]
fn init_fails_without_room_for_a_chunk() {
    let mut heap = unsafe { Heap::with_grower(MemGrower::with_capacity(1024)) };
    assert_eq!(heap.init(), Err(OutOfMemory));
    // Still unseeded, so a second attempt fails the same way.
    assert_eq!(heap.init(), Err(OutOfMemory));
    assert!(heap.allocate(8).is_null());
    assert_eq!(heap.region_len(), INITIAL_LEN as usize);
    assert!(heap.check().is_ok());
}

/// Refuses to grow past a limit the test can raise later.
struct Capped<'a> {
    inner: MemGrower,
    limit: &'a Cell<usize>,
}

unsafe impl Grower for Capped<'_> {
    unsafe fn grow(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if self.inner.len() + size > self.limit.get() {
            return Err(OutOfMemory);
        }
        self.inner.grow(size)
    }

    fn base(&self) -> Option<NonNull<u8>> {
        self.inner.base()
    }

    fn end(&self) -> Option<NonNull<u8>> {
        self.inner.end()
    }
}

#[test]
fn failed_seeding_is_retried() {
    let limit = Cell::new(1024);
    let grower = Capped {
        inner: MemGrower::with_capacity(64 * 1024),
        limit: &limit,
    };
    let mut heap = unsafe { Heap::with_grower(grower) };
    assert_eq!(heap.init(), Err(OutOfMemory));
    assert_eq!(stats_of(&heap).free_blocks, 0);

    limit.set(64 * 1024);
    assert_eq!(heap.init(), Ok(()));
    let s = stats_of(&heap);
    assert_eq!((s.free_blocks, s.free_bytes), (1, CHUNK_SIZE));
    assert_eq!(s.region_len, INITIAL_LEN as usize + CHUNK_SIZE);

    heap.init().unwrap();
    assert_eq!(heap.region_len(), INITIAL_LEN as usize + CHUNK_SIZE);
}

#[test]
fn unencodable_chunk_size_falls_back_to_the_request() {
    let mut heap = heap_with(64 * 1024, HeapConfig::DEFAULT.with_chunk_size(usize::MAX));
    let s = stats(&heap);
    assert_eq!((s.free_blocks, s.free_bytes), (1, MIN_BLOCK_SIZE as usize));

    let p = heap.allocate(8);
    assert!(!p.is_null());
    let q = heap.allocate(100);
    assert!(!q.is_null());
    let s = stats(&heap);
    assert_eq!((s.allocated_blocks, s.free_blocks), (2, 0));
    assert_eq!(s.region_len, INITIAL_LEN as usize + MIN_BLOCK_SIZE as usize + 112);
}

#[test]
fn heap_initializes_lazily() {
    let mut heap = unsafe { Heap::with_grower(MemGrower::with_capacity(64 * 1024)) };
    assert_eq!(heap.region_len(), 0);
    assert_eq!(heap.check(), Ok(HeapStats::default()));
    let p = heap.allocate(10);
    assert!(!p.is_null());
    assert_eq!(offset(&heap, p), 16);
    assert_eq!(stats(&heap).allocated_blocks, 1);
}

#[test]
fn heap_runs_on_a_borrowed_arena() {
    let mut buf = vec![0_u64; 2048];
    let arena = unsafe { ArenaGrower::new(buf.as_mut_ptr().cast(), buf.len() * 8) };
    let mut heap = unsafe { Heap::with_grower(arena) };
    let p = heap.allocate(1000);
    assert!(!p.is_null());
    assert!(heap.allocate(20_000).is_null());
    unsafe { heap.free(p) };
    assert_eq!(stats_of(&heap).free_blocks, 1);
    assert_eq!(heap.grower().remaining(), 16 * 1024 - INITIAL_LEN as usize - CHUNK_SIZE);
}

#[test]
fn freed_block_is_reused() {
    let mut heap = heap(64 * 1024);
    let len = heap.region_len();
    let a = heap.allocate(24);
    assert!(!a.is_null());
    assert_eq!(a as usize % ALIGNMENT as usize, 0);
    unsafe { heap.free(a) };
    assert_eq!(heap.allocate(24), a);
    assert_eq!(heap.region_len(), len);
}

#[test]
fn request_beyond_the_first_chunk_grows_the_heap() {
    let mut heap = heap(64 * 1024);
    let len = heap.region_len();
    let p = heap.allocate(4096);
    assert!(!p.is_null());
    assert!(heap.region_len() > len);
    assert!(unsafe { heap.usable_size(p) } >= 4096);
    let stats = stats(&heap);
    assert_eq!(stats.allocated_blocks, 1);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn adjacent_freed_blocks_coalesce() {
    let mut heap = heap(64 * 1024);
    let len = heap.region_len();
    let p1 = heap.allocate(16);
    let p2 = heap.allocate(16);
    let guard = heap.allocate(16);
    assert!(!guard.is_null());
    assert_eq!(p2 as usize - p1 as usize, 24);

    unsafe {
        heap.free(p1);
        heap.free(p2);
    }
    let after = stats(&heap);
    // One block for p1 + p2, one for the rest of the chunk.
    assert_eq!(after.free_blocks, 2);
    assert_eq!(after.free_bytes, CHUNK_SIZE - 24);

    // 40 payload bytes need exactly the 48 bytes of the merged block.
    assert_eq!(heap.allocate(40), p1);
    assert_eq!(heap.region_len(), len);
    assert_eq!(stats(&heap).free_blocks, 1);
}

#[test]
fn all_four_coalescing_cases() {
    let mut heap = heap(64 * 1024);
    let p: Vec<*mut u8> = (0..6).map(|_| heap.allocate(24)).collect();
    let block = 32;
    let tail = CHUNK_SIZE - 6 * block;

    unsafe {
        // Both neighbours allocated.
        heap.free(p[1]);
        assert_eq!(stats(&heap).free_blocks, 2);

        // Successor free.
        heap.free(p[0]);
        let s = stats(&heap);
        assert_eq!((s.free_blocks, s.free_bytes), (2, 2 * block + tail));

        // Both neighbours free.
        heap.free(p[3]);
        heap.free(p[2]);
        let s = stats(&heap);
        assert_eq!((s.free_blocks, s.free_bytes), (2, 4 * block + tail));

        // Predecessor free, successor allocated.
        let q = heap.allocate(24);
        assert_eq!(q, p[0]);
        heap.free(p[4]);
        let s = stats(&heap);
        assert_eq!((s.free_blocks, s.free_bytes), (2, 4 * block + tail));
        heap.free(q);
        assert_eq!(stats(&heap).free_blocks, 2);

        // Both neighbours free again, the last block joins the tail of the chunk.
        heap.free(p[5]);
    }
    let s = stats(&heap);
    assert_eq!((s.free_blocks, s.free_bytes), (1, CHUNK_SIZE));
}

#[test]
fn growth_merges_with_trailing_free_block() {
    let mut heap = heap(64 * 1024);
    let p = heap.allocate(4000);
    assert_eq!(offset(&heap, p), 16);
    // 4008 bytes taken, 88 left at the end of the chunk.
    let q = heap.allocate(5000);
    assert_eq!(offset(&heap, q), 16 + 4008);
    assert_eq!(heap.region_len(), INITIAL_LEN as usize + CHUNK_SIZE + 5008);
    let s = stats(&heap);
    assert_eq!((s.allocated_blocks, s.free_blocks, s.free_bytes), (2, 1, 88));
}

#[test]
fn small_remainders_are_not_split_off() {
    let mut heap = heap(64 * 1024);
    // Block of 4088 leaves 8 bytes, too few for a block of their own.
    let p = heap.allocate(4080);
    assert_eq!(unsafe { heap.usable_size(p) }, CHUNK_SIZE - TAG_OVERHEAD as usize);
    let s = stats(&heap);
    assert_eq!((s.allocated_blocks, s.free_blocks), (1, 0));
    unsafe { heap.free(p) };

    // Block of 4080 leaves exactly a minimum block.
    let p = heap.allocate(4072);
    assert_eq!(unsafe { heap.usable_size(p) }, 4072);
    let s = stats(&heap);
    assert_eq!((s.free_blocks, s.free_bytes), (1, MIN_BLOCK_SIZE as usize));
}

#[test]
fn zero_sized_requests() {
    let mut heap = heap(64 * 1024);
    let before = stats(&heap);
    assert!(heap.allocate(0).is_null());
    unsafe { heap.free(null_mut()) };
    assert_eq!(stats(&heap), before);
}

#[test]
fn resize_of_null_allocates() {
    let mut a = heap(64 * 1024);
    let mut b = heap(64 * 1024);
    let p = unsafe { a.resize(null_mut(), 32) };
    let q = b.allocate(32);
    assert!(!p.is_null());
    assert_eq!(offset(&a, p), offset(&b, q));
    assert_eq!(stats(&a), stats(&b));
}

#[test]
fn resize_to_zero_frees() {
    let mut heap = heap(64 * 1024);
    let p = heap.allocate(100);
    assert!(unsafe { heap.resize(p, 0) }.is_null());
    let s = stats(&heap);
    assert_eq!((s.allocated_blocks, s.free_blocks), (0, 1));
}

#[test]
fn resize_preserves_contents() {
    let mut heap = heap(64 * 1024);
    unsafe {
        let p = heap.allocate(100);
        for i in 0..100 {
            *p.add(i) = i as u8;
        }
        let grown = heap.resize(p, 3000);
        assert!(!grown.is_null());
        assert_ne!(grown, p);
        for i in 0..100 {
            assert_eq!(*grown.add(i), i as u8);
        }
        let shrunk = heap.resize(grown, 10);
        for i in 0..10 {
            assert_eq!(*shrunk.add(i), i as u8);
        }
        assert_eq!(stats(&heap).allocated_blocks, 1);
    }
}

#[test]
fn failed_resize_keeps_the_old_block() {
    let mut heap = heap(8 * 1024);
    unsafe {
        let p = heap.allocate(64);
        p.write_bytes(0xab, 64);
        assert!(heap.resize(p, 1 << 20).is_null());
        for i in 0..64 {
            assert_eq!(*p.add(i), 0xab);
        }
        assert_eq!(stats(&heap).allocated_blocks, 1);
    }
}

#[test]
fn out_of_memory_is_not_fatal() {
    let mut heap = heap(16 * 1024);
    assert!(heap.allocate(1 << 20).is_null());
    assert!(heap.allocate(usize::MAX).is_null());
    assert!(heap.allocate(u32::MAX as usize).is_null());
    let before = stats(&heap);

    let p = heap.allocate(64);
    assert!(!p.is_null());
    let mut live = vec![p];
    loop {
        let p = heap.allocate(1000);
        if p.is_null() {
            break;
        }
        live.push(p);
    }
    assert!(heap.region_len() <= 16 * 1024);
    assert!(live.len() > 10);
    assert_eq!(before.allocated_blocks, 0);
    for p in live {
        unsafe { heap.free(p) };
    }
    let s = stats(&heap);
    assert_eq!((s.allocated_blocks, s.free_blocks), (0, 1));
}

#[test]
fn double_free_is_ignored() {
    init_logging();
    let mut heap = heap(64 * 1024);
    let a = heap.allocate(40);
    let b = heap.allocate(40);
    unsafe {
        heap.free(a);
        let before = stats(&heap);
        heap.free(a);
        assert_eq!(stats(&heap), before);
        heap.free(b);
    }
    assert_eq!(stats(&heap).free_blocks, 1);
}

#[test]
fn free_on_an_uninitialized_heap_is_ignored() {
    let mut heap = unsafe { Heap::with_grower(MemGrower::with_capacity(1024)) };
    let mut x = 0_u64;
    unsafe { heap.free((&mut x as *mut u64).cast()) };
    assert_eq!(heap.region_len(), 0);
}

#[test]
fn usable_size_covers_the_request() {
    let mut heap = heap(64 * 1024);
    assert_eq!(unsafe { heap.usable_size(core::ptr::null()) }, 0);
    for size in [1, 7, 8, 9, 16, 17, 100, 1000] {
        let p = heap.allocate(size);
        let usable = unsafe { heap.usable_size(p) };
        assert!(usable >= size);
        assert!(usable < size + 2 * ALIGNMENT as usize);
    }
}

#[test]
fn fit_strategies_pick_different_blocks() {
    let mut picks = vec![];
    for fit in STRATEGIES {
        let mut heap = heap_with(64 * 1024, HeapConfig::DEFAULT.with_fit(fit));
        let a = heap.allocate(200);
        let _g1 = heap.allocate(8);
        let b = heap.allocate(40);
        let _g2 = heap.allocate(8);
        unsafe {
            heap.free(b);
            heap.free(a);
        }
        // Free list is now: a (208 bytes), b (48 bytes), rest of the chunk.
        let first = heap.allocate(40);
        let second = heap.allocate(40);
        assert!(stats(&heap).allocated_blocks == 4);
        picks.push((fit, offset(&heap, first), offset(&heap, second)));
    }
    // a is at 16, the rest of a after a split at 64, b at 240.
    assert_eq!(
        picks,
        vec![
            (FitStrategy::FirstFit, 16, 64),
            (FitStrategy::NextFit, 16, 240),
            (FitStrategy::BestFit, 240, 16),
        ]
    );
}

#[test]
fn checker_catches_a_clobbered_footer() {
    let mut heap = heap(64 * 1024);
    let p = heap.allocate(16);
    let _q = heap.allocate(16);
    unsafe { p.add(16).cast::<u32>().write(Tag::new(32, true).to_word()) };
    assert_eq!(
        heap.check(),
        Err(HeapCheckError::TagMismatch {
            offset: offset(&heap, p) as u32
        })
    );
}

#[test]
fn checker_catches_a_clobbered_link() {
    let mut heap = heap(64 * 1024);
    let a = heap.allocate(16);
    let _guard = heap.allocate(16);
    unsafe {
        heap.free(a);
        // `a` is the list head, overwrite its next link.
        a.add(4).cast::<u32>().write(0);
    }
    assert!(matches!(heap.check(), Err(HeapCheckError::BrokenLink { .. })));
}

#[test]
fn checker_catches_adjacent_free_blocks() {
    let mut heap = heap(64 * 1024);
    let a = heap.allocate(16);
    let b = heap.allocate(16);
    let _guard = heap.allocate(16);
    unsafe {
        heap.free(a);
        // Mark `b` free behind the heap's back.
        let tag = Tag::new(24, false).to_word();
        b.sub(4).cast::<u32>().write(tag);
        b.add(16).cast::<u32>().write(tag);
    }
    assert_eq!(
        heap.check(),
        Err(HeapCheckError::AdjacentFree {
            offset: offset(&heap, b) as u32
        })
    );
}

/// Random allocate/free/resize sequences, checking every payload and the heap
/// invariants after every step.
#[test]
fn random_operations_keep_the_heap_consistent() {
    init_logging();
    for fit in STRATEGIES {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut heap = heap_with(16 << 20, HeapConfig::DEFAULT.with_fit(fit));
        // (payload, requested size, fill byte)
        let mut live: Vec<(*mut u8, usize, u8)> = vec![];

        for step in 0..3000 {
            let fill = (step % 251) as u8;
            match rng.gen_range(0..10) {
                0..=4 => {
                    let size = if rng.gen_bool(0.1) {
                        rng.gen_range(1..20_000)
                    } else {
                        rng.gen_range(1..300)
                    };
                    let p = heap.allocate(size);
                    assert!(!p.is_null(), "{fit}: allocation of {size} failed");
                    assert_eq!(p as usize % ALIGNMENT as usize, 0);
                    unsafe { p.write_bytes(fill, size) };
                    live.push((p, size, fill));
                }
                5..=7 if !live.is_empty() => {
                    let (p, size, fill) = live.swap_remove(rng.gen_range(0..live.len()));
                    assert_filled(p, size, fill);
                    unsafe { heap.free(p) };
                }
                8..=9 if !live.is_empty() => {
                    let i = rng.gen_range(0..live.len());
                    let (p, size, old_fill) = live[i];
                    let new_size = rng.gen_range(1..2000);
                    let q = unsafe { heap.resize(p, new_size) };
                    assert!(!q.is_null());
                    assert_filled(q, size.min(new_size), old_fill);
                    unsafe { q.write_bytes(fill, new_size) };
                    live[i] = (q, new_size, fill);
                }
                _ => {}
            }

            let s = stats(&heap);
            assert_eq!(s.allocated_blocks, live.len());
            assert_disjoint(&mut live);
        }

        for (p, size, fill) in live.drain(..) {
            assert_filled(p, size, fill);
            unsafe { heap.free(p) };
        }
        let s = stats(&heap);
        assert_eq!((s.allocated_blocks, s.free_blocks), (0, 1), "{fit}");
    }
}

fn assert_filled(p: *mut u8, size: usize, fill: u8) {
    let bytes = unsafe { core::slice::from_raw_parts(p, size) };
    assert!(bytes.iter().all(|&b| b == fill), "payload at {p:?} was clobbered");
}

fn assert_disjoint(live: &mut [(*mut u8, usize, u8)]) {
    live.sort_unstable_by_key(|&(p, _, _)| p as usize);
    for pair in live.windows(2) {
        let (p, size, _) = pair[0];
        let (q, _, _) = pair[1];
        assert!(p as usize + size <= q as usize, "payloads at {p:?} and {q:?} overlap");
    }
}
