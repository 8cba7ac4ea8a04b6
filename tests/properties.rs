//! Properties every heap has to fulfill, checked against the public API.
use tagalloc::{
    OutOfMemory, Payload, RawAllocator, Region, SliceRegion, State, StaticRegion, ALIGNMENT,
    CHUNK_SIZE,
};

/// A region counting the number of growth requests.
struct Counting<R> {
    inner: R,
    grows: Vec<usize>,
}
unsafe impl<R: Region> Region for Counting<R> {
    fn grow(&mut self, increment: usize) -> Result<usize, OutOfMemory> {
        self.grows.push(increment);
        self.inner.grow(increment)
    }

    fn base(&self) -> *mut u8 {
        self.inner.base()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }
}

fn heap() -> RawAllocator<Counting<StaticRegion<65536>>> {
    let mut heap = RawAllocator::new(Counting {
        inner: StaticRegion::new(),
        grows: Vec::new(),
    });
    heap.init().unwrap();
    heap
}

/// A tiny xorshift generator, so that the "random" sequences are reproducible.
struct XorShift(u64);
impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, limit: usize) -> usize {
        (self.next() % limit as u64) as usize
    }
}

fn block_range<R: Region>(heap: &RawAllocator<R>, block: Payload) -> (usize, usize) {
    let header = block.offset() - 8;
    (header, header + heap.usable_size(block) + 16)
}

#[test]
fn payloads_are_aligned() {
    let mut heap = heap();
    for n in 1..200 {
        let block = heap.alloc(n).unwrap();
        assert_eq!(block.offset() % ALIGNMENT, 0);
        assert_eq!(heap.memory_of(block).as_ptr() as usize % ALIGNMENT, 0);
    }
}

#[test]
fn blocks_are_large_enough() {
    let mut heap = heap();
    for n in (1..3000).step_by(7) {
        let block = heap.alloc(n).unwrap();
        let size = heap.usable_size(block) + 16;
        assert!(heap.usable_size(block) >= n);
        assert!(size >= (n + 16 + 15) / 16 * 16);
        heap.free(Some(block));
    }
}

#[test]
fn freed_block_is_reused() {
    let mut heap = heap();
    let a = heap.alloc(100);
    heap.free(a);
    let b = heap.alloc(100);
    assert_eq!(a, b);
}

#[test]
fn first_fit_prefers_earlier_holes() {
    let mut heap = heap();
    let a = heap.alloc(100);
    let _b = heap.alloc(200);
    heap.free(a);
    let c = heap.alloc(50);
    assert_eq!(c, a);
}

#[test]
fn coalescing_closes_gaps() {
    let mut heap = heap();
    let a = heap.alloc(100).unwrap();
    let b = heap.alloc(100).unwrap();
    // keep the tail of the heap out of the merged block
    let _c = heap.alloc(100).unwrap();
    heap.free(Some(a));
    heap.free(Some(b));

    let grows = heap.region().grows.len();
    // two blocks of 128 bytes: 256 bytes minus header and footer
    let d = heap.alloc(256 - 16).unwrap();
    assert_eq!(d, a);
    assert_eq!(heap.region().grows.len(), grows);
}

#[test]
fn growth_happens_exactly_once() {
    let mut heap = heap();
    let grows = heap.region().grows.len();
    let _a = heap.alloc(4048).unwrap();
    assert_eq!(heap.region().grows.len(), grows);

    // no free memory is left, a small request grows by a chunk
    let _b = heap.alloc(10).unwrap();
    assert_eq!(heap.region().grows[grows..], [CHUNK_SIZE]);

    // a large request grows by exactly the adjusted size
    let grows = heap.region().grows.len();
    let _c = heap.alloc(10_000).unwrap();
    assert_eq!(heap.region().grows[grows..], [10_016]);
}

#[test]
fn live_blocks_are_disjoint_and_the_heap_stays_consistent() {
    let mut heap = heap();
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    let mut live: Vec<(Payload, u8)> = Vec::new();

    for round in 0..2000 {
        if live.is_empty() || rng.below(3) != 0 {
            let n = 1 + rng.below(600);
            if let Some(block) = heap.alloc(n) {
                let tag = round as u8;
                heap.memory_of_mut(block)[..n].fill(tag);
                live.push((block, tag));
            }
        } else {
            let (block, tag) = live.swap_remove(rng.below(live.len()));
            assert!(heap.memory_of(block).iter().take(1).all(|&byte| byte == tag));
            heap.free(Some(block));
        }
        assert_eq!(heap.check(), Ok(()), "heap corrupted in round {}", round);
    }

    let mut ranges: Vec<_> = live
        .iter()
        .map(|&(block, _)| block_range(&heap, block))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }

    for (block, tag) in live.drain(..) {
        assert_eq!(heap.memory_of(block)[0], tag);
        heap.free(Some(block));
    }
    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].state, State::Free);
    assert_eq!(blocks[0].size, heap.region().size() - 32);
}

#[test]
fn stats_add_up() {
    let mut heap = heap();
    let a = heap.alloc(300);
    let _b = heap.alloc(1000);
    heap.free(a);

    let stats = heap.stats();
    assert_eq!(stats.used_blocks, 1);
    assert_eq!(stats.free_blocks, 2);
    assert_eq!(stats.used_bytes + stats.free_bytes + 32, stats.heap_size);
    assert!(stats.largest_free <= stats.free_bytes);
}

#[test]
fn slice_region() {
    let mut memory = vec![0u8; 3 * CHUNK_SIZE];
    let mut heap = RawAllocator::new(SliceRegion::new(&mut memory));
    heap.init().unwrap();

    let a = heap.alloc(5000).unwrap();
    assert_eq!(heap.memory_of(a).as_ptr() as usize % ALIGNMENT, 0);
    assert_eq!(heap.alloc(5000), None);
    heap.free(Some(a));
    assert_eq!(heap.check(), Ok(()));
    assert!(heap.alloc(5000).is_some());
}
