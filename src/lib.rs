//! Boundary-tag allocator for heaps, that grow on demand
//!
//! This crate provides a first-fit allocator with immediate coalescing for
//! `#![no_std]`-environments like kernels or embedded firmware. The heap lives
//! in a [`Region`]: a contiguous piece of memory, which only ever grows at its
//! end (just like the program break moved by `sbrk(2)`). Freed memory is
//! merged with its free neighbors right away and reused by later allocations.
//!
//! There are two ways to use it:
//! - [`Allocator`] implements [`core::alloc::GlobalAlloc`] on top of a static
//!   region and a spin lock. This is what you want for the
//!   [`alloc`-crate][alloc].
//! - [`RawAllocator`] is the single-threaded allocator core. It works on any
//!   [`Region`], hands out [`Payload`] offsets instead of pointers and offers
//!   some introspection ([`RawAllocator::blocks()`], [`RawAllocator::stats()`]
//!   and [`RawAllocator::check()`]).
//!
//! # Usage
//! Copy the following code into your binary crate and adjust the number of
//! bytes of the heap (here 64K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: tagalloc::Allocator<65536> = tagalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! The heap is initialized on the first allocation. Afterwards you can use
//! `alloc::vec::Vec`, `alloc::collections::BTreeMap` and friends.
//!
//! The raw allocator can be used on its own, e.g. to manage memory handed over
//! by a boot loader:
//! ```
//! use tagalloc::{RawAllocator, StaticRegion};
//!
//! let mut heap = RawAllocator::new(StaticRegion::<8192>::new());
//! heap.init().expect("region too small");
//!
//! let a = heap.alloc(100).unwrap();
//! heap.memory_of_mut(a)[..5].copy_from_slice(b"hello");
//! heap.free(Some(a));
//! assert_eq!(heap.alloc(100), Some(a));
//! ```
//!
//! # Implementation
//! Every block carries a header and a footer of 8 bytes each, both holding
//! the block size (a multiple of 16) and a "used"-flag. The heap is framed by a
//! prologue and an epilogue, two blocks which are always used. The algorithm
//! is as follows:
//! 1.  The heap is initialized.
//!     ```text
//!     0    8    16   24        4112 4120
//!     pad  hdr  ftr  hdr  .... ftr  hdr
//!     ^--- ^-------  ^------------- ^---
//!          prologue  FREE 4096      epilogue
//!     ```
//!     Four words (padding, prologue, epilogue) are requested from the region,
//!     followed by a first chunk of 4096 bytes, which becomes a free block.
//!     The padding makes the payloads (directly after a header) land on
//!     16-byte boundaries.
//! 2.  A block of 100 is allocated.
//!     ```text
//!     prologue  USED 128  FREE 3968  epilogue
//!     ```
//!     The request is enlarged by the header and footer and rounded up to 16
//!     (116 -> 128). The blocks are scanned from the start and the first free
//!     block large enough is split.
//! 3.  A block of 200 is allocated and afterwards the first block is freed.
//!     ```text
//!     prologue  FREE 128  USED 224  FREE 3744  epilogue
//!     ```
//!     The freed block has no free neighbor, so nothing is merged.
//! 4.  A block of 50 is allocated.
//!     ```text
//!     prologue  USED 80  FREE 48  USED 224  FREE 3744  epilogue
//!     ```
//!     The first free block fits (first-fit), so the hole in front is used
//!     although there is a lot more space at the end. The remainder of 48 bytes
//!     is large enough to be split off. A remainder of 32 bytes or less would
//!     have been handed out as part of the allocation instead.
//! 5.  The block of 200 is freed.
//!     ```text
//!     prologue  USED 80  FREE 4016  epilogue
//!     ```
//!     Both neighbors are free, so all three blocks are merged into one. The
//!     previous block is found by reading its footer, which sits directly in
//!     front of the header of the freed block. This is the reason why used
//!     blocks carry a footer as well.
//! 6.  A block of 5000 is allocated.
//!     ```text
//!     prologue  USED 80  USED 5024  FREE 4016  epilogue
//!     ```
//!     No free block is large enough. The region is grown by the needed size
//!     (but at least 4096 bytes). The new memory replaces the old epilogue and
//!     is merged with the free block at the end of the heap before the
//!     allocation is placed into it.
//!
//! The allocator never gives memory back to the region.
//!
//! # Logging
//! The crate emits [`log`] records (initialization, growth, splitting and
//! merging of blocks). Those are created while the lock of the [`Allocator`]
//! is held, so a logger used together with it must not allocate.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]

mod raw_allocator;
pub mod region;

pub use raw_allocator::{
    Block, Corruption, Payload, RawAllocator, State, Stats, ALIGNMENT, CHUNK_SIZE,
    MIN_BLOCK_SIZE, MIN_HEAP_SIZE, WORD,
};
pub use region::{OutOfMemory, Region, SliceRegion, StaticRegion};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use log::trace;
use region::{Memory, Window};
use spin::{Mutex, MutexGuard};

/// The memory allocator for `#![no_std]`-systems.
///
/// This is an allocator with a predefined maximum heap size. The heap memory
/// is part of the allocator itself, so it is accounted to the static memory
/// (it lands in the `.bss`-section). The heap starts out small and grows in
/// steps of at least [`CHUNK_SIZE`] bytes up to `N` bytes.
///
/// All operations are serialized by a spin lock, so the allocator can be
/// shared between threads or cores. It must not be used from an interrupt
/// handler, that might interrupt an allocation on the same core, though.
///
/// Its usage is simple: just copy and paste the following in the binary crate
/// you're developing. The memory size of the heap is `65536` or 64K in this
/// example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: tagalloc::Allocator<65536> = tagalloc::Allocator::new();
/// ```
/// Payloads are aligned to [`ALIGNMENT`]. Allocations with a larger alignment
/// take `align` bytes more from the heap: the returned pointer is moved
/// forward to the next boundary and the distance is stored in the word in
/// front of it.
pub struct Allocator<const N: usize> {
    memory: Memory<N>,
    heap: Mutex<RawAllocator<Window>>,
}
impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied heap size, i.e. `N` is less
    /// than [`MIN_HEAP_SIZE`] (`4128`) or not divisible by `16`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= MIN_HEAP_SIZE, "too small heap memory: minimum size is 4128");
        assert!(N % ALIGNMENT == 0, "heap size has to be divisible by 16");
        Self {
            memory: Memory::new(),
            heap: Mutex::new(RawAllocator::new(Window::detached())),
        }
    }

    /// Gather usage statistics of the heap.
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// Lock the heap and point it to the memory of this allocator.
    ///
    /// The memory lives outside of the lock, since locking hands out an
    /// exclusive reference to everything inside of it. That would invalidate
    /// the pointers handed out so far.
    fn lock(&self) -> MutexGuard<'_, RawAllocator<Window>> {
        let mut heap = self.heap.lock();
        // SAFETY: the memory belongs to `self` and is aligned to 16. It is
        // attached again on every access, so a moved allocator keeps working
        // on its own memory (including the blocks granted so far).
        unsafe { heap.region_mut().attach(self.memory.as_ptr(), N) };
        heap
    }
}
impl<const N: usize> Default for Allocator<N> {
    fn default() -> Self {
        Self::new()
    }
}
// SAFETY: the heap metadata is only touched with the lock held. The payloads
// are handed out to the callers of `alloc()` and never accessed by the
// allocator until they are given back.
unsafe impl<const N: usize> Sync for Allocator<N> {}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return ptr::null_mut();
        }

        let mut heap = self.lock();
        if !heap.is_initialized() && heap.init().is_err() {
            return ptr::null_mut();
        }

        let align = layout.align();
        if align <= ALIGNMENT {
            return match heap.alloc(layout.size()) {
                Some(block) => heap.payload_ptr(block),
                None => ptr::null_mut(),
            };
        }

        let block = match layout.size().checked_add(align).and_then(|n| heap.alloc(n)) {
            Some(block) => block,
            None => return ptr::null_mut(),
        };
        let payload = heap.payload_ptr(block);
        // payloads are aligned to 16, so the shift is in `16..=align`
        let shift = align - (payload as usize & (align - 1));
        // SAFETY: the block holds `align` bytes more than requested, so both
        // the shifted allocation and the word in front of it are part of the
        // payload. The word is aligned, since `align` is a multiple of 32.
        let aligned = payload.add(shift);
        aligned.cast::<usize>().sub(1).write(shift);
        trace!("over-aligned allocation shifted by {} bytes", shift);
        aligned
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let ptr = if layout.align() > ALIGNMENT && !ptr.is_null() {
            // SAFETY: `ptr` was returned by `alloc()` with the same layout,
            // which stored the shift right in front of it.
            let shift = ptr.cast::<usize>().sub(1).read();
            ptr.sub(shift)
        } else {
            ptr
        };

        let mut heap = self.lock();
        let block = heap.payload_at(ptr);
        heap.free(block);
    }
}
