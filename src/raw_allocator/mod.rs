//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific memory
//! size and hands out [`Payload`]s inside of its [`Region`]. It knows nothing
//! about [`Layout`](core::alloc::Layout)s or locking: the
//! [`Allocator`](crate::Allocator) builds on top of it for that.
mod buffer;
mod check;
mod entry;

pub use buffer::Payload;
pub use check::{Block, Corruption, Stats};
pub use entry::State;

use core::slice;

use buffer::Buffer;
use entry::Entry;
use log::{debug, trace};

use crate::region::{OutOfMemory, Region};

/// The size of a boundary tag (header or footer) in bytes.
pub const WORD: usize = 8;
/// The alignment of every block and therefore of every payload.
pub const ALIGNMENT: usize = 16;
/// The minimum number of bytes requested from the region when growing.
pub const CHUNK_SIZE: usize = 4096;
/// The smallest block, that may exist on its own. A free block is only split
/// if the remainder would be larger than this.
pub const MIN_BLOCK_SIZE: usize = 2 * ALIGNMENT;
/// The number of bytes a region has to provide for [`RawAllocator::init()`]
/// to succeed: the sentinels and the first chunk.
pub const MIN_HEAP_SIZE: usize = 4 * WORD + CHUNK_SIZE;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
fn align(size: usize) -> Option<usize> {
    size.checked_add(ALIGNMENT - 1).map(|size| size & !(ALIGNMENT - 1))
}

/// A boundary-tag allocator over a growing [`Region`].
///
/// Every block carries its size and state twice: in a header in front of the
/// payload and in a footer after it. This allows to reach both neighbors of a
/// block in constant time, which is needed to merge a freed block with free
/// blocks on either side. The heap is framed by two sentinels, which are
/// always "used": a prologue at the start and an epilogue header at the end.
/// ```text
/// pad  hdr  ftr  hdr  ....payload.... ftr  hdr  ..free..  ftr  hdr
/// ^--- ^-------  ^------------------------ ^-------------------- ^---
/// 0    prologue  USED size = 128           FREE size = 3968      epilogue
/// ```
/// Allocation searches the blocks linearly for the first free one large
/// enough (first-fit). If there is none, the region is grown by at least
/// [`CHUNK_SIZE`] bytes.
pub struct RawAllocator<R> {
    region: R,
    prologue: Option<Payload>,
}
impl<R> RawAllocator<R> {
    /// Create a new, uninitialized [`RawAllocator`] over the given region.
    ///
    /// Call [`init()`](Self::init) before allocating.
    pub const fn new(region: R) -> Self {
        Self {
            region,
            prologue: None,
        }
    }

    /// Whether [`init()`](Self::init) has laid out the sentinels.
    pub const fn is_initialized(&self) -> bool {
        self.prologue.is_some()
    }

    /// Access the underlying region.
    pub const fn region(&self) -> &R {
        &self.region
    }

    pub(crate) fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }
}
impl<R: Region> RawAllocator<R> {
    fn buffer(&self) -> Buffer<&R> {
        Buffer::new(&self.region)
    }

    fn buffer_mut(&mut self) -> Buffer<&mut R> {
        Buffer::new(&mut self.region)
    }

    /// Initialize the heap.
    ///
    /// This lays out the prologue and the epilogue and grows the heap by
    /// [`CHUNK_SIZE`] bytes to create the first free block. If the sentinels
    /// can be written but the first chunk can't be obtained, the heap is still
    /// usable (it just has no free block yet) but the error is reported.
    ///
    /// Calling this on an initialized heap does nothing.
    pub fn init(&mut self) -> Result<(), OutOfMemory> {
        if self.is_initialized() {
            return Ok(());
        }

        let start = self.region.grow(4 * WORD).map_err(|error| {
            debug!("no memory for the heap sentinels");
            error
        })?;
        debug_assert!(start % ALIGNMENT == 0, "heap start is unaligned");

        let prologue = Payload::new(start + 2 * WORD);
        let epilogue = Payload::new(start + 4 * WORD);
        let mut buffer = self.buffer_mut();
        buffer.set_at(start, Entry::PADDING);
        buffer.set(prologue, Entry::used(2 * WORD));
        buffer.set_header(epilogue, Entry::used(0));
        self.prologue = Some(prologue);

        self.extend_heap(CHUNK_SIZE / WORD)?;
        debug!("heap initialized at offset {}", start);
        Ok(())
    }

    /// Allocate a new memory block with room for at least `n` bytes.
    ///
    /// The returned payload is aligned to [`ALIGNMENT`] relative to the start
    /// of the region. `None` is returned for a request of zero bytes, on an
    /// uninitialized heap and if the region cannot grow any further.
    pub fn alloc(&mut self, n: usize) -> Option<Payload> {
        if n == 0 {
            return None;
        }
        let prologue = match self.prologue {
            Some(prologue) => prologue,
            None => {
                debug!("allocation on an uninitialized heap");
                return None;
            }
        };
        let size = n.checked_add(2 * WORD).and_then(align)?;

        let block = match self.find_fit(prologue, size) {
            Some(block) => block,
            None => self.extend_heap(size.max(CHUNK_SIZE) / WORD).ok()?,
        };
        self.place(block, size);
        Some(block)
    }

    /// Release a block previously returned by [`alloc()`](Self::alloc).
    ///
    /// The block is merged with its neighbors, if they are free. Releasing
    /// `None` does nothing.
    ///
    /// The block must be live, i.e. allocated from this heap and not released
    /// since. This is not checked: releasing a stale handle corrupts the heap
    /// metadata (but never touches memory outside of the region).
    pub fn free(&mut self, block: Option<Payload>) {
        let block = match block {
            Some(block) => block,
            None => return,
        };
        let mut buffer = self.buffer_mut();
        let size = buffer.header(block).size();
        buffer.set(block, Entry::free(size));
        self.coalesce(block);
    }

    /// The number of bytes usable by the owner of the block.
    pub fn usable_size(&self, block: Payload) -> usize {
        self.buffer().header(block).size().saturating_sub(2 * WORD)
    }

    /// The payload bytes of a block.
    ///
    /// # Panics
    /// This function panics if the header of the block claims more memory
    /// than the region holds, which only happens for stale handles.
    pub fn memory_of(&self, block: Payload) -> &[u8] {
        let size = self.payload_size(block);
        // SAFETY: the payload lies inside of the granted bytes (checked by
        // `payload_size()`). The returned slice borrows the allocator, so no
        // tag can be written while it is alive.
        unsafe { slice::from_raw_parts(self.payload_ptr(block), size) }
    }

    /// The payload bytes of a block, mutably.
    ///
    /// # Panics
    /// See [`memory_of()`](Self::memory_of).
    pub fn memory_of_mut(&mut self, block: Payload) -> &mut [u8] {
        let size = self.payload_size(block);
        // SAFETY: same as `memory_of()`, the allocator is borrowed
        // exclusively, so the slice is the only access to these bytes.
        unsafe { slice::from_raw_parts_mut(self.payload_ptr(block), size) }
    }

    /// The usable size of the block, checked against the end of the region.
    fn payload_size(&self, block: Payload) -> usize {
        let size = self.usable_size(block);
        let end = block.offset().checked_add(size);
        assert!(
            matches!(end, Some(end) if end <= self.region.size()),
            "block {} exceeds the heap",
            block.offset()
        );
        size
    }

    /// The address of the payload of a block.
    ///
    /// The pointer is derived from the base pointer of the region, so it stays
    /// usable while the allocator keeps working on other blocks.
    pub fn payload_ptr(&self, block: Payload) -> *mut u8 {
        self.region.base().wrapping_add(block.offset())
    }

    /// Map an address inside of the region back to the block payload starting
    /// there.
    ///
    /// Only the location is checked: `None` is returned for null, for
    /// addresses outside of the heap and for addresses, which can't be a
    /// payload because of their alignment.
    pub fn payload_at(&self, ptr: *const u8) -> Option<Payload> {
        let prologue = self.prologue?;
        let offset = (ptr as usize).checked_sub(self.region.base() as usize)?;
        let plausible =
            offset > prologue.offset() && offset < self.region.size() && offset % ALIGNMENT == 0;
        plausible.then(|| Payload::new(offset))
    }

    /// Grow the heap by (at least) `words` words and return the free block at
    /// the end of the heap.
    ///
    /// The size is rounded up to an even number of words to keep the
    /// alignment. The new block takes the place of the old epilogue and is
    /// merged with the previous block, if that one is free.
    fn extend_heap(&mut self, words: usize) -> Result<Payload, OutOfMemory> {
        let size = (words + words % 2) * WORD;
        let start = self.region.grow(size).map_err(|error| {
            debug!("failed to grow the heap by {} bytes", size);
            error
        })?;
        trace!("heap grown by {} bytes at offset {}", size, start);

        // the old epilogue header becomes the header of the new block
        let block = Payload::new(start);
        let mut buffer = self.buffer_mut();
        buffer.set(block, Entry::free(size));
        let epilogue = buffer.next(block);
        buffer.set_header(epilogue, Entry::used(0));

        Ok(self.coalesce(block))
    }

    /// Find the first free block with at least `size` bytes (first-fit).
    fn find_fit(&self, prologue: Payload, size: usize) -> Option<Payload> {
        let buffer = self.buffer();
        buffer
            .blocks(buffer.next(prologue))
            .find(|(_, entry)| entry.is_free() && entry.size() >= size)
            .map(|(block, _)| block)
    }

    /// Mark the free `block` as used, splitting off the tail as a new free
    /// block if it is large enough.
    fn place(&mut self, block: Payload, size: usize) {
        let mut buffer = self.buffer_mut();
        let available = buffer.header(block).size();
        if available - size > MIN_BLOCK_SIZE {
            buffer.set(block, Entry::used(size));
            let remainder = buffer.next(block);
            buffer.set(remainder, Entry::free(available - size));
            trace!("split block {}: {} used, {} free", block.offset(), size, available - size);
        } else {
            buffer.set(block, Entry::used(available));
        }
    }

    /// Merge the free `block` with its free neighbors.
    ///
    /// Only the outermost header and footer of the merged block are written.
    /// Returns the merged block, which starts at the lowest address involved.
    fn coalesce(&mut self, block: Payload) -> Payload {
        let mut buffer = self.buffer_mut();
        let next = buffer.next(block);
        let previous_free = buffer.previous_footer(block).is_free();
        let next_free = buffer.header(next).is_free();
        let size = buffer.header(block).size();

        match (previous_free, next_free) {
            (false, false) => block,
            (false, true) => {
                let size = size + buffer.header(next).size();
                buffer.set(block, Entry::free(size));
                trace!("merged block {} with its successor", block.offset());
                block
            }
            (true, false) => {
                let previous = buffer.previous(block);
                let size = size + buffer.header(previous).size();
                buffer.set(previous, Entry::free(size));
                trace!("merged block {} with its predecessor", block.offset());
                previous
            }
            (true, true) => {
                let previous = buffer.previous(block);
                let size = size + buffer.header(previous).size() + buffer.header(next).size();
                buffer.set(previous, Entry::free(size));
                trace!("merged block {} with both neighbors", block.offset());
                previous
            }
        }
    }
}
