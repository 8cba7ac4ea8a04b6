use core::ops::{Deref, DerefMut};

use super::entry::Entry;
use super::WORD;
use crate::region::Region;

/// The offset of a block's payload inside the heap region.
///
/// Handles are only produced by the allocator, so they always point just past
/// a header written by it (as long as the block wasn't freed in between).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(usize);
impl Payload {
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// The byte offset of the payload from the start of the heap region.
    pub const fn offset(self) -> usize {
        self.0
    }

    /// The offset of the header tag of this block.
    const fn header(self) -> usize {
        self.0 - WORD
    }
}

/// A view of the heap region, that knows how to read and write boundary tags.
///
/// All navigation happens relative to [`Payload`]s and uses only the sizes
/// stored in the tags. There are no semantic bounds checks: the prologue and
/// epilogue make sure, that the walk never leaves the heap on a well-formed
/// heap. Every tag access is checked against the size of the region though,
/// so a corrupted heap panics instead of touching foreign memory.
///
/// Reading needs a shared reference to the region, writing an exclusive one.
#[derive(Clone, Copy)]
pub struct Buffer<M>(M);
impl<M: Deref> Buffer<M>
where
    M::Target: Region,
{
    /// Wrap a heap region.
    pub const fn new(region: M) -> Self {
        Self(region)
    }

    /// Check, that a tag at the given offset is aligned and in bounds and
    /// return its address.
    fn tag(&self, offset: usize) -> *mut [u8; WORD] {
        assert!(offset % WORD == 0, "unaligned tag offset {}", offset);
        assert!(
            offset < self.0.size() && WORD <= self.0.size() - offset,
            "tag offset {} out of bounds",
            offset
        );
        // SAFETY: the offset is inside of the granted bytes (asserted above),
        // so the resulting pointer stays within the region's memory.
        unsafe { self.0.base().add(offset).cast() }
    }

    /// Read the tag at the given byte offset.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of 8 or the tag
    /// would extend past the end of the region.
    pub fn at(&self, offset: usize) -> Entry {
        let tag = self.tag(offset);
        // SAFETY: `tag()` checked that all eight bytes are granted, so the
        // region contract makes them valid for reads. The tag is a byte array,
        // so there is no alignment requirement.
        Entry::from_raw(unsafe { tag.read() })
    }

    /// The header tag of the given block.
    pub fn header(&self, block: Payload) -> Entry {
        self.at(block.header())
    }

    /// The footer tag of the given block.
    pub fn footer(&self, block: Payload) -> Entry {
        self.at(self.footer_offset(block))
    }

    /// The footer tag of the block directly in front of the given one.
    pub fn previous_footer(&self, block: Payload) -> Entry {
        self.at(block.0 - 2 * WORD)
    }

    fn footer_offset(&self, block: Payload) -> usize {
        block.header() + self.header(block).size() - WORD
    }

    /// The block following the given one.
    ///
    /// For the last block this is the epilogue, whose header sits in the last
    /// word of the heap.
    pub fn next(&self, block: Payload) -> Payload {
        Payload(block.0 + self.header(block).size())
    }

    /// The block preceding the given one.
    ///
    /// For the first block this is the prologue.
    pub fn previous(&self, block: Payload) -> Payload {
        Payload(block.0 - self.previous_footer(block).size())
    }
}
impl<'region, R: Region> Buffer<&'region R> {
    /// Iterate over the blocks starting at `first` up to (excluding) the
    /// epilogue.
    pub fn blocks(self, first: Payload) -> BlockIter<'region, R> {
        BlockIter {
            buffer: self,
            current: first,
        }
    }
}
impl<M: DerefMut> Buffer<M>
where
    M::Target: Region,
{
    /// Write a tag at the given byte offset.
    ///
    /// # Panics
    /// This function panics if the offset is not a multiple of 8 or the tag
    /// would extend past the end of the region.
    pub fn set_at(&mut self, offset: usize, entry: Entry) {
        let tag = self.tag(offset);
        // SAFETY: same as `at()`, the region is borrowed exclusively, so
        // nobody reads the tag concurrently.
        unsafe { tag.write(entry.as_raw()) };
    }

    /// Write the header and footer of a block.
    ///
    /// The footer position is derived from the size of the new `entry`, not
    /// from the current header, so this both retags and resizes a block.
    pub fn set(&mut self, block: Payload, entry: Entry) {
        self.set_at(block.header(), entry);
        self.set_at(block.header() + entry.size() - WORD, entry);
    }

    /// Write only the header of a block (used for the epilogue).
    pub fn set_header(&mut self, block: Payload, entry: Entry) {
        self.set_at(block.header(), entry);
    }
}

/// Iterator over the blocks of a [`Buffer`], see [`Buffer::blocks()`].
pub struct BlockIter<'region, R> {
    buffer: Buffer<&'region R>,
    current: Payload,
}
impl<'region, R: Region> Iterator for BlockIter<'region, R> {
    type Item = (Payload, Entry);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current;
        let entry = self.buffer.header(block);
        if entry.size() == 0 {
            return None;
        }
        self.current = Payload(block.0 + entry.size());
        Some((block, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, Entry, Payload};
    use crate::region::{Region, StaticRegion};
    use test_log::test;

    /// A region laid out like a freshly initialized heap with two blocks:
    /// padding, prologue, a used block of 32, a free block of 48, epilogue.
    fn sample() -> StaticRegion<112> {
        let mut region = StaticRegion::new();
        region.grow(112).unwrap();
        let mut buffer = Buffer::new(&mut region);
        buffer.set_at(0, Entry::PADDING);
        buffer.set(Payload(16), Entry::used(16));
        buffer.set(Payload(32), Entry::used(32));
        buffer.set(Payload(64), Entry::free(48));
        buffer.set_header(Payload(112), Entry::used(0));
        region
    }

    #[test]
    fn header_and_footer_agree() {
        let region = sample();
        let buffer = Buffer::new(&region);
        assert_eq!(buffer.header(Payload(32)), Entry::used(32));
        assert_eq!(buffer.footer(Payload(32)), Entry::used(32));
        assert_eq!(buffer.at(48), Entry::used(32));
        assert_eq!(buffer.header(Payload(64)), Entry::free(48));
        assert_eq!(buffer.footer(Payload(64)), Entry::free(48));
        assert_eq!(buffer.at(96), Entry::free(48));
    }

    #[test]
    fn prologue_footer_is_at_its_payload() {
        let region = sample();
        let buffer = Buffer::new(&region);
        assert_eq!(buffer.at(8), Entry::used(16));
        assert_eq!(buffer.at(16), Entry::used(16));
        assert_eq!(buffer.footer(Payload(16)), Entry::used(16));
    }

    #[test]
    fn navigation() {
        let region = sample();
        let buffer = Buffer::new(&region);
        assert_eq!(buffer.next(Payload(16)), Payload(32));
        assert_eq!(buffer.next(Payload(32)), Payload(64));
        assert_eq!(buffer.next(Payload(64)), Payload(112));
        assert_eq!(buffer.previous(Payload(112)), Payload(64));
        assert_eq!(buffer.previous(Payload(64)), Payload(32));
        assert_eq!(buffer.previous(Payload(32)), Payload(16));
        assert_eq!(buffer.previous_footer(Payload(64)), Entry::used(32));
    }

    #[test]
    fn block_iter() {
        let region = sample();
        let mut iter = Buffer::new(&region).blocks(Payload(32));
        assert_eq!(iter.next(), Some((Payload(32), Entry::used(32))));
        assert_eq!(iter.next(), Some((Payload(64), Entry::free(48))));
        assert_eq!(iter.next(), None);

        assert_eq!(Buffer::new(&region).blocks(Payload(112)).count(), 0);
    }

    #[test]
    fn resizing_moves_the_footer() {
        let mut region = sample();
        Buffer::new(&mut region).set(Payload(32), Entry::free(80));
        let buffer = Buffer::new(&region);
        assert_eq!(buffer.footer(Payload(32)), Entry::free(80));
        assert_eq!(buffer.at(96), Entry::free(80));
        assert_eq!(buffer.next(Payload(32)), Payload(112));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn reading_past_the_end() {
        let region = sample();
        Buffer::new(&region).at(112);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn reading_beyond_the_break() {
        // the memory is there, but it wasn't granted yet
        let mut region = StaticRegion::<64>::new();
        region.grow(32).unwrap();
        Buffer::new(&region).at(32);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn unaligned_access() {
        let region = sample();
        Buffer::new(&region).at(12);
    }
}
