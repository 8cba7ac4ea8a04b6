//! Walking and validating the heap.
use core::fmt;

use super::buffer::Payload;
use super::entry::{Entry, State};
use super::{RawAllocator, ALIGNMENT, MIN_BLOCK_SIZE, WORD};
use crate::region::Region;

/// A block of the heap as seen by [`RawAllocator::blocks()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// The payload of the block.
    pub payload: Payload,
    /// The total size of the block including its header and footer.
    pub size: usize,
    /// Whether the block is free or in use.
    pub state: State,
}

/// Usage statistics of a heap, see [`RawAllocator::stats()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// The number of bytes obtained from the region so far.
    pub heap_size: usize,
    /// The number of used blocks.
    pub used_blocks: usize,
    /// The total size of all used blocks.
    pub used_bytes: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of all free blocks.
    pub free_bytes: usize,
    /// The size of the largest free block.
    pub largest_free: usize,
}

/// An inconsistency found by [`RawAllocator::check()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The heap was never initialized.
    NotInitialized,
    /// The prologue was overwritten.
    Prologue,
    /// A block payload is not aligned.
    Misaligned { offset: usize },
    /// A block is too small or extends past the end of the heap.
    Size { offset: usize, size: usize },
    /// The header and footer of a block differ.
    TagMismatch { offset: usize },
    /// Two adjacent blocks are both free.
    Uncoalesced { offset: usize },
    /// The block chain doesn't end in an epilogue at the end of the heap.
    Epilogue { offset: usize },
}
impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NotInitialized => f.write_str("heap is not initialized"),
            Self::Prologue => f.write_str("prologue is damaged"),
            Self::Misaligned { offset } => write!(f, "block at {} is misaligned", offset),
            Self::Size { offset, size } => {
                write!(f, "block at {} has an invalid size of {}", offset, size)
            }
            Self::TagMismatch { offset } => {
                write!(f, "header and footer of block at {} differ", offset)
            }
            Self::Uncoalesced { offset } => {
                write!(f, "free block at {} follows a free block", offset)
            }
            Self::Epilogue { offset } => write!(f, "no epilogue at {}", offset),
        }
    }
}

impl<R: Region> RawAllocator<R> {
    /// Iterate over all blocks between the prologue and the epilogue in
    /// address order.
    ///
    /// An uninitialized heap has no blocks.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.prologue
            .into_iter()
            .flat_map(move |prologue| {
                let buffer = self.buffer();
                buffer.blocks(buffer.next(prologue))
            })
            .map(|(payload, entry)| Block {
                payload,
                size: entry.size(),
                state: entry.state(),
            })
    }

    /// Gather usage statistics by walking the heap.
    pub fn stats(&self) -> Stats {
        let initial = Stats {
            heap_size: self.region.size(),
            ..Stats::default()
        };
        self.blocks().fold(initial, |mut stats, block| {
            match block.state {
                State::Used => {
                    stats.used_blocks += 1;
                    stats.used_bytes += block.size;
                }
                State::Free => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                    stats.largest_free = stats.largest_free.max(block.size);
                }
            }
            stats
        })
    }

    /// Validate the heap structure.
    ///
    /// This checks that the prologue is intact, that every block is aligned,
    /// at least [`MIN_BLOCK_SIZE`] bytes large and has matching tags, that no
    /// two free blocks are adjacent and that the epilogue sits right at the
    /// end of the heap. The walk is bounds checked, so it terminates on any
    /// heap contents.
    pub fn check(&self) -> Result<(), Corruption> {
        let prologue = self.prologue.ok_or(Corruption::NotInitialized)?;
        let buffer = self.buffer();
        let end = self.region.size();

        let sentinel = Entry::used(2 * WORD);
        if buffer.header(prologue) != sentinel || buffer.footer(prologue) != sentinel {
            return Err(Corruption::Prologue);
        }

        let mut previous_free = false;
        let mut block = buffer.next(prologue);
        loop {
            let offset = block.offset();
            if offset % ALIGNMENT != 0 {
                return Err(Corruption::Misaligned { offset });
            }
            if offset > end {
                return Err(Corruption::Epilogue { offset });
            }

            let header = buffer.header(block);
            let size = header.size();
            if size == 0 {
                return match header.state() {
                    State::Used if offset == end => Ok(()),
                    _ => Err(Corruption::Epilogue { offset }),
                };
            }
            if size < MIN_BLOCK_SIZE || size > end - offset {
                return Err(Corruption::Size { offset, size });
            }
            if buffer.footer(block) != header {
                return Err(Corruption::TagMismatch { offset });
            }
            if previous_free && header.is_free() {
                return Err(Corruption::Uncoalesced { offset });
            }

            previous_free = header.is_free();
            block = buffer.next(block);
        }
    }
}
