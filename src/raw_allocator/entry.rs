//! The boundary tag stored at both ends of every block.
use core::fmt;

/// The state of a memory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The block is available for allocation.
    Free,
    /// The block is handed out to a caller (or is one of the sentinels).
    Used,
}

/// A boundary tag: the size of a block and its [`State`] packed into a single
/// 8-byte word.
///
/// The size always is a multiple of the alignment (16), so the low four bits
/// are available for flags. Only the lowest one is used: it is set for used
/// blocks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(u64);
impl Entry {
    const USED_FLAG: u64 = 0x1;
    const SIZE_MASK: u64 = !0xf;

    /// The word written in front of the prologue to keep payloads aligned.
    pub const PADDING: Self = Self(0);

    /// Create a tag for a free block of the given total size.
    pub const fn free(size: usize) -> Self {
        Self::new(size, State::Free)
    }

    /// Create a tag for a used block of the given total size.
    pub const fn used(size: usize) -> Self {
        Self::new(size, State::Used)
    }

    const fn new(size: usize, state: State) -> Self {
        debug_assert!(size % 16 == 0, "block size not aligned");
        let flag = match state {
            State::Free => 0,
            State::Used => Self::USED_FLAG,
        };
        Self(size as u64 | flag)
    }

    /// Query the total size of the block (header and footer included).
    pub const fn size(self) -> usize {
        (self.0 & Self::SIZE_MASK) as usize
    }

    /// Query the state of the block.
    pub const fn state(self) -> State {
        if self.0 & Self::USED_FLAG == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    /// Shorthand for `entry.state() == State::Free`.
    pub const fn is_free(self) -> bool {
        matches!(self.state(), State::Free)
    }

    /// The in-memory representation of the tag.
    pub const fn as_raw(self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }

    /// Decode a tag from its in-memory representation.
    pub const fn from_raw(raw: [u8; 8]) -> Self {
        Self(u64::from_ne_bytes(raw))
    }
}
impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}
