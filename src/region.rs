//! The memory the heap grows into.
//!
//! The allocator never obtains memory by itself. Instead it asks a [`Region`]
//! for more bytes whenever it runs out of free blocks, similar to what
//! `sbrk(2)` does for a classic Unix `malloc`. Two regions are provided:
//! [`StaticRegion`], which embeds the memory inline (suitable for a `static`)
//! and [`SliceRegion`], which grows into memory handed over at runtime (e.g.
//! by a boot loader).
//!
//! Regions are addressed through a raw base pointer instead of slices. The
//! payloads of a heap are handed out as pointers as well, so the allocator
//! must never create a reference spanning the whole heap: that would
//! invalidate every pointer handed out before.
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;

use crate::raw_allocator::ALIGNMENT;

/// The heap region could not be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("heap region exhausted")
    }
}

/// A contiguous memory region, that grows at its end.
///
/// # Safety
/// The allocator reads and writes the granted bytes through the pointer
/// returned by [`base()`](Self::base). Implementors have to guarantee:
/// - `base()` is valid for reads and writes of `size()` bytes, even if only
///   a shared reference to the region exists, and nothing else accesses
///   those bytes except through pointers derived from `base()`,
/// - `base()` is aligned to 16 bytes, so that payload addresses are aligned
///   as well,
/// - the bytes returned by `grow()` directly follow all previously granted
///   bytes, i.e. `grow()` returns the previous `size()`,
/// - granted bytes are never reused or taken away and keep their contents,
///   also if the region itself is moved.
pub unsafe trait Region {
    /// Extend the region by `increment` bytes.
    ///
    /// On success the offset of the first new byte is returned. On failure
    /// the region stays unchanged.
    fn grow(&mut self, increment: usize) -> Result<usize, OutOfMemory>;

    /// The address of the first byte of the region.
    fn base(&self) -> *mut u8;

    /// The number of bytes granted so far.
    fn size(&self) -> usize;
}

/// Move the break by `increment` bytes, if it stays within `capacity`.
fn bump(brk: &mut usize, capacity: usize, increment: usize) -> Result<usize, OutOfMemory> {
    if increment > capacity - *brk {
        return Err(OutOfMemory);
    }
    let old = *brk;
    *brk += increment;
    Ok(old)
}

/// `N` bytes of zeroed memory, that may be written through shared references.
#[repr(align(16))]
pub(crate) struct Memory<const N: usize>(UnsafeCell<[u8; N]>);
impl<const N: usize> Memory<N> {
    pub(crate) const fn new() -> Self {
        Self(UnsafeCell::new([0; N]))
    }

    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}

/// A region of `N` bytes embedded directly into the value.
///
/// The memory is zero-initialized, which places a `static` containing this
/// region into `.bss` instead of `.data` (so it doesn't occupy flash space).
pub struct StaticRegion<const N: usize> {
    memory: Memory<N>,
    brk: usize,
}
impl<const N: usize> StaticRegion<N> {
    /// Create a new, empty region.
    pub const fn new() -> Self {
        Self {
            memory: Memory::new(),
            brk: 0,
        }
    }

    /// The total number of bytes this region can ever grant.
    pub const fn capacity(&self) -> usize {
        N
    }
}
impl<const N: usize> Default for StaticRegion<N> {
    fn default() -> Self {
        Self::new()
    }
}
// SAFETY: the memory is owned by the region and sits in an `UnsafeCell`, so
// the pointer may be written through with a shared reference. `Memory` is
// aligned to 16 and moving the region moves the contents along.
unsafe impl<const N: usize> Region for StaticRegion<N> {
    fn grow(&mut self, increment: usize) -> Result<usize, OutOfMemory> {
        bump(&mut self.brk, N, increment)
    }

    fn base(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    fn size(&self) -> usize {
        self.brk
    }
}

/// A region over memory owned by someone else, addressed by a raw pointer.
///
/// The [`Allocator`](crate::Allocator) keeps its memory outside of its lock
/// and attaches the window on every access, as the allocator might have been
/// moved in between.
pub(crate) struct Window {
    base: *mut u8,
    capacity: usize,
    brk: usize,
}
impl Window {
    /// A window without memory. It has to be attached before growing.
    pub(crate) const fn detached() -> Self {
        Self {
            base: ptr::null_mut(),
            capacity: 0,
            brk: 0,
        }
    }

    /// Point the window to the given memory, keeping the current break.
    ///
    /// # Safety
    /// `base` has to be aligned to 16 and valid for reads and writes of
    /// `capacity` bytes for as long as the window is used. The bytes below
    /// the break have to hold the contents granted so far.
    pub(crate) unsafe fn attach(&mut self, base: *mut u8, capacity: usize) {
        debug_assert!(self.brk <= capacity);
        self.base = base;
        self.capacity = capacity;
    }
}
// SAFETY: the window is only an address. Whoever attaches it owns the memory
// and serializes the accesses.
unsafe impl Send for Window {}
// SAFETY: guaranteed by the contract of `attach()`.
unsafe impl Region for Window {
    fn grow(&mut self, increment: usize) -> Result<usize, OutOfMemory> {
        bump(&mut self.brk, self.capacity, increment)
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    fn size(&self) -> usize {
        self.brk
    }
}

/// A region growing into a borrowed slice of memory.
pub struct SliceRegion<'memory> {
    window: Window,
    _memory: PhantomData<&'memory mut [u8]>,
}
impl<'memory> SliceRegion<'memory> {
    /// Create a region over the given memory.
    ///
    /// Leading bytes are skipped until the first 16-byte boundary, so the
    /// usable capacity might be up to 15 bytes smaller than the slice.
    pub fn new(memory: &'memory mut [u8]) -> Self {
        let skip = memory.as_ptr().align_offset(ALIGNMENT).min(memory.len());
        let memory = &mut memory[skip..];
        let mut window = Window::detached();
        // SAFETY: the slice is borrowed mutably for `'memory`, which outlives
        // the region, and its start was aligned above.
        unsafe { window.attach(memory.as_mut_ptr(), memory.len()) };
        Self {
            window,
            _memory: PhantomData,
        }
    }

    /// The total number of bytes this region can ever grant.
    pub fn capacity(&self) -> usize {
        self.window.capacity
    }
}
// SAFETY: the exclusive borrow of the memory is held by the region.
unsafe impl<'memory> Region for SliceRegion<'memory> {
    fn grow(&mut self, increment: usize) -> Result<usize, OutOfMemory> {
        self.window.grow(increment)
    }

    fn base(&self) -> *mut u8 {
        self.window.base()
    }

    fn size(&self) -> usize {
        self.window.size()
    }
}
