//! The virtual memory arena underneath the heap.
//!
//! The heap only talks to the arena through [`MeshArena`], so any backing that
//! can hand out page spans, resolve addresses and alias one span onto another's
//! physical pages can be substituted. [`MemfdArena`] is the Linux
//! implementation.

pub mod memfd;
pub mod page_map;

pub use memfd::MemfdArena;

use crate::slab::MiniHeapId;
use crate::util::{PAGE_SHIFT, PAGE_SIZE};

/// A run of contiguous arena pages, addressed by page offset from the arena
/// start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub offset: u32,
    pub length: u32,
}

impl Span {
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    #[inline]
    pub const fn byte_offset(&self) -> usize {
        (self.offset as usize) << PAGE_SHIFT
    }

    #[inline]
    pub const fn byte_length(&self) -> usize {
        (self.length as usize) << PAGE_SHIFT
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Split off the first `pages` pages. Returns `(head, rest)`.
    pub const fn split_at(self, pages: u32) -> (Span, Span) {
        debug_assert!(pages <= self.length);
        (
            Span::new(self.offset, pages),
            Span::new(self.offset + pages, self.length - pages),
        )
    }

    /// True if `other` starts exactly where `self` ends.
    pub const fn adjoins(&self, other: &Span) -> bool {
        self.offset + self.length == other.offset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidSize { requested: usize },
    Memfd { errno: i32 },
    Truncate { size: usize, errno: i32 },
    Map { size: usize, errno: i32 },
    PageMap { pages: usize },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidSize { requested } => write!(
                f,
                "arena size {} must be a non-zero multiple of {} bytes addressable in 32-bit pages",
                requested, PAGE_SIZE
            ),
            Self::Memfd { errno } => write!(f, "memfd_create failed (errno {})", errno),
            Self::Truncate { size, errno } => {
                write!(f, "sizing arena file to {} bytes failed (errno {})", size, errno)
            }
            Self::Map { size, errno } => {
                write!(f, "mapping {} byte arena failed (errno {})", size, errno)
            }
            Self::PageMap { pages } => write!(f, "mapping page map for {} pages failed", pages),
        }
    }
}

impl std::error::Error for Error {}

/// Capability interface the heap needs from its memory arena.
///
/// All mutating calls are made with the heap lock held; `owner_of` may be
/// called concurrently from the free path and must be lock-free.
pub trait MeshArena: Send + Sync {
    /// Start of the arena's virtual reservation.
    fn arena_begin(&self) -> *mut u8;

    /// Size of the reservation in bytes.
    fn arena_size(&self) -> usize;

    /// Hand out `pages` contiguous, page-aligned pages, or `None` when the
    /// arena is exhausted.
    fn page_alloc(&self, pages: usize) -> Option<Span>;

    /// Return a span. `meshed` spans currently alias another span's pages and
    /// must have their own mapping restored first.
    fn free_span(&self, span: Span, meshed: bool);

    /// Record `id` as the owner of every page in `span`.
    fn track(&self, span: Span, id: MiniHeapId);

    /// Forget the owner of every page in `span`.
    fn untrack(&self, span: Span);

    /// Span owning the page that contains `ptr`.
    fn owner_of(&self, ptr: *const u8) -> Option<MiniHeapId>;

    /// Freeze `remove` so no writes land while its objects are copied into
    /// `keep`.
    ///
    /// # Safety
    /// Both pointers must be span starts inside this arena, `size` bytes long.
    unsafe fn begin_mesh(&self, keep: *mut u8, remove: *mut u8, size: usize);

    /// Release `remove`'s physical pages, alias its virtual range onto
    /// `keep`'s pages read-write, and point its page map entries at `keep`'s
    /// owner.
    ///
    /// Spans already aliased onto `remove`'s pages must be finalized before
    /// `remove` itself, or they read released pages in between.
    ///
    /// # Safety
    /// Same as [`MeshArena::begin_mesh`]; `begin_mesh` must have been called
    /// for this pair and the live objects already copied.
    unsafe fn finalize_mesh(&self, keep: *mut u8, remove: *mut u8, size: usize);

    /// Best-effort return of freed pages to the OS. Non-aggressive calls only
    /// act once enough dirty pages have accumulated.
    fn scavenge(&self, aggressive: bool);

    /// True when the arena already holds as many meshed spans as it is
    /// willing to map.
    fn above_mesh_threshold(&self) -> bool;

    /// Resident memory of the process in KiB.
    fn resident_kib(&self) -> usize;

    /// Most pages ever simultaneously freed by meshing.
    fn meshed_page_high_water_mark(&self) -> usize;

    #[inline]
    fn span_start(&self, span: Span) -> *mut u8 {
        unsafe { self.arena_begin().add(span.byte_offset()) }
    }

    #[inline]
    fn contains(&self, ptr: *const u8) -> bool {
        let begin = self.arena_begin() as usize;
        let addr = ptr as usize;
        addr >= begin && addr < begin + self.arena_size()
    }
}
