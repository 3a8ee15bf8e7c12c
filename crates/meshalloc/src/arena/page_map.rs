//! Flat table mapping every arena page to the span that owns it.
//!
//! The arena is one contiguous reservation, so a page's index is simply its
//! offset from the arena start shifted by `PAGE_SHIFT`. Each entry is an
//! `AtomicU32` holding `id + 1` of the owning `MiniHeap` (0 = untracked),
//! which lets `free` resolve a pointer without taking the heap lock. The top
//! bit marks pages whose virtual range aliases another span's memory.
//!
//! The table is mmap'd and zero-filled by the kernel; only pages of the table
//! that cover touched arena pages consume physical memory.

use crate::platform;
use crate::slab::MiniHeapId;
use crate::util::{align_up, PAGE_SIZE};
use core::sync::atomic::{AtomicU32, Ordering};

const UNTRACKED: u32 = 0;
const ALIASED: u32 = 1 << 31;

pub struct PageMap {
    entries: *mut AtomicU32,
    num_pages: usize,
    mapped_bytes: usize,
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl PageMap {
    /// Map a table for `num_pages` pages. Returns `None` if the mapping fails.
    pub fn new(num_pages: usize) -> Option<Self> {
        let bytes = num_pages.checked_mul(core::mem::size_of::<AtomicU32>())?;
        let mapped_bytes = align_up(bytes.max(1), PAGE_SIZE);
        // mmap returns zeroed memory, and AtomicU32(0) is UNTRACKED
        let mem = unsafe { platform::map_anonymous(mapped_bytes) };
        if mem.is_null() {
            return None;
        }
        Some(PageMap {
            entries: mem as *mut AtomicU32,
            num_pages,
            mapped_bytes,
        })
    }

    #[inline(always)]
    fn entry(&self, page: usize) -> &AtomicU32 {
        debug_assert!(page < self.num_pages);
        unsafe { &*self.entries.add(page) }
    }

    #[inline(always)]
    fn encode(id: Option<MiniHeapId>) -> u32 {
        match id {
            Some(id) => id.index() + 1,
            None => UNTRACKED,
        }
    }

    #[inline(always)]
    fn decode(raw: u32) -> Option<MiniHeapId> {
        let raw = raw & !ALIASED;
        if raw == UNTRACKED {
            None
        } else {
            Some(MiniHeapId::new(raw - 1))
        }
    }

    /// Point `count` pages starting at `first_page` at `id` (or clear them).
    pub fn set_range(&self, first_page: usize, count: usize, id: Option<MiniHeapId>) {
        let packed = Self::encode(id);
        let end = (first_page + count).min(self.num_pages);
        for page in first_page..end {
            self.entry(page).store(packed, Ordering::Release);
        }
    }

    /// Point `count` pages at `id` and flag them as aliasing `id`'s memory.
    pub fn set_range_aliased(&self, first_page: usize, count: usize, id: Option<MiniHeapId>) {
        let packed = Self::encode(id) | ALIASED;
        let end = (first_page + count).min(self.num_pages);
        for page in first_page..end {
            self.entry(page).store(packed, Ordering::Release);
        }
    }

    /// True if `page` was last set by [`PageMap::set_range_aliased`].
    pub fn is_aliased(&self, page: usize) -> bool {
        page < self.num_pages && self.entry(page).load(Ordering::Acquire) & ALIASED != 0
    }

    /// Owner of arena page `page`, if any.
    #[inline(always)]
    pub fn get(&self, page: usize) -> Option<MiniHeapId> {
        if page >= self.num_pages {
            return None;
        }
        Self::decode(self.entry(page).load(Ordering::Acquire))
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }
}

impl Drop for PageMap {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.entries as *mut u8, self.mapped_bytes) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untracked() {
        let map = PageMap::new(4096).unwrap();
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(4095), None);
        assert_eq!(map.get(4096), None, "out of range pages are untracked");
    }

    #[test]
    fn set_and_clear_range() {
        let map = PageMap::new(64).unwrap();
        let id = MiniHeapId::new(0);
        map.set_range(10, 4, Some(id));
        assert_eq!(map.get(9), None);
        assert_eq!(map.get(10), Some(id));
        assert_eq!(map.get(13), Some(id));
        assert_eq!(map.get(14), None);

        map.set_range(10, 4, None);
        assert_eq!(map.get(10), None);
    }

    #[test]
    fn aliased_flag_is_transparent_to_get() {
        let map = PageMap::new(16).unwrap();
        let id = MiniHeapId::new(5);
        map.set_range_aliased(4, 2, Some(id));
        assert_eq!(map.get(4), Some(id));
        assert!(map.is_aliased(5));
        assert!(!map.is_aliased(6));

        map.set_range(4, 2, None);
        assert!(!map.is_aliased(4));
        assert_eq!(map.get(4), None);
    }

    #[test]
    fn retarget_overwrites_owner() {
        let map = PageMap::new(16).unwrap();
        map.set_range(0, 2, Some(MiniHeapId::new(3)));
        map.set_range(0, 2, Some(MiniHeapId::new(7)));
        assert_eq!(map.get(1), Some(MiniHeapId::new(7)));
    }
}
