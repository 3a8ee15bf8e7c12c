//! Arena backed by one sparse memory file mapped `MAP_SHARED`.
//!
//! Arena byte offset N is file offset N until a span is meshed; meshing
//! remaps the source span's virtual range onto the destination's file offset
//! and punches a hole at the source's own offset, so two virtual spans share
//! one set of physical pages.

use super::page_map::PageMap;
use super::{Error, MeshArena, Span};
use crate::config::MeshConfig;
use crate::platform;
use crate::slab::MiniHeapId;
use crate::sync::Mutex;
use crate::util::{is_aligned, PAGE_SHIFT, PAGE_SIZE};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::os::fd::RawFd;

/// Free page runs not currently handed out.
struct SpanLists {
    /// First page never handed out.
    end: u32,
    /// Freed spans whose pages may still be resident.
    dirty: Vec<Span>,
    dirty_pages: usize,
    /// Spans with no physical backing.
    clean: Vec<Span>,
}

impl SpanLists {
    fn take_exact(list: &mut Vec<Span>, pages: u32) -> Option<Span> {
        let idx = list.iter().position(|s| s.length == pages)?;
        Some(list.swap_remove(idx))
    }

    fn take_fit(list: &mut Vec<Span>, pages: u32) -> Option<Span> {
        let idx = list.iter().position(|s| s.length >= pages)?;
        Some(list.swap_remove(idx))
    }

    /// Merge adjacent clean spans and give a trailing run back to the bump
    /// pointer.
    fn coalesce_clean(&mut self) {
        self.clean.sort_unstable_by_key(|s| s.offset);
        let mut merged: Vec<Span> = Vec::with_capacity(self.clean.len());
        for span in self.clean.drain(..) {
            match merged.last_mut() {
                Some(last) if last.adjoins(&span) => last.length += span.length,
                _ => merged.push(span),
            }
        }
        if let Some(last) = merged.last() {
            if last.offset + last.length == self.end {
                self.end = last.offset;
                merged.pop();
            }
        }
        self.clean = merged;
    }
}

pub struct MemfdArena {
    fd: RawFd,
    begin: *mut u8,
    size: usize,
    page_map: PageMap,
    spans: Mutex<SpanLists>,
    meshed_span_count: AtomicUsize,
    meshed_page_count: AtomicUsize,
    meshed_page_hwm: AtomicUsize,
    max_mesh_count: usize,
    dirty_page_threshold: usize,
}

unsafe impl Send for MemfdArena {}
unsafe impl Sync for MemfdArena {}

impl MemfdArena {
    /// Create and map an arena sized by `conf.arena_size`.
    pub fn new(conf: &MeshConfig) -> Result<Self, Error> {
        let size = conf.arena_size;
        let num_pages = size >> PAGE_SHIFT;
        if size == 0 || !is_aligned(size, PAGE_SIZE) || num_pages > u32::MAX as usize {
            return Err(Error::InvalidSize { requested: size });
        }

        let fd = platform::memfd_create(c"meshalloc-arena")
            .map_err(|errno| Error::Memfd { errno })?;
        if let Err(errno) = platform::ftruncate(fd, size) {
            platform::close(fd);
            return Err(Error::Truncate { size, errno });
        }

        let begin = unsafe { platform::map_shared(fd, size) };
        if begin.is_null() {
            let errno = platform::errno();
            platform::close(fd);
            return Err(Error::Map { size, errno });
        }

        let page_map = match PageMap::new(num_pages) {
            Some(map) => map,
            None => {
                unsafe { platform::unmap(begin, size) };
                platform::close(fd);
                return Err(Error::PageMap { pages: num_pages });
            }
        };

        tracing::debug!(size, ?begin, "arena mapped");

        Ok(Self {
            fd,
            begin,
            size,
            page_map,
            spans: Mutex::new(SpanLists {
                end: 0,
                dirty: Vec::new(),
                dirty_pages: 0,
                clean: Vec::new(),
            }),
            meshed_span_count: AtomicUsize::new(0),
            meshed_page_count: AtomicUsize::new(0),
            meshed_page_hwm: AtomicUsize::new(0),
            max_mesh_count: conf.max_mesh_count,
            dirty_page_threshold: conf.dirty_page_threshold,
        })
    }

    #[inline]
    fn offset_of(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr));
        ptr as usize - self.begin as usize
    }

    #[inline]
    fn total_pages(&self) -> u32 {
        (self.size >> PAGE_SHIFT) as u32
    }

    /// Pages currently held in the dirty list.
    pub fn dirty_page_count(&self) -> usize {
        self.spans.lock().dirty_pages
    }

    /// Spans currently aliased onto another span's pages.
    pub fn meshed_span_count(&self) -> usize {
        self.meshed_span_count.load(Ordering::Relaxed)
    }

    fn release_phys(&self, span: Span) {
        if let Err(errno) = platform::punch_hole(self.fd, span.byte_offset(), span.byte_length()) {
            tracing::warn!(?span, errno, "punching hole in arena file failed");
        }
    }
}

impl MeshArena for MemfdArena {
    #[inline]
    fn arena_begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    fn arena_size(&self) -> usize {
        self.size
    }

    fn page_alloc(&self, pages: usize) -> Option<Span> {
        if pages == 0 || pages > u32::MAX as usize {
            return None;
        }
        let pages = pages as u32;
        let mut lists = self.spans.lock();

        if let Some(span) = SpanLists::take_exact(&mut lists.dirty, pages) {
            lists.dirty_pages -= span.length as usize;
            return Some(span);
        }

        if let Some(span) = SpanLists::take_fit(&mut lists.clean, pages) {
            let (head, rest) = span.split_at(pages);
            if !rest.is_empty() {
                lists.clean.push(rest);
            }
            return Some(head);
        }

        let offset = lists.end;
        if offset.checked_add(pages)? > self.total_pages() {
            tracing::warn!(pages, "arena exhausted");
            return None;
        }
        lists.end = offset + pages;
        Some(Span::new(offset, pages))
    }

    fn free_span(&self, span: Span, meshed: bool) {
        if meshed {
            // Its own file pages were punched when it was meshed; point the
            // virtual range back at them so the span can be reused alone.
            let addr = self.span_start(span);
            let ok = unsafe { platform::remap_fixed(addr, span.byte_length(), self.fd, span.byte_offset()) };
            if !ok {
                tracing::warn!(?span, errno = platform::errno(), "resetting meshed span mapping failed");
            }
            self.meshed_span_count.fetch_sub(1, Ordering::Relaxed);
            self.meshed_page_count
                .fetch_sub(span.length as usize, Ordering::Relaxed);
            self.spans.lock().clean.push(span);
            return;
        }

        let mut lists = self.spans.lock();
        lists.dirty_pages += span.length as usize;
        lists.dirty.push(span);
    }

    #[inline]
    fn track(&self, span: Span, id: MiniHeapId) {
        self.page_map
            .set_range(span.offset as usize, span.length as usize, Some(id));
    }

    #[inline]
    fn untrack(&self, span: Span) {
        self.page_map
            .set_range(span.offset as usize, span.length as usize, None);
    }

    #[inline]
    fn owner_of(&self, ptr: *const u8) -> Option<MiniHeapId> {
        if !self.contains(ptr) {
            return None;
        }
        self.page_map.get(self.offset_of(ptr) >> PAGE_SHIFT)
    }

    unsafe fn begin_mesh(&self, _keep: *mut u8, remove: *mut u8, size: usize) {
        if !platform::protect_read(remove, size) {
            tracing::warn!(?remove, errno = platform::errno(), "write-protecting mesh source failed");
        }
    }

    unsafe fn finalize_mesh(&self, keep: *mut u8, remove: *mut u8, size: usize) {
        let keep_off = self.offset_of(keep);
        let remove_off = self.offset_of(remove);
        let pages = size >> PAGE_SHIFT;

        let keep_id = self.page_map.get(keep_off >> PAGE_SHIFT);
        // A span already aliased by an earlier mesh moves to the new owner
        // without changing the meshed totals.
        let already_aliased = self.page_map.is_aliased(remove_off >> PAGE_SHIFT);
        self.page_map
            .set_range_aliased(remove_off >> PAGE_SHIFT, pages, keep_id);

        if !platform::remap_fixed(remove, size, self.fd, keep_off) {
            crate::integrity::abort_with_message("meshalloc: aliasing meshed span failed\n");
        }
        if already_aliased {
            return;
        }
        self.release_phys(Span::new((remove_off >> PAGE_SHIFT) as u32, pages as u32));

        self.meshed_span_count.fetch_add(1, Ordering::Relaxed);
        let meshed = self.meshed_page_count.fetch_add(pages, Ordering::Relaxed) + pages;
        self.meshed_page_hwm.fetch_max(meshed, Ordering::Relaxed);
    }

    fn scavenge(&self, aggressive: bool) {
        let mut lists = self.spans.lock();
        if !aggressive && lists.dirty_pages < self.dirty_page_threshold {
            return;
        }
        let released = lists.dirty_pages;
        let dirty = core::mem::take(&mut lists.dirty);
        for span in &dirty {
            self.release_phys(*span);
        }
        lists.clean.extend(dirty);
        lists.dirty_pages = 0;
        lists.coalesce_clean();
        if released > 0 {
            tracing::debug!(pages = released, aggressive, "scavenged dirty spans");
        }
    }

    fn above_mesh_threshold(&self) -> bool {
        self.meshed_span_count.load(Ordering::Relaxed) > self.max_mesh_count
    }

    fn resident_kib(&self) -> usize {
        platform::measure_pss_kib()
    }

    fn meshed_page_high_water_mark(&self) -> usize {
        self.meshed_page_hwm.load(Ordering::Relaxed)
    }
}

impl Drop for MemfdArena {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.begin, self.size) };
        platform::close(self.fd);
    }
}
