use super::stats::{BinStats, HeapStats, SpanInfo};
use crate::arena::MeshArena;
use crate::config::MeshConfig;
use crate::integrity::{self, IntegrityResult};
use crate::mesh;
use crate::slab::{
    size_class_index, BinnedTracker, MiniHeap, MiniHeapId, MiniHeapTable, NUM_SIZE_CLASSES,
};
use crate::sync::Mutex;
use crate::util::{hard_assert, page_count, MAX_SIZE, MESH_EFFECTIVE_THRESHOLD, PAGE_SIZE};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::io;
use std::time::Instant;

/// Everything guarded by the heap lock.
struct HeapInner {
    table: MiniHeapTable,
    bins: Vec<BinnedTracker>,
    rng: fastrand::Rng,
    stats: HeapStats,
}

/// The meshing heap: owns the spans of every size class, routes frees to
/// their owners and periodically merges sparsely used spans.
///
/// All span and bin mutation happens under one lock. Pointer to owner
/// resolution goes through the arena's page map and needs no lock.
pub struct GlobalHeap<A: MeshArena> {
    arena: A,
    inner: Mutex<HeapInner>,
    config: MeshConfig,
    /// Hint that meshing is worth attempting, raised by every small free.
    last_mesh_effective: AtomicBool,
    mesh_period_ms: AtomicUsize,
    /// Milliseconds since `epoch` at which the last mesh pass ran.
    last_mesh_ms: AtomicU64,
    epoch: Instant,
}

impl<A: MeshArena> GlobalHeap<A> {
    pub fn new(arena: A, config: MeshConfig) -> Self {
        Self::with_rng(arena, config, fastrand::Rng::new())
    }

    /// Build a heap whose mesh search draws from `rng`; seed it for
    /// reproducible candidate order.
    pub fn with_rng(arena: A, config: MeshConfig, rng: fastrand::Rng) -> Self {
        let bins = (0..NUM_SIZE_CLASSES)
            .map(|class| BinnedTracker::new(class, config.max_empty_spans))
            .collect();
        Self {
            arena,
            inner: Mutex::new(HeapInner {
                table: MiniHeapTable::new(),
                bins,
                rng,
                stats: HeapStats::default(),
            }),
            config,
            last_mesh_effective: AtomicBool::new(false),
            mesh_period_ms: AtomicUsize::new(config.mesh_period_ms),
            last_mesh_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    #[inline]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Allocate any size: size-class bins up to `MAX_SIZE`, a dedicated span
    /// above it.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size <= MAX_SIZE {
            self.alloc_small(size)
        } else {
            self.malloc(size)
        }
    }

    /// Allocate a dedicated single-object span for `size > MAX_SIZE`.
    ///
    /// Returns null when the page-rounded size does not fit in an `i32` or
    /// the arena is exhausted.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        #[cfg(debug_assertions)]
        if size <= MAX_SIZE {
            integrity::abort_with_message("meshalloc: malloc called with a size-class size\n");
        }

        let pages = page_count(size);
        match pages.checked_mul(PAGE_SIZE) {
            Some(bytes) if bytes <= i32::MAX as usize => {}
            _ => return ptr::null_mut(),
        }

        let mut inner = self.inner.lock();
        let Some(span) = self.arena.page_alloc(pages) else {
            return ptr::null_mut();
        };
        let id = Self::track_locked(&self.arena, &mut inner, MiniHeap::new_large(span));
        tracing::debug!(id = id.index(), pages, "large span allocated");
        self.arena.span_start(span)
    }

    /// Allocate one object from the bin of `size`'s size class, claiming a
    /// random free slot.
    pub fn alloc_small(&self, size: usize) -> *mut u8 {
        let Some(class) = size_class_index(size) else {
            return ptr::null_mut();
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = match inner.bins[class].pick_for_alloc() {
            Some(id) => id,
            None => match self.alloc_small_span_locked(inner, class) {
                Some(id) => id,
                None => return ptr::null_mut(),
            },
        };

        let random = inner.rng.u64(..);
        let Some(mh) = inner.table.get_mut(id) else {
            return ptr::null_mut();
        };
        let Some(slot) = mh.bitmap_mut().alloc_random(random) else {
            integrity::abort_with_message("meshalloc: bin handed out a full span\n");
        };
        let offset = mh.span().byte_offset() + slot * mh.object_size();
        inner.bins[class].reclassify(&mut inner.table, id);

        unsafe { self.arena.arena_begin().add(offset) }
    }

    fn alloc_small_span_locked(&self, inner: &mut HeapInner, class: usize) -> Option<MiniHeapId> {
        let bin = &inner.bins[class];
        let (pages, object_size, object_count) =
            (bin.span_pages(), bin.object_size(), bin.object_count());
        let span = self.arena.page_alloc(pages)?;
        let mh = MiniHeap::new_small(span, class, object_size, object_count);
        let id = Self::track_locked(&self.arena, inner, mh);
        inner.bins[class].add(&mut inner.table, id);
        tracing::debug!(id = id.index(), object_size, pages, "span allocated");
        Some(id)
    }

    fn track_locked(arena: &A, inner: &mut HeapInner, mh: MiniHeap) -> MiniHeapId {
        let span = mh.span();
        let id = inner.table.insert(mh);
        arena.track(span, id);
        inner.stats.mh_alloc_count += 1;
        inner.stats.mh_high_water_mark = inner.stats.mh_high_water_mark.max(inner.table.len());
        id
    }

    /// Span owning `ptr`, by page map lookup.
    #[inline]
    pub fn lookup(&self, ptr: *const u8) -> Option<MiniHeapId> {
        self.arena.owner_of(ptr)
    }

    /// Free `ptr`. Null is a no-op; a pointer the heap does not own is
    /// logged and ignored.
    pub fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.lookup(ptr) {
            Some(id) => self.free_for(id, ptr),
            None => tracing::warn!(?ptr, "free of untracked pointer"),
        }
    }

    /// Free `ptr`, which was resolved to span `id` without the lock held.
    pub fn free_for(&self, id: MiniHeapId, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let should_consider_mesh = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let Some(mh) = inner.table.get(id) else {
                tracing::warn!(?ptr, id = id.index(), "free through a released span");
                return;
            };
            if mh.is_large() {
                self.free_miniheap_locked(inner, id);
                return;
            }

            self.last_mesh_effective.store(true, Ordering::Release);

            // A mesh pass may have merged the span away after the caller
            // looked it up; the page map now names the surviving owner.
            let mut id = id;
            if mh.is_meshed() {
                let owner = self.lookup(ptr);
                let owner_meshed = owner.and_then(|o| inner.table.get(o)).map(MiniHeap::is_meshed);
                hard_assert(
                    owner_meshed == Some(false),
                    "meshalloc: re-resolved owner is still meshed\n",
                );
                if let Some(owner) = owner {
                    id = owner;
                }
            }

            let offset = ptr as usize - self.arena.arena_begin() as usize;
            let Some(slot) = Self::slot_for(&inner.table, id, offset) else {
                tracing::warn!(?ptr, id = id.index(), "free of pointer not at an object start");
                return;
            };
            let Some(mh) = inner.table.get_mut(id) else {
                return;
            };
            if !mh.bitmap_mut().unset(slot) {
                tracing::warn!(?ptr, "double free");
                return;
            }

            let remaining = mh.in_use_count();
            let Some(class) = mh.size_class() else {
                return;
            };

            // May release the span; `id` is dead after a flush.
            let should_flush = inner.bins[class].post_free(&mut inner.table, id, remaining);
            if should_flush {
                self.flush_bin_locked(inner, class);
            }
            remaining > 0
        };

        if should_consider_mesh {
            self.maybe_mesh();
        }
    }

    /// Slot of arena byte `offset` within `id` or any span meshed into it.
    fn slot_for(table: &MiniHeapTable, id: MiniHeapId, offset: usize) -> Option<usize> {
        let mut cur = Some(id);
        while let Some(member_id) = cur {
            let member = table.get(member_id)?;
            if member.covers(offset) {
                return member.slot_at(offset);
            }
            cur = member.next_meshed();
        }
        None
    }

    /// Release every empty span of `class` to the arena.
    fn flush_bin_locked(&self, inner: &mut HeapInner, class: usize) {
        let empty = inner.bins[class].take_empty(&mut inner.table);
        for id in empty {
            self.free_miniheap_locked(inner, id);
        }
    }

    /// Release `id` and every span meshed into it.
    fn free_miniheap_locked(&self, inner: &mut HeapInner, id: MiniHeapId) {
        if let Some(class) = inner.table.get(id).and_then(MiniHeap::size_class) {
            inner.bins[class].remove(&mut inner.table, id);
        }

        let mut cur = Some(id);
        while let Some(member_id) = cur {
            let Some(mh) = inner.table.remove(member_id) else {
                break;
            };
            cur = mh.next_meshed();
            self.arena.untrack(mh.span());
            self.arena.free_span(mh.span(), mh.is_meshed());
            inner.stats.mh_free_count += 1;
        }
    }

    /// Run a mesh pass if at least `mesh_period_ms` has passed since the last
    /// one. A period of 0 disables this trigger.
    pub fn maybe_mesh(&self) {
        let period = self.mesh_period_ms.load(Ordering::Relaxed) as u64;
        if period == 0 {
            return;
        }
        if self.now_ms().saturating_sub(self.last_mesh_ms.load(Ordering::Acquire)) < period {
            return;
        }

        let mut inner = self.inner.lock();
        // Another thread may have meshed while this one waited for the lock.
        let now = self.now_ms();
        if now.saturating_sub(self.last_mesh_ms.load(Ordering::Acquire)) < period {
            return;
        }
        self.last_mesh_ms.store(now, Ordering::Release);
        self.mesh_all_size_classes_locked(&mut inner);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Search every bin for meshable pairs and merge them. Returns the number
    /// of pairs merged.
    pub fn mesh_all_size_classes(&self) -> usize {
        let mut inner = self.inner.lock();
        self.mesh_all_size_classes_locked(&mut inner)
    }

    fn mesh_all_size_classes_locked(&self, inner: &mut HeapInner) -> usize {
        self.arena.scavenge(false);

        if !self.last_mesh_effective.load(Ordering::Acquire) {
            return 0;
        }
        if self.arena.above_mesh_threshold() {
            return 0;
        }

        self.last_mesh_effective.store(false, Ordering::Release);

        for class in 0..NUM_SIZE_CLASSES {
            self.flush_bin_locked(inner, class);
        }

        let max_meshes = self.config.max_meshes;
        let limit = self.config.max_meshes_per_iteration;
        let mut pairs: Vec<(MiniHeapId, MiniHeapId)> = Vec::new();
        let mut partial_count = 0;
        {
            let HeapInner { table, bins, rng, .. } = &mut *inner;
            let table = &*table;
            let is_candidate =
                |id| table.get(id).is_some_and(|mh| mh.is_meshing_candidate(max_meshes));
            for bin in bins.iter() {
                partial_count += bin.partial_size();
                mesh::shifted_splitting(rng, table, bin, max_meshes, limit, |a, b| {
                    if is_candidate(a) && is_candidate(b) {
                        pairs.push((a, b));
                    }
                    false
                });
            }
        }

        self.last_mesh_effective
            .store(pairs.len() > MESH_EFFECTIVE_THRESHOLD, Ordering::Release);

        if pairs.is_empty() {
            self.arena.scavenge(false);
            return 0;
        }

        let mut merged = 0;
        for (a, b) in pairs.iter().copied() {
            let count_of = |id| inner.table.get(id).map_or(0, MiniHeap::mesh_count);
            let (a_count, b_count) = (count_of(a), count_of(b));
            if a_count + b_count > max_meshes {
                continue;
            }
            let (dst, src) = if a_count < b_count { (b, a) } else { (a, b) };
            self.mesh_locked(inner, dst, src);
            merged += 1;
        }
        inner.stats.mesh_count += merged;

        self.arena.scavenge(false);
        self.last_mesh_ms.store(self.now_ms(), Ordering::Release);

        tracing::debug!(
            partial = partial_count,
            found = pairs.len(),
            merged,
            "mesh pass complete"
        );
        merged
    }

    /// Merge `src` (and every span already meshed into it) into `dst`.
    fn mesh_locked(&self, inner: &mut HeapInner, dst: MiniHeapId, src: MiniHeapId) {
        let (Some(dst_mh), Some(src_mh)) = (inner.table.get(dst), inner.table.get(src)) else {
            return;
        };
        hard_assert(
            !dst_mh.is_meshed() && !src_mh.is_meshed(),
            "meshalloc: meshing a span that is already meshed\n",
        );
        debug_assert!(dst_mh.bitmap().meshable_with(src_mh.bitmap()));

        let size = dst_mh.span().byte_length();
        let object_size = dst_mh.object_size();
        let dst_start = self.arena.span_start(dst_mh.span());
        let src_start = self.arena.span_start(src_mh.span());
        let src_bitmap = *src_mh.bitmap();
        let src_mesh_count = src_mh.mesh_count();
        let Some(class) = dst_mh.size_class() else {
            return;
        };
        let chain = inner.table.chain(src);

        for &member in &chain {
            if let Some(mh) = inner.table.get(member) {
                unsafe {
                    self.arena
                        .begin_mesh(dst_start, self.arena.span_start(mh.span()), size)
                };
            }
        }

        // Live objects keep their slot index, so every old address stays
        // valid once the source range aliases the destination's pages.
        for slot in src_bitmap.iter() {
            let off = slot * object_size;
            unsafe { ptr::copy_nonoverlapping(src_start.add(off), dst_start.add(off), object_size) };
        }

        let tail = inner.table.chain(dst).last().copied().unwrap_or(dst);
        if let Some(mh) = inner.table.get_mut(tail) {
            mh.set_next_meshed(Some(src));
        }
        for &member in &chain {
            if let Some(mh) = inner.table.get_mut(member) {
                mh.mark_meshed_into(dst);
            }
        }
        if let Some(mh) = inner.table.get_mut(dst) {
            mh.bitmap_mut().absorb(&src_bitmap);
            mh.add_mesh_count(src_mesh_count);
        }

        // Tail first: older members still alias the head's pages until
        // they are moved, and the head's pages go away with its own call.
        for &member in chain.iter().rev() {
            if let Some(mh) = inner.table.get(member) {
                unsafe {
                    self.arena
                        .finalize_mesh(dst_start, self.arena.span_start(mh.span()), size)
                };
            }
        }

        let in_use = inner.table.get(dst).map_or(0, MiniHeap::in_use_count);
        inner.bins[class].post_free(&mut inner.table, dst, in_use);
        inner.bins[class].remove(&mut inner.table, src);
    }

    /// Mesh, then return all freed memory to the OS.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.lock();
        let merged = self.mesh_all_size_classes_locked(&mut inner);
        inner.unlocked(|| self.arena.scavenge(true));
        merged
    }

    /// Return freed memory to the OS; see [`MeshArena::scavenge`].
    pub fn scavenge(&self, aggressive: bool) {
        self.arena.scavenge(aggressive);
    }

    pub fn mesh_period_ms(&self) -> usize {
        self.mesh_period_ms.load(Ordering::Relaxed)
    }

    pub fn set_mesh_period_ms(&self, period: usize) {
        self.mesh_period_ms.store(period, Ordering::Relaxed);
    }

    /// Usable bytes at `ptr`, or 0 if the heap does not own it.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        self.span_info(ptr).map_or(0, |info| info.object_size)
    }

    /// Metadata of the span currently owning `ptr`.
    pub fn span_info(&self, ptr: *const u8) -> Option<SpanInfo> {
        let id = self.lookup(ptr)?;
        let inner = self.inner.lock();
        inner.table.get(id).map(|mh| Self::info_of(id, mh))
    }

    fn info_of(id: MiniHeapId, mh: &MiniHeap) -> SpanInfo {
        SpanInfo {
            id,
            span: mh.span(),
            object_size: mh.object_size(),
            max_count: mh.max_count(),
            in_use: mh.in_use_count(),
            mesh_count: mh.mesh_count(),
            state: mh.state(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }

    pub fn bin_stats(&self, class: usize) -> Option<BinStats> {
        let inner = self.inner.lock();
        inner.bins.get(class).map(|bin| Self::bin_stats_of(&inner.table, bin))
    }

    fn bin_stats_of(table: &MiniHeapTable, bin: &BinnedTracker) -> BinStats {
        BinStats {
            size_class: bin.size_class(),
            object_size: bin.object_size(),
            object_count: bin.object_count(),
            empty: bin.empty_count(),
            partial: bin.partial_size(),
            full: bin.non_empty_count() - bin.partial_size(),
            allocated_objects: bin.allocated_object_count(table),
        }
    }

    /// Bytes in spans holding at least one live object.
    fn active_bytes(inner: &HeapInner) -> usize {
        inner
            .bins
            .iter()
            .map(|bin| bin.non_empty_count() * bin.object_size() * bin.object_count())
            .sum()
    }

    /// Bytes in live small objects.
    fn allocated_bytes(inner: &HeapInner) -> usize {
        inner
            .bins
            .iter()
            .filter(|bin| bin.non_empty_count() > 0)
            .map(|bin| bin.object_size() * bin.allocated_object_count(&inner.table))
            .sum()
    }

    /// Cross-check span metadata against the bins.
    pub fn check_integrity(&self) -> IntegrityResult {
        let inner = self.inner.lock();
        integrity::scan(&inner.table, &inner.bins, self.config.max_meshes)
    }

    /// Read or write a named control value, `mallctl` style.
    ///
    /// Returns 0 on success (unknown names included) and -1 when `oldp` or
    /// `oldlenp` is null, `*oldlenp` is smaller than a `usize`, or a setter
    /// lacks a `usize`-sized `newp`.
    ///
    /// # Safety
    /// Non-null `oldp` must be valid for a `usize` write, `oldlenp` for a
    /// `usize` read, and `newp` for a `newlen`-byte read.
    pub unsafe fn mallctl(
        &self,
        name: &str,
        oldp: *mut usize,
        oldlenp: *const usize,
        newp: *const usize,
        newlen: usize,
    ) -> i32 {
        let mut inner = self.inner.lock();

        if oldp.is_null() || oldlenp.is_null() || *oldlenp < core::mem::size_of::<usize>() {
            return -1;
        }

        match name {
            "mesh.check_period" => {
                *oldp = self.mesh_period_ms();
                if newp.is_null() || newlen < core::mem::size_of::<usize>() {
                    return -1;
                }
                self.set_mesh_period_ms(newp.read_unaligned());
            }
            "mesh.scavenge" => inner.unlocked(|| self.arena.scavenge(true)),
            "mesh.compact" => {
                self.mesh_all_size_classes_locked(&mut inner);
                inner.unlocked(|| self.arena.scavenge(true));
            }
            "arena" => {}
            "stats.resident" => *oldp = self.arena.resident_kib() * 1024,
            "stats.active" => *oldp = Self::active_bytes(&inner),
            "stats.allocated" => *oldp = Self::allocated_bytes(&inner),
            _ => {}
        }
        0
    }

    /// Write heap statistics to `w`. Level 0 prints nothing, level 1 the heap
    /// totals, level 2 adds one line per non-empty bin; `detailed` adds one
    /// line per span.
    pub fn dump_stats<W: io::Write>(&self, w: &mut W, level: u32, detailed: bool) -> io::Result<()> {
        if level < 1 {
            return Ok(());
        }

        let inner = self.inner.lock();
        let hwm = self.arena.meshed_page_high_water_mark();
        writeln!(w, "Meshed pages HWM:   {}", hwm)?;
        writeln!(
            w,
            "Meshed MB HWM:      {:.1}",
            (hwm * PAGE_SIZE) as f64 / 1024.0 / 1024.0
        )?;
        writeln!(w, "Mesh count:         {}", inner.stats.mesh_count)?;
        writeln!(w, "MH Alloc Count:     {}", inner.stats.mh_alloc_count)?;
        writeln!(w, "MH Free  Count:     {}", inner.stats.mh_free_count)?;
        writeln!(w, "MH High Water Mark: {}", inner.stats.mh_high_water_mark)?;

        if level > 1 {
            for bin in inner.bins.iter() {
                if bin.non_empty_count() + bin.empty_count() == 0 {
                    continue;
                }
                Self::bin_stats_of(&inner.table, bin).write_to(w)?;
                if detailed {
                    for id in bin.iter() {
                        if let Some(mh) = inner.table.get(id) {
                            Self::info_of(id, mh).write_to(w)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
