//! Per-span metadata.
//!
//! A `MiniHeap` describes one span of arena pages carved into equal slots. The
//! heap keeps every `MiniHeap` in a [`MiniHeapTable`] and refers to them by
//! [`MiniHeapId`], which is also what the page map stores.

use super::bitmap::Bitmap;
use crate::arena::Span;

/// Handle of a `MiniHeap` inside the heap's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MiniHeapId(u32);

impl MiniHeapId {
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Whether a span still owns its objects or has been merged into another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeshState {
    Active,
    /// Absorbed by the given span; this span's bitmap is stale and its
    /// virtual range aliases the owner's pages.
    MeshedInto(MiniHeapId),
}

/// Which of a bin's lists a span is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partition {
    Empty,
    Partial,
    Full,
}

/// Position of a span inside its bin, for O(1) removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinSlot {
    pub partition: Partition,
    pub index: usize,
}

#[derive(Debug)]
pub struct MiniHeap {
    span: Span,
    object_size: usize,
    /// `None` for dedicated large-object spans.
    size_class: Option<usize>,
    bitmap: Bitmap,
    state: MeshState,
    /// Next span whose virtual range shares this span's pages.
    next_meshed: Option<MiniHeapId>,
    /// Number of virtual spans backed by this span's pages, itself included.
    mesh_count: usize,
    pub(crate) bin_slot: Option<BinSlot>,
}

impl MiniHeap {
    pub fn new_small(span: Span, size_class: usize, object_size: usize, object_count: usize) -> Self {
        debug_assert!(object_count > 1);
        debug_assert!(object_size * object_count <= span.byte_length());
        Self {
            span,
            object_size,
            size_class: Some(size_class),
            bitmap: Bitmap::new(object_count),
            state: MeshState::Active,
            next_meshed: None,
            mesh_count: 1,
            bin_slot: None,
        }
    }

    /// A span holding exactly one object that fills the whole span.
    pub fn new_large(span: Span) -> Self {
        let mut bitmap = Bitmap::new(1);
        bitmap.try_set(0);
        Self {
            span,
            object_size: span.byte_length(),
            size_class: None,
            bitmap,
            state: MeshState::Active,
            next_meshed: None,
            mesh_count: 1,
            bin_slot: None,
        }
    }

    #[inline]
    pub fn span(&self) -> Span {
        self.span
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn size_class(&self) -> Option<usize> {
        self.size_class
    }

    #[inline]
    pub fn max_count(&self) -> usize {
        self.bitmap.num_slots()
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.bitmap.in_use_count()
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.max_count() == 1
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.bitmap.is_full()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    #[inline]
    pub fn state(&self) -> MeshState {
        self.state
    }

    #[inline]
    pub fn is_meshed(&self) -> bool {
        matches!(self.state, MeshState::MeshedInto(_))
    }

    #[inline]
    pub fn mesh_count(&self) -> usize {
        self.mesh_count
    }

    #[inline]
    pub fn next_meshed(&self) -> Option<MiniHeapId> {
        self.next_meshed
    }

    #[inline]
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    #[inline]
    pub fn bitmap_mut(&mut self) -> &mut Bitmap {
        &mut self.bitmap
    }

    /// Eligible to take part in a mesh under a `max_meshes` depth limit.
    pub fn is_meshing_candidate(&self, max_meshes: usize) -> bool {
        !self.is_large() && !self.is_full() && !self.is_meshed() && self.mesh_count < max_meshes
    }

    /// Slot index of the object at arena byte offset `offset`, if the offset
    /// falls on a slot boundary inside this span's own virtual range.
    pub fn slot_at(&self, offset: usize) -> Option<usize> {
        let start = self.span.byte_offset();
        if offset < start || offset >= start + self.span.byte_length() {
            return None;
        }
        let rel = offset - start;
        if rel % self.object_size != 0 {
            return None;
        }
        let slot = rel / self.object_size;
        (slot < self.max_count()).then_some(slot)
    }

    /// True if arena byte offset `offset` lies within this span's range.
    #[inline]
    pub fn covers(&self, offset: usize) -> bool {
        let start = self.span.byte_offset();
        offset >= start && offset < start + self.span.byte_length()
    }

    pub(crate) fn mark_meshed_into(&mut self, owner: MiniHeapId) {
        self.state = MeshState::MeshedInto(owner);
    }

    pub(crate) fn set_next_meshed(&mut self, next: Option<MiniHeapId>) {
        self.next_meshed = next;
    }

    pub(crate) fn add_mesh_count(&mut self, count: usize) {
        self.mesh_count += count;
    }
}

/// Slot table of all live `MiniHeap`s, indexed by `MiniHeapId`.
#[derive(Default)]
pub struct MiniHeapTable {
    slots: Vec<Option<MiniHeap>>,
    vacant: Vec<u32>,
    live: usize,
}

impl MiniHeapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mh: MiniHeap) -> MiniHeapId {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            self.slots[index as usize] = Some(mh);
            return MiniHeapId::new(index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Some(mh));
        MiniHeapId::new(index)
    }

    pub fn remove(&mut self, id: MiniHeapId) -> Option<MiniHeap> {
        let mh = self.slots.get_mut(id.index() as usize)?.take()?;
        self.vacant.push(id.index());
        self.live -= 1;
        Some(mh)
    }

    #[inline]
    pub fn get(&self, id: MiniHeapId) -> Option<&MiniHeap> {
        self.slots.get(id.index() as usize)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, id: MiniHeapId) -> Option<&mut MiniHeap> {
        self.slots.get_mut(id.index() as usize)?.as_mut()
    }

    /// Number of occupied entries, meshed spans included.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (MiniHeapId, &MiniHeap)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|mh| (MiniHeapId::new(i as u32), mh)))
    }

    /// `id` followed by every span meshed into it, in chain order.
    pub fn chain(&self, id: MiniHeapId) -> Vec<MiniHeapId> {
        let mut out = vec![id];
        let mut cur = self.get(id).and_then(MiniHeap::next_meshed);
        while let Some(next) = cur {
            out.push(next);
            cur = self.get(next).and_then(MiniHeap::next_meshed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(offset: u32) -> MiniHeap {
        MiniHeap::new_small(Span::new(offset, 1), 15, 512, 8)
    }

    #[test]
    fn large_span_is_single_full_slot() {
        let mh = MiniHeap::new_large(Span::new(0, 5));
        assert!(mh.is_large());
        assert!(mh.is_full());
        assert_eq!(mh.object_size(), 5 * crate::util::PAGE_SIZE);
        assert!(!mh.is_meshing_candidate(256));
    }

    #[test]
    fn candidate_rules() {
        let mut mh = small(0);
        assert!(mh.is_meshing_candidate(256));
        assert!(!mh.is_meshing_candidate(1), "no headroom below max_meshes");

        for slot in 0..8 {
            mh.bitmap_mut().try_set(slot);
        }
        assert!(!mh.is_meshing_candidate(256), "full spans are excluded");

        let mut meshed = small(1);
        meshed.mark_meshed_into(MiniHeapId::new(0));
        assert!(meshed.is_meshed());
        assert!(!meshed.is_meshing_candidate(256));
    }

    #[test]
    fn slot_lookup_checks_bounds_and_alignment() {
        let mh = small(2);
        let base = 2 * crate::util::PAGE_SIZE;
        assert_eq!(mh.slot_at(base), Some(0));
        assert_eq!(mh.slot_at(base + 3 * 512), Some(3));
        assert_eq!(mh.slot_at(base + 3 * 512 + 8), None);
        assert_eq!(mh.slot_at(base - 512), None);
        assert_eq!(mh.slot_at(base + crate::util::PAGE_SIZE), None);
    }

    #[test]
    fn table_reuses_vacated_ids() {
        let mut table = MiniHeapTable::new();
        let a = table.insert(small(0));
        let b = table.insert(small(1));
        assert_eq!(table.len(), 2);

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none(), "double remove is harmless");

        let c = table.insert(small(2));
        assert_eq!(c, a);
        assert_eq!(table.iter().count(), 2);
        assert_eq!(table.get(b).map(|mh| mh.span().offset), Some(1));
    }

    #[test]
    fn chain_follows_links() {
        let mut table = MiniHeapTable::new();
        let a = table.insert(small(0));
        let b = table.insert(small(1));
        let c = table.insert(small(2));
        table.get_mut(a).unwrap().set_next_meshed(Some(b));
        table.get_mut(b).unwrap().set_next_meshed(Some(c));
        assert_eq!(table.chain(a), vec![a, b, c]);
        assert_eq!(table.chain(c), vec![c]);
    }
}
