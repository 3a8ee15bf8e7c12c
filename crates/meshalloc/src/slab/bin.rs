//! Per-size-class bookkeeping.
//!
//! Each `BinnedTracker` owns the ids of every span of its size class and keeps
//! each one on exactly one of three lists: empty, partial or full. Spans record
//! their list position in `MiniHeap::bin_slot` so moves are O(1).

use super::miniheap::{BinSlot, MiniHeapId, MiniHeapTable, Partition};
use super::size_class;

pub struct BinnedTracker {
    size_class: usize,
    object_size: usize,
    object_count: usize,
    span_pages: usize,
    /// Empty spans tolerated before `post_free` asks for a flush.
    max_empty: usize,
    empty: Vec<MiniHeapId>,
    partial: Vec<MiniHeapId>,
    full: Vec<MiniHeapId>,
}

impl BinnedTracker {
    pub fn new(size_class: usize, max_empty: usize) -> Self {
        Self {
            size_class,
            object_size: size_class::object_size(size_class),
            object_count: size_class::object_count(size_class),
            span_pages: size_class::span_pages(size_class),
            max_empty,
            empty: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
        }
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Objects per span.
    #[inline]
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    #[inline]
    pub fn span_pages(&self) -> usize {
        self.span_pages
    }

    /// Spans holding at least one live object.
    pub fn non_empty_count(&self) -> usize {
        self.partial.len() + self.full.len()
    }

    pub fn empty_count(&self) -> usize {
        self.empty.len()
    }

    pub fn partial_size(&self) -> usize {
        self.partial.len()
    }

    pub fn partial(&self) -> &[MiniHeapId] {
        &self.partial
    }

    /// Live objects across every span of the bin.
    pub fn allocated_object_count(&self, table: &MiniHeapTable) -> usize {
        self.partial
            .iter()
            .chain(self.full.iter())
            .filter_map(|&id| table.get(id))
            .map(|mh| mh.in_use_count())
            .sum()
    }

    fn list_mut(&mut self, partition: Partition) -> &mut Vec<MiniHeapId> {
        match partition {
            Partition::Empty => &mut self.empty,
            Partition::Partial => &mut self.partial,
            Partition::Full => &mut self.full,
        }
    }

    pub fn list(&self, partition: Partition) -> &[MiniHeapId] {
        match partition {
            Partition::Empty => &self.empty,
            Partition::Partial => &self.partial,
            Partition::Full => &self.full,
        }
    }

    fn partition_for(in_use: usize, capacity: usize) -> Partition {
        if in_use == 0 {
            Partition::Empty
        } else if in_use >= capacity {
            Partition::Full
        } else {
            Partition::Partial
        }
    }

    /// Start tracking `id`, filed according to its current occupancy.
    pub fn add(&mut self, table: &mut MiniHeapTable, id: MiniHeapId) {
        let Some(mh) = table.get(id) else { return };
        debug_assert!(mh.bin_slot.is_none(), "span already binned");
        let partition = Self::partition_for(mh.in_use_count(), mh.max_count());
        self.push(table, id, partition);
    }

    /// Stop tracking `id`. No-op if it is not in this bin.
    pub fn remove(&mut self, table: &mut MiniHeapTable, id: MiniHeapId) {
        let Some(slot) = table.get_mut(id).and_then(|mh| mh.bin_slot.take()) else {
            return;
        };
        let list = self.list_mut(slot.partition);
        debug_assert_eq!(list.get(slot.index), Some(&id));
        list.swap_remove(slot.index);
        if let Some(&moved) = list.get(slot.index) {
            if let Some(mh) = table.get_mut(moved) {
                mh.bin_slot = Some(slot);
            }
        }
    }

    fn push(&mut self, table: &mut MiniHeapTable, id: MiniHeapId, partition: Partition) {
        let list = self.list_mut(partition);
        let index = list.len();
        list.push(id);
        if let Some(mh) = table.get_mut(id) {
            mh.bin_slot = Some(BinSlot { partition, index });
        }
    }

    /// Move `id` to the list matching its occupancy.
    pub fn reclassify(&mut self, table: &mut MiniHeapTable, id: MiniHeapId) {
        let Some(mh) = table.get(id) else { return };
        let wanted = Self::partition_for(mh.in_use_count(), mh.max_count());
        match mh.bin_slot {
            Some(slot) if slot.partition == wanted => {}
            Some(_) => {
                self.remove(table, id);
                self.push(table, id, wanted);
            }
            None => self.push(table, id, wanted),
        }
    }

    /// Record a free that left `remaining` live objects in `id`. Returns true
    /// when enough spans are empty that the bin should be flushed.
    ///
    /// After a true return the caller must not touch `id` again without
    /// re-resolving it: the flush may release it.
    pub fn post_free(&mut self, table: &mut MiniHeapTable, id: MiniHeapId, remaining: usize) -> bool {
        debug_assert_eq!(table.get(id).map(|mh| mh.in_use_count()), Some(remaining));
        self.reclassify(table, id);
        remaining == 0 && self.empty.len() > self.max_empty
    }

    /// A span to serve the next allocation from: partial spans first, then an
    /// empty one.
    pub fn pick_for_alloc(&self) -> Option<MiniHeapId> {
        self.partial.last().or_else(|| self.empty.last()).copied()
    }

    /// Untrack and return every empty span.
    pub fn take_empty(&mut self, table: &mut MiniHeapTable) -> Vec<MiniHeapId> {
        let drained = core::mem::take(&mut self.empty);
        for &id in &drained {
            if let Some(mh) = table.get_mut(id) {
                mh.bin_slot = None;
            }
        }
        drained
    }

    /// Every id tracked by the bin.
    pub fn iter(&self) -> impl Iterator<Item = MiniHeapId> + '_ {
        self.empty
            .iter()
            .chain(self.partial.iter())
            .chain(self.full.iter())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Span;
    use crate::slab::MiniHeap;

    const CLASS_512: usize = 15;

    fn insert(table: &mut MiniHeapTable, offset: u32, occupied: &[usize]) -> MiniHeapId {
        let mut mh = MiniHeap::new_small(Span::new(offset, 1), CLASS_512, 512, 8);
        for &slot in occupied {
            mh.bitmap_mut().try_set(slot);
        }
        table.insert(mh)
    }

    fn partition_of(table: &MiniHeapTable, id: MiniHeapId) -> Option<Partition> {
        table.get(id).and_then(|mh| mh.bin_slot).map(|s| s.partition)
    }

    #[test]
    fn geometry_matches_size_class() {
        let bin = BinnedTracker::new(CLASS_512, 0);
        assert_eq!(bin.object_size(), 512);
        assert_eq!(bin.object_count(), 8);
        assert_eq!(bin.span_pages(), 1);
    }

    #[test]
    fn add_files_by_occupancy() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 0);
        let e = insert(&mut table, 0, &[]);
        let p = insert(&mut table, 1, &[0, 1]);
        let f = insert(&mut table, 2, &[0, 1, 2, 3, 4, 5, 6, 7]);
        for id in [e, p, f] {
            bin.add(&mut table, id);
        }

        assert_eq!(partition_of(&table, e), Some(Partition::Empty));
        assert_eq!(partition_of(&table, p), Some(Partition::Partial));
        assert_eq!(partition_of(&table, f), Some(Partition::Full));
        assert_eq!(bin.non_empty_count(), 2);
        assert_eq!(bin.partial_size(), 1);
        assert_eq!(bin.allocated_object_count(&table), 10);
    }

    #[test]
    fn emptying_free_requests_flush() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 0);
        let id = insert(&mut table, 0, &[3]);
        bin.add(&mut table, id);

        table.get_mut(id).unwrap().bitmap_mut().unset(3);
        assert!(bin.post_free(&mut table, id, 0));
        assert_eq!(bin.take_empty(&mut table), vec![id]);
        assert_eq!(table.get(id).unwrap().bin_slot, None);
        assert_eq!(bin.iter().count(), 0);
    }

    #[test]
    fn hysteresis_keeps_some_empty_spans() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 1);
        let a = insert(&mut table, 0, &[0]);
        let b = insert(&mut table, 1, &[0]);
        bin.add(&mut table, a);
        bin.add(&mut table, b);

        table.get_mut(a).unwrap().bitmap_mut().unset(0);
        assert!(!bin.post_free(&mut table, a, 0));
        table.get_mut(b).unwrap().bitmap_mut().unset(0);
        assert!(bin.post_free(&mut table, b, 0));
    }

    #[test]
    fn partial_free_does_not_flush() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 0);
        let id = insert(&mut table, 0, &[0, 1, 2, 3, 4, 5, 6, 7]);
        bin.add(&mut table, id);

        table.get_mut(id).unwrap().bitmap_mut().unset(2);
        assert!(!bin.post_free(&mut table, id, 7));
        assert_eq!(partition_of(&table, id), Some(Partition::Partial));
    }

    #[test]
    fn swap_remove_keeps_positions_consistent() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 0);
        let ids: Vec<_> = (0..4).map(|i| insert(&mut table, i, &[0])).collect();
        for &id in &ids {
            bin.add(&mut table, id);
        }

        bin.remove(&mut table, ids[0]);
        for (index, &id) in bin.partial().iter().enumerate() {
            let slot = table.get(id).unwrap().bin_slot.unwrap();
            assert_eq!(slot.index, index);
        }
        assert_eq!(bin.partial_size(), 3);
        bin.remove(&mut table, ids[0]);
        assert_eq!(bin.partial_size(), 3, "removing an unbinned span is a no-op");
    }

    #[test]
    fn picks_partial_before_empty() {
        let mut table = MiniHeapTable::new();
        let mut bin = BinnedTracker::new(CLASS_512, 4);
        let e = insert(&mut table, 0, &[]);
        bin.add(&mut table, e);
        assert_eq!(bin.pick_for_alloc(), Some(e));

        let p = insert(&mut table, 1, &[5]);
        bin.add(&mut table, p);
        assert_eq!(bin.pick_for_alloc(), Some(p));
    }
}
