use crate::arena::Span;
use crate::slab::{MeshState, MiniHeapId};
use std::io;

/// Lifetime counters of a heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Spans ever created, small and large.
    pub mh_alloc_count: usize,
    /// Spans ever released, meshed aliases included.
    pub mh_free_count: usize,
    /// Most spans ever tracked at once.
    pub mh_high_water_mark: usize,
    /// Pairs merged across all mesh passes.
    pub mesh_count: usize,
}

/// Snapshot of one size-class bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinStats {
    pub size_class: usize,
    pub object_size: usize,
    pub object_count: usize,
    pub empty: usize,
    pub partial: usize,
    pub full: usize,
    pub allocated_objects: usize,
}

impl BinStats {
    pub fn non_empty(&self) -> usize {
        self.partial + self.full
    }

    pub(crate) fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "bin {:>5}: {:>6} spans ({} partial, {} full, {} empty), {} of {} objects live",
            self.object_size,
            self.non_empty() + self.empty,
            self.partial,
            self.full,
            self.empty,
            self.allocated_objects,
            self.non_empty() * self.object_count,
        )
    }
}

/// Metadata of the span owning a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanInfo {
    pub id: MiniHeapId,
    pub span: Span,
    pub object_size: usize,
    pub max_count: usize,
    pub in_use: usize,
    pub mesh_count: usize,
    pub state: MeshState,
}

impl SpanInfo {
    pub(crate) fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(
            w,
            "  span {:>6} @ page {:>8}: {}/{} live, mesh count {}",
            self.id.index(),
            self.span.offset,
            self.in_use,
            self.max_count,
            self.mesh_count,
        )
    }
}
