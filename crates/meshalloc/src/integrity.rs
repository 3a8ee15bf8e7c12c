//! Fatal error reporting and a consistency scan over heap metadata.

use crate::slab::{BinnedTracker, MeshState, MiniHeapTable, Partition};

/// Abort with a diagnostic message to stderr.
/// This is used when unrecoverable corruption is detected.
#[cold]
#[inline(never)]
pub fn abort_with_message(msg: &str) -> ! {
    unsafe {
        // Write directly to stderr fd (2) -- no allocation needed
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
}

/// Result of an integrity scan across all spans.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrityResult {
    pub total_spans: usize,
    pub meshed_spans: usize,
    pub errors_found: usize,
    /// Span filed on a list that does not match its occupancy, or binned in
    /// the wrong bin, or active but not binned at all.
    pub partition_mismatches: usize,
    /// Meshed span whose owner is missing, itself meshed, or whose chain
    /// does not include it.
    pub broken_meshes: usize,
    /// `mesh_count` above the configured limit or disagreeing with the
    /// length of the span's chain.
    pub mesh_count_violations: usize,
}

impl IntegrityResult {
    pub fn is_ok(&self) -> bool {
        self.errors_found == 0
    }

    fn fail(counter: &mut usize, errors: &mut usize) {
        *counter += 1;
        *errors += 1;
    }
}

/// Cross-check the span table against the bins.
pub fn scan(table: &MiniHeapTable, bins: &[BinnedTracker], max_meshes: usize) -> IntegrityResult {
    let mut res = IntegrityResult::default();

    for (id, mh) in table.iter() {
        res.total_spans += 1;

        match mh.state() {
            MeshState::MeshedInto(owner_id) => {
                res.meshed_spans += 1;
                let owner_ok = table
                    .get(owner_id)
                    .is_some_and(|owner| !owner.is_meshed() && table.chain(owner_id).contains(&id));
                if !owner_ok {
                    IntegrityResult::fail(&mut res.broken_meshes, &mut res.errors_found);
                }
                if mh.bin_slot.is_some() {
                    IntegrityResult::fail(&mut res.partition_mismatches, &mut res.errors_found);
                }
                continue;
            }
            MeshState::Active => {}
        }

        let chain_len = table.chain(id).len();
        if mh.mesh_count() > max_meshes || mh.mesh_count() != chain_len {
            IntegrityResult::fail(&mut res.mesh_count_violations, &mut res.errors_found);
        }

        let Some(class) = mh.size_class() else {
            if mh.bin_slot.is_some() {
                IntegrityResult::fail(&mut res.partition_mismatches, &mut res.errors_found);
            }
            continue;
        };

        let expected = if mh.is_empty() {
            Partition::Empty
        } else if mh.is_full() {
            Partition::Full
        } else {
            Partition::Partial
        };
        let filed_ok = mh.bin_slot.is_some_and(|slot| {
            slot.partition == expected
                && bins
                    .get(class)
                    .and_then(|bin| bin.list(slot.partition).get(slot.index))
                    == Some(&id)
        });
        if !filed_ok {
            IntegrityResult::fail(&mut res.partition_mismatches, &mut res.errors_found);
        }
    }

    res
}
