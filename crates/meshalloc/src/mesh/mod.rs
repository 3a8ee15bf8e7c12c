//! Randomized search for pairs of spans that can share physical pages.
//!
//! Two spans of the same size class mesh when no slot is occupied in both.
//! The search draws a bounded random sample of a bin's partial spans, splits it
//! in half and probes each left span against a sliding window of right spans,
//! so each pass costs at most `SPLIT_LIST_SIZE * PROBE_LENGTH / 2` bitmap
//! comparisons no matter how many spans the bin holds.

use crate::slab::{Bitmap, BinnedTracker, MiniHeap, MiniHeapId, MiniHeapTable};

/// Most partial spans sampled from one bin per pass.
pub const SPLIT_LIST_SIZE: usize = 64;

/// Right-hand spans probed for each left-hand span.
pub const PROBE_LENGTH: usize = 64;

/// Spans at least this full are left out of the sample; they have too few
/// free slots to mesh with anything.
pub const OCCUPANCY_CUTOFF: f64 = 0.8;

/// True if no slot is occupied in both bitmaps.
#[inline]
pub fn bitmaps_meshable(a: &Bitmap, b: &Bitmap) -> bool {
    a.meshable_with(b)
}

fn is_sampled(mh: &MiniHeap, max_meshes: usize) -> bool {
    mh.is_meshing_candidate(max_meshes)
        && (mh.in_use_count() as f64) < OCCUPANCY_CUTOFF * mh.max_count() as f64
}

/// Search `bin` for meshable pairs, reporting each through `found`.
///
/// Every span appears in at most one reported pair. `found` returns true to
/// stop the search early; the search also stops after `limit` pairs. Returns
/// the number of pairs reported.
pub fn shifted_splitting<F>(
    rng: &mut fastrand::Rng,
    table: &MiniHeapTable,
    bin: &BinnedTracker,
    max_meshes: usize,
    limit: usize,
    mut found: F,
) -> usize
where
    F: FnMut(MiniHeapId, MiniHeapId) -> bool,
{
    let mut sample: Vec<MiniHeapId> = bin
        .partial()
        .iter()
        .copied()
        .filter(|&id| table.get(id).is_some_and(|mh| is_sampled(mh, max_meshes)))
        .collect();
    if sample.len() < 2 {
        return 0;
    }

    // Shuffle before truncating so every partial span can be drawn.
    rng.shuffle(&mut sample);
    sample.truncate(SPLIT_LIST_SIZE);
    let (left, right) = sample.split_at(sample.len() / 2);
    let mut left_used = [false; SPLIT_LIST_SIZE];
    let mut right_used = [false; SPLIT_LIST_SIZE];
    let probes = right.len().min(PROBE_LENGTH);

    let mut count = 0;
    for (l, &left_id) in left.iter().enumerate() {
        let Some(left_bm) = table.get(left_id).map(MiniHeap::bitmap) else {
            continue;
        };
        for step in 0..probes {
            if left_used[l] {
                break;
            }
            let r = (l + step) % right.len();
            if right_used[r] {
                continue;
            }
            let right_id = right[r];
            let Some(right_bm) = table.get(right_id).map(MiniHeap::bitmap) else {
                continue;
            };
            if !bitmaps_meshable(left_bm, right_bm) {
                continue;
            }

            left_used[l] = true;
            right_used[r] = true;
            count += 1;
            if found(left_id, right_id) || count >= limit {
                return count;
            }
        }
    }
    count
}
