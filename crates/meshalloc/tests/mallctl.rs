//! The named control-value interface.

mod common;

use common::{fill_spans, heap, keep_slots};
use meshalloc::{GlobalHeap, MemfdArena};
use std::ptr;

const WORD: usize = std::mem::size_of::<usize>();

/// Read a value, with no new value supplied.
fn read(heap: &GlobalHeap<MemfdArena>, name: &str) -> (i32, usize) {
    let mut old = usize::MAX;
    let len = WORD;
    let rc = unsafe { heap.mallctl(name, &mut old, &len, ptr::null(), 0) };
    (rc, old)
}

#[test]
fn malformed_buffers_are_rejected() {
    let heap = heap();
    let mut old = 0usize;
    let short = WORD - 1;
    let len = WORD;
    unsafe {
        assert_eq!(heap.mallctl("stats.active", ptr::null_mut(), &len, ptr::null(), 0), -1);
        assert_eq!(heap.mallctl("stats.active", &mut old, ptr::null(), ptr::null(), 0), -1);
        assert_eq!(heap.mallctl("stats.active", &mut old, &short, ptr::null(), 0), -1);
        // Buffers are checked before the name is looked at
        assert_eq!(heap.mallctl("no.such.key", ptr::null_mut(), &len, ptr::null(), 0), -1);
    }
}

#[test]
fn unknown_and_arena_keys_are_no_ops() {
    let heap = heap();
    assert_eq!(read(&heap, "no.such.key"), (0, usize::MAX));
    assert_eq!(read(&heap, "arena"), (0, usize::MAX));
}

#[test]
fn check_period_reads_then_writes() {
    let heap = heap();
    let mut old = 0usize;
    let len = WORD;

    // Reading alone reports the value but fails for lack of a new one
    let rc = unsafe { heap.mallctl("mesh.check_period", &mut old, &len, ptr::null(), 0) };
    assert_eq!((rc, old), (-1, 0));

    let new = 250usize;
    let rc = unsafe { heap.mallctl("mesh.check_period", &mut old, &len, &new, WORD) };
    assert_eq!((rc, old), (0, 0));
    assert_eq!(heap.mesh_period_ms(), 250);

    let short = unsafe { heap.mallctl("mesh.check_period", &mut old, &len, &new, WORD - 1) };
    assert_eq!((short, old), (-1, 250));
}

#[test]
fn active_and_allocated_bytes() {
    let heap = heap();
    assert_eq!(read(&heap, "stats.active"), (0, 0));

    let small: Vec<_> = (0..3).map(|_| heap.allocate(512)).collect();
    let large = heap.allocate(1 << 20);
    assert_eq!(read(&heap, "stats.active"), (0, 512 * 8));
    assert_eq!(read(&heap, "stats.allocated"), (0, 512 * 3));

    heap.free(large);
    for p in small {
        heap.free(p);
    }
    assert_eq!(read(&heap, "stats.allocated"), (0, 0));
}

#[test]
fn resident_reports_bytes() {
    let heap = heap();
    let (rc, resident) = read(&heap, "stats.resident");
    assert_eq!(rc, 0);
    assert!(resident > 0);
    assert_eq!(resident % 1024, 0);
}

#[test]
fn compact_meshes_and_scavenge_releases() {
    let heap = heap();
    let mut spans = fill_spans(&heap, 512, 2);
    let b = keep_slots(&heap, spans.pop().unwrap(), |slot| slot % 2 == 1);
    let a = keep_slots(&heap, spans.pop().unwrap(), |slot| slot % 2 == 0);

    assert_eq!(read(&heap, "mesh.compact").0, 0);
    assert_eq!(heap.stats().mesh_count, 1);
    assert_eq!(read(&heap, "stats.active"), (0, 512 * 8));

    for o in a.iter().chain(&b) {
        heap.free(o.ptr);
    }
    assert!(heap.arena().dirty_page_count() > 0);
    assert_eq!(read(&heap, "mesh.scavenge").0, 0);
    assert_eq!(heap.arena().dirty_page_count(), 0);
}
