#![allow(dead_code)]

use meshalloc::{GlobalHeap, MemfdArena, MeshArena, MeshConfig};
use meshalloc::slab::MiniHeapId;
use tracing_subscriber::EnvFilter;

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small arena, no opportunistic meshing: tests decide when to mesh.
pub fn test_config() -> MeshConfig {
    MeshConfig::default()
        .with_arena_size(128 << 20)
        .with_mesh_period_ms(0)
}

pub fn heap_with(conf: MeshConfig) -> GlobalHeap<MemfdArena> {
    tracing_init();
    let arena = MemfdArena::new(&conf).expect("arena");
    GlobalHeap::with_rng(arena, conf, fastrand::Rng::with_seed(0x5eed))
}

pub fn heap() -> GlobalHeap<MemfdArena> {
    heap_with(test_config())
}

/// A live object and where it sat when allocated.
#[derive(Clone, Copy, Debug)]
pub struct Obj {
    pub ptr: *mut u8,
    pub id: MiniHeapId,
    pub slot: usize,
}

pub fn locate<A: MeshArena>(heap: &GlobalHeap<A>, ptr: *mut u8) -> Obj {
    let info = heap.span_info(ptr).expect("pointer is tracked");
    let start = heap.arena().span_start(info.span) as usize;
    Obj {
        ptr,
        id: info.id,
        slot: (ptr as usize - start) / info.object_size,
    }
}

/// Allocate `spans` full spans of `size`-byte objects, grouped by span in
/// allocation order.
pub fn fill_spans<A: MeshArena>(heap: &GlobalHeap<A>, size: usize, spans: usize) -> Vec<Vec<Obj>> {
    let mut groups: Vec<Vec<Obj>> = Vec::new();
    for _ in 0..spans {
        let first = heap.allocate(size);
        assert!(!first.is_null());
        let info = heap.span_info(first).unwrap();
        let mut group = vec![locate(heap, first)];
        for _ in 1..info.max_count {
            let p = heap.allocate(size);
            assert!(!p.is_null());
            let obj = locate(heap, p);
            assert_eq!(obj.id, info.id, "bin fills one span before opening the next");
            group.push(obj);
        }
        groups.push(group);
    }
    groups
}

/// Free every object of `group` whose slot fails `keep`, returning the rest.
pub fn keep_slots<A: MeshArena>(
    heap: &GlobalHeap<A>,
    group: Vec<Obj>,
    mut keep: impl FnMut(usize) -> bool,
) -> Vec<Obj> {
    let (kept, dropped): (Vec<_>, Vec<_>) = group.into_iter().partition(|o| keep(o.slot));
    for o in dropped {
        heap.free(o.ptr);
    }
    kept
}

pub unsafe fn stamp(ptr: *mut u8, len: usize, tag: u8) {
    for i in 0..len {
        ptr.add(i).write(tag ^ (i as u8));
    }
}

pub unsafe fn stamped(ptr: *const u8, len: usize, tag: u8) -> bool {
    (0..len).all(|i| ptr.add(i).read() == tag ^ (i as u8))
}
