#![no_main]

use libfuzzer_sys::fuzz_target;
use meshalloc::{GlobalHeap, MemfdArena, MeshConfig};
use std::sync::OnceLock;

/// Fuzz target that interprets a byte slice as a sequence of heap operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=free, 2=mesh pass, 3=compact)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers, each filled with its slot's tag so a
/// mesh that loses or overlaps an object shows up as a mismatch.
const MAX_SLOTS: usize = 64;

fn heap() -> &'static GlobalHeap<MemfdArena> {
    static HEAP: OnceLock<GlobalHeap<MemfdArena>> = OnceLock::new();
    HEAP.get_or_init(|| {
        let conf = MeshConfig::default()
            .with_arena_size(1 << 30)
            .with_mesh_period_ms(0);
        GlobalHeap::new(MemfdArena::new(&conf).expect("arena"), conf)
    })
}

unsafe fn check(ptr: *const u8, size: usize, tag: u8) {
    for i in 0..size.min(256) {
        assert_eq!(*ptr.add(i), tag, "object in slot {} corrupted", tag);
    }
}

fuzz_target!(|data: &[u8]| {
    let heap = heap();
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if !slots[slot].is_null() {
                    unsafe { check(slots[slot], sizes[slot], slot as u8) };
                    heap.free(slots[slot]);
                }
                let size = size.max(1);
                let ptr = heap.allocate(size);
                assert!(!ptr.is_null());
                assert!(heap.usable_size(ptr) >= size);
                unsafe { std::ptr::write_bytes(ptr, slot as u8, size.min(256)) };
                slots[slot] = ptr;
                sizes[slot] = size;
            }
            1 => {
                if !slots[slot].is_null() {
                    unsafe { check(slots[slot], sizes[slot], slot as u8) };
                    heap.free(slots[slot]);
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                heap.mesh_all_size_classes();
            }
            _ => {
                heap.compact();
            }
        }
    }

    for (slot, &ptr) in slots.iter().enumerate() {
        if !ptr.is_null() {
            unsafe { check(ptr, sizes[slot], slot as u8) };
            heap.free(ptr);
        }
    }
    assert!(heap.check_integrity().is_ok());
});
