//! The `mesh_*` C entry points over the process-wide heap.
//!
//! Everything lives in one test: the singleton reads its configuration once,
//! from the environment, on first use.

use core::ffi::c_void;
use meshalloc::api::{mesh_dump_stats, mesh_free, mesh_malloc, mesh_mallctl, mesh_usable_size};
use meshalloc::init;
use std::ptr;

#[test]
fn c_entry_points() {
    std::env::set_var("MESH_ARENA_SIZE", (256usize << 20).to_string());
    std::env::set_var("MESH_PERIOD_MS", "0");

    unsafe {
        let p = mesh_malloc(100);
        assert!(!p.is_null());
        assert_eq!(init::state(), init::STATE_READY);
        assert_eq!(mesh_usable_size(p), 112);
        ptr::write_bytes(p as *mut u8, 0x5A, 100);

        let big = mesh_malloc(1 << 20);
        assert!(!big.is_null());
        assert_eq!(mesh_usable_size(big), 1 << 20);

        let mut period = usize::MAX;
        let mut len = core::mem::size_of::<usize>();
        let new_period = 50usize;
        let rc = mesh_mallctl(
            c"mesh.check_period".as_ptr(),
            &mut period as *mut usize as *mut c_void,
            &mut len,
            &new_period as *const usize as *mut c_void,
            len,
        );
        assert_eq!((rc, period), (0, 0), "period comes from MESH_PERIOD_MS");

        let mut active = 0usize;
        let rc = mesh_mallctl(
            c"stats.active".as_ptr(),
            &mut active as *mut usize as *mut c_void,
            &mut len,
            ptr::null_mut(),
            0,
        );
        assert_eq!((rc, active), (0, 112 * 36));

        assert_eq!(mesh_mallctl(ptr::null(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut(), 0), -1);

        // Statistics go to stderr; a failed write is logged, not raised
        mesh_dump_stats(2, 1);
        mesh_dump_stats(0, 0);

        mesh_free(big);
        mesh_free(p);
        mesh_free(ptr::null_mut());
        assert_eq!(mesh_usable_size(p), 0);
        assert_eq!(mesh_usable_size(ptr::null_mut()), 0);

        let heap = init::heap().unwrap();
        assert_eq!(heap.config().arena_size, 256 << 20);
        assert_eq!(heap.mesh_period_ms(), 50);
        assert!(heap.check_integrity().is_ok());
    }
}
