use crate::init;
use core::ffi::{c_char, c_int, c_void, CStr};
use core::ptr;

/// Run `$ready` against the process heap, or `$disabled` when there is none.
macro_rules! dispatch {
    ($heap:ident => $ready:expr, $disabled:expr) => {{
        match init::heap() {
            Some($heap) => $ready,
            None => $disabled,
        }
    }};
}

// ============================================================================
// Allocation
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn mesh_malloc(size: usize) -> *mut c_void {
    dispatch!(heap => heap.allocate(size) as *mut c_void, ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn mesh_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    dispatch!(heap => heap.free(ptr as *mut u8), ())
}

#[no_mangle]
pub unsafe extern "C" fn mesh_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    dispatch!(heap => heap.usable_size(ptr as *const u8), 0)
}

// ============================================================================
// Control and diagnostics
// ============================================================================

/// `mallctl`-style control values; see [`GlobalHeap::mallctl`].
///
/// [`GlobalHeap::mallctl`]: crate::allocator::GlobalHeap::mallctl
#[no_mangle]
pub unsafe extern "C" fn mesh_mallctl(
    name: *const c_char,
    oldp: *mut c_void,
    oldlenp: *mut usize,
    newp: *mut c_void,
    newlen: usize,
) -> c_int {
    if name.is_null() {
        return -1;
    }
    // Names that are not UTF-8 cannot match a key and fall through as unknown.
    let name = CStr::from_ptr(name).to_str().unwrap_or("");
    dispatch!(
        heap => heap.mallctl(name, oldp as *mut usize, oldlenp, newp as *const usize, newlen),
        -1
    )
}

/// Print heap statistics to stderr.
#[no_mangle]
pub unsafe extern "C" fn mesh_dump_stats(level: c_int, detailed: c_int) {
    if level < 1 {
        return;
    }
    dispatch!(
        heap => {
            if let Err(err) = heap.dump_stats(&mut std::io::stderr().lock(), level as u32, detailed != 0) {
                tracing::warn!(%err, "writing heap statistics failed");
            }
        },
        ()
    )
}
