//! OS memory primitives used by the arena.
//!
//! Meshing aliases two virtual spans onto the same file pages, which needs
//! `memfd_create`, `MAP_FIXED` remapping and hole punching; only Linux is
//! supported.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(not(target_os = "linux"))]
compile_error!("meshalloc needs memfd_create and MAP_FIXED remapping; only Linux is supported");

use std::os::fd::RawFd;

pub use sys::errno;

/// Create the memory file that backs an arena.
#[inline]
pub fn memfd_create(name: &core::ffi::CStr) -> Result<RawFd, i32> {
    sys::memfd_create(name)
}

/// Resize a memory file.
#[inline]
pub fn ftruncate(fd: RawFd, size: usize) -> Result<(), i32> {
    sys::ftruncate(fd, size)
}

#[inline]
pub fn close(fd: RawFd) {
    sys::close(fd)
}

/// Map anonymous memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Map a whole memory file shared. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_shared(fd: RawFd, size: usize) -> *mut u8 {
    sys::map_shared(fd, size)
}

/// Point the virtual range at `addr` to file offset `offset`.
///
/// # Safety
/// `addr` and `size` must lie inside a mapping owned by the caller.
#[inline]
pub unsafe fn remap_fixed(addr: *mut u8, size: usize, fd: RawFd, offset: usize) -> bool {
    sys::remap_fixed(addr, size, fd, offset)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_shared` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Mark memory as read-only.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_read(ptr: *mut u8, size: usize) -> bool {
    sys::protect_read(ptr, size)
}

/// Release the physical pages behind a file range.
#[inline]
pub fn punch_hole(fd: RawFd, offset: usize, size: usize) -> Result<(), i32> {
    sys::punch_hole(fd, offset, size)
}

/// Proportional set size of the current process, in KiB.
pub fn measure_pss_kib() -> usize {
    sys::measure_pss_kib()
}
