use core::ptr;
use std::os::fd::RawFd;

/// Last OS error number.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

/// Create an anonymous, close-on-exec memory file.
pub fn memfd_create(name: &core::ffi::CStr) -> Result<RawFd, i32> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        Err(errno())
    } else {
        Ok(fd)
    }
}

/// Set the size of `fd`. The file stays sparse.
pub fn ftruncate(fd: RawFd, size: usize) -> Result<(), i32> {
    let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if ret != 0 {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Close a file descriptor, ignoring errors.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Map anonymous read-write memory.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Map `size` bytes of `fd` read-write and shared, at a kernel-chosen address.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn map_shared(fd: RawFd, size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_NORESERVE,
        fd,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Replace the mapping at `addr` with `size` bytes of `fd` starting at
/// `offset`, read-write and shared.
///
/// # Safety
/// `addr` must be a page-aligned address inside a mapping owned by the caller.
pub unsafe fn remap_fixed(addr: *mut u8, size: usize, fd: RawFd, offset: usize) -> bool {
    let result = libc::mmap(
        addr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        offset as libc::off_t,
    );
    result != libc::MAP_FAILED
}

/// Unmap memory.
///
/// # Safety
/// `ptr` must have been returned by a map call with the same `size`.
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Mark memory as read-only.
///
/// # Safety
/// Region must be valid and page-aligned.
pub unsafe fn protect_read(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ) == 0
}

/// Free the physical pages backing `[offset, offset + size)` of `fd`.
/// Subsequent reads through any mapping see zeroes.
pub fn punch_hole(fd: RawFd, offset: usize, size: usize) -> Result<(), i32> {
    let ret = unsafe {
        libc::fallocate(
            fd,
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            size as libc::off_t,
        )
    };
    if ret != 0 {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Proportional set size of this process in KiB. Falls back to plain RSS
/// when `smaps_rollup` is unavailable (pre-4.14 kernels).
pub fn measure_pss_kib() -> usize {
    if let Ok(rollup) = std::fs::read_to_string("/proc/self/smaps_rollup") {
        if let Some(kib) = parse_kib_field(&rollup, "Pss:") {
            return kib;
        }
    }
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1)?.parse::<usize>().ok())
        .map(|pages| pages * crate::util::PAGE_SIZE / 1024)
        .unwrap_or(0)
}

fn parse_kib_field(text: &str, field: &str) -> Option<usize> {
    text.lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
