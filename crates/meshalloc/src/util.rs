/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Minimum alignment for all allocations (matches max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 16;

/// Page granularity of the arena. Spans, meshing and the page map all work in
/// units of this size, so it is fixed at build time rather than read from
/// sysconf. Hosts with larger pages still map in multiples of it.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE), for shift-based page number computation.
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// Largest request served by a size-class bin. Anything bigger gets a
/// dedicated single-object span.
pub const MAX_SIZE: usize = 16384; // 16 KiB

/// Upper bound on slots per span: one bit each in the occupancy bitmap.
pub const MAX_OBJECTS_PER_SPAN: usize = 256;

/// Spans are sized so that each holds at least this many objects.
pub const MIN_OBJECTS_PER_SPAN: usize = 8;

/// A mesh pass counts as effective when it finds more than this many pairs
/// (~1 MiB of pages at 4 KiB per page).
pub const MESH_EFFECTIVE_THRESHOLD: usize = 256;

/// Number of pages needed to hold `size` bytes.
#[inline(always)]
pub const fn page_count(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Cheap stand-in for `hard_assert`: aborts with `msg` when `cond` is false,
/// in every build profile.
#[inline(always)]
pub fn hard_assert(cond: bool, msg: &str) {
    if !cond {
        crate::integrity::abort_with_message(msg);
    }
}
