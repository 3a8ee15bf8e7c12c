//! Tunables for the mesh heap.
//!
//! Every knob has a compiled-in default; `MeshConfig::from_env` lets the
//! process singleton pick up overrides without allocating.

/// Default virtual size of the arena: 64 GiB. The backing file is sparse, so
/// only touched pages cost memory.
pub const DEFAULT_ARENA_SIZE: usize = 64 << 30;

/// Default minimum interval between opportunistic mesh passes.
pub const DEFAULT_MESH_PERIOD_MS: usize = 100;

/// Default ceiling on how many spans may share one physical span.
pub const DEFAULT_MAX_MESHES: usize = 256;

/// Default number of empty spans a bin keeps before asking for a flush.
pub const DEFAULT_MAX_EMPTY_SPANS: usize = 0;

/// Default ceiling on live meshed spans. Each one costs a kernel mapping, so
/// this stays well under the usual `vm.max_map_count` of 65530.
pub const DEFAULT_MAX_MESH_COUNT: usize = 30_000;

/// Default cap on pairs reported by a single bin search.
pub const DEFAULT_MAX_MESHES_PER_ITERATION: usize = 2500;

/// Default amount of freed-but-resident memory tolerated before a
/// non-aggressive scavenge returns it to the OS.
pub const DEFAULT_DIRTY_PAGE_THRESHOLD: usize = (32 << 20) / crate::util::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshConfig {
    pub arena_size: usize,
    /// 0 disables opportunistic meshing from the free path.
    pub mesh_period_ms: usize,
    pub max_meshes: usize,
    pub max_empty_spans: usize,
    pub max_mesh_count: usize,
    pub max_meshes_per_iteration: usize,
    pub dirty_page_threshold: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            mesh_period_ms: DEFAULT_MESH_PERIOD_MS,
            max_meshes: DEFAULT_MAX_MESHES,
            max_empty_spans: DEFAULT_MAX_EMPTY_SPANS,
            max_mesh_count: DEFAULT_MAX_MESH_COUNT,
            max_meshes_per_iteration: DEFAULT_MAX_MESHES_PER_ITERATION,
            dirty_page_threshold: DEFAULT_DIRTY_PAGE_THRESHOLD,
        }
    }
}

impl MeshConfig {
    pub const fn with_arena_size(self, arena_size: usize) -> Self {
        Self { arena_size, ..self }
    }

    pub const fn with_mesh_period_ms(self, mesh_period_ms: usize) -> Self {
        Self {
            mesh_period_ms,
            ..self
        }
    }

    pub const fn with_max_meshes(self, max_meshes: usize) -> Self {
        Self { max_meshes, ..self }
    }

    pub const fn with_max_empty_spans(self, max_empty_spans: usize) -> Self {
        Self {
            max_empty_spans,
            ..self
        }
    }

    pub const fn with_max_mesh_count(self, max_mesh_count: usize) -> Self {
        Self {
            max_mesh_count,
            ..self
        }
    }

    pub const fn with_max_meshes_per_iteration(self, max_meshes_per_iteration: usize) -> Self {
        Self {
            max_meshes_per_iteration,
            ..self
        }
    }

    pub const fn with_dirty_page_threshold(self, dirty_page_threshold: usize) -> Self {
        Self {
            dirty_page_threshold,
            ..self
        }
    }

    /// Defaults overridden by `MESH_*` environment variables.
    ///
    /// # Safety
    /// Calls `libc::getenv`, which races with concurrent `setenv`. Call from
    /// init or while no other thread mutates the environment.
    pub unsafe fn from_env() -> Self {
        let mut conf = Self::default();
        if let Some(val) = getenv_usize(b"MESH_ARENA_SIZE\0") {
            conf.arena_size = val;
        }
        if let Some(val) = getenv_usize(b"MESH_PERIOD_MS\0") {
            conf.mesh_period_ms = val;
        }
        if let Some(val) = getenv_usize(b"MESH_MAX_MESHES\0") {
            conf.max_meshes = val;
        }
        if let Some(val) = getenv_usize(b"MESH_MAX_EMPTY\0") {
            conf.max_empty_spans = val;
        }
        if let Some(val) = getenv_usize(b"MESH_MAX_MESH_COUNT\0") {
            conf.max_mesh_count = val;
        }
        conf
    }
}

/// Check if the process singleton is disabled via env var.
///
/// # Safety
/// Calls libc::getenv which is not thread-safe, so must be called during init.
pub unsafe fn is_disabled() -> bool {
    let key = b"MESH_DISABLE\0".as_ptr() as *const libc::c_char;
    !libc::getenv(key).is_null()
}

/// Parse an environment variable as a usize.
///
/// # Safety
/// Calls libc::getenv.
unsafe fn getenv_usize(key: &[u8]) -> Option<usize> {
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return None;
    }
    parse_usize(core::ffi::CStr::from_ptr(val).to_bytes())
}

/// Parse decimal digits with overflow checking (no std allocation).
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((byte - b'0') as usize)?;
    }
    Some(result)
}
