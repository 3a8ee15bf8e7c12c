//! Lazily initialised process-wide heap behind the C entry points.

use crate::allocator::GlobalHeap;
use crate::arena::MemfdArena;
use crate::config::{self, MeshConfig};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

struct HeapHolder(UnsafeCell<MaybeUninit<GlobalHeap<MemfdArena>>>);
unsafe impl Sync for HeapHolder {}

static HEAP: HeapHolder = HeapHolder(UnsafeCell::new(MaybeUninit::uninit()));

/// Build the process heap from `MESH_*` environment settings. Concurrent
/// callers wait for the first one to finish.
///
/// # Safety
/// Reads the environment with `libc::getenv`; no other thread may be
/// mutating it.
pub unsafe fn meshalloc_init() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    if config::is_disabled() {
        INIT_STATE.store(DISABLED, Ordering::Release);
        return;
    }

    let conf = MeshConfig::from_env();
    match MemfdArena::new(&conf) {
        Ok(arena) => {
            (*HEAP.0.get()).write(GlobalHeap::new(arena, conf));
            INIT_STATE.store(READY, Ordering::Release);
        }
        Err(err) => {
            tracing::warn!(%err, "mesh heap unavailable");
            INIT_STATE.store(DISABLED, Ordering::Release);
        }
    }
}

/// The process heap, initialising it on first use. `None` when disabled by
/// `MESH_DISABLE` or when the arena could not be created.
///
/// # Safety
/// Same as [`meshalloc_init`] on the first call.
#[inline]
pub unsafe fn heap() -> Option<&'static GlobalHeap<MemfdArena>> {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        ensure_initialized();
        if INIT_STATE.load(Ordering::Acquire) != READY {
            return None;
        }
    }
    Some((*HEAP.0.get()).assume_init_ref())
}

#[cold]
#[inline(never)]
unsafe fn ensure_initialized() {
    meshalloc_init();
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

pub const STATE_READY: u8 = READY;
pub const STATE_DISABLED: u8 = DISABLED;
