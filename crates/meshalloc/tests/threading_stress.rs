//! Thread stress tests for the mesh heap.
//!
//! These exercise the heap under multi-threaded contention, verifying that
//! concurrent allocate/free and frees racing a mesh pass do not corrupt
//! objects or heap metadata.

mod common;

use common::{heap_with, stamp, stamped, test_config};
use meshalloc::{GlobalHeap, MemfdArena};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

/// Wrapper to allow sending `*mut u8` across thread boundaries.
/// Safety: the pointers inside are heap-allocated by our heap, which is
/// thread-safe. We only send ownership (one thread allocates, another frees).
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

fn shared_heap() -> Arc<GlobalHeap<MemfdArena>> {
    Arc::new(heap_with(test_config().with_arena_size(512 << 20)))
}

fn assert_drained(heap: &GlobalHeap<MemfdArena>) {
    let res = heap.check_integrity();
    assert!(res.is_ok(), "{:?}", res);
    let stats = heap.stats();
    assert_eq!(stats.mh_alloc_count, stats.mh_free_count, "{:?}", stats);
}

// ---------------------------------------------------------------------------
// N threads doing rapid allocate/free cycles
// ---------------------------------------------------------------------------

fn stress_alloc_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 5_000;

    let heap = shared_heap();
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(t as u64);
                barrier.wait();
                for i in 0..ITERATIONS {
                    let size = if i % 97 == 0 { rng.usize(20_000..100_000) } else { rng.usize(1..2048) };
                    let p = heap.allocate(size);
                    assert!(!p.is_null(), "allocate returned NULL under contention");
                    unsafe {
                        stamp(p, size, t as u8);
                        assert!(stamped(p, size, t as u8));
                    }
                    heap.free(p);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during allocate/free stress");
    }
    assert_drained(&heap);
}

#[test]
fn stress_alloc_free_4_threads() {
    stress_alloc_free_n_threads(4);
}

#[test]
fn stress_alloc_free_8_threads() {
    stress_alloc_free_n_threads(8);
}

// ---------------------------------------------------------------------------
// Cross-thread free: one thread allocates, another frees
// ---------------------------------------------------------------------------

#[test]
fn cross_thread_free() {
    const COUNT: usize = 20_000;

    let heap = shared_heap();
    let (tx, rx) = mpsc::channel::<(SendPtr, u8)>();

    let producer = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for i in 0..COUNT {
                let p = heap.allocate(64);
                assert!(!p.is_null());
                unsafe { stamp(p, 64, i as u8) };
                tx.send((SendPtr(p), i as u8)).unwrap();
            }
        })
    };

    let consumer = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            for (p, tag) in rx {
                assert!(unsafe { stamped(p.0, 64, tag) }, "object corrupted in transit");
                heap.free(p.0);
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_drained(&heap);
}

// ---------------------------------------------------------------------------
// Frees and reads racing mesh passes
// ---------------------------------------------------------------------------

#[test]
fn frees_race_mesh_passes() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 4_000;

    let heap = shared_heap();
    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let done = Arc::new(AtomicBool::new(false));

    // Objects are written before meshing starts; while passes run the
    // workers only read and free.
    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(100 + t as u64);
                let mut live: Vec<(SendPtr, usize, u8)> = (0..PER_THREAD)
                    .map(|i| {
                        let size = [48, 256, 512, 1024][i % 4];
                        let p = heap.allocate(size);
                        assert!(!p.is_null());
                        let tag = (t * 31 + i) as u8;
                        unsafe { stamp(p, size, tag) };
                        (SendPtr(p), size, tag)
                    })
                    .collect();

                barrier.wait();
                rng.shuffle(&mut live);
                let keep = live.split_off(live.len() * 3 / 4);
                for (p, size, tag) in live {
                    assert!(unsafe { stamped(p.0, size, tag) });
                    heap.free(p.0);
                }
                for &(p, size, tag) in &keep {
                    assert!(unsafe { stamped(p.0, size, tag) });
                }
                keep
            })
        })
        .collect();

    let compactor = {
        let heap = Arc::clone(&heap);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            barrier.wait();
            let mut passes = 0;
            loop {
                heap.compact();
                passes += 1;
                if done.load(Ordering::Acquire) {
                    break passes;
                }
                thread::yield_now();
            }
        })
    };

    let survivors: Vec<_> = workers
        .into_iter()
        .flat_map(|h| h.join().expect("worker panicked"))
        .collect();
    done.store(true, Ordering::Release);
    assert!(compactor.join().unwrap() > 0);

    // One more pass with every worker finished, then check the survivors
    heap.free(heap.allocate(48));
    heap.compact();
    for &(p, size, tag) in &survivors {
        assert!(unsafe { stamped(p.0, size, tag) }, "survivor corrupted by meshing");
    }
    assert!(heap.check_integrity().is_ok());

    for (p, _, _) in survivors {
        heap.free(p.0);
    }
    assert_drained(&heap);
}
