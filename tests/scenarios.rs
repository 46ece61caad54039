//! End-to-end scenarios across the subsystems.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use waitless::collections::Fifo;
use waitless::hazard::{self, assign_hazard_slot, is_hazard_ptr};
use waitless::shared_ptr::{AtomicSharedPtr, SharedHandle};
use waitless::sticky::StickyCounter;
use waitless::{gmem_allocate, gmem_deallocate};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn fifo_basic() {
    init_logging();
    let q: Fifo<u32> = Fifo::new();
    q.push(1);
    q.push(2);
    assert_eq!(q.pop(), Some(1));
    assert_eq!(q.pop(), Some(2));
    assert_eq!(q.pop(), None);
}

#[test]
#[cfg(not(feature = "sanitizer-fallback"))]
fn allocator_reuses_the_freed_slot() {
    init_logging();
    let p1 = gmem_allocate(16);
    assert!(!p1.is_null());
    assert!(gmem_deallocate(p1));
    let p2 = gmem_allocate(16);
    assert_eq!(p1, p2);
    assert!(gmem_deallocate(p2));
}

#[test]
fn hazard_protects_a_retiring_pointer() {
    init_logging();
    static DELETED: AtomicUsize = AtomicUsize::new(0);

    let p = Box::into_raw(Box::new(123u64));
    let owner = assign_hazard_slot(p as *mut ()).unwrap();

    // Another thread retires while the slot is still published.
    {
        let addr = p as usize;
        thread::spawn(move || unsafe {
            unsafe fn deleter(q: *mut ()) {
                DELETED.fetch_add(1, Ordering::SeqCst);
                drop(Box::from_raw(q as *mut u64));
            }
            hazard::retire_with(addr as *mut (), deleter);
        })
        .join()
        .unwrap();
    }

    assert!(is_hazard_ptr(p as *mut ()));
    hazard::prune();
    assert_eq!(DELETED.load(Ordering::SeqCst), 0, "protected: must not free");

    drop(owner);
    // The global drain is try-lock; retry in case a concurrent pruner
    // holds it.
    for _ in 0..1000 {
        hazard::prune();
        if DELETED.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::yield_now();
    }
    assert_eq!(DELETED.load(Ordering::SeqCst), 1, "released: must free");
}

#[test]
#[cfg(not(feature = "sanitizer-fallback"))]
fn double_free_detection() {
    init_logging();
    let p = gmem_allocate(32);
    assert!(gmem_deallocate(p));
    assert!(!gmem_deallocate(p));
}

#[test]
fn sticky_counter_single_zero_winner() {
    init_logging();
    let counter = Arc::new(StickyCounter::new());
    counter.increment_if_not_zero(); // count = 2
    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let counter = counter.clone();
            let winners = winners.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if counter.decrement_then_is_zero() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn queue_handoff_with_channel_coordination() {
    init_logging();
    let q = Arc::new(Fifo::<u64>::new());
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    const N: u64 = 1_000;

    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for i in 0..N {
                q.push(i);
            }
            done_tx.send(()).unwrap();
        })
    };
    done_rx
        .recv_timeout(std::time::Duration::from_secs(10))
        .unwrap();
    let mut popped = 0;
    let mut last = None;
    while let Some(v) = q.pop() {
        if let Some(prev) = last {
            assert!(v > prev, "single-producer order must hold");
        }
        last = Some(v);
        popped += 1;
    }
    assert_eq!(popped, N);
    producer.join().unwrap();
    hazard::prune();
}

#[test]
fn shared_ptr_store_load_across_threads() {
    init_logging();
    static DROPS: AtomicUsize = AtomicUsize::new(0);
    struct Payload(u64);
    impl Drop for Payload {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let slot = Arc::new(AtomicSharedPtr::<Payload>::empty());
    let ready = Arc::new(Barrier::new(2));

    let writer = {
        let slot = slot.clone();
        let ready = ready.clone();
        thread::spawn(move || {
            slot.store(SharedHandle::new(Payload(7)));
            ready.wait();
        })
    };
    let reader = {
        let slot = slot.clone();
        let ready = ready.clone();
        thread::spawn(move || {
            ready.wait();
            let h = slot.load();
            assert_eq!(h.as_ref().unwrap().0, 7);
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    slot.store(SharedHandle::empty());
    hazard::prune();
    assert_eq!(DROPS.load(Ordering::SeqCst), 1, "pointee freed exactly once");
}
