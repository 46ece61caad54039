//! Deferred reclamation of retired pointers.
//!
//! Each thread keeps a FIFO list of retired entries and drains it
//! cooperatively: every `retire` attempts one reclamation before and after
//! the append. An entry whose pointer is still published in some hazard
//! slot is handed to the mutex-guarded global list instead (try-lock only,
//! never blocking on the hot path), which keeps the thread-local list
//! short. A terminating thread transfers its whole remainder to the global
//! list under the lock.

#[cfg(not(feature = "check-loom"))]
use core::sync::atomic::{fence, Ordering};
#[cfg(feature = "check-loom")]
use loom::sync::atomic::{fence, Ordering};

use core::cell::Cell;
use core::ptr;
use std::sync::Mutex;

use super::group::is_hazard_ptr;

/// One retired pointer with its type-erased deleter.
struct RetireNode {
    ptr: *mut (),
    free: unsafe fn(*mut ()),
    next: *mut RetireNode,
}

impl RetireNode {
    fn boxed(ptr: *mut (), free: unsafe fn(*mut ())) -> *mut RetireNode {
        Box::into_raw(Box::new(RetireNode {
            ptr,
            free,
            next: ptr::null_mut(),
        }))
    }

    /// Run the deleter and free the node itself.
    unsafe fn reclaim(node: *mut RetireNode) {
        let owned = Box::from_raw(node);
        (owned.free)(owned.ptr);
    }
}

struct GlobalList {
    head: *mut RetireNode,
    tail: *mut RetireNode,
}

unsafe impl Send for GlobalList {}

impl GlobalList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn append_chain(&mut self, head: *mut RetireNode, tail: *mut RetireNode) {
        if head.is_null() {
            return;
        }
        if self.head.is_null() {
            self.head = head;
        } else {
            unsafe { (*self.tail).next = head };
        }
        self.tail = tail;
    }

    /// Reclaim the head entry if it is no longer hazard-protected.
    fn recycle_one(&mut self) -> bool {
        if self.head.is_null() {
            return false;
        }
        fence(Ordering::SeqCst);
        if is_hazard_ptr(unsafe { (*self.head).ptr }) {
            return false;
        }
        let node = self.head;
        self.head = unsafe { (*node).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        unsafe { RetireNode::reclaim(node) };
        true
    }
}

static GLOBAL_RETIRE: Mutex<GlobalList> = Mutex::new(GlobalList::new());

struct ThreadRetireList {
    head: Cell<*mut RetireNode>,
    tail: Cell<*mut RetireNode>,
}

impl ThreadRetireList {
    const fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            tail: Cell::new(ptr::null_mut()),
        }
    }

    fn append(&self, node: *mut RetireNode) {
        if self.head.get().is_null() {
            self.head.set(node);
        } else {
            unsafe { (*self.tail.get()).next = node };
        }
        self.tail.set(node);
    }

    fn pop_head(&self) -> *mut RetireNode {
        let node = self.head.get();
        debug_assert!(!node.is_null());
        self.head.set(unsafe { (*node).next });
        if self.head.get().is_null() {
            self.tail.set(ptr::null_mut());
        }
        unsafe { (*node).next = ptr::null_mut() };
        node
    }

    /// Reclaim or hand off at most one entry.
    fn recycle_one(&self) -> bool {
        let head = self.head.get();
        if head.is_null() {
            // Nothing local; help the global list opportunistically.
            if let Ok(mut global) = GLOBAL_RETIRE.try_lock() {
                global.recycle_one();
            }
            return false;
        }

        fence(Ordering::SeqCst);
        if is_hazard_ptr(unsafe { (*head).ptr }) {
            // Still protected; move it out of the way so the local list
            // stays short.
            if let Ok(mut global) = GLOBAL_RETIRE.try_lock() {
                let node = self.pop_head();
                global.append_chain(node, node);
            }
            return false;
        }

        let node = self.pop_head();
        unsafe { RetireNode::reclaim(node) };
        true
    }
}

impl Drop for ThreadRetireList {
    fn drop(&mut self) {
        while self.recycle_one() {}
        let head = self.head.get();
        if head.is_null() {
            return;
        }
        let tail = self.tail.get();
        self.head.set(ptr::null_mut());
        self.tail.set(ptr::null_mut());
        match GLOBAL_RETIRE.lock() {
            Ok(mut global) => global.append_chain(head, tail),
            Err(poisoned) => poisoned.into_inner().append_chain(head, tail),
        }
    }
}

thread_local! {
    static THREAD_RETIRE: ThreadRetireList = ThreadRetireList::new();
}

/// Schedule `p` for deletion once no hazard slot observes it.
///
/// # Safety
///
/// `p` must be exclusively retirable: removed from every shared location,
/// retired exactly once, and valid until `free` runs.
pub unsafe fn retire_with(p: *mut (), free: unsafe fn(*mut ())) {
    let node = RetireNode::boxed(p, free);
    let appended = THREAD_RETIRE
        .try_with(|list| {
            list.recycle_one();
            list.append(node);
            list.recycle_one();
        })
        .is_ok();
    if !appended {
        // Thread teardown: the local list is gone, hand straight to the
        // global list.
        match GLOBAL_RETIRE.lock() {
            Ok(mut global) => global.append_chain(node, node),
            Err(poisoned) => poisoned.into_inner().append_chain(node, node),
        }
    }
}

/// Retire an object placed through the crate allocator
/// ([`alloc_one`](crate::mem::alloc_one)).
///
/// # Safety
///
/// Same contract as [`retire_with`]; additionally `p` must have come from
/// `alloc_one::<T>`.
pub unsafe fn retire_obj<T>(p: *mut T) {
    unsafe fn free_one<T>(p: *mut ()) {
        crate::mem::dealloc_one(p as *mut T);
    }
    retire_with(p as *mut (), free_one::<T>);
}

/// Drain as many retired entries as possible, local and global.
pub fn prune() {
    THREAD_RETIRE
        .try_with(|list| while list.recycle_one() {})
        .ok();
    if let Ok(mut global) = GLOBAL_RETIRE.try_lock() {
        while global.recycle_one() {}
    }
}

#[cfg(all(test, not(feature = "check-loom")))]
mod test {
    use super::*;
    use crate::hazard::group::assign_hazard_slot;
    use crate::mem::alloc_one;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct CountsDrop(#[allow(dead_code)] usize);

    impl Drop for CountsDrop {
        fn drop(&mut self) {
            DROPS.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn unprotected_retire_reclaims_quickly() {
        let before = DROPS.load(AtomicOrdering::SeqCst);
        let p = alloc_one(CountsDrop(1));
        unsafe { retire_obj(p) };
        prune();
        assert!(DROPS.load(AtomicOrdering::SeqCst) > before);
    }

    #[test]
    fn protected_retire_waits_for_release() {
        let counter = Arc::new(AtomicUsize::new(0));
        let p = alloc_one(7usize);

        let owner = assign_hazard_slot(p as *mut ()).unwrap();

        // The deleter must not run while the slot is published.
        unsafe {
            static PENDING: AtomicUsize = AtomicUsize::new(0);
            unsafe fn noted_free(p: *mut ()) {
                PENDING.fetch_add(1, AtomicOrdering::SeqCst);
                crate::mem::dealloc_one(p as *mut usize);
            }
            PENDING.store(0, AtomicOrdering::SeqCst);
            retire_with(p as *mut (), noted_free);
            prune();
            assert_eq!(PENDING.load(AtomicOrdering::SeqCst), 0);

            drop(owner);
            // The global drain is try-lock and can lose to concurrent
            // pruners; retry until the deleter ran.
            for _ in 0..1000 {
                prune();
                if PENDING.load(AtomicOrdering::SeqCst) == 1 {
                    break;
                }
                std::thread::yield_now();
            }
            assert_eq!(PENDING.load(AtomicOrdering::SeqCst), 1);
        }
        let _ = counter;
    }

    #[test]
    fn exiting_thread_hands_off_protected_entries() {
        let p = alloc_one(11u32);
        let owner = assign_hazard_slot(p as *mut ()).unwrap();
        let p_addr = p as usize;
        std::thread::spawn(move || unsafe {
            // Retired on a thread that exits while the pointer is still
            // protected by the spawning thread.
            retire_obj(p_addr as *mut u32);
        })
        .join()
        .unwrap();
        // Entry must have survived the thread exit; releasing and pruning
        // reclaims it without touching freed memory.
        drop(owner);
        prune();
    }
}
