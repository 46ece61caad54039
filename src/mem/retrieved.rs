//! Parking area for deallocated slots waiting to be reused.
//!
//! A retired slot goes to one of two places depending on whether some
//! thread still publishes it as a hazard pointer: the lock-free free
//! stack (reusable immediately) or the mutex-guarded in-hazard stack
//! (re-probed before reuse). Keeping hazard-protected slots off the
//! free stack is also what makes the free-stack pop ABA-safe: a slot can
//! never reappear at the head while another pop still holds it protected.
//!
//! The thread-local tier for the small-slot classes lives next to the
//! class table in `small.rs`; this module provides the two global tiers.

use core::ptr;
use core::sync::atomic::{fence, AtomicPtr, Ordering};
use std::sync::Mutex;

use crate::hazard::{is_hazard_ptr, HazardAtomicPtr};

/// A slot type that can be parked on retrieval stacks.
///
/// # Safety
///
/// `free_link` must return a field that stays valid for the whole life of
/// the slot storage; `tmp_next` accessors may only be used while the slot
/// is parked (they may overlap the user data area).
pub unsafe trait Retrievable: Sized {
    fn free_link(&self) -> &AtomicPtr<Self>;
    unsafe fn set_tmp_next(&self, next: *mut Self);
    unsafe fn tmp_next(&self) -> *mut Self;
}

/// Single-owner stack linked through the temporary links. Used for the
/// thread-local tiers and, under a mutex, for the in-hazard tier.
pub struct LocalStack<T: Retrievable> {
    head: *mut T,
    count: usize,
}

unsafe impl<T: Retrievable> Send for LocalStack<T> {}

impl<T: Retrievable> LocalStack<T> {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    pub fn push(&mut self, p: *mut T) {
        if p.is_null() {
            return;
        }
        unsafe { (*p).set_tmp_next(self.head) };
        self.head = p;
        self.count += 1;
    }

    pub fn pop(&mut self) -> *mut T {
        let p = self.head;
        if p.is_null() {
            return ptr::null_mut();
        }
        self.head = unsafe { (*p).tmp_next() };
        self.count -= 1;
        p
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Move every entry of `src` onto `self`.
    pub fn merge(&mut self, src: &mut LocalStack<T>) {
        loop {
            let p = src.pop();
            if p.is_null() {
                break;
            }
            self.push(p);
        }
    }
}

/// The two global tiers of one retrieval manager.
pub struct RetrievedSlotsMgr<T: Retrievable> {
    free_stack: HazardAtomicPtr<T>,
    in_hazard: Mutex<LocalStack<T>>,
}

impl<T: Retrievable> RetrievedSlotsMgr<T> {
    pub const fn new() -> Self {
        Self {
            free_stack: HazardAtomicPtr::new(ptr::null_mut()),
            in_hazard: Mutex::new(LocalStack::new()),
        }
    }

    /// Park a retired slot. The hazard probe decides the tier.
    pub fn retrieve(&self, p: *mut T) {
        if p.is_null() {
            log::error!("null slot passed to retrieval manager");
            return;
        }
        fence(Ordering::SeqCst);
        if is_hazard_ptr(p as *mut ()) {
            self.push_in_hazard(p);
        } else {
            self.push_free(p);
        }
    }

    /// Pop a reusable slot: free stack first, then the in-hazard stack
    /// with a re-probe per entry. Null when both are exhausted.
    pub fn request_reuse(&self) -> *mut T {
        let p = self.pop_free();
        if !p.is_null() {
            return p;
        }
        self.pop_in_hazard_filtered()
    }

    pub fn push_free(&self, p: *mut T) {
        let link = unsafe { (*p).free_link() };
        let mut head = self.free_stack.load(Ordering::Acquire);
        loop {
            link.store(head, Ordering::Release);
            match self.free_stack.compare_exchange_weak(
                head,
                p,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn pop_free(&self) -> *mut T {
        let mut snapshot = self.free_stack.get_to_verify_exchange();
        loop {
            if !self.free_stack.verify_exchange(&mut snapshot) {
                continue;
            }
            if snapshot.is_null() {
                return ptr::null_mut();
            }
            let next = unsafe { (*snapshot.as_ptr()).free_link() }.load(Ordering::Acquire);
            if self.free_stack.compare_exchange_protected(&mut snapshot, next) {
                return snapshot.as_ptr();
            }
        }
    }

    pub fn push_in_hazard(&self, p: *mut T) {
        match self.in_hazard.lock() {
            Ok(mut stack) => stack.push(p),
            Err(poisoned) => poisoned.into_inner().push(p),
        }
    }

    /// Pop the first entry that is no longer hazard-protected; entries
    /// that still are go back on the stack.
    fn pop_in_hazard_filtered(&self) -> *mut T {
        let mut stack = match self.in_hazard.lock() {
            Ok(stack) => stack,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut still_hazard = LocalStack::new();
        let mut found = ptr::null_mut();
        fence(Ordering::SeqCst);
        loop {
            let p = stack.pop();
            if p.is_null() {
                break;
            }
            if !is_hazard_ptr(p as *mut ()) {
                found = p;
                break;
            }
            still_hazard.push(p);
        }
        stack.merge(&mut still_hazard);
        found
    }

    /// Fold a terminating thread's local tiers into the global ones.
    pub fn merge_local(&self, non_hazard: &mut LocalStack<T>, in_hazard: &mut LocalStack<T>) {
        loop {
            let p = non_hazard.pop();
            if p.is_null() {
                break;
            }
            self.push_free(p);
        }
        if !in_hazard.is_empty() {
            let mut stack = match self.in_hazard.lock() {
                Ok(stack) => stack,
                Err(poisoned) => poisoned.into_inner(),
            };
            stack.merge(in_hazard);
        }
    }

    /// Drop every parked entry; test teardown only.
    pub fn reset_for_test(&self) {
        self.free_stack.store(ptr::null_mut(), Ordering::Release);
        if let Ok(mut stack) = self.in_hazard.lock() {
            *stack = LocalStack::new();
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let mut free = 0;
        let mut p = self.free_stack.load(Ordering::Acquire);
        while !p.is_null() {
            free += 1;
            p = unsafe { (*p).free_link() }.load(Ordering::Acquire);
        }
        let hazard = match self.in_hazard.lock() {
            Ok(stack) => stack.count(),
            Err(poisoned) => poisoned.into_inner().count(),
        };
        (free, hazard)
    }
}
