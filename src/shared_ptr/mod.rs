//! Atomically updatable shared pointers.
//!
//! [`AtomicSharedPtr<T>`] is a shared-ownership slot with the
//! `load`/`store`/`exchange`/`compare_exchange` surface of an atomic
//! shared pointer. `load` hands out a [`SharedHandle<T>`], the plain
//! (non-atomic) strong handle; [`WeakHandle<T>`] and
//! [`AtomicWeakPtr<T>`] are the weak counterparts.
//!
//! The slot itself is a hazard-protected pointer to a control block
//! carrying two sticky counters, so a reader can safely touch a block
//! that a concurrent `store` is in the middle of dropping.

mod control;

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering;

use control::{new_box_block, new_deleter_block, new_inline_block, CbCore};

use crate::hazard::HazardAtomicPtr;

/// Non-atomic strong handle; the `load` result. Cheap to clone (two
/// wait-free increments), releases its references on drop.
pub struct SharedHandle<T> {
    cb: *mut CbCore,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for SharedHandle<T> {}
unsafe impl<T: Send + Sync> Sync for SharedHandle<T> {}

impl<T> SharedHandle<T> {
    pub fn new(value: T) -> Self {
        Self::from_cb(new_inline_block(value))
    }

    pub fn from_box(value: Box<T>) -> Self {
        Self::from_cb(new_box_block(value))
    }

    /// Manage `payload` through `deleter`.
    ///
    /// # Safety
    ///
    /// `payload` must stay valid until the deleter runs, and nothing else
    /// may free it.
    pub unsafe fn with_deleter<D: FnMut(*mut T) + Send + 'static>(
        payload: *mut T,
        deleter: D,
    ) -> Self {
        Self::from_cb(new_deleter_block(payload, deleter))
    }

    pub const fn empty() -> Self {
        Self {
            cb: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    fn from_cb(cb: *mut CbCore) -> Self {
        Self {
            cb,
            _marker: PhantomData,
        }
    }

    fn into_cb(self) -> *mut CbCore {
        let cb = self.cb;
        core::mem::forget(self);
        cb
    }

    pub fn is_empty(&self) -> bool {
        self.cb.is_null()
    }

    pub fn get(&self) -> *mut T {
        if self.cb.is_null() {
            return ptr::null_mut();
        }
        unsafe { CbCore::resource(self.cb) as *mut T }
    }

    pub fn as_ref(&self) -> Option<&T> {
        let p = self.get();
        if p.is_null() {
            None
        } else {
            Some(unsafe { &*p })
        }
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(&mut self.cb, &mut other.cb);
    }

    /// Strong references currently held; zero once the resource is gone.
    pub fn use_count(&self) -> u64 {
        if self.cb.is_null() {
            0
        } else {
            unsafe { &*self.cb }.strong_count()
        }
    }

    /// Owner-based ordering, the `owner_before` of shared pointers:
    /// compares control blocks, not payloads.
    pub fn owner_before(&self, other: &Self) -> bool {
        (self.cb as usize) < (other.cb as usize)
    }

    pub fn downgrade(&self) -> WeakHandle<T> {
        if self.cb.is_null() || !unsafe { &*self.cb }.increment_weak() {
            return WeakHandle::empty();
        }
        WeakHandle {
            cb: self.cb,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SharedHandle<T> {
    fn clone(&self) -> Self {
        if self.cb.is_null() || !unsafe { &*self.cb }.increment_strong() {
            return Self::empty();
        }
        Self::from_cb(self.cb)
    }
}

impl<T> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        if !self.cb.is_null() {
            unsafe { CbCore::decrement_strong(self.cb) };
        }
    }
}

impl<T> Default for SharedHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Non-atomic weak handle.
pub struct WeakHandle<T> {
    cb: *mut CbCore,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for WeakHandle<T> {}
unsafe impl<T: Send + Sync> Sync for WeakHandle<T> {}

impl<T> WeakHandle<T> {
    pub const fn empty() -> Self {
        Self {
            cb: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    fn from_cb(cb: *mut CbCore) -> Self {
        Self {
            cb,
            _marker: PhantomData,
        }
    }

    fn into_cb(self) -> *mut CbCore {
        let cb = self.cb;
        core::mem::forget(self);
        cb
    }

    pub fn is_empty(&self) -> bool {
        self.cb.is_null()
    }

    /// True once the managed resource has been released (or the handle is
    /// empty).
    pub fn expired(&self) -> bool {
        self.cb.is_null() || unsafe { &*self.cb }.expired()
    }

    /// Upgrade to a strong handle; empty when the resource is gone.
    pub fn lock(&self) -> SharedHandle<T> {
        if self.cb.is_null() || !unsafe { &*self.cb }.increment_strong() {
            return SharedHandle::empty();
        }
        SharedHandle::from_cb(self.cb)
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    pub fn owner_before(&self, other: &Self) -> bool {
        (self.cb as usize) < (other.cb as usize)
    }
}

impl<T> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        if self.cb.is_null() || !unsafe { &*self.cb }.increment_weak() {
            return Self::empty();
        }
        Self::from_cb(self.cb)
    }
}

impl<T> Drop for WeakHandle<T> {
    fn drop(&mut self) {
        if !self.cb.is_null() {
            unsafe { CbCore::decrement_weak(self.cb) };
        }
    }
}

impl<T> Default for WeakHandle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Atomic shared-ownership slot.
pub struct AtomicSharedPtr<T> {
    slot: HazardAtomicPtr<CbCore>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for AtomicSharedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSharedPtr<T> {}

impl<T> AtomicSharedPtr<T> {
    pub const fn empty() -> Self {
        Self {
            slot: HazardAtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Take over `handle`'s reference as the initial value.
    pub fn new(handle: SharedHandle<T>) -> Self {
        Self {
            slot: HazardAtomicPtr::new(handle.into_cb()),
            _marker: PhantomData,
        }
    }

    /// Snapshot the current value as a strong handle. Empty when the slot
    /// is null or the resource was released under us.
    pub fn load(&self) -> SharedHandle<T> {
        let snapshot = self.slot.protect();
        if snapshot.is_null() {
            return SharedHandle::empty();
        }
        let cb = snapshot.as_ptr();
        if unsafe { &*cb }.increment_strong() {
            SharedHandle::from_cb(cb)
        } else {
            SharedHandle::empty()
        }
    }

    /// Replace the current value, dropping the old reference.
    pub fn store(&self, handle: SharedHandle<T>) {
        let old = self.slot.swap(handle.into_cb(), Ordering::AcqRel);
        if !old.is_null() {
            unsafe { CbCore::decrement_strong(old) };
        }
    }

    /// Swap in `handle` and return the previous value.
    pub fn exchange(&self, handle: SharedHandle<T>, order: Ordering) -> SharedHandle<T> {
        let old = self.slot.swap(handle.into_cb(), order);
        if old.is_null() {
            SharedHandle::empty()
        } else {
            SharedHandle::from_cb(old)
        }
    }

    /// May fail spuriously; see [`compare_exchange_strong`](Self::compare_exchange_strong).
    pub fn compare_exchange_weak(
        &self,
        expected: &mut SharedHandle<T>,
        desired: &SharedHandle<T>,
        order: Ordering,
    ) -> bool {
        self.compare_exchange_impl(false, expected, desired, order)
    }

    /// CAS on the slot. On success the slot's old reference is released
    /// and `desired` is duplicated into the slot; `expected` keeps its
    /// reference. On failure `expected` is replaced with a handle to the
    /// observed value.
    pub fn compare_exchange_strong(
        &self,
        expected: &mut SharedHandle<T>,
        desired: &SharedHandle<T>,
        order: Ordering,
    ) -> bool {
        self.compare_exchange_impl(true, expected, desired, order)
    }

    fn compare_exchange_impl(
        &self,
        is_strong: bool,
        expected: &mut SharedHandle<T>,
        desired: &SharedHandle<T>,
        order: Ordering,
    ) -> bool {
        let exp_cb = expected.cb;
        // Reserve the reference the slot will hold on success. The caller
        // holds a strong reference to `desired`, so this cannot fail.
        if !desired.cb.is_null() {
            let ok = unsafe { &*desired.cb }.increment_strong();
            debug_assert!(ok);
        }
        let mut snapshot = self.slot.protect();
        loop {
            let result = if is_strong {
                self.slot
                    .compare_exchange(exp_cb, desired.cb, order, Ordering::Acquire)
            } else {
                self.slot
                    .compare_exchange_weak(exp_cb, desired.cb, order, Ordering::Acquire)
            };
            match result {
                Ok(old) => {
                    if !old.is_null() {
                        unsafe { CbCore::decrement_strong(old) };
                    }
                    return true;
                }
                Err(observed) => {
                    if observed == snapshot.as_ptr() {
                        // The observed block is hazard-protected, so its
                        // counters are safe to touch: undo the desired
                        // reservation and move `expected` to it.
                        if !desired.cb.is_null() {
                            unsafe { CbCore::decrement_strong(desired.cb) };
                        }
                        let adopted = if observed.is_null() {
                            SharedHandle::empty()
                        } else if unsafe { &*observed }.increment_strong() {
                            SharedHandle::from_cb(observed)
                        } else {
                            // Retired between the CAS and here.
                            SharedHandle::empty()
                        };
                        *expected = adopted;
                        return false;
                    }
                    // Unknown pointer: it may already have been reclaimed,
                    // so restart from a freshly protected snapshot.
                    self.slot.reuse_to_verify_exchange(&mut snapshot);
                    while !self.slot.verify_exchange(&mut snapshot) {}
                }
            }
        }
    }
}

impl<T> Drop for AtomicSharedPtr<T> {
    fn drop(&mut self) {
        let cb = self.slot.load(Ordering::Acquire);
        if !cb.is_null() {
            unsafe { CbCore::decrement_strong(cb) };
        }
    }
}

impl<T> Default for AtomicSharedPtr<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Atomic weak-ownership slot.
pub struct AtomicWeakPtr<T> {
    slot: HazardAtomicPtr<CbCore>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for AtomicWeakPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicWeakPtr<T> {}

impl<T> AtomicWeakPtr<T> {
    pub const fn empty() -> Self {
        Self {
            slot: HazardAtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn new(handle: WeakHandle<T>) -> Self {
        Self {
            slot: HazardAtomicPtr::new(handle.into_cb()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> WeakHandle<T> {
        let snapshot = self.slot.protect();
        if snapshot.is_null() {
            return WeakHandle::empty();
        }
        let cb = snapshot.as_ptr();
        if unsafe { &*cb }.increment_weak() {
            WeakHandle::from_cb(cb)
        } else {
            WeakHandle::empty()
        }
    }

    pub fn store(&self, handle: WeakHandle<T>) {
        let old = self.slot.swap(handle.into_cb(), Ordering::AcqRel);
        if !old.is_null() {
            unsafe { CbCore::decrement_weak(old) };
        }
    }

    pub fn exchange(&self, handle: WeakHandle<T>, order: Ordering) -> WeakHandle<T> {
        let old = self.slot.swap(handle.into_cb(), order);
        if old.is_null() {
            WeakHandle::empty()
        } else {
            WeakHandle::from_cb(old)
        }
    }
}

impl<T> Drop for AtomicWeakPtr<T> {
    fn drop(&mut self) {
        let cb = self.slot.load(Ordering::Acquire);
        if !cb.is_null() {
            unsafe { CbCore::decrement_weak(cb) };
        }
    }
}

impl<T> Default for AtomicWeakPtr<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hazard::prune;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn store_then_load_sees_the_value() {
        let slot = AtomicSharedPtr::empty();
        slot.store(SharedHandle::new(7));
        let loaded = slot.load();
        assert_eq!(*loaded.as_ref().unwrap(), 7);
        prune();
    }

    #[test]
    fn empty_slot_loads_empty() {
        let slot: AtomicSharedPtr<u32> = AtomicSharedPtr::empty();
        assert!(slot.load().is_empty());
    }

    #[test]
    fn payload_dropped_exactly_once() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let before = DROPS.load(AtomicOrdering::SeqCst);
        {
            let slot = AtomicSharedPtr::new(SharedHandle::new(Tracked));
            let a = slot.load();
            let b = a.clone();
            drop(a);
            drop(slot);
            assert_eq!(DROPS.load(AtomicOrdering::SeqCst), before);
            drop(b);
        }
        assert_eq!(DROPS.load(AtomicOrdering::SeqCst), before + 1);
        prune();
    }

    #[test]
    fn exchange_returns_the_old_value() {
        let slot = AtomicSharedPtr::new(SharedHandle::new(1));
        let old = slot.exchange(SharedHandle::new(2), Ordering::AcqRel);
        assert_eq!(*old.as_ref().unwrap(), 1);
        assert_eq!(*slot.load().as_ref().unwrap(), 2);
        prune();
    }

    #[test]
    fn compare_exchange_success_and_failure() {
        let slot = AtomicSharedPtr::new(SharedHandle::new(1));
        let mut expected = slot.load();
        let desired = SharedHandle::new(2);
        assert!(slot.compare_exchange_strong(&mut expected, &desired, Ordering::AcqRel));
        assert_eq!(*slot.load().as_ref().unwrap(), 2);

        // `expected` still refers to the old value; the next CAS must fail
        // and move it to the current one.
        let other = SharedHandle::new(3);
        assert!(!slot.compare_exchange_strong(&mut expected, &other, Ordering::AcqRel));
        assert_eq!(*expected.as_ref().unwrap(), 2);
        prune();
    }

    #[test]
    fn weak_expires_with_the_last_strong() {
        let strong = SharedHandle::new(5);
        let weak = strong.downgrade();
        assert!(!weak.expired());
        assert_eq!(*weak.lock().as_ref().unwrap(), 5);
        drop(strong);
        assert!(weak.expired());
        assert!(weak.lock().is_empty());
        prune();
    }

    #[test]
    fn atomic_weak_roundtrip() {
        let strong = SharedHandle::new(9);
        let slot = AtomicWeakPtr::new(strong.downgrade());
        let weak = slot.load();
        assert_eq!(*weak.lock().as_ref().unwrap(), 9);
        drop(strong);
        assert!(slot.load().expired());
        prune();
    }

    #[test]
    fn concurrent_store_load_never_sees_freed_payload() {
        let slot = Arc::new(AtomicSharedPtr::new(SharedHandle::new(0usize)));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for i in 0..500 {
                        slot.store(SharedHandle::new(w * 1000 + i));
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let h = slot.load();
                        if let Some(v) = h.as_ref() {
                            // Touch the payload; a reclaimed block would
                            // be a use-after-free under sanitizers.
                            assert!(*v < 4000);
                        }
                    }
                })
            })
            .collect();
        for h in writers.into_iter().chain(readers) {
            h.join().unwrap();
        }
        prune();
    }

    #[test]
    fn racing_compare_exchange_has_one_winner() {
        for _ in 0..50 {
            let slot = Arc::new(AtomicSharedPtr::new(SharedHandle::new(0)));
            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (1..=2)
                .map(|v| {
                    let slot = slot.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        let mut expected = slot.load();
                        let desired = SharedHandle::new(v);
                        if *expected.as_ref().unwrap() == 0
                            && slot.compare_exchange_strong(
                                &mut expected,
                                &desired,
                                Ordering::AcqRel,
                            )
                        {
                            wins.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(wins.load(AtomicOrdering::SeqCst), 1);
            assert_ne!(*slot.load().as_ref().unwrap(), 0);
            prune();
        }
    }
}
