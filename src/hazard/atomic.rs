//! Hazard-protected atomic pointer.
//!
//! `HazardAtomicPtr<T>` is the seam between the containers and the
//! registry: it wraps an `AtomicPtr<T>` and exposes the two validation
//! forms of the hazard-pointer idiom. Either obtain a snapshot with
//! [`get_to_verify_exchange`](HazardAtomicPtr::get_to_verify_exchange) and
//! re-check it with [`verify_exchange`](HazardAtomicPtr::verify_exchange)
//! before dereferencing, or CAS the source directly against a protected
//! snapshot with
//! [`compare_exchange_protected`](HazardAtomicPtr::compare_exchange_protected).

use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::group::{assign_hazard_slot, HazardSlotOwner};

/// A pointer snapshot backed by a published hazard slot. While the value
/// is alive (and validated against its source), the pointee will not be
/// reclaimed through [`retire_with`](crate::hazard::retire_with).
pub struct Protected<T> {
    owner: HazardSlotOwner,
    ptr: *mut T,
    _marker: PhantomData<*mut T>,
}

impl<T> Protected<T> {
    fn acquire(p: *mut T) -> Self {
        let owner = match assign_hazard_slot(p as *mut ()) {
            Some(owner) => owner,
            // Same contract as the group allocator: running out of
            // registry storage is an allocation failure.
            None => std::alloc::handle_alloc_error(Layout::new::<usize>()),
        };
        Self {
            owner,
            ptr: p,
            _marker: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    ///
    /// The snapshot must have been validated against its source and the
    /// pointee must be initialized.
    pub unsafe fn deref(&self) -> &T {
        &*self.ptr
    }

    fn republish(&mut self, p: *mut T) {
        self.owner.publish(p as *mut ());
        self.ptr = p;
    }
}

pub struct HazardAtomicPtr<T> {
    inner: AtomicPtr<T>,
}

impl<T> HazardAtomicPtr<T> {
    pub const fn new(p: *mut T) -> Self {
        Self {
            inner: AtomicPtr::new(p),
        }
    }

    pub fn load(&self, order: Ordering) -> *mut T {
        self.inner.load(order)
    }

    pub fn store(&self, p: *mut T, order: Ordering) {
        self.inner.store(p, order)
    }

    pub fn swap(&self, p: *mut T, order: Ordering) -> *mut T {
        self.inner.swap(p, order)
    }

    pub fn compare_exchange(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        self.inner.compare_exchange(current, new, success, failure)
    }

    pub fn compare_exchange_weak(
        &self,
        current: *mut T,
        new: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<*mut T, *mut T> {
        self.inner.compare_exchange_weak(current, new, success, failure)
    }

    /// Publish the current value without validating it. The caller must
    /// loop on [`verify_exchange`](Self::verify_exchange) before
    /// dereferencing.
    pub fn get_to_verify_exchange(&self) -> Protected<T> {
        Protected::acquire(self.inner.load(Ordering::Relaxed))
    }

    /// Re-read the source. If it still equals the snapshot the protection
    /// is complete and `true` is returned; otherwise the snapshot is
    /// republished with the observed value and `false` is returned so the
    /// caller can retry.
    pub fn verify_exchange(&self, snapshot: &mut Protected<T>) -> bool {
        let observed = self.inner.load(Ordering::Acquire);
        if observed == snapshot.ptr {
            true
        } else {
            snapshot.republish(observed);
            false
        }
    }

    /// Publish-and-validate loop; returns a fully protected snapshot.
    pub fn protect(&self) -> Protected<T> {
        let mut snapshot = self.get_to_verify_exchange();
        // First publish happened before the verifying re-read, so the loop
        // is bounded by writer traffic, not thread count.
        while !self.verify_exchange(&mut snapshot) {}
        snapshot
    }

    /// Re-arm an old snapshot for another verify loop without releasing
    /// its hazard slot.
    pub fn reuse_to_verify_exchange(&self, snapshot: &mut Protected<T>) {
        snapshot.republish(self.inner.load(Ordering::Relaxed));
    }

    /// CAS the source using the protected snapshot as the expected value.
    /// On failure the snapshot is republished with the observed value, so
    /// it is again a candidate for verification.
    pub fn compare_exchange_protected(
        &self,
        snapshot: &mut Protected<T>,
        new: *mut T,
    ) -> bool {
        match self.inner.compare_exchange(
            snapshot.ptr,
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => {
                snapshot.republish(observed);
                false
            }
        }
    }
}

/// Publish-and-validate against a plain `AtomicPtr` field, for sources
/// that are links inside nodes rather than `HazardAtomicPtr` roots.
pub fn protect_atomic<T>(src: &AtomicPtr<T>) -> Protected<T> {
    let mut snapshot = Protected::acquire(src.load(Ordering::Relaxed));
    loop {
        let observed = src.load(Ordering::Acquire);
        if observed == snapshot.ptr {
            return snapshot;
        }
        snapshot.republish(observed);
    }
}

impl<T> Default for HazardAtomicPtr<T> {
    fn default() -> Self {
        Self::new(ptr::null_mut())
    }
}

unsafe impl<T> Send for HazardAtomicPtr<T> {}
unsafe impl<T> Sync for HazardAtomicPtr<T> {}
