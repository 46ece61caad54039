//! The control block behind the shared-pointer family.
//!
//! Two sticky counters: `strong` guards the managed resource, `weak`
//! guards the block itself. Every strong reference also holds one weak
//! reference, so the block outlives the last handle that can still reach
//! it. Block destruction is deferred through the hazard-pointer registry
//! because a concurrent `load` may be dereferencing the block while the
//! last reference drops.
//!
//! Type erasure is three sized function pointers instead of a vtable:
//! resource access, resource release and block destruction.

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ptr;

use crate::hazard::retire_with;
use crate::mem::alloc_one;
use crate::sticky::StickyCounter;

#[repr(C)]
pub(crate) struct CbCore {
    strong: StickyCounter,
    weak: StickyCounter,
    resource_fn: unsafe fn(*mut CbCore) -> *mut (),
    release_fn: unsafe fn(*mut CbCore),
    destroy_fn: unsafe fn(*mut CbCore),
}

impl CbCore {
    fn new(
        resource_fn: unsafe fn(*mut CbCore) -> *mut (),
        release_fn: unsafe fn(*mut CbCore),
        destroy_fn: unsafe fn(*mut CbCore),
    ) -> Self {
        Self {
            strong: StickyCounter::new(),
            weak: StickyCounter::new(),
            resource_fn,
            release_fn,
            destroy_fn,
        }
    }

    /// Acquire one strong reference unless the resource is already gone.
    /// Goes through the weak counter first so a successful strong
    /// reference always pins the block too.
    pub(crate) fn increment_strong(&self) -> bool {
        if !self.weak.increment_if_not_zero() {
            return false;
        }
        if self.strong.increment_if_not_zero() {
            return true;
        }
        // Resource already released; give back the block pin. The weak
        // counter cannot reach zero here: the caller observed the block
        // through a live reference.
        let reached_zero = self.weak.decrement_then_is_zero();
        debug_assert!(!reached_zero);
        false
    }

    pub(crate) fn increment_weak(&self) -> bool {
        self.weak.increment_if_not_zero()
    }

    /// Drop one strong reference; releases the resource and/or retires
    /// the block when the respective counter hits zero.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being dropped.
    pub(crate) unsafe fn decrement_strong(this: *mut CbCore) {
        if (*this).strong.decrement_then_is_zero() {
            ((*this).release_fn)(this);
        }
        Self::decrement_weak(this);
    }

    /// # Safety
    ///
    /// The caller must own the weak reference being dropped.
    pub(crate) unsafe fn decrement_weak(this: *mut CbCore) {
        if (*this).weak.decrement_then_is_zero() {
            retire_block(this);
        }
    }

    pub(crate) fn expired(&self) -> bool {
        self.strong.read() == 0
    }

    pub(crate) fn strong_count(&self) -> u64 {
        self.strong.read()
    }

    /// # Safety
    ///
    /// `this` must be a live control block; the returned pointer is only
    /// valid while a strong reference is held.
    pub(crate) unsafe fn resource(this: *mut CbCore) -> *mut () {
        ((*this).resource_fn)(this)
    }
}

unsafe fn destroy_trampoline(p: *mut ()) {
    let this = p as *mut CbCore;
    ((*this).destroy_fn)(this);
}

/// Defer block destruction until no hazard slot observes it.
unsafe fn retire_block(this: *mut CbCore) {
    retire_with(this as *mut (), destroy_trampoline);
}

/// Block storing the payload inline, Arc-style. The common case.
#[repr(C)]
struct InlineBlock<T> {
    core: CbCore,
    value: UnsafeCell<ManuallyDrop<T>>,
}

impl<T> InlineBlock<T> {
    unsafe fn resource(this: *mut CbCore) -> *mut () {
        (*(this as *mut Self)).value.get() as *mut ()
    }

    unsafe fn release(this: *mut CbCore) {
        ManuallyDrop::drop(&mut *(*(this as *mut Self)).value.get());
    }

    unsafe fn destroy(this: *mut CbCore) {
        // Payload already released by the last strong drop; only the
        // block storage remains.
        let this = this as *mut Self;
        ptr::drop_in_place(&mut (*this).core);
        crate::mem::gmem_deallocate(this as *mut u8);
    }
}

/// Block managing an externally created payload through a deleter.
#[repr(C)]
struct DeleterBlock<T, D: FnMut(*mut T)> {
    core: CbCore,
    value: UnsafeCell<*mut T>,
    deleter: UnsafeCell<ManuallyDrop<D>>,
}

impl<T, D: FnMut(*mut T)> DeleterBlock<T, D> {
    unsafe fn resource(this: *mut CbCore) -> *mut () {
        *(*(this as *mut Self)).value.get() as *mut ()
    }

    unsafe fn release(this: *mut CbCore) {
        let this = this as *mut Self;
        let p = *(*this).value.get();
        *(*this).value.get() = ptr::null_mut();
        let deleter = &mut *(*this).deleter.get();
        (**deleter)(p);
    }

    unsafe fn destroy(this: *mut CbCore) {
        let this = this as *mut Self;
        ManuallyDrop::drop(&mut *(*this).deleter.get());
        ptr::drop_in_place(&mut (*this).core);
        crate::mem::gmem_deallocate(this as *mut u8);
    }
}

/// Allocate a control block owning `value` inline. One strong, one weak
/// reference, both held by the returned pointer.
pub(crate) fn new_inline_block<T>(value: T) -> *mut CbCore {
    let block = alloc_one(InlineBlock {
        core: CbCore::new(
            InlineBlock::<T>::resource,
            InlineBlock::<T>::release,
            InlineBlock::<T>::destroy,
        ),
        value: UnsafeCell::new(ManuallyDrop::new(value)),
    });
    block as *mut CbCore
}

/// Allocate a control block owning `payload` through `deleter`.
///
/// # Safety
///
/// `payload` must stay valid until the deleter runs, and the deleter must
/// free it exactly once.
pub(crate) unsafe fn new_deleter_block<T, D: FnMut(*mut T)>(
    payload: *mut T,
    deleter: D,
) -> *mut CbCore {
    let block = alloc_one(DeleterBlock {
        core: CbCore::new(
            DeleterBlock::<T, D>::resource,
            DeleterBlock::<T, D>::release,
            DeleterBlock::<T, D>::destroy,
        ),
        value: UnsafeCell::new(payload),
        deleter: UnsafeCell::new(ManuallyDrop::new(deleter)),
    });
    block as *mut CbCore
}

/// Block for payloads that arrived as `Box<T>`.
pub(crate) fn new_box_block<T>(payload: Box<T>) -> *mut CbCore {
    // Safety of the re-boxing is carried by the deleter-block contract:
    // it runs exactly once, on the pointer produced right below.
    fn drop_boxed<T>(p: *mut T) {
        drop(unsafe { Box::from_raw(p) });
    }
    let raw = Box::into_raw(payload);
    unsafe { new_deleter_block(raw, drop_boxed::<T>) }
}
