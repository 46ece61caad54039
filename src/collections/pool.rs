//! Free-node pool shared by the containers.
//!
//! Popped container nodes are not freed: they are torn down and parked in
//! a retrieval manager, which quarantines nodes that are still
//! hazard-protected and reuses the rest. A node's `next` field doubles as
//! the free-list link, and the quarantine is what keeps that safe: a node
//! whose `next` some reader may still load is never on the free list.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::node::{HoldValue, Node};
use crate::mem::retrieved::RetrievedSlotsMgr;
use crate::mem::{dealloc_one, try_alloc_one};

pub struct FreeNodePool<H> {
    mgr: RetrievedSlotsMgr<Node<H>>,
    allocated: AtomicUsize,
}

impl<H: HoldValue> FreeNodePool<H> {
    pub const fn new() -> Self {
        Self {
            mgr: RetrievedSlotsMgr::new(),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Pre-create `count` nodes so non-allocating pushes can succeed from
    /// the start.
    pub fn pre_allocate(&self, count: usize) {
        for _ in 0..count {
            let node = try_alloc_one(Node::vacant());
            if node.is_null() {
                log::warn!("free-node pre-allocation stopped early: out of memory");
                return;
            }
            self.allocated.fetch_add(1, Ordering::Relaxed);
            self.mgr.push_free(node);
        }
    }

    /// Hand out a vacant node. With `allow_alloc` false this only reuses
    /// pooled nodes and returns null when none is reusable.
    pub fn allocate(&self, allow_alloc: bool) -> *mut Node<H> {
        let reused = self.mgr.request_reuse();
        if !reused.is_null() {
            unsafe { (*reused).store_next(ptr::null_mut()) };
            return reused;
        }
        if !allow_alloc {
            return ptr::null_mut();
        }
        let node = try_alloc_one(Node::vacant());
        if !node.is_null() {
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        node
    }

    /// Tear the node down and park it for reuse.
    ///
    /// # Safety
    ///
    /// The node must be unlinked from its container and recycled exactly
    /// once; readers may still hold hazard protection on it.
    pub unsafe fn recycle(&self, node: *mut Node<H>) {
        (*node).holder.teardown_by_recycle();
        self.mgr.retrieve(node);
    }

    /// Total nodes this pool ever created and still tracks.
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Free every pooled node.
    ///
    /// # Safety
    ///
    /// Only from the owning container's drop, after all nodes were either
    /// recycled here or freed by the container walk.
    pub unsafe fn drain(&self) {
        loop {
            let node = self.mgr.request_reuse();
            if node.is_null() {
                break;
            }
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            dealloc_one(node);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collections::node::InlineValue;

    #[test]
    fn non_allocating_mode_respects_the_pool() {
        let pool: FreeNodePool<InlineValue<u32>> = FreeNodePool::new();
        assert!(pool.allocate(false).is_null());
        pool.pre_allocate(2);
        assert_eq!(pool.allocated_count(), 2);
        let a = pool.allocate(false);
        let b = pool.allocate(false);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert!(pool.allocate(false).is_null());
        unsafe {
            pool.recycle(a);
            pool.recycle(b);
            pool.drain();
        }
    }

    #[test]
    fn recycled_node_is_reused_before_allocating() {
        let pool: FreeNodePool<InlineValue<u32>> = FreeNodePool::new();
        let a = pool.allocate(true);
        assert_eq!(pool.allocated_count(), 1);
        unsafe { pool.recycle(a) };
        let b = pool.allocate(true);
        assert_eq!(b, a);
        assert_eq!(pool.allocated_count(), 1);
        unsafe {
            pool.recycle(b);
            pool.drain();
        }
        assert_eq!(pool.allocated_count(), 0);
    }
}
