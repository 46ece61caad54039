//! Lock-free FIFO queue (Michael–Scott with hazard pointers).
//!
//! A sentinel node is always present; the value of the logical front
//! lives in the sentinel's successor. `push` helps a lagging tail
//! forward, `pop` extracts through a ticket taken before the winning
//! head CAS so the old head can be recycled without tearing the value.

use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::node::{HoldValue, InlineValue, Node};
use super::pool::FreeNodePool;
use crate::hazard::{protect_atomic, HazardAtomicPtr};
use crate::mem::alloc_one;

/// FIFO over any value holder. See [`Fifo`] and [`FifoBoxed`] for the
/// common instantiations.
pub struct FifoQueue<H: HoldValue> {
    head: HazardAtomicPtr<Node<H>>,
    tail: HazardAtomicPtr<Node<H>>,
    len: AtomicUsize,
    pool: FreeNodePool<H>,
}

/// FIFO of in-place copyable values.
pub type Fifo<T> = FifoQueue<InlineValue<T>>;

/// FIFO of heap-owned values.
pub type FifoBoxed<T> = FifoQueue<super::node::BoxedValue<T>>;

unsafe impl<H: HoldValue> Send for FifoQueue<H> {}
unsafe impl<H: HoldValue> Sync for FifoQueue<H> {}

impl<H: HoldValue> FifoQueue<H> {
    pub fn new() -> Self {
        let sentinel = alloc_one(Node::vacant());
        Self {
            head: HazardAtomicPtr::new(sentinel),
            tail: HazardAtomicPtr::new(sentinel),
            len: AtomicUsize::new(0),
            pool: FreeNodePool::new(),
        }
    }

    /// Like [`new`](Self::new) but with `reserve` nodes pre-created so
    /// [`try_push`](Self::try_push) can succeed before any pop recycled
    /// one. Size it to at least the number of accessing threads.
    pub fn with_reserve(reserve: usize) -> Self {
        let q = Self::new();
        q.pool.pre_allocate(reserve.max(1));
        q
    }

    /// Enqueue, allocating a node when the pool is empty.
    pub fn push(&self, value: H::Input) {
        let node = self.pool.allocate(true);
        if node.is_null() {
            std::alloc::handle_alloc_error(core::alloc::Layout::new::<Node<H>>());
        }
        unsafe { (*node).holder.set_value(value) };
        self.push_node(node);
    }

    /// Enqueue only if a pooled node is available; hands the value back
    /// otherwise so the caller can back off.
    pub fn try_push(&self, value: H::Input) -> Result<(), H::Input> {
        let node = self.pool.allocate(false);
        if node.is_null() {
            return Err(value);
        }
        unsafe { (*node).holder.set_value(value) };
        self.push_node(node);
        Ok(())
    }

    fn push_node(&self, node: *mut Node<H>) {
        unsafe { (*node).store_next(ptr::null_mut()) };
        loop {
            let tail_snap = self.tail.protect();
            let tail_ptr = tail_snap.as_ptr();
            let next = unsafe { (*tail_ptr).load_next() };
            if next.is_null() {
                if unsafe { &*tail_ptr }
                    .next()
                    .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Linked; swing the tail (failure means someone helped).
                    let _ = self.tail.compare_exchange(
                        tail_ptr,
                        node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Tail is lagging; help it forward.
                let _ = self.tail.compare_exchange(
                    tail_ptr,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Dequeue the front value; `None` when the queue is empty.
    pub fn pop(&self) -> Option<H::Output> {
        loop {
            let head_snap = self.head.protect();
            let head_ptr = head_snap.as_ptr();
            let tail_ptr = self.tail.load(Ordering::Acquire);

            let next_snap = protect_atomic(unsafe { (*head_ptr).next() });
            if self.head.load(Ordering::Acquire) != head_ptr {
                continue;
            }
            let next = next_snap.as_ptr();

            if head_ptr == tail_ptr {
                if next.is_null() {
                    return None;
                }
                // Sentinel-only view, but the tail is lagging: help and
                // retry.
                let _ = self.tail.compare_exchange(
                    tail_ptr,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if next.is_null() {
                // Head moved under us; retry.
                continue;
            }

            // Take the extraction ticket before the CAS: once the head
            // moves, the node storage may be recycled at any time.
            let ticket = unsafe { (*next).holder.get_ticket() };
            if self
                .head
                .compare_exchange(head_ptr, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::Relaxed);
                let value = unsafe { (*next).holder.exchange_ticket_and_move_value(ticket) };
                unsafe {
                    // The new sentinel no longer owns its payload.
                    (*next).holder.release_ownership();
                }
                // Release our own protection first so the recycle probe
                // only sees other threads' hazards.
                drop(head_snap);
                unsafe { self.pool.recycle(head_ptr) };
                return Some(value);
            }
        }
    }

    /// Queued values; concurrent traffic can change this immediately.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes ever created for this queue (live plus pooled).
    pub fn get_allocated_num(&self) -> usize {
        // The sentinel is not pool-tracked.
        self.pool.allocated_count() + 1
    }
}

impl<H: HoldValue> Default for FifoQueue<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HoldValue> Drop for FifoQueue<H> {
    fn drop(&mut self) {
        unsafe {
            let mut cur = self.head.load(Ordering::Acquire);
            self.head.store(ptr::null_mut(), Ordering::Release);
            self.tail.store(ptr::null_mut(), Ordering::Release);
            while !cur.is_null() {
                let next = (*cur).load_next();
                (*cur).holder.teardown_by_recycle();
                crate::mem::dealloc_one(cur);
                cur = next;
            }
            self.pool.drain();
        }
    }
}
