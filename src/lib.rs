//! Lock-free concurrency suite: containers, hazard-pointer reclamation
//! and a slab allocator for systems that cannot afford mutex-based
//! coordination.
//!
//! Three tightly coupled subsystems:
//!
//! - [`hazard`]: safe memory reclamation. Readers publish the pointer
//!   they are about to dereference into a registry slot and re-validate
//!   the source; writers [`hazard::retire_with`] pointers instead of
//!   freeing them, and reclamation waits until no slot observes them.
//! - [`mem`]: a two-tier slab/big-block allocator whose hot path is a
//!   lock-free free-list pop, exposed as [`mem::gmem_allocate`] /
//!   [`mem::gmem_deallocate`] and used by everything below.
//! - [`collections`] and [`shared_ptr`]: FIFO queue, LIFO stack,
//!   one-side deque, sorted list, and an atomically updatable shared
//!   pointer with the load/store/compare-exchange surface of
//!   `atomic<shared_ptr>`.
//!
//! Shared invariant: every pointer a thread dereferences was
//! hazard-protected before the load was validated, and every retired
//! pointer is freed only once no hazard slot holds it.
//!
//! # Example
//!
//! ```
//! use waitless::collections::Fifo;
//!
//! let queue: Fifo<u64> = Fifo::new();
//! queue.push(1);
//! queue.push(2);
//! assert_eq!(queue.pop(), Some(1));
//! assert_eq!(queue.pop(), Some(2));
//! assert_eq!(queue.pop(), None);
//! ```

pub mod collections;
pub mod hazard;
pub mod mem;
pub mod shared_ptr;
pub mod sticky;

pub use collections::{Deque, Fifo, Lifo, OrderedList};
pub use mem::{
    get_max_allocatable_size, gmem_allocate, gmem_allocate_aligned, gmem_deallocate,
    gmem_dump_status, GmemAllocator,
};
pub use shared_ptr::{AtomicSharedPtr, AtomicWeakPtr, SharedHandle, WeakHandle};
pub use sticky::StickyCounter;
