//! Hazard-pointer based safe memory reclamation.
//!
//! Readers publish the pointer they are about to dereference into a slot
//! of the global registry and re-validate the source before the first
//! dereference; writers retire pointers instead of freeing them, and a
//! retired pointer is reclaimed only once no slot in the registry holds
//! it.

pub mod atomic;
pub mod group;
pub mod retire;

pub use atomic::{protect_atomic, HazardAtomicPtr, Protected};
pub use group::{
    assign_hazard_slot, destroy_all, is_hazard_ptr, scan_hazard_ptrs, HazardSlotOwner,
};
pub use retire::{prune, retire_obj, retire_with};
