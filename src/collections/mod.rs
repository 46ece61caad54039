//! Lock-free containers built on the hazard-pointer registry and the
//! free-node pool.

pub mod deque;
pub mod fifo;
pub mod list;
pub mod node;
pub mod pool;
pub mod stack;

pub use deque::{Deque, DequeBoxed, OneSideDeque};
pub use fifo::{Fifo, FifoBoxed, FifoQueue};
pub use list::OrderedList;
pub use node::{BoxedValue, HoldValue, InlineValue, RawPtrValue};
pub use stack::{Lifo, LifoBoxed, LifoStack};
