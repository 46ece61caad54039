//! Lock-free sorted list (Harris–Michael with hazard pointers).
//!
//! Keys are unique and kept in ascending order. Deletion is two-step:
//! the low bit of the victim's own next pointer is CASed to 1 (logical
//! deletion, exactly one winner), then the predecessor link is swung
//! past it. Unlinking is cooperative: any traversal that observes a
//! marked node snips and retires it.
//!
//! Values are written once at insertion and never mutated, so readers
//! clone them under nothing but the node's hazard protection.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::node::mark::{is_marked, marked, unmarked};
use crate::hazard::{protect_atomic, Protected};
use crate::mem::{alloc_one, gmem_deallocate};

pub struct ListNode<K, V> {
    key: K,
    value: V,
    next: AtomicPtr<ListNode<K, V>>,
}

impl<K, V> ListNode<K, V> {
    fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Position returned by the search: the link holding `curr` and the
/// protected `curr` itself (first node with key >= target, or null).
struct Window<K, V> {
    prev_link: *const AtomicPtr<ListNode<K, V>>,
    /// Keeps the node owning `prev_link` alive; `None` when `prev_link`
    /// is the list head.
    _prev_guard: Option<Protected<ListNode<K, V>>>,
    curr: Protected<ListNode<K, V>>,
    found: bool,
}

pub struct OrderedList<K, V> {
    head: AtomicPtr<ListNode<K, V>>,
    len: AtomicUsize,
}

unsafe impl<K: Send + Sync, V: Send + Sync> Send for OrderedList<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for OrderedList<K, V> {}

impl<K: Ord + 'static, V: 'static> OrderedList<K, V> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Walk to the first node with key >= `key`, snipping every marked
    /// node passed on the way.
    fn find(&self, key: &K) -> Window<K, V> {
        'retry: loop {
            let mut prev_link: *const AtomicPtr<ListNode<K, V>> = &self.head;
            let mut prev_guard: Option<Protected<ListNode<K, V>>> = None;
            let mut curr = protect_atomic(unsafe { &*prev_link });
            loop {
                if is_marked(curr.as_ptr()) {
                    // The predecessor itself got logically deleted while
                    // we were standing on its link.
                    continue 'retry;
                }
                let curr_ptr = curr.as_ptr();
                if curr_ptr.is_null() {
                    return Window {
                        prev_link,
                        _prev_guard: prev_guard,
                        curr,
                        found: false,
                    };
                }
                let next = unsafe { (*curr_ptr).next.load(Ordering::Acquire) };
                if unsafe { &*prev_link }.load(Ordering::Acquire) != curr_ptr {
                    continue 'retry;
                }
                if is_marked(next) {
                    // Cooperative unlink of a logically deleted node.
                    if unsafe { &*prev_link }
                        .compare_exchange(
                            curr_ptr,
                            unmarked(next),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue 'retry;
                    }
                    unsafe { retire_list_node(curr_ptr) };
                    curr = protect_atomic(unsafe { &*prev_link });
                    continue;
                }
                let curr_key = unsafe { &(*curr_ptr).key };
                if curr_key >= key {
                    return Window {
                        prev_link,
                        _prev_guard: prev_guard,
                        curr,
                        found: curr_key == key,
                    };
                }
                let next_link: *const AtomicPtr<ListNode<K, V>> =
                    unsafe { &(*curr_ptr).next };
                prev_guard = Some(curr);
                prev_link = next_link;
                curr = protect_atomic(unsafe { &*prev_link });
            }
        }
    }

    /// Insert a key/value pair; hands both back when the key exists.
    pub fn insert(&self, key: K, value: V) -> Result<(), (K, V)> {
        let node = alloc_one(ListNode::new(key, value));
        loop {
            let window = self.find(unsafe { &(*node).key });
            if window.found {
                // Take the pair back out; the storage is freed raw so the
                // fields are not dropped twice.
                let taken = unsafe { ptr::read(node) };
                gmem_deallocate(node as *mut u8);
                return Err((taken.key, taken.value));
            }
            unsafe { (*node).next.store(window.curr.as_ptr(), Ordering::Release) };
            if unsafe { &*window.prev_link }
                .compare_exchange(
                    window.curr.as_ptr(),
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.len.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    /// Logically delete `key`; true when this call was the one that
    /// removed it.
    pub fn remove(&self, key: &K) -> bool {
        loop {
            let window = self.find(key);
            if !window.found {
                return false;
            }
            let curr = window.curr.as_ptr();
            let next = unsafe { (*curr).next.load(Ordering::Acquire) };
            if is_marked(next) {
                // Another remover won; help the find path and report
                // accordingly.
                continue;
            }
            if unsafe { &*curr }
                .next
                .compare_exchange(next, marked(next), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            self.len.fetch_sub(1, Ordering::Relaxed);
            // Physical unlink is best-effort; a failed swing leaves the
            // node to the next traversal.
            if unsafe { &*window.prev_link }
                .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                unsafe { retire_list_node(curr) };
            }
            return true;
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find(key).found
    }

    /// Clone the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let window = self.find(key);
        if !window.found {
            return None;
        }
        // The window keeps the node protected while we clone.
        Some(unsafe { (*window.curr.as_ptr()).value.clone() })
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ascending snapshot of the keys, cloning each under protection.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut out = Vec::new();
        let mut link: *const AtomicPtr<ListNode<K, V>> = &self.head;
        // Keeps the node owning `link` protected while the next hop is
        // published.
        let mut _hop_guard: Option<Protected<ListNode<K, V>>> = None;
        loop {
            let guard = protect_atomic(unsafe { &*link });
            let p = guard.as_ptr();
            if is_marked(p) {
                // Restart; the snapshot stays best-effort.
                out.clear();
                link = &self.head;
                _hop_guard = None;
                continue;
            }
            if p.is_null() {
                return out;
            }
            let next = unsafe { (*p).next.load(Ordering::Acquire) };
            if !is_marked(next) {
                out.push(unsafe { (*p).key.clone() });
            }
            link = unsafe { &(*p).next };
            _hop_guard = Some(guard);
        }
    }
}

unsafe fn retire_list_node<K: 'static, V: 'static>(node: *mut ListNode<K, V>) {
    crate::hazard::retire_obj(node);
}

impl<K, V> Drop for OrderedList<K, V> {
    fn drop(&mut self) {
        let mut cur = unmarked(self.head.load(Ordering::Acquire));
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            unsafe { crate::mem::dealloc_one(cur) };
            cur = unmarked(next);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_remove_roundtrip() {
        let list: OrderedList<u32, String> = OrderedList::new();
        assert!(list.insert(2, "two".into()).is_ok());
        assert!(list.insert(1, "one".into()).is_ok());
        assert!(list.insert(3, "three".into()).is_ok());
        assert!(list.contains(&2));
        assert_eq!(list.get(&2), Some("two".to_string()));
        assert!(list.remove(&2));
        assert!(!list.contains(&2));
        assert!(!list.remove(&2));
        assert_eq!(list.len(), 2);
        crate::hazard::prune();
    }

    #[test]
    fn duplicate_insert_hands_the_pair_back() {
        let list: OrderedList<u32, u32> = OrderedList::new();
        assert!(list.insert(7, 70).is_ok());
        assert_eq!(list.insert(7, 71), Err((7, 71)));
        assert_eq!(list.get(&7), Some(70));
        crate::hazard::prune();
    }

    #[test]
    fn keys_come_out_sorted() {
        let list: OrderedList<u32, ()> = OrderedList::new();
        for k in [5u32, 1, 4, 2, 3].iter() {
            list.insert(*k, ()).unwrap();
        }
        assert_eq!(list.keys(), vec![1, 2, 3, 4, 5]);
        crate::hazard::prune();
    }

    #[test]
    fn concurrent_inserts_keep_unique_keys() {
        let list = Arc::new(OrderedList::<u64, u64>::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let list = list.clone();
                thread::spawn(move || {
                    let mut wins = 0;
                    for k in 0..500u64 {
                        if list.insert(k, t).is_ok() {
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 500, "each key inserted exactly once");
        assert_eq!(list.len(), 500);
        crate::hazard::prune();
    }

    #[test]
    fn concurrent_remove_has_one_winner_per_key() {
        let list = Arc::new(OrderedList::<u64, ()>::new());
        for k in 0..200u64 {
            list.insert(k, ()).unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                thread::spawn(move || {
                    let mut wins = 0;
                    for k in 0..200u64 {
                        if list.remove(&k) {
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 200);
        assert!(list.is_empty());
        crate::hazard::prune();
    }

    #[test]
    fn mixed_insert_remove_traffic_converges() {
        let list = Arc::new(OrderedList::<u64, u64>::new());
        let writers: Vec<_> = (0..2)
            .map(|t| {
                let list = list.clone();
                thread::spawn(move || {
                    for round in 0..200u64 {
                        for k in 0..16u64 {
                            let _ = list.insert(k, t * 1000 + round);
                            let _ = list.remove(&k);
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        for k in 0..16u64 {
            let _ = list.remove(&k);
        }
        assert!(list.is_empty());
        crate::hazard::prune();
    }
}
