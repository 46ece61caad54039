//! Wait-free sticky counter.
//!
//! A 64-bit reference counter that becomes permanently zero once it
//! reaches zero. Two reserved high bits make that transition race-free:
//! bit 63 is the zero flag, bit 62 is a "helped" credit that a racing
//! `read` donates to whichever decrementer completes the transition.
//! Wait-free on targets with a native atomic fetch-add, lock-free
//! elsewhere.

cfg_if::cfg_if! {
    if #[cfg(feature = "check-loom")] {
        use loom::sync::atomic::{AtomicU64, Ordering};
    } else {
        use core::sync::atomic::{AtomicU64, Ordering};
    }
}

const ZERO_FLAG: u64 = 1 << 63;
const HELPED_FLAG: u64 = 1 << 62;

pub struct StickyCounter {
    counter: AtomicU64,
}

impl StickyCounter {
    /// Starts at one, like a freshly created reference count.
    #[cfg(not(feature = "check-loom"))]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    #[cfg(feature = "check-loom")]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Increment unless the counter is already (stickily) zero.
    ///
    /// Returns whether the increment took effect. The fetch-add is
    /// unconditional; an increment that lands on a zero-flagged value is
    /// simply ignored by every reader, which is what makes this wait-free.
    pub fn increment_if_not_zero(&self) -> bool {
        (self.counter.fetch_add(1, Ordering::AcqRel) & ZERO_FLAG) == 0
    }

    /// Decrement; returns true iff this caller takes the counter to zero.
    ///
    /// Exactly one of the concurrent callers that reach zero observes
    /// `true`, even when a racing `read` has donated the helped credit.
    pub fn decrement_then_is_zero(&self) -> bool {
        if self.counter.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }
        match self
            .counter
            .compare_exchange(0, ZERO_FLAG, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(observed) => {
                if observed & HELPED_FLAG != 0 {
                    // A reader saw the transient zero and parked the
                    // credit; consume it if we get there first.
                    self.counter.swap(ZERO_FLAG, Ordering::AcqRel) & HELPED_FLAG != 0
                } else {
                    // Either an increment revived the counter or another
                    // thread already owns the zero transition.
                    false
                }
            }
        }
    }

    /// Current count; a transient zero is converted into a sticky zero
    /// with the helped credit attached.
    pub fn read(&self) -> u64 {
        let mut val = self.counter.load(Ordering::Acquire);
        if val == 0 {
            match self.counter.compare_exchange(
                0,
                ZERO_FLAG | HELPED_FLAG,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return 0,
                Err(observed) => val = observed,
            }
        }
        if val & ZERO_FLAG != 0 {
            0
        } else {
            val
        }
    }
}

impl Default for StickyCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "check-loom")))]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn starts_at_one() {
        let c = StickyCounter::new();
        assert_eq!(c.read(), 1);
    }

    #[test]
    fn zero_is_sticky() {
        let c = StickyCounter::new();
        assert!(c.decrement_then_is_zero());
        assert_eq!(c.read(), 0);
        assert!(!c.increment_if_not_zero());
        assert_eq!(c.read(), 0);
    }

    #[test]
    fn increment_before_zero_keeps_it_alive() {
        let c = StickyCounter::new();
        assert!(c.increment_if_not_zero());
        assert!(!c.decrement_then_is_zero());
        assert!(c.decrement_then_is_zero());
    }

    #[test]
    fn exactly_one_thread_observes_zero() {
        for _ in 0..200 {
            let c = Arc::new(StickyCounter::new());
            c.increment_if_not_zero(); // count = 2
            let observed = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let c = c.clone();
                    let observed = observed.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if c.decrement_then_is_zero() {
                            observed.fetch_add(1, AtomicOrdering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(observed.load(AtomicOrdering::SeqCst), 1);
        }
    }

    #[test]
    fn racing_read_donates_credit_once() {
        for _ in 0..200 {
            let c = Arc::new(StickyCounter::new());
            let observed = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));

            let reader = {
                let c = c.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let _ = c.read();
                })
            };
            let writer = {
                let c = c.clone();
                let observed = observed.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if c.decrement_then_is_zero() {
                        observed.fetch_add(1, AtomicOrdering::SeqCst);
                    }
                })
            };
            reader.join().unwrap();
            writer.join().unwrap();
            assert_eq!(observed.load(AtomicOrdering::SeqCst), 1);
            assert_eq!(c.read(), 0);
        }
    }
}
