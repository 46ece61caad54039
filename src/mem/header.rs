//! The one-word header prefixed to every region the allocator hands out.
//!
//! A single atomic word encodes the owner back-pointer (a small-slot group
//! or a big slot), a two-bit management-type tag and the in-use flag, so
//! `gmem_deallocate` can recover the owning structure from nothing but the
//! user pointer. The low three bits of every owner pointer are free
//! because owners are at least word aligned.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert_eq;

/// Memory management type of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemTag {
    Unused = 0,
    Small = 1,
    Big = 2,
    OverBig = 3,
}

impl MemTag {
    fn from_bits(bits: usize) -> MemTag {
        match bits & TAG_MASK {
            1 => MemTag::Small,
            2 => MemTag::Big,
            3 => MemTag::OverBig,
            _ => MemTag::Unused,
        }
    }
}

const TAG_MASK: usize = 0b011;
const USED_BIT: usize = 0b100;
const FLAG_MASK: usize = 0b111;

/// Decoded view of a header word.
#[derive(Debug, Clone, Copy)]
pub struct AllocInfo {
    pub owner: *mut (),
    pub tag: MemTag,
    pub is_used: bool,
}

/// Minimum alignment of every user pointer; also the header size.
pub const MIN_ALIGN: usize = mem::size_of::<usize>();

#[repr(transparent)]
pub struct AllocHeader {
    word: AtomicUsize,
}

const_assert_eq!(mem::size_of::<AllocHeader>(), MIN_ALIGN);

impl AllocHeader {
    pub fn new<U>(owner: *const U, tag: MemTag, is_used: bool) -> Self {
        debug_assert_eq!(owner as usize & FLAG_MASK, 0);
        let word = owner as usize | tag as usize | if is_used { USED_BIT } else { 0 };
        Self {
            word: AtomicUsize::new(word),
        }
    }

    /// Write a copy of `src` at `addr`. Used for the aligned sub-header in
    /// front of an alignment-shifted user pointer.
    ///
    /// # Safety
    ///
    /// `addr` must be word aligned, writable and inside the owning slot.
    pub unsafe fn emplace_copy(addr: *mut u8, src: &AllocHeader) -> *mut AllocHeader {
        let header = addr as *mut AllocHeader;
        let word = src.word.load(Ordering::Acquire);
        (*header).word = AtomicUsize::new(word);
        header
    }

    /// Recover the header sitting immediately before a user pointer.
    ///
    /// # Safety
    ///
    /// `p` must be a pointer previously returned by the allocator.
    pub unsafe fn from_user_ptr(p: *mut u8) -> *mut AllocHeader {
        (p as usize - mem::size_of::<AllocHeader>()) as *mut AllocHeader
    }

    /// First user byte behind this header.
    pub fn data_ptr(&self) -> *mut u8 {
        (self as *const AllocHeader as usize + mem::size_of::<AllocHeader>()) as *mut u8
    }

    pub fn info(&self) -> AllocInfo {
        let word = self.word.load(Ordering::Acquire);
        AllocInfo {
            owner: (word & !FLAG_MASK) as *mut (),
            tag: MemTag::from_bits(word),
            is_used: word & USED_BIT != 0,
        }
    }

    pub fn owner<U>(&self) -> *mut U {
        (self.word.load(Ordering::Acquire) & !FLAG_MASK) as *mut U
    }

    pub fn tag(&self) -> MemTag {
        MemTag::from_bits(self.word.load(Ordering::Acquire))
    }

    /// Set or clear the used flag; returns the previous flag value.
    pub fn fetch_set_used(&self, is_used: bool) -> bool {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            let desired = if is_used {
                cur | USED_BIT
            } else {
                cur & !USED_BIT
            };
            match self
                .word
                .compare_exchange(cur, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return cur & USED_BIT != 0,
                Err(observed) => cur = observed,
            }
        }
    }

    /// CAS the used flag; `expected` is updated with the observed state on
    /// failure. A `true -> false` transition that fails here is the racing
    /// half of a double free.
    pub fn compare_exchange_used(&self, expected: &mut bool, desired: bool) -> bool {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            let cur_used = cur & USED_BIT != 0;
            if cur_used != *expected {
                *expected = cur_used;
                return false;
            }
            let desired_word = if desired {
                cur | USED_BIT
            } else {
                cur & !USED_BIT
            };
            match self
                .word
                .compare_exchange(cur, desired_word, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_owner_tag_and_flag() {
        let owner = 0x1000 as *const u64;
        let h = AllocHeader::new(owner, MemTag::Small, true);
        let info = h.info();
        assert_eq!(info.owner as usize, 0x1000);
        assert_eq!(info.tag, MemTag::Small);
        assert!(info.is_used);
    }

    #[test]
    fn fetch_set_reports_previous_state() {
        let h = AllocHeader::new(0x2000 as *const u64, MemTag::Big, true);
        assert!(h.fetch_set_used(false));
        assert!(!h.fetch_set_used(false));
        assert!(!h.fetch_set_used(true));
        assert!(h.info().is_used);
    }

    #[test]
    fn used_flag_cas_detects_race() {
        let h = AllocHeader::new(0x3000 as *const u64, MemTag::Small, false);
        let mut expected = true;
        assert!(!h.compare_exchange_used(&mut expected, false));
        assert!(!expected);
        let mut expected = false;
        assert!(h.compare_exchange_used(&mut expected, true));
        assert_eq!(h.tag(), MemTag::Small);
    }
}
