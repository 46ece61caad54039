//! Small-slot groups and per-class group lists.
//!
//! A size class owns a stack of page-backed groups, each carved into N
//! identical slots. The allocation hot path is a pop from the retrieval
//! tiers; the warm path bumps the current group's unassigned-slot cursor;
//! the cold path maps a fresh group whose size grows geometrically up to
//! the class limit.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use static_assertions::const_assert;

use super::header::{AllocHeader, MemTag, MIN_ALIGN};
use super::page;
use super::retrieved::{LocalStack, Retrievable, RetrievedSlotsMgr};
use crate::hazard::is_hazard_ptr;

pub const SLOT_GROUP_MAGIC: usize = 0xABAB_7878_CDCD_3434;

/// One byte written past the usable area of every slot; a corrupted value
/// at deallocation means the caller overran its buffer.
pub const TAIL_SENTINEL: u8 = 0xA5;
const TAIL_ZONE_BYTES: usize = 1;

/// Per-slot management data. The user area starts right after the header
/// and doubles as the temporary link while the slot is parked.
#[repr(C)]
pub struct SlotLink {
    free_next: AtomicPtr<SlotLink>,
    header: AllocHeader,
    // user data follows; see `data_ptr`
}

const_assert!(mem::size_of::<SlotLink>() == 2 * MIN_ALIGN);

unsafe impl Retrievable for SlotLink {
    fn free_link(&self) -> &AtomicPtr<SlotLink> {
        &self.free_next
    }
    unsafe fn set_tmp_next(&self, next: *mut SlotLink) {
        *(self.data_ptr() as *mut *mut SlotLink) = next;
    }
    unsafe fn tmp_next(&self) -> *mut SlotLink {
        *(self.data_ptr() as *mut *mut SlotLink)
    }
}

impl SlotLink {
    /// Write a fresh slot header onto raw group memory.
    ///
    /// # Safety
    ///
    /// `at` must point at an unassigned, word-aligned slot inside `owner`.
    pub unsafe fn emplace(at: *mut u8, owner: *mut SlotGroup) -> *mut SlotLink {
        let slot = at as *mut SlotLink;
        ptr::write(
            slot,
            SlotLink {
                free_next: AtomicPtr::new(ptr::null_mut()),
                header: AllocHeader::new(owner, MemTag::Small, true),
            },
        );
        slot
    }

    pub fn header(&self) -> &AllocHeader {
        &self.header
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.header.data_ptr()
    }

    /// Owner group, validated through the magic number. Null means the
    /// pointer never came from a small-slot group.
    pub fn owner_checked(&self) -> *mut SlotGroup {
        let owner: *mut SlotGroup = self.header.owner();
        if owner.is_null() {
            return ptr::null_mut();
        }
        if unsafe { (*owner).magic } != SLOT_GROUP_MAGIC {
            return ptr::null_mut();
        }
        owner
    }

    /// Place (or reuse) the header right in front of the aligned user
    /// address and stamp the tail sentinel.
    ///
    /// # Safety
    ///
    /// The slot must be assigned to the caller and `align` a power of two
    /// small enough that `requested + align` fits the slot.
    pub unsafe fn prepare_user_area(&self, align: usize, slot_bytes: usize) -> *mut u8 {
        let slot_addr = self as *const SlotLink as usize;
        let data = self.data_ptr() as usize;
        let user = (data + align - 1) & !(align - 1);
        let end = slot_addr + slot_bytes;
        *((end - TAIL_ZONE_BYTES) as *mut u8) = TAIL_SENTINEL;
        if user != data {
            AllocHeader::emplace_copy((user - mem::size_of::<AllocHeader>()) as *mut u8, &self.header);
        }
        user as *mut u8
    }
}

/// A chunk of pages carved into identical slots of one class.
#[repr(C)]
pub struct SlotGroup {
    magic: usize,
    buffer_size: usize,
    list: *const SlotGroupList,
    slot_bytes: usize,
    num_slots: usize,
    slot_begin: usize,
    slot_end: usize,
    next_group: AtomicPtr<SlotGroup>,
    /// Bump cursor over the never-yet-assigned slots.
    unassigned: AtomicUsize,
    // slot array follows
}

impl SlotGroup {
    /// Bytes one slot occupies for a class handing out `allocatable`.
    pub const fn one_slot_bytes(allocatable: usize) -> usize {
        let payload = if allocatable < MIN_ALIGN {
            MIN_ALIGN
        } else {
            allocatable
        };
        let raw = payload + mem::size_of::<SlotLink>() + TAIL_ZONE_BYTES + MIN_ALIGN - 1;
        raw / MIN_ALIGN * MIN_ALIGN
    }

    pub const fn min_buffer_size(allocatable: usize) -> usize {
        mem::size_of::<SlotGroup>() + Self::one_slot_bytes(allocatable)
    }

    /// Build a group over a freshly mapped region.
    ///
    /// # Safety
    ///
    /// `region_addr` must be the start of a writable region of
    /// `buffer_size` bytes, exclusively owned by the caller.
    pub unsafe fn emplace(
        region_addr: *mut u8,
        buffer_size: usize,
        list: *const SlotGroupList,
        allocatable: usize,
    ) -> *mut SlotGroup {
        let slot_bytes = Self::one_slot_bytes(allocatable);
        let num_slots = (buffer_size - mem::size_of::<SlotGroup>()) / slot_bytes;
        let begin = region_addr as usize + mem::size_of::<SlotGroup>();
        let begin = (begin + MIN_ALIGN - 1) & !(MIN_ALIGN - 1);
        let end = begin + num_slots * slot_bytes;
        debug_assert!(end <= region_addr as usize + buffer_size);
        let group = region_addr as *mut SlotGroup;
        ptr::write(
            group,
            SlotGroup {
                magic: SLOT_GROUP_MAGIC,
                buffer_size,
                list,
                slot_bytes,
                num_slots,
                slot_begin: begin,
                slot_end: end,
                next_group: AtomicPtr::new(ptr::null_mut()),
                unassigned: AtomicUsize::new(begin),
            },
        );
        group
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn list(&self) -> *const SlotGroupList {
        self.list
    }

    /// Index of the slot containing `p`, or None for a foreign pointer.
    pub fn slot_index(&self, p: *mut u8) -> Option<usize> {
        let addr = p as usize;
        if addr < self.slot_begin || self.slot_end <= addr {
            return None;
        }
        Some((addr - self.slot_begin) / self.slot_bytes)
    }

    pub fn slot_ptr(&self, idx: usize) -> *mut SlotLink {
        debug_assert!(idx < self.num_slots);
        (self.slot_begin + idx * self.slot_bytes) as *mut SlotLink
    }

    /// End address of the slot holding index `idx`.
    pub fn slot_end_addr(&self, idx: usize) -> usize {
        self.slot_begin + (idx + 1) * self.slot_bytes
    }

    pub fn is_assigned_all_slots(&self) -> bool {
        self.slot_end <= self.unassigned.load(Ordering::Acquire)
    }

    /// Claim one never-assigned slot by bumping the cursor.
    pub fn assign_new_slot(&self) -> *mut SlotLink {
        let mut cur = self.unassigned.load(Ordering::Acquire);
        loop {
            if self.slot_end <= cur {
                return ptr::null_mut();
            }
            match self.unassigned.compare_exchange(
                cur,
                cur + self.slot_bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return unsafe { SlotLink::emplace(cur as *mut u8, self as *const _ as *mut _) }
                }
                Err(observed) => cur = observed,
            }
        }
    }
}

/// Thread-local retrieval tiers for all small-slot classes.
pub(super) struct SmallTls {
    non_hazard: [LocalStack<SlotLink>; super::classes::CLASS_COUNT],
    in_hazard: [LocalStack<SlotLink>; super::classes::CLASS_COUNT],
}

impl SmallTls {
    const TIER_INIT: LocalStack<SlotLink> = LocalStack::new();

    const fn new() -> Self {
        Self {
            non_hazard: [Self::TIER_INIT; super::classes::CLASS_COUNT],
            in_hazard: [Self::TIER_INIT; super::classes::CLASS_COUNT],
        }
    }
}

impl Drop for SmallTls {
    fn drop(&mut self) {
        for idx in 0..super::classes::CLASS_COUNT {
            let mgr = &super::classes::class_list(idx).retrieved;
            mgr.merge_local(&mut self.non_hazard[idx], &mut self.in_hazard[idx]);
        }
    }
}

thread_local! {
    static SMALL_TLS: core::cell::RefCell<SmallTls> =
        core::cell::RefCell::new(SmallTls::new());
}

/// One allocation-size class: group stack, assigning cursor and the
/// retrieval tiers feeding reuse.
pub struct SlotGroupList {
    allocatable: usize,
    limit_bytes: usize,
    class_idx: usize,
    next_buffer: AtomicUsize,
    head: AtomicPtr<SlotGroup>,
    cursor: AtomicPtr<SlotGroup>,
    pub(super) retrieved: RetrievedSlotsMgr<SlotLink>,
}

unsafe impl Send for SlotGroupList {}
unsafe impl Sync for SlotGroupList {}

impl SlotGroupList {
    pub const fn new(
        allocatable: usize,
        init_buffer: usize,
        limit_bytes: usize,
        class_idx: usize,
    ) -> Self {
        // The first group must hold at least one slot.
        let min = SlotGroup::min_buffer_size(allocatable);
        let init = if init_buffer < min { min } else { init_buffer };
        Self {
            allocatable,
            limit_bytes,
            class_idx,
            next_buffer: AtomicUsize::new(init),
            head: AtomicPtr::new(ptr::null_mut()),
            cursor: AtomicPtr::new(ptr::null_mut()),
            retrieved: RetrievedSlotsMgr::new(),
        }
    }

    pub fn allocatable_bytes(&self) -> usize {
        self.allocatable
    }

    /// Pop a slot for this class. Null means the caller should trigger
    /// [`request_new_group`](Self::request_new_group) and retry once.
    pub fn allocate(&self) -> *mut SlotLink {
        let reused = self.reuse_retrieved();
        if !reused.is_null() {
            let was_used = unsafe { (*reused).header.fetch_set_used(true) };
            if was_used {
                log::error!("reused slot unexpectedly marked in-use");
            }
            return reused;
        }

        let mut target = self.cursor.load(Ordering::Acquire);
        if target.is_null() {
            return ptr::null_mut();
        }
        loop {
            let group = unsafe { &*target };
            if group.is_assigned_all_slots() {
                // Advance the cursor, wrapping to the head of the stack.
                let mut next = group.next_group.load(Ordering::Acquire);
                if next.is_null() {
                    next = self.head.load(Ordering::Acquire);
                }
                if self
                    .cursor
                    .compare_exchange(target, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    target = self.cursor.load(Ordering::Acquire);
                    if target.is_null() {
                        return ptr::null_mut();
                    }
                    continue;
                }
                if unsafe { &*next }.is_assigned_all_slots() {
                    if next == self.head.load(Ordering::Acquire) {
                        // One full lap found no capacity.
                        return ptr::null_mut();
                    }
                    target = self.head.load(Ordering::Acquire);
                    continue;
                }
                target = next;
                continue;
            }
            let slot = group.assign_new_slot();
            if !slot.is_null() {
                return slot;
            }
        }
    }

    /// Three-tier reuse: thread-local first (no contention), then the
    /// global tiers. Lists outside the class table (the test-only ones)
    /// have no thread-local tier.
    fn reuse_retrieved(&self) -> *mut SlotLink {
        let idx = self.class_idx;
        if idx >= super::classes::CLASS_COUNT {
            return self.retrieved.request_reuse();
        }
        let local = SMALL_TLS.try_with(|tls| {
            let mut tls = tls.borrow_mut();
            let p = tls.non_hazard[idx].pop();
            if !p.is_null() {
                return p;
            }
            // Re-probe parked in-hazard slots; the ones still protected go
            // back where they were.
            core::sync::atomic::fence(Ordering::SeqCst);
            let mut still = LocalStack::new();
            let mut found = ptr::null_mut();
            loop {
                let p = tls.in_hazard[idx].pop();
                if p.is_null() {
                    break;
                }
                if !is_hazard_ptr(p as *mut ()) {
                    found = p;
                    break;
                }
                still.push(p);
            }
            tls.in_hazard[idx].merge(&mut still);
            found
        });
        match local {
            Ok(p) if !p.is_null() => p,
            _ => self.retrieved.request_reuse(),
        }
    }

    /// Park a freed slot in the tier matching its hazard state.
    fn park_retrieved(&self, p: *mut SlotLink) {
        let idx = self.class_idx;
        if idx >= super::classes::CLASS_COUNT {
            self.retrieved.retrieve(p);
            return;
        }
        use core::sync::atomic::fence;
        fence(Ordering::SeqCst);
        let hazardous = is_hazard_ptr(p as *mut ());
        let parked = SMALL_TLS
            .try_with(|tls| {
                let mut tls = tls.borrow_mut();
                if hazardous {
                    tls.in_hazard[idx].push(p);
                } else {
                    tls.non_hazard[idx].push(p);
                }
            })
            .is_ok();
        if !parked {
            if hazardous {
                self.retrieved.push_in_hazard(p);
            } else {
                self.retrieved.push_free(p);
            }
        }
    }

    /// Release a slot back to the class. False reports a double free or a
    /// corrupted slot; the allocation is left untouched in that case.
    pub fn deallocate(&self, p: *mut SlotLink) -> bool {
        if p.is_null() {
            log::warn!("small-slot deallocate of null");
            return false;
        }
        let slot = unsafe { &*p };
        if slot.owner_checked().is_null() {
            log::warn!("small-slot deallocate of foreign pointer {:p}", p);
            return false;
        }
        let info = slot.header.info();
        if info.tag != MemTag::Small {
            log::warn!("small-slot deallocate with tag {:?}", info.tag);
            return false;
        }
        if !info.is_used {
            crate::mem::report_corruption("double free of small slot");
            return false;
        }
        let mut expected = true;
        if !slot.header.compare_exchange_used(&mut expected, false) {
            crate::mem::report_corruption("racing double free of small slot");
            return false;
        }
        self.park_retrieved(p);
        true
    }

    /// Map one more group, push it on the class stack and seed the cursor.
    pub fn request_new_group(&self) {
        let want = self.next_buffer.load(Ordering::Acquire);
        let region = page::map_pages(want, MIN_ALIGN);
        if region.is_failed() {
            return;
        }
        let group = unsafe {
            SlotGroup::emplace(region.addr, region.len, self as *const _, self.allocatable)
        };
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { &*group }.next_group.store(head, Ordering::Release);
            match self
                .head
                .compare_exchange_weak(head, group, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let doubled = (want * 2).min(self.limit_bytes.max(want));
        let _ = self.next_buffer.compare_exchange(
            want,
            doubled,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let cur = self.cursor.load(Ordering::Acquire);
        if cur.is_null() {
            let _ = self
                .cursor
                .compare_exchange(cur, group, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Groups currently mapped and how many slots they carry.
    pub fn status(&self) -> (usize, usize) {
        let mut groups = 0;
        let mut slots = 0;
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let group = unsafe { &*cur };
            groups += 1;
            slots += group.num_slots;
            cur = group.next_group.load(Ordering::Acquire);
        }
        (groups, slots)
    }

    /// Unmap every group of this class.
    ///
    /// # Safety
    ///
    /// Test teardown only: no allocation from this class may be live and
    /// no other thread may be using the allocator.
    pub unsafe fn clear_for_test(&self) {
        self.retrieved.reset_for_test();
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        self.cursor.store(ptr::null_mut(), Ordering::Release);
        while !cur.is_null() {
            let next = (*cur).next_group.load(Ordering::Acquire);
            let len = (*cur).buffer_size;
            page::unmap_pages(cur as *mut u8, len);
            cur = next;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Out-of-table index keeps these lists off the shared thread-local
    // tiers.
    fn fresh_list(allocatable: usize) -> SlotGroupList {
        SlotGroupList::new(allocatable, 4096, 1 << 20, usize::MAX)
    }

    #[test]
    fn allocate_needs_a_group_first() {
        let list = fresh_list(64);
        assert!(list.allocate().is_null());
        list.request_new_group();
        let slot = list.allocate();
        assert!(!slot.is_null());
        assert!(list.deallocate(slot));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn freed_slot_is_reused() {
        let list = fresh_list(32);
        list.request_new_group();
        let a = list.allocate();
        assert!(list.deallocate(a));
        let b = list.allocate();
        assert_eq!(a, b, "freed slot should be the next one handed out");
        assert!(list.deallocate(b));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn double_free_is_detected() {
        let list = fresh_list(32);
        list.request_new_group();
        let a = list.allocate();
        assert!(list.deallocate(a));
        assert!(!list.deallocate(a));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn cursor_walks_and_new_groups_extend_capacity() {
        let list = fresh_list(128);
        list.request_new_group();
        let mut slots = Vec::new();
        // Exhaust the first group entirely.
        loop {
            let p = list.allocate();
            if p.is_null() {
                break;
            }
            slots.push(p);
        }
        assert!(!slots.is_empty());
        list.request_new_group();
        let extra = list.allocate();
        assert!(!extra.is_null());
        slots.push(extra);
        for p in slots {
            assert!(list.deallocate(p));
        }
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn slot_index_rejects_foreign_pointers() {
        let list = fresh_list(32);
        list.request_new_group();
        let a = list.allocate();
        let group = unsafe { (*a).owner_checked() };
        assert!(!group.is_null());
        let group = unsafe { &*group };
        assert!(group.slot_index(a as *mut u8).is_some());
        assert!(group.slot_index(0x10 as *mut u8).is_none());
        assert!(list.deallocate(a));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn user_area_alignment_and_sentinel() {
        let list = fresh_list(256);
        list.request_new_group();
        let slot = list.allocate();
        let user = unsafe { (*slot).prepare_user_area(64, SlotGroup::one_slot_bytes(256)) };
        assert_eq!(user as usize % 64, 0);
        // A sub-header in front of the shifted pointer resolves to the
        // same group.
        let header = unsafe { &*AllocHeader::from_user_ptr(user) };
        assert_eq!(header.tag(), MemTag::Small);
        assert!(list.deallocate(slot));
        unsafe { list.clear_for_test() };
    }
}
