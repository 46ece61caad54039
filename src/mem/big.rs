//! Big memory slots: standalone page-backed regions above the largest
//! size class.
//!
//! A big slot is one mapped region holding a management header and the
//! user buffer. Regions up to the over-big threshold are cached for reuse
//! (bounded by a byte budget); anything larger is returned to the OS on
//! deallocation.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::header::{AllocHeader, MemTag, MIN_ALIGN};
use super::page;
use super::retrieved::{LocalStack, Retrievable, RetrievedSlotsMgr};
use super::small::TAIL_SENTINEL;

pub const BIG_SLOT_MAGIC: usize = 0x3434_ABAB_7878_CDCD;

const TAIL_ZONE_BYTES: usize = 1;

/// Cached-reuse budget for freed big slots.
pub const DEFAULT_CACHE_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Regions above this are OVER_BIG: never cached, unmapped immediately.
pub const DEFAULT_OVER_BIG_THRESHOLD: usize = 4 * 1024 * 1024;

#[repr(C)]
pub struct BigSlot {
    magic: usize,
    buffer_size: usize,
    free_next: AtomicPtr<BigSlot>,
    header: AllocHeader,
    // user data follows; doubles as the temporary link while parked
}

unsafe impl Retrievable for BigSlot {
    fn free_link(&self) -> &AtomicPtr<BigSlot> {
        &self.free_next
    }
    unsafe fn set_tmp_next(&self, next: *mut BigSlot) {
        *(self.data_ptr() as *mut *mut BigSlot) = next;
    }
    unsafe fn tmp_next(&self) -> *mut BigSlot {
        *(self.data_ptr() as *mut *mut BigSlot)
    }
}

impl BigSlot {
    /// # Safety
    ///
    /// `region_addr`/`region_len` must describe a freshly mapped region
    /// exclusively owned by the caller.
    pub unsafe fn emplace(region_addr: *mut u8, region_len: usize, tag: MemTag) -> *mut BigSlot {
        let slot = region_addr as *mut BigSlot;
        ptr::write(
            slot,
            BigSlot {
                magic: BIG_SLOT_MAGIC,
                buffer_size: region_len,
                free_next: AtomicPtr::new(ptr::null_mut()),
                header: AllocHeader::new(slot, tag, true),
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

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_allocatable_size(&self) -> usize {
        self.buffer_size - mem::size_of::<BigSlot>() - TAIL_ZONE_BYTES
    }

    pub fn is_valid(&self) -> bool {
        self.magic == BIG_SLOT_MAGIC
    }

    /// Align the user pointer, drop a sub-header in front of it when it
    /// moved, and stamp the tail sentinel.
    ///
    /// # Safety
    ///
    /// The slot must be assigned to the caller; `align` a power of two and
    /// `requested + align` within the buffer.
    pub unsafe fn prepare_user_area(&self, align: usize) -> *mut u8 {
        let data = self.data_ptr() as usize;
        let user = (data + align - 1) & !(align - 1);
        let end = self as *const BigSlot as usize + self.buffer_size;
        *((end - TAIL_ZONE_BYTES) as *mut u8) = TAIL_SENTINEL;
        if user != data {
            AllocHeader::emplace_copy((user - mem::size_of::<AllocHeader>()) as *mut u8, &self.header);
        }
        user as *mut u8
    }
}

pub struct BigSlotList {
    cached_bytes: AtomicUsize,
    cache_limit: AtomicUsize,
    over_big_threshold: AtomicUsize,
    retrieved: RetrievedSlotsMgr<BigSlot>,
}

impl BigSlotList {
    /// Reuse candidates inspected per request before giving up and
    /// mapping fresh pages.
    const REUSE_PROBES: usize = 8;

    pub const fn new() -> Self {
        Self {
            cached_bytes: AtomicUsize::new(0),
            cache_limit: AtomicUsize::new(DEFAULT_CACHE_LIMIT_BYTES),
            over_big_threshold: AtomicUsize::new(DEFAULT_OVER_BIG_THRESHOLD),
            retrieved: RetrievedSlotsMgr::new(),
        }
    }

    pub fn set_cache_limit(&self, bytes: usize) {
        self.cache_limit.store(bytes, Ordering::Relaxed);
    }

    /// Map a fresh big slot able to hold `needed` bytes.
    pub fn allocate_newly(&self, needed: usize) -> *mut BigSlot {
        let want = match needed
            .checked_add(mem::size_of::<BigSlot>())
            .and_then(|v| v.checked_add(TAIL_ZONE_BYTES))
        {
            Some(v) => v,
            None => return ptr::null_mut(),
        };
        let region = page::map_pages(want, MIN_ALIGN);
        if region.is_failed() {
            return ptr::null_mut();
        }
        let tag = if region.len <= self.over_big_threshold.load(Ordering::Relaxed) {
            MemTag::Big
        } else {
            MemTag::OverBig
        };
        unsafe { BigSlot::emplace(region.addr, region.len, tag) }
    }

    /// Pop a cached slot big enough for `needed`; candidates that are too
    /// small go back in the cache.
    pub fn reuse_allocate(&self, needed: usize) -> *mut BigSlot {
        let mut unfit = LocalStack::new();
        let mut found = ptr::null_mut();
        for _ in 0..Self::REUSE_PROBES {
            let p = self.retrieved.request_reuse();
            if p.is_null() {
                break;
            }
            let slot = unsafe { &*p };
            if slot.max_allocatable_size() >= needed {
                found = p;
                break;
            }
            unfit.push(p);
        }
        loop {
            let p = unfit.pop();
            if p.is_null() {
                break;
            }
            self.retrieved.push_free(p);
        }
        if !found.is_null() {
            let slot = unsafe { &*found };
            self.cached_bytes
                .fetch_sub(slot.buffer_size, Ordering::Relaxed);
            let was_used = slot.header.fetch_set_used(true);
            if was_used {
                log::error!("cached big slot unexpectedly marked in-use");
            }
        }
        found
    }

    /// Release a big slot: cache it when the budget allows, otherwise hand
    /// the pages back. False reports a double free or foreign pointer.
    pub fn deallocate(&self, p: *mut BigSlot) -> bool {
        if p.is_null() {
            return false;
        }
        let slot = unsafe { &*p };
        if !slot.is_valid() {
            log::warn!("big-slot deallocate of foreign pointer {:p}", p);
            return false;
        }
        let info = slot.header.info();
        if !info.is_used {
            crate::mem::report_corruption("double free of big slot");
            return false;
        }
        let mut expected = true;
        if !slot.header.compare_exchange_used(&mut expected, false) {
            crate::mem::report_corruption("racing double free of big slot");
            return false;
        }

        match info.tag {
            MemTag::OverBig => {
                unsafe { page::unmap_pages(p as *mut u8, slot.buffer_size) };
                true
            }
            MemTag::Big => {
                let size = slot.buffer_size;
                let limit = self.cache_limit.load(Ordering::Relaxed);
                let cached = self.cached_bytes.fetch_add(size, Ordering::Relaxed);
                if cached + size <= limit {
                    self.retrieved.retrieve(p);
                } else {
                    self.cached_bytes.fetch_sub(size, Ordering::Relaxed);
                    unsafe { page::unmap_pages(p as *mut u8, size) };
                }
                true
            }
            _ => {
                log::warn!("big-slot deallocate with tag {:?}", info.tag);
                false
            }
        }
    }

    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes.load(Ordering::Relaxed)
    }

    /// Unmap every cached slot.
    ///
    /// # Safety
    ///
    /// Test teardown only; no live big allocation, no concurrent users.
    pub unsafe fn clear_for_test(&self) {
        loop {
            let p = self.retrieved.request_reuse();
            if p.is_null() {
                break;
            }
            let size = (*p).buffer_size;
            self.cached_bytes.fetch_sub(size, Ordering::Relaxed);
            page::unmap_pages(p as *mut u8, size);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_slot_fits_request_and_deallocates() {
        let list = BigSlotList::new();
        let p = list.allocate_newly(200_000);
        assert!(!p.is_null());
        let slot = unsafe { &*p };
        assert!(slot.max_allocatable_size() >= 200_000);
        assert_eq!(slot.header().tag(), MemTag::Big);
        assert!(list.deallocate(p));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn cached_slot_is_reused() {
        let list = BigSlotList::new();
        let p = list.allocate_newly(150_000);
        assert!(list.deallocate(p));
        assert!(list.cached_bytes() > 0);
        let q = list.reuse_allocate(140_000);
        assert_eq!(p, q);
        assert_eq!(list.cached_bytes(), 0);
        assert!(list.deallocate(q));
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn undersized_cache_entries_are_skipped() {
        let list = BigSlotList::new();
        let small = list.allocate_newly(140_000);
        assert!(list.deallocate(small));
        assert!(list.reuse_allocate(1_000_000).is_null());
        // The unfit candidate must still be cached.
        assert!(list.cached_bytes() > 0);
        unsafe { list.clear_for_test() };
    }

    #[test]
    fn over_threshold_regions_bypass_the_cache() {
        let list = BigSlotList::new();
        let p = list.allocate_newly(DEFAULT_OVER_BIG_THRESHOLD + 1);
        assert!(!p.is_null());
        assert_eq!(unsafe { &*p }.header().tag(), MemTag::OverBig);
        assert!(list.deallocate(p));
        assert_eq!(list.cached_bytes(), 0);
    }

    #[test]
    fn double_free_of_cached_slot_reports() {
        let list = BigSlotList::new();
        let p = list.allocate_newly(100_000);
        assert!(list.deallocate(p));
        assert!(!list.deallocate(p));
        unsafe { list.clear_for_test() };
    }
}
