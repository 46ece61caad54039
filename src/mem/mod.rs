//! Lock-free two-tier memory allocator.
//!
//! `gmem_allocate` routes a request to the first size class that can hold
//! it (walking up on exhaustion) and past the largest class to the
//! big-slot list. Every returned region is preceded by a one-word
//! [`header::AllocHeader`] from which `gmem_deallocate` recovers the
//! owning structure; the hot path on both sides is a lock-free stack
//! operation.

pub mod big;
pub mod chamber;
pub mod classes;
pub mod header;
pub mod page;
pub mod retrieved;
pub mod small;

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;

use big::{BigSlot, BigSlotList};
use classes::{class_index_hint, CLASSES, CLASS_COUNT};
use header::{AllocHeader, MemTag, MIN_ALIGN};
use small::{SlotGroup, SlotLink, TAIL_SENTINEL};

static BIG_SLOTS: BigSlotList = BigSlotList::new();

/// Allocate `n` bytes with word alignment. Null on OOM; `n == 0` still
/// returns a unique pointer at least one byte wide.
pub fn gmem_allocate(n: usize) -> *mut u8 {
    allocate_impl(n, MIN_ALIGN)
}

/// Allocate `n` bytes aligned to `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two; that is a programming error,
/// not a runtime condition.
pub fn gmem_allocate_aligned(n: usize, align: usize) -> *mut u8 {
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    allocate_impl(n, align)
}

#[cfg(feature = "sanitizer-fallback")]
fn allocate_impl(n: usize, align: usize) -> *mut u8 {
    sanitizer::alloc(n, align)
}

#[cfg(not(feature = "sanitizer-fallback"))]
fn allocate_impl(n: usize, align: usize) -> *mut u8 {
    let mut needed = match n.checked_add(1) {
        Some(v) => v,
        None => return ptr::null_mut(),
    };
    if align > MIN_ALIGN {
        needed = match needed.checked_add(align - 1) {
            Some(v) => v,
            None => {
                log::error!("allocation overflow: n={} align={}", n, align);
                return ptr::null_mut();
            }
        };
    }

    let hint = class_index_hint(needed);
    for idx in hint..CLASS_COUNT {
        let class = &CLASSES[idx];
        if needed > class.allocatable_bytes() {
            continue;
        }
        let mut slot = class.allocate();
        if slot.is_null() {
            class.request_new_group();
            slot = class.allocate();
        }
        if !slot.is_null() {
            let slot_bytes = SlotGroup::one_slot_bytes(class.allocatable_bytes());
            return unsafe { (*slot).prepare_user_area(align, slot_bytes) };
        }
    }

    let mut big = BIG_SLOTS.reuse_allocate(needed);
    if big.is_null() {
        big = BIG_SLOTS.allocate_newly(needed);
    }
    if big.is_null() {
        return ptr::null_mut();
    }
    unsafe { (*big).prepare_user_area(align) }
}

/// Free a pointer returned by the allocator.
///
/// Returns false for null, for pointers the allocator never handed out,
/// and for double frees; those are logged and the memory is untouched.
pub fn gmem_deallocate(p: *mut u8) -> bool {
    if p.is_null() {
        return false;
    }
    deallocate_impl(p)
}

#[cfg(feature = "sanitizer-fallback")]
fn deallocate_impl(p: *mut u8) -> bool {
    sanitizer::dealloc(p)
}

#[cfg(not(feature = "sanitizer-fallback"))]
fn deallocate_impl(p: *mut u8) -> bool {
    {
        let top = unsafe { &*AllocHeader::from_user_ptr(p) };
        let info = top.info();
        if info.owner.is_null() {
            log::error!("gmem never allocated {:p}", p);
            return false;
        }
        match info.tag {
            MemTag::Small => {
                let group = info.owner as *mut SlotGroup;
                let group = unsafe { &*group };
                let idx = match group.slot_index(p) {
                    Some(idx) => idx,
                    None => {
                        log::error!("pointer {:p} outside its slot group", p);
                        return false;
                    }
                };
                let slot: *mut SlotLink = group.slot_ptr(idx);
                check_tail_sentinel(group.slot_end_addr(idx));
                if !ptr::eq(unsafe { (*slot).header() }, top) {
                    // Alignment shifted the user pointer; clear the
                    // sub-header copy as well.
                    top.fetch_set_used(false);
                }
                let list = unsafe { &*group.list() };
                list.deallocate(slot)
            }
            MemTag::Big | MemTag::OverBig => {
                let slot = info.owner as *mut BigSlot;
                let slot_ref = unsafe { &*slot };
                if !slot_ref.is_valid() {
                    log::error!("big slot behind {:p} failed the magic check", p);
                    return false;
                }
                check_tail_sentinel(slot as usize + slot_ref.buffer_size());
                if !ptr::eq(slot_ref.header(), top) {
                    top.fetch_set_used(false);
                }
                BIG_SLOTS.deallocate(slot)
            }
            MemTag::Unused => {
                log::error!("deallocate of unassigned region {:p}", p);
                false
            }
        }
    }
}

#[cfg(not(feature = "sanitizer-fallback"))]
fn check_tail_sentinel(slot_end: usize) {
    let tail = unsafe { *((slot_end - 1) as *const u8) };
    if tail != TAIL_SENTINEL {
        report_corruption("tail sentinel overwritten; buffer overrun before free");
    }
}

/// Usable bytes from `p` to the end of its slot.
pub fn get_max_allocatable_size(p: *mut u8) -> usize {
    if p.is_null() {
        return 0;
    }
    max_allocatable_impl(p)
}

#[cfg(feature = "sanitizer-fallback")]
fn max_allocatable_impl(p: *mut u8) -> usize {
    sanitizer::max_size(p)
}

#[cfg(not(feature = "sanitizer-fallback"))]
fn max_allocatable_impl(p: *mut u8) -> usize {
    {
        let top = unsafe { &*AllocHeader::from_user_ptr(p) };
        let info = top.info();
        if info.owner.is_null() {
            log::error!("gmem never allocated {:p}", p);
            return 0;
        }
        match info.tag {
            MemTag::Small => {
                let group = unsafe { &*(info.owner as *mut SlotGroup) };
                match group.slot_index(p) {
                    Some(idx) => group.slot_end_addr(idx) - 1 - p as usize,
                    None => 0,
                }
            }
            MemTag::Big | MemTag::OverBig => {
                let slot = unsafe { &*(info.owner as *mut BigSlot) };
                slot as *const BigSlot as usize + slot.buffer_size() - 1 - p as usize
            }
            MemTag::Unused => 0,
        }
    }
}

/// Log one status line per size class plus the big-slot cache.
pub fn gmem_dump_status(level: log::Level, id: &str) {
    for (idx, class) in CLASSES.iter().enumerate() {
        let (groups, slots) = class.status();
        if groups > 0 {
            log::log!(
                level,
                "[{}] class {:3} ({:6} B): {} groups, {} slots",
                id,
                idx,
                class.allocatable_bytes(),
                groups,
                slots
            );
        }
    }
    log::log!(
        level,
        "[{}] big-slot cache: {} bytes",
        id,
        BIG_SLOTS.cached_bytes()
    );
}

/// Corruption reporting shared by the allocator internals: logged, never
/// fatal unless the strict feature asks for it.
pub(crate) fn report_corruption(msg: &str) {
    #[cfg(feature = "record-backtrace")]
    log::error!("{}\n{}", msg, std::backtrace::Backtrace::capture());
    #[cfg(not(feature = "record-backtrace"))]
    log::error!("{}", msg);
    #[cfg(feature = "abort-on-logic-error")]
    panic!("{}", msg);
}

/// Place one object through the allocator. Containers and control blocks
/// draw their nodes from here so the slab path backs everything.
pub(crate) fn alloc_one<T>(value: T) -> *mut T {
    let size = mem::size_of::<T>().max(1);
    let p = allocate_impl(size, mem::align_of::<T>()) as *mut T;
    if p.is_null() {
        std::alloc::handle_alloc_error(Layout::new::<T>());
    }
    unsafe { ptr::write(p, value) };
    p
}

/// Fallible twin of [`alloc_one`]; null on OOM, used by the
/// non-allocating container paths.
pub(crate) fn try_alloc_one<T>(value: T) -> *mut T {
    let size = mem::size_of::<T>().max(1);
    let p = allocate_impl(size, mem::align_of::<T>()) as *mut T;
    if !p.is_null() {
        unsafe { ptr::write(p, value) };
    }
    p
}

/// Drop and free an object placed with [`alloc_one`].
///
/// # Safety
///
/// `p` must come from `alloc_one::<T>`/`try_alloc_one::<T>` and must not
/// be used afterwards.
pub(crate) unsafe fn dealloc_one<T>(p: *mut T) {
    if p.is_null() {
        return;
    }
    ptr::drop_in_place(p);
    gmem_deallocate(p as *mut u8);
}

/// `GlobalAlloc` adapter over `gmem`; register with
/// `#[global_allocator]` to route every heap allocation through the
/// slab path.
pub struct GmemAllocator;

unsafe impl GlobalAlloc for GmemAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate_impl(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        gmem_deallocate(ptr);
    }
}

#[cfg(feature = "sanitizer-fallback")]
mod sanitizer {
    //! Pass-through to `std::alloc` so sanitizers see every allocation.
    //! A two-word prefix keeps enough of the layout to free and to answer
    //! `get_max_allocatable_size`.

    use core::alloc::Layout;
    use core::mem;
    use core::ptr;

    const PREFIX: usize = 2 * mem::size_of::<usize>();

    pub(super) fn alloc(n: usize, align: usize) -> *mut u8 {
        let total = match n.checked_add(PREFIX + align) {
            Some(v) => v,
            None => return ptr::null_mut(),
        };
        let layout = match Layout::from_size_align(total, mem::align_of::<usize>()) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };
        let raw = unsafe { std::alloc::alloc(layout) };
        if raw.is_null() {
            return ptr::null_mut();
        }
        let user = (raw as usize + PREFIX + align - 1) & !(align - 1);
        unsafe {
            *((user - mem::size_of::<usize>()) as *mut usize) = user - raw as usize;
            *((user - 2 * mem::size_of::<usize>()) as *mut usize) = total;
        }
        user as *mut u8
    }

    pub(super) fn dealloc(p: *mut u8) -> bool {
        unsafe {
            let offset = *((p as usize - mem::size_of::<usize>()) as *const usize);
            let total = *((p as usize - 2 * mem::size_of::<usize>()) as *const usize);
            let raw = (p as usize - offset) as *mut u8;
            let layout = Layout::from_size_align_unchecked(total, mem::align_of::<usize>());
            std::alloc::dealloc(raw, layout);
        }
        true
    }

    pub(super) fn max_size(p: *mut u8) -> usize {
        unsafe {
            let offset = *((p as usize - mem::size_of::<usize>()) as *const usize);
            let total = *((p as usize - 2 * mem::size_of::<usize>()) as *const usize);
            total - offset
        }
    }
}
