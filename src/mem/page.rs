//! Page-level allocation primitive backed by `mmap`/`munmap`.
//!
//! Everything above this module deals in whole, page-aligned regions; this
//! is the only place that talks to the OS.

use core::ptr;

/// A region obtained from [`map_pages`]. `addr` is page aligned and `len`
/// is a multiple of the page size, so the region may be larger than what
/// was asked for; callers use the whole of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRegion {
    pub addr: *mut u8,
    pub len: usize,
}

impl PageRegion {
    pub const fn failed() -> Self {
        Self {
            addr: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.addr.is_null()
    }
}

pub fn page_size() -> usize {
    // Single syscall-free read after the first call.
    use core::sync::atomic::{AtomicUsize, Ordering};
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let sz = if sz <= 0 { 4096 } else { sz as usize };
    CACHED.store(sz, Ordering::Relaxed);
    sz
}

fn round_up(v: usize, to: usize) -> usize {
    (v + to - 1) & !(to - 1)
}

/// Map at least `len` bytes with at least `align` alignment.
///
/// `align` must be a power of two. Alignment up to the page size comes for
/// free; larger alignments over-map by `align` bytes and trim the
/// misaligned head and tail back to the OS.
pub fn map_pages(len: usize, align: usize) -> PageRegion {
    debug_assert!(align.is_power_of_two());
    let page = page_size();
    let len = round_up(len.max(1), page);

    if align <= page {
        let addr = raw_map(len);
        if addr.is_null() {
            return PageRegion::failed();
        }
        return PageRegion { addr, len };
    }

    // Over-map, then carve the aligned window out of the middle.
    let padded = match len.checked_add(align) {
        Some(v) => v,
        None => return PageRegion::failed(),
    };
    let addr = raw_map(padded);
    if addr.is_null() {
        return PageRegion::failed();
    }
    let base = addr as usize;
    let aligned = round_up(base, align);
    let head = aligned - base;
    let tail = padded - head - len;
    unsafe {
        if head != 0 {
            libc::munmap(addr as *mut libc::c_void, head);
        }
        if tail != 0 {
            libc::munmap((aligned + len) as *mut libc::c_void, tail);
        }
    }
    PageRegion {
        addr: aligned as *mut u8,
        len,
    }
}

fn raw_map(len: usize) -> *mut u8 {
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        log::warn!("mmap of {} bytes failed", len);
        ptr::null_mut()
    } else {
        p as *mut u8
    }
}

/// Return a region to the OS. `addr`/`len` must come from [`map_pages`].
pub unsafe fn unmap_pages(addr: *mut u8, len: usize) {
    if addr.is_null() {
        return;
    }
    if libc::munmap(addr as *mut libc::c_void, len) != 0 {
        log::error!("munmap({:p}, {}) failed", addr, len);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn map_gives_aligned_region() {
        let r = map_pages(100, 8);
        assert!(!r.is_failed());
        assert!(r.len >= 100);
        assert_eq!(r.addr as usize % page_size(), 0);
        unsafe { unmap_pages(r.addr, r.len) };
    }

    #[test]
    fn map_honors_large_alignment() {
        let align = page_size() * 4;
        let r = map_pages(page_size(), align);
        assert!(!r.is_failed());
        assert_eq!(r.addr as usize % align, 0);
        unsafe { unmap_pages(r.addr, r.len) };
    }

    #[test]
    fn region_is_writable() {
        let r = map_pages(4096, 8);
        assert!(!r.is_failed());
        unsafe {
            r.addr.write(0xa5);
            r.addr.add(r.len - 1).write(0x5a);
            assert_eq!(r.addr.read(), 0xa5);
        }
        unsafe { unmap_pages(r.addr, r.len) };
    }
}
