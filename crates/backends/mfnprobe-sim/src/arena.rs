use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::debug;
use mfnprobe_core::memory::PAGE_SIZE;

use crate::SimError;

/// Anonymous mapping holding the contents of all guest pages.
///
/// Page `i` of the guest lives at `ptr + i * PAGE_SIZE`.
#[derive(Debug)]
pub(crate) struct Arena {
    ptr: *mut u8,
    len: usize,
}

impl Arena {
    /// Maps `pages` zeroed pages.
    pub(crate) fn map(pages: usize) -> Result<Self, SimError> {
        let len = pages * PAGE_SIZE;
        let p = unsafe {
            libc::mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(SimError::ArenaMap(std::io::Error::last_os_error()));
        }
        debug!("Mapped page arena of {} pages at {:p}", pages, p);
        Ok(Arena {
            ptr: p as *mut u8,
            len,
        })
    }

    /// Pointer to the first byte of page `index`.
    pub(crate) fn page(&self, index: usize) -> *mut u8 {
        assert!(
            index * PAGE_SIZE < self.len,
            "page {} outside of arena",
            index
        );
        unsafe { self.ptr.add(index * PAGE_SIZE) }
    }

    /// Zeroes `count` pages starting at page `index`.
    pub(crate) fn clear(&mut self, index: usize, count: usize) {
        assert!((index + count) * PAGE_SIZE <= self.len);
        unsafe { std::ptr::write_bytes(self.page(index), 0, count * PAGE_SIZE) };
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0 {
            log::error!("munmap: {}", std::io::Error::last_os_error());
        }
    }
}
