//! Page-aligned anonymous mappings owned by the tracer.
//!
//! Bulk protection covers every anonymous mapping in the process, including
//! these. Keeping the tracer's own memory in dedicated mappings lets the
//! tracer make exactly those pages accessible again afterwards.

use std::ptr::NonNull;

use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

use crate::error::TraceError;
use crate::{page_size, round_up_to_page, PageRange};

#[derive(Debug)]
pub struct PageBuffer {
    base: NonNull<u8>,
    len: usize,
}

impl PageBuffer {
    /// Map at least `len` bytes of zeroed, read-write memory.
    pub fn map(len: usize) -> Result<PageBuffer, TraceError> {
        let len = round_up_to_page(len.max(1), page_size());
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(TraceError::last_os_error("mmap"));
        }
        match NonNull::new(ptr as *mut u8) {
            Some(base) => Ok(PageBuffer { base, len }),
            None => Err(TraceError::last_os_error("mmap")),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn range(&self) -> PageRange {
        let start = self.base.as_ptr() as usize;
        PageRange::new(start, start + self.len)
    }

    /// Give up ownership without unmapping. Used for memory the signal
    /// handler may still reach after the owner is gone.
    pub fn leak(self) -> PageRange {
        let range = self.range();
        std::mem::forget(self);
        range
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_whole_zeroed_pages() {
        let size = page_size();
        let buffer = PageBuffer::map(size + 1).unwrap();
        assert_eq!(buffer.len(), 2 * size);
        assert_eq!(buffer.range().start % size, 0);
        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_mut_ptr(), buffer.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_length_still_maps_a_page() {
        let buffer = PageBuffer::map(0).unwrap();
        assert_eq!(buffer.len(), page_size());
    }

    #[test]
    fn leaked_range_stays_mapped() {
        let range = PageBuffer::map(page_size()).unwrap().leak();
        unsafe {
            (range.start as *mut u8).write(7);
            assert_eq!((range.start as *const u8).read(), 7);
            libc::munmap(range.start as *mut c_void, range.len());
        }
    }
}
