//! Page-granular memory access tracing for the current process.
//!
//! Every eligible page of the address space is made execute-only. The first
//! read or write of a page raises SIGSEGV; the handler makes the page
//! read-write again and records it in a small circular cache. When the cache
//! is full the oldest page is evicted and protected again, so the cache always
//! holds a sample of the most recently first-touched pages.
//!
//! ```no_run
//! let mut tracer = page_snoop::Tracer::new(page_snoop::TraceConfig::default())?;
//! tracer.start(128)?;
//! // ... workload ...
//! tracer.stop()?;
//! tracer.dump("pages.out")?;
//! # Ok::<(), page_snoop::TraceError>(())
//! ```
//!
//! Tracing assumes a single-threaded process. Stopping swaps the handler back
//! to its passive mode but does not restore the original protections: pages
//! stay execute-only until touched.

#[macro_use]
extern crate scan_fmt;

#[macro_use]
extern crate log;

extern crate libc;

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod maps;
pub mod persist;
pub mod protect;
pub mod statistics;
pub mod tracer;

pub use cache::{CacheSnapshot, PageCache};
pub use config::TraceConfig;
pub use error::{ProtectError, TraceError};
pub use protect::Protection;
pub use tracer::{Tracer, TracingState};

/// Half-open address range `[start, end)` handed to the protection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub const fn new(start: usize, end: usize) -> PageRange {
        PageRange { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Size of a virtual memory page as reported by the OS.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Start of the page containing `addr`. `page_size` must be a power of two.
#[inline]
pub fn round_to_page(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

/// `len` rounded up to a whole number of pages.
#[inline]
pub fn round_up_to_page(len: usize, page_size: usize) -> usize {
    (len + page_size - 1) & !(page_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_down_to_page_start() {
        assert_eq!(round_to_page(0x1fff, 0x1000), 0x1000);
        assert_eq!(round_to_page(0x2000, 0x1000), 0x2000);
        assert_eq!(round_to_page(0x7ffd_1234_5678, 0x1000), 0x7ffd_1234_5000);
    }

    #[test]
    fn rounds_lengths_up() {
        assert_eq!(round_up_to_page(1, 0x1000), 0x1000);
        assert_eq!(round_up_to_page(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up_to_page(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn page_size_is_power_of_two() {
        let size = page_size();
        assert!(size >= 4096);
        assert_eq!(size & (size - 1), 0);
    }

    #[test]
    fn page_range_bounds() {
        let range = PageRange::new(0x1000, 0x3000);
        assert_eq!(range.len(), 0x2000);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x2fff));
        assert!(!range.contains(0x3000));
        assert!(PageRange::new(0x3000, 0x1000).is_empty());
    }
}
