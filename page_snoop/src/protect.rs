//! Page protection changes.
//!
//! `protect` is called from the SIGSEGV handler, so it does nothing but
//! address arithmetic and a single `mprotect` call. `errno` is only read on
//! the failure path.

use libc::{c_int, c_void, PROT_EXEC, PROT_READ, PROT_WRITE};

use crate::error::ProtectError;
use crate::{page_size, round_to_page, PageRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Reads and writes fault; instruction fetch does not.
    ExecOnly,
    ReadWrite,
    ReadWriteExec,
}

impl Protection {
    pub fn prot_flags(self) -> c_int {
        match self {
            Protection::ExecOnly => PROT_EXEC,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
            Protection::ReadWriteExec => PROT_READ | PROT_WRITE | PROT_EXEC,
        }
    }
}

/// Apply `mode` to every page in `[page_floor(start), end)`.
pub fn protect(
    start: usize,
    end: usize,
    page_size: usize,
    mode: Protection,
) -> Result<(), ProtectError> {
    let page_start = round_to_page(start, page_size);
    let len = end.saturating_sub(page_start);
    let result = unsafe { libc::mprotect(page_start as *mut c_void, len, mode.prot_flags()) };
    if result != 0 {
        return Err(ProtectError {
            start: page_start,
            end,
            mode,
            errno: errno(),
        });
    }
    Ok(())
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Seam between the tracer and the OS protection call.
pub trait Protector {
    fn protect(&mut self, range: PageRange, mode: Protection) -> Result<(), ProtectError>;
}

/// Live protector backed by `mprotect`.
#[derive(Debug, Clone, Copy)]
pub struct Mprotect {
    page_size: usize,
}

impl Mprotect {
    pub fn new() -> Mprotect {
        Mprotect {
            page_size: page_size(),
        }
    }
}

impl Default for Mprotect {
    fn default() -> Mprotect {
        Mprotect::new()
    }
}

impl Protector for Mprotect {
    fn protect(&mut self, range: PageRange, mode: Protection) -> Result<(), ProtectError> {
        protect(range.start, range.end, self.page_size, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageBuffer;

    #[test]
    fn flags_per_mode() {
        assert_eq!(Protection::ExecOnly.prot_flags(), PROT_EXEC);
        assert_eq!(Protection::ReadWrite.prot_flags(), PROT_READ | PROT_WRITE);
        assert_eq!(
            Protection::ReadWriteExec.prot_flags(),
            PROT_READ | PROT_WRITE | PROT_EXEC
        );
    }

    #[test]
    fn toggles_a_private_mapping() {
        let size = page_size();
        let buffer = PageBuffer::map(2 * size).unwrap();
        let range = buffer.range();
        let mut protector = Mprotect::new();

        protector.protect(range, Protection::ExecOnly).unwrap();
        protector.protect(range, Protection::ReadWrite).unwrap();

        unsafe {
            let ptr = buffer.as_mut_ptr();
            ptr.write(0xaa);
            ptr.add(size).write(0x55);
            assert_eq!(ptr.read(), 0xaa);
            assert_eq!(ptr.add(size).read(), 0x55);
        }
    }

    #[test]
    fn unaligned_start_is_rounded_down() {
        let size = page_size();
        let buffer = PageBuffer::map(size).unwrap();
        let range = buffer.range();

        protect(range.start + 100, range.end, size, Protection::ReadWriteExec).unwrap();
        protect(range.start + size - 1, range.end, size, Protection::ReadWrite).unwrap();

        unsafe {
            buffer.as_mut_ptr().write(1);
        }
    }

    #[test]
    fn rejects_unaligned_page_size_misuse() {
        // A start that is not page aligned after rounding with a bogus page
        // size is refused by the kernel and reported, not swallowed.
        let size = page_size();
        let buffer = PageBuffer::map(size).unwrap();
        let range = buffer.range();

        let err = protect(range.start + 8, range.end, 8, Protection::ReadWrite).unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);
        assert_eq!(err.mode, Protection::ReadWrite);
        assert_eq!(err.start, range.start + 8);
    }
}
