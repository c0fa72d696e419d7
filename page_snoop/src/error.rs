//! Error types for tracing.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::protect::Protection;

/// A failed `mprotect` call.
///
/// Plain data so it can be built on the bulk-protection path, where nothing
/// may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("mprotect {start:#x}-{end:#x} to {mode:?} failed: {}", os_error(.errno))]
pub struct ProtectError {
    pub start: usize,
    pub end: usize,
    pub mode: Protection,
    pub errno: i32,
}

fn os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("tracing is already active")]
    AlreadyActive,

    #[error("tracing is not active")]
    NotActive,

    #[error("cannot read the page cache while tracing is active")]
    StillActive,

    #[error("page cache capacity must be at least one slot")]
    ZeroCapacity,

    /// The process-wide SIGSEGV slot is owned by another tracer.
    #[error("the fault handler is already claimed by another tracer")]
    HandlerClaimed,

    #[error("unable to read memory map {}: {source}", .path.display())]
    Maps {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("memory map lists more than {0} protectable regions")]
    TooManyRegions(usize),

    #[error(transparent)]
    Protect(#[from] ProtectError),

    /// An OS call other than `mprotect` failed (`mmap`, `sigaltstack`, `sigaction`).
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("unable to write dump {}: {source}", .path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TraceError {
    pub(crate) fn last_os_error(op: &'static str) -> TraceError {
        TraceError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_error_names_range_and_cause() {
        let err = ProtectError {
            start: 0x1000,
            end: 0x3000,
            mode: Protection::ExecOnly,
            errno: libc::ENOMEM,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x1000-0x3000"), "{}", msg);
        assert!(msg.contains("ExecOnly"), "{}", msg);
    }

    #[test]
    fn protect_error_converts_into_trace_error() {
        let err = ProtectError {
            start: 0,
            end: 0x1000,
            mode: Protection::ReadWrite,
            errno: libc::EACCES,
        };
        match TraceError::from(err) {
            TraceError::Protect(inner) => assert_eq!(inner, err),
            other => panic!("unexpected {:?}", other),
        }
    }
}
