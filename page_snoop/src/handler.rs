//! SIGSEGV dispatch.
//!
//! Two handlers share the fault path:
//!
//! | Mode    | On an access fault                                   |
//! |---------|------------------------------------------------------|
//! | Passive | make the page read-write                             |
//! | Active  | make the page read-write, record it, re-protect evictee |
//!
//! Switching modes is one `sigaction` call, so some handler is installed at
//! every instant. Both run on the alternate signal stack because the thread's
//! own stack is protected while tracing.
//!
//! # Signal safety
//!
//! The handlers run at arbitrary instruction boundaries of the traced thread.
//! They may only do address arithmetic, call `mprotect`, load from
//! `HANDLER_STATE` and write into the published cache. No allocation, no
//! locks, no logging.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use libc::{c_int, c_void, siginfo_t};

use crate::buffer::PageBuffer;
use crate::cache::{PageCache, RawSlots, SharedCache, Slot};
use crate::error::{ProtectError, TraceError};
use crate::protect::{self, Protection};
use crate::{page_size, round_to_page, PageRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Passive,
    Active,
}

/// Everything the handlers read besides the cache. Page aligned so the
/// tracer can make exactly this page accessible after bulk protection.
#[repr(C, align(4096))]
struct HandlerState {
    page_size: AtomicUsize,
    cache: AtomicPtr<SharedCache>,
}

static HANDLER_STATE: HandlerState = HandlerState {
    page_size: AtomicUsize::new(0),
    cache: AtomicPtr::new(ptr::null_mut()),
};

/// `si_code` of a SIGSEGV caused by page permissions.
const SEGV_ACCERR: c_int = 2;
/// `si_code` when the page's protection key denied the access. x86-64 with
/// PKU backs execute-only mappings with a key, so their faults carry this.
const SEGV_PKUERR: c_int = 4;

/// Whether a `SignalDispatcher` currently owns the SIGSEGV slot.
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Service one access fault at `addr`.
///
/// The faulting page is made read-write. With a cache the page is recorded,
/// and a page evicted to make room is made execute-only again so its next
/// touch faults.
pub fn handle_fault<S, F>(
    addr: usize,
    page_size: usize,
    cache: Option<&mut PageCache<S>>,
    mut protect: F,
) -> Result<(), ProtectError>
where
    S: AsRef<[Slot]> + AsMut<[Slot]>,
    F: FnMut(usize, usize, Protection) -> Result<(), ProtectError>,
{
    let page = round_to_page(addr, page_size);
    protect(page, page + page_size, Protection::ReadWrite)?;
    if let Some(cache) = cache {
        if let Some(evicted) = cache.record(page) {
            protect(evicted, evicted + page_size, Protection::ExecOnly)?;
        }
    }
    Ok(())
}

/// Seam between the tracer and the process-wide signal machinery.
pub trait Dispatcher {
    /// Make sure an alternate signal stack of at least `size` bytes is
    /// installed and return the memory it occupies.
    fn install_signal_stack(&mut self, size: usize) -> Result<PageRange, TraceError>;

    /// Hand the cache to the active handler.
    fn publish(&mut self, cache: *mut SharedCache);

    /// Atomically replace the installed handler.
    fn install(&mut self, mode: HandlerMode) -> Result<(), TraceError>;

    /// Handler memory outside the cache and the signal stack.
    fn state_range(&self) -> PageRange;
}

/// Owner of the process's SIGSEGV disposition.
///
/// Only one exists at a time. The alternate stack it installs is never
/// unmapped: pages stay protected after tracing, so the passive handler
/// keeps needing it for the rest of the process.
#[derive(Debug)]
pub struct SignalDispatcher {
    signal_stack: Option<PageRange>,
    mode: Option<HandlerMode>,
}

impl SignalDispatcher {
    pub fn claim() -> Result<SignalDispatcher, TraceError> {
        if CLAIMED.swap(true, Ordering::AcqRel) {
            return Err(TraceError::HandlerClaimed);
        }
        HANDLER_STATE.page_size.store(page_size(), Ordering::Release);
        Ok(SignalDispatcher {
            signal_stack: None,
            mode: None,
        })
    }

    /// Mode of the handler this dispatcher last installed.
    pub fn mode(&self) -> Option<HandlerMode> {
        self.mode
    }
}

impl Dispatcher for SignalDispatcher {
    fn install_signal_stack(&mut self, size: usize) -> Result<PageRange, TraceError> {
        if let Some(range) = self.signal_stack {
            return Ok(range);
        }
        let stack = PageBuffer::map(size)?;
        unsafe {
            let mut ss: libc::stack_t = std::mem::zeroed();
            ss.ss_sp = stack.as_mut_ptr() as *mut c_void;
            ss.ss_size = stack.len();
            ss.ss_flags = 0;
            if libc::sigaltstack(&ss, ptr::null_mut()) == -1 {
                return Err(TraceError::last_os_error("sigaltstack"));
            }
        }
        let range = stack.leak();
        debug!("Signal stack installed at {:#x}-{:#x}", range.start, range.end);
        self.signal_stack = Some(range);
        Ok(range)
    }

    fn publish(&mut self, cache: *mut SharedCache) {
        HANDLER_STATE.cache.store(cache, Ordering::Release);
    }

    fn install(&mut self, mode: HandlerMode) -> Result<(), TraceError> {
        let handler = match mode {
            HandlerMode::Passive => passive_handler as *const () as libc::sighandler_t,
            HandlerMode::Active => active_handler as *const () as libc::sighandler_t,
        };
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) != 0 {
                return Err(TraceError::last_os_error("sigaction"));
            }
        }
        self.mode = Some(mode);
        Ok(())
    }

    fn state_range(&self) -> PageRange {
        let start = &HANDLER_STATE as *const HandlerState as usize;
        PageRange::new(start, start + std::mem::size_of::<HandlerState>())
    }
}

impl Drop for SignalDispatcher {
    fn drop(&mut self) {
        HANDLER_STATE.cache.store(ptr::null_mut(), Ordering::Release);
        CLAIMED.store(false, Ordering::Release);
    }
}

extern "C" fn passive_handler(_sig: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    let addr = match access_fault(info) {
        Some(addr) => addr,
        None => return restore_default(),
    };
    let page_size = HANDLER_STATE.page_size.load(Ordering::Acquire);
    let result = handle_fault::<RawSlots, _>(addr, page_size, None, |s, e, m| {
        protect::protect(s, e, page_size, m)
    });
    if result.is_err() {
        unsafe { libc::abort() }
    }
}

extern "C" fn active_handler(_sig: c_int, info: *mut siginfo_t, _context: *mut c_void) {
    let addr = match access_fault(info) {
        Some(addr) => addr,
        None => return restore_default(),
    };
    let page_size = HANDLER_STATE.page_size.load(Ordering::Acquire);
    let cache = unsafe { HANDLER_STATE.cache.load(Ordering::Acquire).as_mut() };
    let result = handle_fault(addr, page_size, cache, |s, e, m| {
        protect::protect(s, e, page_size, m)
    });
    if result.is_err() {
        unsafe { libc::abort() }
    }
}

/// Faulting address of a permission fault, `None` for any other SIGSEGV.
fn access_fault(info: *const siginfo_t) -> Option<usize> {
    let info = unsafe { &*info };
    match info.si_code {
        SEGV_ACCERR | SEGV_PKUERR => Some(unsafe { info.si_addr() } as usize),
        _ => None,
    }
}

/// Not a fault we caused: fall back to the default action so the faulting
/// instruction kills the process when it re-executes.
fn restore_default() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
    }
}
