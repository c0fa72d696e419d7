//! Enumeration and classification of the process's memory regions.
//!
//! Every line of `/proc/self/maps` becomes a `MemoryRegion`; `Classifier`
//! decides which of those may be protected. The regions the tracer itself
//! runs from (C runtime, loader text, kernel helper pages) are left alone,
//! and the stack is set aside so it can be protected last.

use std::fs::File;
use std::io::{self, BufRead, Read};
use std::path::Path;

use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::{page_size, round_to_page, PageRange};

const STACK_NAME: &str = "[stack]";
const LOADER_TEXT_PERMS: &str = "r-xp";
const KERNEL_SPECIAL: &[&str] = &["[vsyscall]", "[vdso]", "[vvar]", "[vvar_vclock]"];

/// One `/proc/<pid>/maps` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    /// Backing file or pseudo-name such as `[heap]`; empty for anonymous memory.
    pub pathname: String,
}

impl MemoryRegion {
    /// Parse a maps line, or `None` if it is malformed.
    pub fn parse(line: &str) -> Option<MemoryRegion> {
        let (start, end, perms) =
            scan_fmt!(line, "{x}-{x} {}", [hex usize], [hex usize], String).ok()?;
        if end <= start || perms.len() != 4 {
            return None;
        }
        // address perms offset dev inode pathname; the pathname may contain spaces.
        let pathname = line
            .split_whitespace()
            .skip(5)
            .collect::<Vec<_>>()
            .join(" ");
        Some(MemoryRegion {
            start,
            end,
            perms,
            pathname,
        })
    }

    pub fn range(&self) -> PageRange {
        PageRange::new(self.start, self.end)
    }

    pub fn is_anonymous(&self) -> bool {
        self.pathname.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionClass {
    /// Eligible for bulk protection.
    Protect,
    /// The main thread's stack; protected after everything else.
    Stack,
    /// Part of the C runtime or the tracer's own image.
    Runtime,
    /// Read-execute private text mapped by the loader.
    LoaderText,
    /// vsyscall / vdso / vvar.
    KernelSpecial,
    /// Start address outside the user-space window.
    OutsideWindow,
}

/// Result of classifying a whole memory map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectionPlan {
    /// Regions to protect, in map order, starts rounded down to the page.
    pub regions: Vec<PageRange>,
    pub stack: Option<PageRange>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    runtime_patterns: Vec<String>,
    min_address: usize,
    max_address: usize,
    page_size: usize,
}

impl Classifier {
    pub fn new(config: &TraceConfig) -> Classifier {
        let mut runtime_patterns = config.runtime_patterns.clone();
        if config.exclude_self_image {
            match std::env::current_exe() {
                Ok(exe) => runtime_patterns.push(exe.to_string_lossy().into_owned()),
                Err(e) => warn!("Unable to resolve own executable, not excluding it: {}", e),
            }
        }
        Classifier {
            runtime_patterns,
            min_address: config.min_address,
            max_address: config.max_address,
            page_size: page_size(),
        }
    }

    pub fn classify(&self, region: &MemoryRegion) -> RegionClass {
        // Stack is special, it is protected last because we are running on it.
        if region.pathname == STACK_NAME {
            return RegionClass::Stack;
        }
        if self
            .runtime_patterns
            .iter()
            .any(|p| !p.is_empty() && region.pathname.contains(p.as_str()))
        {
            return RegionClass::Runtime;
        }
        if region.perms == LOADER_TEXT_PERMS {
            return RegionClass::LoaderText;
        }
        if KERNEL_SPECIAL.contains(&region.pathname.as_str()) {
            return RegionClass::KernelSpecial;
        }
        if region.start < self.min_address || region.start >= self.max_address {
            return RegionClass::OutsideWindow;
        }
        RegionClass::Protect
    }

    /// Classify every parsable line of `reader`. Malformed lines are skipped.
    pub fn plan<R: BufRead>(&self, reader: R) -> io::Result<ProtectionPlan> {
        let mut plan = ProtectionPlan::default();
        for line in reader.lines() {
            let line = line?;
            let region = match MemoryRegion::parse(&line) {
                Some(region) => region,
                None => {
                    debug!("Skipping unparsable maps line: {}", line);
                    continue;
                }
            };
            match self.classify(&region) {
                RegionClass::Protect => {
                    trace!("Protecting region {:#x}-{:#x} {}", region.start, region.end, region.pathname);
                    plan.regions.push(PageRange::new(
                        round_to_page(region.start, self.page_size),
                        region.end,
                    ));
                }
                RegionClass::Stack => plan.stack = Some(region.range()),
                class => trace!(
                    "Leaving {:#x}-{:#x} {} alone ({:?})",
                    region.start,
                    region.end,
                    region.pathname,
                    class
                ),
            }
        }
        Ok(plan)
    }

    /// Read and classify the map at `path`.
    pub fn plan_from_path(&self, path: &Path) -> Result<ProtectionPlan, TraceError> {
        let text = read_maps(path)?;
        self.plan(text.as_bytes()).map_err(|source| TraceError::Maps {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Every region listed at `path`, in map order.
pub fn get_regions(path: &Path) -> Result<Vec<MemoryRegion>, TraceError> {
    let text = read_maps(path)?;
    Ok(text.lines().filter_map(MemoryRegion::parse).collect())
}

const READ_CHUNK: usize = 16 * 1024;

/// Read the whole map into memory.
///
/// Pages left execute-only by an earlier trace make `read(2)` fail with
/// `EFAULT` rather than fault. Growing the buffer with `resize` writes every
/// new byte from user space first, which takes those faults before the
/// kernel is asked to fill it.
fn read_maps(path: &Path) -> Result<String, TraceError> {
    let wrap = |source: io::Error| TraceError::Maps {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(wrap)?;
    let mut buf: Vec<u8> = Vec::new();
    let mut filled = 0;
    loop {
        if buf.len() - filled < READ_CHUNK {
            buf.resize(filled + READ_CHUNK, 0);
        }
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(wrap(e)),
        }
    }
    buf.truncate(filled);
    String::from_utf8(buf).map_err(|e| wrap(io::Error::new(io::ErrorKind::InvalidData, e)))
}
