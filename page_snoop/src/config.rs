use std::path::PathBuf;

/// Lowest start address considered for protection. Anything below holds
/// the program image of non-PIE binaries and the zero page.
pub const MIN_TRACED_ADDRESS: usize = 0x50_0000;

/// First start address no longer considered for protection.
pub const MAX_TRACED_ADDRESS: usize = 0x7fff_f000_0000;

pub const DEFAULT_SIGNAL_STACK_SIZE: usize = 64 * 1024;

/// Name fragments of mappings belonging to the C runtime and loader. The
/// fault handler calls into these, so they must never fault.
pub const RUNTIME_PATTERNS: &[&str] = &[
    "linux-gnu",
    "ld-linux",
    "/libc.so",
    "/libc-",
    "/libgcc_s",
    "/libpthread",
    "/libdl",
    "/libm.so",
    "/librt",
    "musl",
];

#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Memory map read on every start.
    pub maps_path: PathBuf,
    pub min_address: usize,
    pub max_address: usize,
    pub runtime_patterns: Vec<String>,
    /// Treat the running executable as part of the runtime.
    pub exclude_self_image: bool,
    pub signal_stack_size: usize,
}

impl TraceConfig {
    /// Signal stack size, never below what the platform requires.
    pub fn signal_stack_size(&self) -> usize {
        self.signal_stack_size.max(libc::SIGSTKSZ)
    }
}

impl Default for TraceConfig {
    fn default() -> TraceConfig {
        TraceConfig {
            maps_path: PathBuf::from("/proc/self/maps"),
            min_address: MIN_TRACED_ADDRESS,
            max_address: MAX_TRACED_ADDRESS,
            runtime_patterns: RUNTIME_PATTERNS.iter().map(|p| p.to_string()).collect(),
            exclude_self_image: true,
            signal_stack_size: DEFAULT_SIGNAL_STACK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_trace_self_map() {
        let config = TraceConfig::default();
        assert_eq!(config.maps_path, PathBuf::from("/proc/self/maps"));
        assert!(config.runtime_patterns.iter().any(|p| p == "linux-gnu"));
        assert!(config.exclude_self_image);
    }

    #[test]
    fn signal_stack_has_a_floor() {
        let config = TraceConfig {
            signal_stack_size: 16,
            ..TraceConfig::default()
        };
        assert_eq!(config.signal_stack_size(), libc::SIGSTKSZ);
    }
}
