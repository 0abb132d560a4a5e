//! Error types for the memory-management core.
//!
//! Recoverable exhaustion (`page_alloc`, `kalloc`) is signaled by returning
//! `None`/null per the external contract, never by `MmError`. `MmError` covers
//! the boot-time initialization path (`mm::init`) and gives every other fatal
//! condition a typed payload before it is handed to the panic surface.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "memory errors must be handled, not silently discarded"]
pub enum MmError {
    /// A bootstrap, buddy, or slab allocation request could not be satisfied.
    OutOfMemory { requested_bytes: u64 },
    /// Detected corruption of an allocator-internal structure, or a caller
    /// violating a documented precondition (e.g. reusing a closed allocator).
    InvariantViolation { what: &'static str },
    /// Slab sanitizer detected a buffer over/underflow or a double-free.
    SanitizerReport {
        addr: usize,
        cache: &'static str,
        requested_size: usize,
    },
    /// A `map_*`/`page_free` argument violated an alignment precondition.
    UnalignedRequest { addr: usize, required_align: usize },
    /// Firmware-provided state (memory map, PAT layout) did not match what
    /// the core requires to boot.
    ConfigurationFault { reason: &'static str },
}

pub type MmResult<T> = Result<T, MmError>;

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested_bytes } => {
                write!(f, "out of memory: requested {requested_bytes} bytes")
            }
            Self::InvariantViolation { what } => write!(f, "invariant violation: {what}"),
            Self::SanitizerReport {
                addr,
                cache,
                requested_size,
            } => write!(
                f,
                "sanitizer report at 0x{addr:x} in cache '{cache}' (requested size {requested_size})"
            ),
            Self::UnalignedRequest {
                addr,
                required_align,
            } => write!(f, "unaligned request: 0x{addr:x} requires {required_align}-byte alignment"),
            Self::ConfigurationFault { reason } => write!(f, "configuration fault: {reason}"),
        }
    }
}

/// Logs `msg` at `error!` and halts the calling core. Used for the
/// `INVARIANT_VIOLATION` / `SANITIZER_REPORT` / `UNALIGNED_REQUEST` kinds,
/// which always panic rather than returning `MmError` (see SPEC_FULL.md §7).
#[macro_export]
macro_rules! mm_panic {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}
