//! Typed error kinds for the subcontext machinery.
//!
//! Library code returns `Result<T, Error>` so callers can match on kind
//! (`BadIndex` and `ConfigTooLarge` are recoverable; the rest are fatal to
//! the operation in progress). The CLI binary wraps these in `anyhow` at
//! the top level.

use std::fmt;

/// Error kinds for image codec, snapshot, and matchmaker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Region count or subcontext count exceeds compile-time capacity.
    #[error("capacity exceeded: {0}")]
    ConfigTooLarge(String),

    /// Snapshot file creation, truncation, or mapping failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A subcontext region intersects a pre-existing client mapping.
    #[error("region {range} overlaps existing mapping")]
    OverlapFatal { range: AddrRange },

    /// The OS refused a fixed-address mapping or a protection change.
    #[error("failed to map region {range}: {source}")]
    MapFailed { range: AddrRange, source: nix::errno::Errno },

    /// Function-entry index is out of range or null.
    #[error("bad function index {index} for subcontext fd {fd}")]
    BadIndex { fd: i32, index: usize },

    /// A protection fault landed outside every known domain.
    #[error("fault at {addr:#x} outside all known domains")]
    UnmappedFault { addr: usize },

    /// The requested subcontext fd is not currently mapped.
    #[error("no mapped subcontext with fd {0}")]
    NotMapped(i32),
}

/// Half-open virtual address range, used only for error display.
#[derive(Debug, Clone, Copy)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}-{:#018x}", self.start, self.end)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_index_displays_fd_and_index() {
        let e = Error::BadIndex { fd: 7, index: 3 };
        assert_eq!(format!("{}", e), "bad function index 3 for subcontext fd 7");
    }

    #[test]
    fn overlap_fatal_displays_range() {
        let e = Error::OverlapFatal {
            range: AddrRange {
                start: 0x1000,
                end: 0x2000,
            },
        };
        assert!(format!("{}", e).contains("0x0000000000001000"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
