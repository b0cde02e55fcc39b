//! Error types for virtq.

use std::io;

/// Queue construction and submission errors.
///
/// Per-command protocol failures are not `Error`s: they end as a virtio
/// status byte in the guest response, or as a fatal command state surfaced
/// through the queue counters (see [`crate::stats::CmdCounters`]).
#[derive(Debug)]
pub enum Error {
    /// IO error from the memory registry or a collaborator.
    Io(io::Error),
    /// Queue depth is zero or not a power of two.
    InvalidSize(u16),
    /// Segment maximum must be at least one.
    InvalidSegMax(u16),
    /// Request buffer cannot hold the minimum payload.
    DataBufTooSmall { required: u32, got: u32 },
    /// Memory-pool policy configured without a pool.
    PoolRequired,
    /// Page size is zero or not a power of two.
    InvalidPageSize(u32),
    /// Buffer allocation failed.
    AllocFailed { len: usize },
    /// Descriptor chain has fewer elements than header + footer.
    ChainTooShort(u16),
    /// Header or footer element has the wrong length after normalization.
    BadChainGeometry { hdr_len: u32, ftr_len: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidSize(size) => write!(f, "Queue size {} is not a power of two", size),
            Error::InvalidSegMax(seg_max) => write!(f, "Invalid segment maximum {}", seg_max),
            Error::DataBufTooSmall { required, got } => {
                write!(f, "Data buffer of {} bytes is below the {} byte minimum", got, required)
            }
            Error::PoolRequired => write!(f, "Memory-pool policy requires a pool"),
            Error::InvalidPageSize(ps) => write!(f, "Page size {} is not a power of two", ps),
            Error::AllocFailed { len } => write!(f, "Failed to allocate {} bytes", len),
            Error::ChainTooShort(n) => write!(f, "Descriptor chain of {} elements is too short", n),
            Error::BadChainGeometry { hdr_len, ftr_len } => {
                write!(f, "Bad chain geometry: header {} bytes, footer {} bytes", hdr_len, ftr_len)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for virtq operations.
pub type Result<T> = std::result::Result<T, Error>;
