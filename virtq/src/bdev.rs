//! Block-device backend seam.
//!
//! Everything below the request state machine is behind [`BlkBackend`]: the
//! engine submits reads, writes and flushes against byte offsets and gets the
//! outcome back through [`Virtq::bdev_done`](crate::queue::Virtq::bdev_done).
//! Submissions must not deliver their completion from inside the submitting
//! call.

use std::io;

/// Outcome of one backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdevOpStatus {
    Success,
    Failed,
}

/// Completion routing token for one in-flight backend operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdevToken {
    pub(crate) cmd_idx: u16,
}

/// One element of a zero-copy scatter/gather list, addressing guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iovec {
    pub addr: u64,
    pub len: u32,
}

/// Storage backend a queue dispatches into.
///
/// # Contract
///
/// Buffers passed to `read` and `write` stay valid until the matching
/// completion is delivered; the command slot owning them is parked until
/// then. `pg_id` tags the submission with the protection-group the queue was
/// created under and is forwarded verbatim.
pub trait BlkBackend {
    /// Logical block size in bytes.
    fn block_size(&self) -> u32;

    /// Device capacity in blocks.
    fn num_blocks(&self) -> u64;

    /// Device name reported to `GET_ID` requests.
    fn bdev_name(&self) -> &str;

    /// Read `len` bytes at byte `offset` into `buf`.
    fn read(
        &self,
        buf: *mut u8,
        offset: u64,
        len: usize,
        comp: BdevToken,
        pg_id: u32,
    ) -> io::Result<()>;

    /// Write `len` bytes from `buf` at byte `offset`.
    fn write(
        &self,
        buf: *const u8,
        offset: u64,
        len: usize,
        comp: BdevToken,
        pg_id: u32,
    ) -> io::Result<()>;

    /// Flush `len` bytes starting at byte `offset`.
    fn flush(&self, offset: u64, len: u64, comp: BdevToken, pg_id: u32) -> io::Result<()>;

    /// Whether `iovs` may be handed to `readv_blocks`/`writev_blocks`
    /// directly. Backends without zero-copy support leave the default.
    fn zcopy_validate_params(&self, _iovs: &[Iovec], _offset: u64, _len: u64) -> bool {
        false
    }

    /// Scatter-read `num_blocks` blocks at `offset_blocks` into `iovs`.
    fn readv_blocks(
        &self,
        _iovs: &[Iovec],
        _offset_blocks: u64,
        _num_blocks: u64,
        _comp: BdevToken,
        _pg_id: u32,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "backend has no zero-copy read path",
        ))
    }

    /// Gather-write `num_blocks` blocks at `offset_blocks` from `iovs`.
    fn writev_blocks(
        &self,
        _iovs: &[Iovec],
        _offset_blocks: u64,
        _num_blocks: u64,
        _comp: BdevToken,
        _pg_id: u32,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "backend has no zero-copy write path",
        ))
    }
}
