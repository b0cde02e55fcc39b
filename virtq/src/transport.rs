//! Remote-memory transport seam.
//!
//! The engine never talks to DMA hardware directly. The embedding
//! controller supplies a [`DmaChannel`] for guest-memory reads/writes and
//! completion delivery, and a [`MemRegistry`] that registers local buffers
//! for the channel's use. Both are driven from a single polling thread per
//! queue: submissions are fire-and-forget and must never invoke the queue's
//! completion entry points from inside the submitting call; completions are
//! delivered later from the same thread's polling context.

use std::io;

/// Local registered memory for one DMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSlice {
    /// Local address, as registered.
    pub addr: u64,
    pub len: u32,
    /// Key returned by [`MemRegistry::register`] for the containing buffer.
    pub lkey: u32,
}

/// Guest (host-side) memory for one DMA operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSlice {
    pub addr: u64,
    pub len: u32,
    /// Remote access key covering guest memory.
    pub rkey: u32,
}

/// Location of the guest descriptor table, used to fetch chain elements the
/// arrival message did not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescTable {
    /// Guest address of descriptor 0.
    pub addr: u64,
    /// Number of descriptors in the table.
    pub size: u16,
}

/// Completion routing token for one in-flight DMA operation.
///
/// Opaque to the transport: it is handed back unchanged to
/// [`Virtq::dma_done`](crate::queue::Virtq::dma_done).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaToken {
    pub(crate) cmd_idx: u16,
}

/// Remote-memory channel the queue issues guest I/O through.
///
/// Buffers referenced by a submitted operation stay valid until its token is
/// returned through `dma_done`; the slot owning them is not reused before
/// that.
pub trait DmaChannel {
    /// Read guest memory into a local registered buffer.
    fn read(&self, local: DmaSlice, remote: RemoteSlice, comp: DmaToken) -> io::Result<()>;

    /// Write a local registered buffer to guest memory.
    fn write(&self, local: DmaSlice, remote: RemoteSlice, comp: DmaToken) -> io::Result<()>;

    /// Write a few bytes to guest memory with no completion; the data is
    /// captured before the call returns.
    fn write_short(&self, data: &[u8], remote: RemoteSlice) -> io::Result<()>;

    /// Deliver a completion element to the guest-facing side.
    fn send_completion(&self, payload: &[u8]) -> io::Result<()>;
}

/// Registration of local buffers for DMA access.
pub trait MemRegistry {
    /// Register `len` bytes at `addr`, returning the local key.
    ///
    /// # Safety
    /// `addr` must point to an allocation of at least `len` bytes that
    /// outlives the registration.
    unsafe fn register(&self, addr: *mut u8, len: usize) -> io::Result<u32>;

    /// Release a registration. Called once per successful `register`.
    fn deregister(&self, lkey: u32);
}
