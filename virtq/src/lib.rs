//! virtq - Storage-side emulation engine for tunneled virtio-blk queues.
//!
//! Commands arrive as a descriptor head index plus whatever chain elements
//! rode along with it. Each queue slot walks a per-command state machine
//! that pulls the rest of the chain and the request header from guest
//! memory, stages or zero-copies the payload, runs the request against an
//! asynchronous block backend and pushes data, status footer and completion
//! element back out.
//!
//! # Architecture
//!
//! ```text
//!  tunneled command       transport completion       backend completion
//!        │                        │                         │
//!        ▼                        ▼                         ▼
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │                            Virtq                              │
//!  │   slot table ──► sm::progress ──► BlkDev state handlers       │
//!  └───────────────────────────────────────────────────────────────┘
//!          │                                        │
//!          ▼                                        ▼
//!   DmaChannel                                  BlkBackend
//!   (guest memory reads/writes,                 (async read/write/flush,
//!    completion elements)                        optional zero-copy)
//! ```
//!
//! States run in this order, suspending at every asynchronous boundary:
//!
//! ```text
//!  FetchCmdDescs ─► ReadHeader ─► ParseHeader ─┬─► ReadData ─┐
//!                                              └─────────────┴─► HandleReq
//!  HandleReq ─┬─► OutDataDone ─┬─► WriteStatus ─► SendComp ─► Release
//!             └─► InDataDone ──┘      (SendInOrderComp parks until its turn)
//! ```
//!
//! Everything is single threaded per queue. Collaborators (transport,
//! backend, memory pool) take submissions synchronously and deliver their
//! completions later through `dma_done`, `bdev_done` and `pool_ready` on
//! [`Virtq`], never from inside the submit call.

pub mod bdev;
pub mod blk;
pub mod buffer;
pub mod cmd;
pub mod config;
pub mod desc;
pub mod dirty;
pub mod error;
pub mod queue;
pub mod sm;
pub mod stats;
pub mod transport;

pub use bdev::{BdevOpStatus, BdevToken, BlkBackend, Iovec};
pub use blk::{BlkCompletion, BlkHdr};
pub use buffer::{DmaBuffer, MemPool, PoolChunk, PoolToken};
pub use cmd::{BlkCommand, BlkDev};
pub use config::{DataPolicy, QueueConfig};
pub use desc::{Desc, DescChain, DescFlags};
pub use dirty::{DirtyLog, DirtyPageMap};
pub use error::{Error, Result};
pub use queue::{BlkVirtq, Virtq};
pub use sm::{CmdState, OpStatus};
pub use stats::{CmdCounters, IoStat, IoStats};
pub use transport::{DescTable, DmaChannel, DmaSlice, DmaToken, MemRegistry, RemoteSlice};
