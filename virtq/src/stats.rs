//! Per-queue counters.
//!
//! All counters are `Cell`s: a queue is driven from one thread and the
//! engine updates them from `&self` contexts.

use std::cell::Cell;

use crate::blk::{VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT};

/// Counters for one request type.
#[derive(Debug, Default)]
pub struct IoStat {
    /// Requests dispatched to the backend.
    pub total: Cell<u64>,
    /// Backend completions that reported success.
    pub success: Cell<u64>,
    /// Backend completions that reported failure.
    pub fail: Cell<u64>,
    /// Payload descriptors folded away by merging.
    pub merged_desc: Cell<u64>,
    /// Requests staged in a grown private buffer.
    pub large_in_buf: Cell<u64>,
    /// Requests whose descriptor chain outgrew the static slot.
    pub long_desc_chain: Cell<u64>,
}

/// Per-type I/O counters for one queue.
#[derive(Debug, Default)]
pub struct IoStats {
    pub read: IoStat,
    pub write: IoStat,
    pub flush: IoStat,
}

impl IoStats {
    /// Bucket for a request type, if it is a backend I/O type.
    pub fn for_type(&self, req_type: u32) -> Option<&IoStat> {
        match req_type {
            VIRTIO_BLK_T_IN => Some(&self.read),
            VIRTIO_BLK_T_OUT => Some(&self.write),
            VIRTIO_BLK_T_FLUSH => Some(&self.flush),
            _ => None,
        }
    }
}

/// Outstanding-command counters for one queue.
#[derive(Debug, Default)]
pub struct CmdCounters {
    /// Commands between arrival and release.
    pub outstanding_total: Cell<u32>,
    /// Commands with at least one unreaped remote-memory transfer.
    pub outstanding_to_host: Cell<u32>,
    /// Commands waiting on a backend completion.
    pub outstanding_in_bdev: Cell<u32>,
    /// Commands parked in the fatal state.
    pub fatal: Cell<u32>,
    /// Commands fully completed and released.
    pub completed: Cell<u64>,
}
