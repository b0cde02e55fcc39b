//! Queue configuration.

use crate::blk::VIRTIO_BLK_ID_BYTES;
use crate::error::{Error, Result};
use crate::transport::DescTable;

/// How a command obtains staging memory for its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPolicy {
    /// Fixed per-command slice of the queue slab; oversized requests fail.
    Static,
    /// Per-command slice, with a private registered buffer allocated when a
    /// request outgrows it.
    Growth,
    /// No queue slab; every staged request borrows a chunk from an external
    /// memory pool.
    Pool,
}

/// Per-queue configuration.
///
/// Controls queue geometry, the staging-memory policy and the completion
/// ordering mode.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue index, used for logging and completion routing.
    /// Default: 0
    pub idx: u16,
    /// Queue depth (command slots). Must be a power of two.
    /// Default: 64
    pub size: u16,
    /// Maximum number of payload descriptors per request.
    /// Default: 32
    pub seg_max: u16,
    /// Maximum size of one payload descriptor in bytes.
    /// Default: 4096
    pub size_max: u32,
    /// Per-command staging bytes. 0 derives `seg_max * size_max`.
    /// Default: 0
    pub data_buf_size: u32,
    /// Staging-memory policy.
    /// Default: Growth
    pub policy: DataPolicy,
    /// Merge physically adjacent payload descriptors after fetch.
    /// Default: true
    pub merge_descs: bool,
    /// Complete commands in arrival order.
    /// Default: false
    pub force_in_order: bool,
    /// Attempt zero-copy backend submission for multi-descriptor payloads.
    /// Default: false
    pub zcopy: bool,
    /// Protection-group id forwarded with every backend submission.
    /// Default: 0
    pub pg_id: u32,
    /// Remote key covering guest memory.
    /// Default: 0
    pub dma_mkey: u32,
    /// Guest descriptor table, required to fetch chains the arrival message
    /// did not fully carry.
    /// Default: None
    pub desc_table: Option<DescTable>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idx: 0,
            size: 64,
            seg_max: 32,
            size_max: 4096,
            data_buf_size: 0,
            policy: DataPolicy::Growth,
            merge_descs: true,
            force_in_order: false,
            zcopy: false,
            pg_id: 0,
            dma_mkey: 0,
            desc_table: None,
        }
    }
}

impl QueueConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue index.
    pub fn with_idx(mut self, idx: u16) -> Self {
        self.idx = idx;
        self
    }

    /// Set the queue depth.
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }

    /// Set the payload descriptor limit.
    pub fn with_seg_max(mut self, seg_max: u16) -> Self {
        self.seg_max = seg_max;
        self
    }

    /// Set the per-descriptor size limit.
    pub fn with_size_max(mut self, size_max: u32) -> Self {
        self.size_max = size_max;
        self
    }

    /// Set the per-command staging size.
    pub fn with_data_buf_size(mut self, data_buf_size: u32) -> Self {
        self.data_buf_size = data_buf_size;
        self
    }

    /// Set the staging-memory policy.
    pub fn with_policy(mut self, policy: DataPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable or disable descriptor merging.
    pub fn with_merge_descs(mut self, merge_descs: bool) -> Self {
        self.merge_descs = merge_descs;
        self
    }

    /// Enable or disable in-order completion.
    pub fn with_force_in_order(mut self, force_in_order: bool) -> Self {
        self.force_in_order = force_in_order;
        self
    }

    /// Enable or disable zero-copy backend submission.
    pub fn with_zcopy(mut self, zcopy: bool) -> Self {
        self.zcopy = zcopy;
        self
    }

    /// Set the protection-group id.
    pub fn with_pg_id(mut self, pg_id: u32) -> Self {
        self.pg_id = pg_id;
        self
    }

    /// Set the remote key for guest memory.
    pub fn with_dma_mkey(mut self, dma_mkey: u32) -> Self {
        self.dma_mkey = dma_mkey;
        self
    }

    /// Set the guest descriptor table location.
    pub fn with_desc_table(mut self, desc_table: DescTable) -> Self {
        self.desc_table = Some(desc_table);
        self
    }

    /// Effective per-command staging size in bytes.
    #[inline]
    pub fn data_buf_len(&self) -> u32 {
        if self.data_buf_size != 0 {
            self.data_buf_size
        } else {
            self.seg_max as u32 * self.size_max
        }
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || !self.size.is_power_of_two() {
            return Err(Error::InvalidSize(self.size));
        }
        if self.seg_max == 0 {
            return Err(Error::InvalidSegMax(self.seg_max));
        }
        // GET_ID stages the device name even under the smallest layout.
        if self.policy != DataPolicy::Pool && self.data_buf_len() < VIRTIO_BLK_ID_BYTES as u32 {
            return Err(Error::DataBufTooSmall {
                required: VIRTIO_BLK_ID_BYTES as u32,
                got: self.data_buf_len(),
            });
        }
        Ok(())
    }
}
