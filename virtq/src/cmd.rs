//! Block-device command slots and state handlers.
//!
//! One [`BlkCommand`] per queue slot, driven by [`BlkDev`] through the
//! generic machine in [`sm`](crate::sm). Handlers set the next state before
//! submitting asynchronous work and report synchronous completion through
//! their return value.

use std::io;
use std::rc::Rc;

use crate::bdev::{BdevToken, BlkBackend, Iovec};
use crate::blk::{
    BlkCompletion, BlkHdr, BLK_FTR_BYTES, BLK_HDR_BYTES, NUM_HDR_FTR_DESCS, SECTOR_BYTES,
    VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH,
    VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use crate::buffer::{BufSlice, DmaBuffer, MemPool, PoolChunk, PoolToken};
use crate::config::{DataPolicy, QueueConfig};
use crate::desc::{Desc, DESC_BYTES};
use crate::dirty::DirtyLog;
use crate::error::{Error, Result};
use crate::sm::{CmdBase, CmdState, OpStatus, QueueState, VirtqCmd, VirtqOps};
use crate::stats::IoStats;
use crate::transport::{DmaChannel, DmaSlice, DmaToken, MemRegistry, RemoteSlice};

/// Header staging offset within a slot's aux window.
const AUX_HDR_OFF: usize = 0;
/// Descriptor-fetch staging offset within a slot's aux window.
const AUX_STAGE_OFF: usize = BLK_HDR_BYTES;
/// Per-slot aux stride; header and fetch staging, cache-line padded.
pub(crate) const AUX_SLOT_BYTES: usize = 64;

macro_rules! err_on_cmd {
    ($dev:expr, $cmd:expr, $($arg:tt)*) => {
        log::error!(
            "queue:{} cmd_idx:{} err: {}",
            $dev.cfg.idx,
            $cmd.base.idx,
            format_args!($($arg)*)
        )
    };
}

// ============================================================================
// Command slot
// ============================================================================

/// Staging memory currently backing a request.
///
/// Points into the queue slab, a grown private buffer or a pool chunk; null
/// and empty until one of those is installed.
#[derive(Debug, Clone, Copy)]
struct ReqBuf {
    ptr: *mut u8,
    lkey: u32,
    cap: u32,
}

impl ReqBuf {
    fn empty() -> Self {
        ReqBuf {
            ptr: std::ptr::null_mut(),
            lkey: 0,
            cap: 0,
        }
    }

    fn from_slice(s: BufSlice) -> Self {
        ReqBuf {
            ptr: s.as_mut_ptr(),
            lkey: s.lkey(),
            cap: s.len() as u32,
        }
    }

    fn dma_at(&self, offset: u32, len: u32) -> DmaSlice {
        debug_assert!(offset as u64 + len as u64 <= self.cap as u64);
        DmaSlice {
            addr: self.ptr as u64 + offset as u64,
            len,
            lkey: self.lkey,
        }
    }
}

/// One reusable per-command context.
pub struct BlkCommand {
    pub(crate) base: CmdBase,
    /// Registered window for header and descriptor-fetch staging.
    aux: BufSlice,
    /// Per-slot window of the queue data slab; None under the pool policy.
    slab: Option<BufSlice>,
    /// Staging backing the current request.
    req: ReqBuf,
    /// Grown private buffer, held until release.
    dbuf: Option<DmaBuffer>,
    /// Borrowed pool chunk, held until release.
    pool_chunk: Option<PoolChunk>,
    pub(crate) req_type: u32,
    sector: u64,
    /// Footer status byte accumulated for the guest.
    pub(crate) status: u8,
    zcopy: bool,
    iovs: Vec<Iovec>,
    /// A descriptor fetch is in flight into the aux staging area.
    fetch_pending: bool,
}

impl BlkCommand {
    fn new(idx: u16, chain_cap: u16, aux: BufSlice, slab: Option<BufSlice>) -> Self {
        BlkCommand {
            base: CmdBase::new(idx, chain_cap),
            aux,
            slab,
            req: ReqBuf::empty(),
            dbuf: None,
            pool_chunk: None,
            req_type: 0,
            sector: 0,
            status: VIRTIO_BLK_S_OK,
            zcopy: false,
            iovs: Vec::with_capacity(chain_cap as usize),
            fetch_pending: false,
        }
    }

    /// Arm the slot for a newly arrived command.
    pub(crate) fn begin(&mut self, descr_head_idx: u16, cmd_available_index: u16) {
        self.base.reset();
        self.base.descr_head_idx = descr_head_idx;
        self.base.cmd_available_index = cmd_available_index;
        self.base.state = CmdState::FetchCmdDescs;
        self.req = match self.slab {
            Some(s) => ReqBuf::from_slice(s),
            None => ReqBuf::empty(),
        };
        self.dbuf = None;
        self.pool_chunk = None;
        self.req_type = 0;
        self.sector = 0;
        self.status = VIRTIO_BLK_S_OK;
        self.zcopy = false;
        self.iovs.clear();
        self.fetch_pending = false;
    }

    /// Point the request at a delivered pool chunk.
    pub(crate) fn install_chunk(&mut self, chunk: PoolChunk) {
        self.req = ReqBuf {
            ptr: chunk.ptr,
            lkey: chunk.lkey,
            cap: chunk.len,
        };
        self.pool_chunk = Some(chunk);
    }

    #[inline]
    fn token(&self) -> DmaToken {
        DmaToken {
            cmd_idx: self.base.idx,
        }
    }

    /// Header area of the auxiliary slot, as landed by the header read.
    fn hdr_bytes(&self) -> &[u8; BLK_HDR_BYTES] {
        unsafe { &*(self.aux.as_ptr().add(AUX_HDR_OFF) as *const [u8; BLK_HDR_BYTES]) }
    }

    /// Descriptor-fetch staging area of the auxiliary slot.
    fn stage_bytes(&self) -> &[u8; DESC_BYTES] {
        unsafe { &*(self.aux.as_ptr().add(AUX_STAGE_OFF) as *const [u8; DESC_BYTES]) }
    }
}

impl VirtqCmd for BlkCommand {
    fn base(&self) -> &CmdBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CmdBase {
        &mut self.base
    }
}

// ============================================================================
// Block device
// ============================================================================

/// Device side of a block queue: collaborators, staging slabs and the state
/// handlers.
pub struct BlkDev {
    pub(crate) cfg: QueueConfig,
    pub(crate) dma: Rc<dyn DmaChannel>,
    pub(crate) bdev: Rc<dyn BlkBackend>,
    registry: Rc<dyn MemRegistry>,
    pool: Option<Rc<dyn MemPool>>,
    dirty: Option<Rc<dyn DirtyLog>>,
    pub(crate) stats: IoStats,
    /// Request staging for all slots; None under the pool policy.
    data_slab: Option<DmaBuffer>,
    /// Header and fetch staging for all slots.
    aux_slab: DmaBuffer,
    /// Per-slot staging capacity in bytes.
    req_size: u32,
}

impl BlkDev {
    pub(crate) fn new(
        cfg: QueueConfig,
        dma: Rc<dyn DmaChannel>,
        bdev: Rc<dyn BlkBackend>,
        registry: Rc<dyn MemRegistry>,
        pool: Option<Rc<dyn MemPool>>,
        dirty: Option<Rc<dyn DirtyLog>>,
    ) -> Result<Self> {
        cfg.validate()?;
        if cfg.policy == DataPolicy::Pool && pool.is_none() {
            return Err(Error::PoolRequired);
        }
        let req_size = cfg.data_buf_len();
        let data_slab = if cfg.policy == DataPolicy::Pool {
            None
        } else {
            Some(DmaBuffer::new(
                &registry,
                cfg.size as usize * req_size as usize,
            )?)
        };
        let aux_slab = DmaBuffer::new(&registry, cfg.size as usize * AUX_SLOT_BYTES)?;
        Ok(BlkDev {
            cfg,
            dma,
            bdev,
            registry,
            pool,
            dirty,
            stats: IoStats::default(),
            data_slab,
            aux_slab,
            req_size,
        })
    }

    /// Build the slot array, one command per queue entry.
    pub(crate) fn cmd_slots(&self) -> Vec<BlkCommand> {
        let chain_cap = self.cfg.seg_max.saturating_add(NUM_HDR_FTR_DESCS);
        (0..self.cfg.size)
            .map(|i| {
                let aux = self
                    .aux_slab
                    .slice(i as usize * AUX_SLOT_BYTES, AUX_SLOT_BYTES);
                let slab = self.data_slab.as_ref().map(|s| {
                    s.slice(i as usize * self.req_size as usize, self.req_size as usize)
                });
                BlkCommand::new(i, chain_cap, aux, slab)
            })
            .collect()
    }

    fn mark_dirty(&self, qs: &QueueState, addr: u64, len: u32, is_completion: bool) {
        if !qs.log_writes.get() {
            return;
        }
        if let Some(dirty) = &self.dirty {
            dirty.mark_dirty(addr, len, is_completion);
        }
    }

    fn to_fatal(&self, cmd: &mut BlkCommand) -> bool {
        cmd.base.state = CmdState::FatalErr;
        true
    }

    fn to_ioerr(&self, cmd: &mut BlkCommand) -> bool {
        cmd.status = VIRTIO_BLK_S_IOERR;
        cmd.base.state = CmdState::WriteStatus;
        true
    }

    // ========================================================================
    // State handlers
    // ========================================================================

    fn sm_idle(&self, cmd: &BlkCommand) -> bool {
        log::error!(
            "queue:{} cmd_idx:{} progressed while idle",
            self.cfg.idx,
            cmd.base.idx
        );
        false
    }

    /// Walk the guest descriptor table until the chain is complete, one
    /// element fetch at a time through the aux staging window.
    fn sm_fetch_cmd_descs(&self, cmd: &mut BlkCommand, status: OpStatus, qs: &QueueState) -> bool {
        if status == OpStatus::Err {
            err_on_cmd!(self, cmd, "failed to fetch command descs");
            return self.to_fatal(cmd);
        }

        if cmd.fetch_pending {
            cmd.fetch_pending = false;
            let d = Desc::decode_from(cmd.stage_bytes());
            if cmd.base.chain.is_full() {
                let table_size = self.cfg.desc_table.map_or(0, |t| t.size);
                if cmd.base.chain.capacity() >= table_size {
                    err_on_cmd!(
                        self,
                        cmd,
                        "descriptor chain exceeds table size {}",
                        table_size
                    );
                    return self.to_fatal(cmd);
                }
                cmd.base.chain.grow(table_size);
            }
            cmd.base.chain.push(d);
        }

        let complete = !cmd.base.chain.is_empty() && !cmd.base.chain.last().has_next();
        if !complete {
            let Some(table) = self.cfg.desc_table else {
                err_on_cmd!(self, cmd, "no descriptor table to fetch remaining descs");
                return self.to_fatal(cmd);
            };
            let idx = if cmd.base.chain.is_empty() {
                cmd.base.descr_head_idx
            } else {
                cmd.base.chain.last().next
            };
            if idx >= table.size {
                err_on_cmd!(self, cmd, "descriptor index {} outside table", idx);
                return self.to_fatal(cmd);
            }
            log::debug!(
                "queue:{} cmd:{} FETCH_DESC: idx {}",
                self.cfg.idx,
                cmd.base.idx,
                idx
            );
            cmd.base.join.set(1);
            let local = cmd.aux.dma(AUX_STAGE_OFF, DESC_BYTES as u32);
            let remote = RemoteSlice {
                addr: table.addr.wrapping_add(idx as u64 * DESC_BYTES as u64),
                len: DESC_BYTES as u32,
                rkey: self.cfg.dma_mkey,
            };
            if let Err(e) = self.dma.read(local, remote, cmd.token()) {
                err_on_cmd!(self, cmd, "failed to fetch desc {}, {}", idx, e);
                return self.to_fatal(cmd);
            }
            qs.counters
                .outstanding_to_host
                .set(qs.counters.outstanding_to_host.get() + 1);
            cmd.fetch_pending = true;
            return false;
        }

        match cmd.base.chain.process(
            BLK_HDR_BYTES as u32,
            BLK_FTR_BYTES as u32,
            self.cfg.merge_descs,
        ) {
            Ok(info) => {
                cmd.base.total_seg_len = info.total_seg_len;
                cmd.base.num_merges = info.num_merges;
                cmd.base.state = CmdState::ReadHeader;
                true
            }
            Err(e) => {
                err_on_cmd!(
                    self,
                    cmd,
                    "failed to process descriptors, dumping command without response: {}",
                    e
                );
                self.to_fatal(cmd)
            }
        }
    }

    fn sm_read_header(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        let d0 = cmd.base.chain.get(0);
        log::debug!(
            "queue:{} cmd:{} READ_HEADER: pa {:#x} len {}",
            self.cfg.idx,
            cmd.base.idx,
            d0.addr,
            d0.len
        );
        cmd.base.state = CmdState::ParseHeader;
        cmd.base.join.set(1);
        let local = cmd.aux.dma(AUX_HDR_OFF, d0.len);
        let remote = RemoteSlice {
            addr: d0.addr,
            len: d0.len,
            rkey: self.cfg.dma_mkey,
        };
        if let Err(e) = self.dma.read(local, remote, cmd.token()) {
            err_on_cmd!(self, cmd, "failed to read header, {}", e);
            return self.to_fatal(cmd);
        }
        qs.counters
            .outstanding_to_host
            .set(qs.counters.outstanding_to_host.get() + 1);
        false
    }

    fn sm_parse_header(&self, cmd: &mut BlkCommand, status: OpStatus) -> bool {
        if status == OpStatus::Err {
            // A torn header read cannot be retried without risking duplicate
            // remote reads; the queue stops here.
            err_on_cmd!(self, cmd, "failed to get header data");
            return self.to_fatal(cmd);
        }

        let hdr = BlkHdr::decode_from(cmd.hdr_bytes());
        cmd.req_type = hdr.req_type;
        cmd.sector = hdr.sector;

        cmd.zcopy = self.zcopy_prepare(cmd);
        if cmd.zcopy {
            cmd.base.state = CmdState::HandleReq;
            return true;
        }

        let req_len = match cmd.req_type {
            VIRTIO_BLK_T_OUT => {
                cmd.base.state = CmdState::ReadData;
                cmd.base.total_seg_len
            }
            VIRTIO_BLK_T_IN | VIRTIO_BLK_T_GET_ID => {
                cmd.base.state = CmdState::HandleReq;
                cmd.base.total_seg_len
            }
            _ => {
                cmd.base.state = CmdState::HandleReq;
                0
            }
        };

        if self.cfg.policy == DataPolicy::Pool {
            if req_len == 0 {
                return true;
            }
            let Some(pool) = &self.pool else {
                err_on_cmd!(self, cmd, "pool policy without a pool");
                return self.to_ioerr(cmd);
            };
            let token = PoolToken {
                cmd_idx: cmd.base.idx,
            };
            if let Err(e) = pool.alloc(req_len, token) {
                err_on_cmd!(self, cmd, "failed to allocate memory, returning failure, {}", e);
                return self.to_ioerr(cmd);
            }
            return false;
        }

        if req_len > self.req_size {
            if self.cfg.policy == DataPolicy::Static {
                err_on_cmd!(
                    self,
                    cmd,
                    "request of {} bytes exceeds {} byte slot",
                    req_len,
                    self.req_size
                );
                return self.to_ioerr(cmd);
            }
            match DmaBuffer::new(&self.registry, req_len as usize) {
                Ok(buf) => {
                    cmd.req = ReqBuf {
                        ptr: buf.as_mut_ptr(),
                        lkey: buf.lkey(),
                        cap: buf.capacity() as u32,
                    };
                    cmd.dbuf = Some(buf);
                }
                Err(e) => {
                    err_on_cmd!(
                        self,
                        cmd,
                        "failed to allocate {} bytes for request, {}",
                        req_len,
                        e
                    );
                    return self.to_ioerr(cmd);
                }
            }
        }
        true
    }

    /// Whether the request can run against the guest descriptors directly.
    fn zcopy_prepare(&self, cmd: &mut BlkCommand) -> bool {
        if !self.cfg.zcopy {
            return false;
        }
        if cmd.base.chain.len() == NUM_HDR_FTR_DESCS {
            return false;
        }
        if cmd.req_type == VIRTIO_BLK_T_GET_ID {
            return false;
        }
        let payload_cnt = (cmd.base.chain.len() - NUM_HDR_FTR_DESCS) as usize;
        if payload_cnt > self.cfg.seg_max as usize {
            log::warn!(
                "queue:{} num_desc {} from cmd is bigger than seg_max {} supported",
                self.cfg.idx,
                payload_cnt,
                self.cfg.seg_max
            );
            return false;
        }
        cmd.iovs.clear();
        for i in 1..cmd.base.chain.len() - 1 {
            let d = cmd.base.chain.get(i);
            cmd.iovs.push(Iovec {
                addr: d.addr,
                len: d.len,
            });
        }
        let offset = cmd.sector.wrapping_mul(SECTOR_BYTES);
        self.bdev
            .zcopy_validate_params(&cmd.iovs, offset, cmd.base.total_seg_len as u64)
    }

    /// One remote read per device-readable payload descriptor, fanned in
    /// through the join counter.
    fn sm_read_data(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        cmd.base.state = CmdState::HandleReq;

        let mut reads = 0u16;
        for i in 1..cmd.base.chain.len() - 1 {
            if !cmd.base.chain.get(i).is_write() {
                reads += 1;
            }
        }
        if reads == 0 {
            return true;
        }
        cmd.base.join.set(reads);

        let mut offset = 0u32;
        for i in 1..cmd.base.chain.len() - 1 {
            let d = cmd.base.chain.get(i);
            if d.is_write() {
                continue;
            }
            log::debug!(
                "queue:{} cmd:{} READ_DATA: pa {:#x} len {}",
                self.cfg.idx,
                cmd.base.idx,
                d.addr,
                d.len
            );
            let local = cmd.req.dma_at(offset, d.len);
            let remote = RemoteSlice {
                addr: d.addr,
                len: d.len,
                rkey: self.cfg.dma_mkey,
            };
            if let Err(e) = self.dma.read(local, remote, cmd.token()) {
                // Reads already posted for this batch cannot be recalled, so
                // the join counter can never reach zero.
                err_on_cmd!(self, cmd, "failed to read data, {}", e);
                return self.to_fatal(cmd);
            }
            offset += d.len;
        }
        qs.counters
            .outstanding_to_host
            .set(qs.counters.outstanding_to_host.get() + 1);
        false
    }

    fn sm_handle_req(&self, cmd: &mut BlkCommand, status: OpStatus, qs: &QueueState) -> bool {
        if status == OpStatus::Err {
            err_on_cmd!(self, cmd, "failed to get request data, returning failure");
            return self.to_ioerr(cmd);
        }

        // While the backend detaches, every arriving command is failed
        // without dispatch and marked so release skips the detach counter.
        if qs.pending_bdev_detach.get() {
            cmd.base.in_bdev_detach = true;
            log::debug!(
                "queue:{} started to detach bdev - failing all incoming commands",
                self.cfg.idx
            );
            err_on_cmd!(self, cmd, "failed while executing command {}", cmd.req_type);
            return self.to_ioerr(cmd);
        }
        cmd.base.in_bdev_detach = false;

        if cmd.req_type == VIRTIO_BLK_T_GET_ID {
            return self.handle_get_id(cmd, qs);
        }

        let token = BdevToken {
            cmd_idx: cmd.base.idx,
        };
        let rc = match cmd.req_type {
            VIRTIO_BLK_T_OUT => {
                cmd.base.state = CmdState::OutDataDone;
                let offset = cmd.sector.wrapping_mul(SECTOR_BYTES);
                if cmd.zcopy {
                    let bs = self.bdev.block_size() as u64;
                    self.bdev.writev_blocks(
                        &cmd.iovs,
                        offset / bs,
                        cmd.base.total_seg_len as u64 / bs,
                        token,
                        self.cfg.pg_id,
                    )
                } else {
                    self.bdev.write(
                        cmd.req.ptr,
                        offset,
                        cmd.base.total_seg_len as usize,
                        token,
                        self.cfg.pg_id,
                    )
                }
            }
            VIRTIO_BLK_T_IN => {
                let offset = cmd.sector.wrapping_mul(SECTOR_BYTES);
                if cmd.zcopy {
                    // Data lands in guest memory straight from the backend.
                    cmd.base.total_in_len += cmd.base.total_seg_len;
                    cmd.base.state = CmdState::WriteStatus;
                    let bs = self.bdev.block_size() as u64;
                    self.bdev.readv_blocks(
                        &cmd.iovs,
                        offset / bs,
                        cmd.base.total_seg_len as u64 / bs,
                        token,
                        self.cfg.pg_id,
                    )
                } else {
                    cmd.base.state = CmdState::InDataDone;
                    self.bdev.read(
                        cmd.req.ptr,
                        offset,
                        cmd.base.total_seg_len as usize,
                        token,
                        self.cfg.pg_id,
                    )
                }
            }
            VIRTIO_BLK_T_FLUSH => {
                if cmd.sector != 0 {
                    err_on_cmd!(self, cmd, "sector must be zero for flush command");
                    Err(io::Error::from(io::ErrorKind::InvalidInput))
                } else {
                    cmd.base.state = CmdState::WriteStatus;
                    let len = self.bdev.num_blocks() * self.bdev.block_size() as u64;
                    self.bdev.flush(0, len, token, self.cfg.pg_id)
                }
            }
            other => {
                err_on_cmd!(
                    self,
                    cmd,
                    "invalid command - requested command type {:#x} is not implemented",
                    other
                );
                cmd.status = VIRTIO_BLK_S_UNSUPP;
                cmd.base.state = CmdState::WriteStatus;
                return true;
            }
        };

        if let Some(stat) = self.stats.for_type(cmd.req_type) {
            stat.total.set(stat.total.get() + 1);
            if rc.is_err() {
                stat.fail.set(stat.fail.get() + 1);
            }
            if self.cfg.merge_descs {
                stat.merged_desc
                    .set(stat.merged_desc.get() + cmd.base.num_merges as u64);
            }
            if cmd.dbuf.is_some() {
                stat.large_in_buf.set(stat.large_in_buf.get() + 1);
            }
            if cmd.base.chain.grown() {
                stat.long_desc_chain.set(stat.long_desc_chain.get() + 1);
            }
        }

        if let Err(e) = rc {
            err_on_cmd!(
                self,
                cmd,
                "failed while executing command {}, {}",
                cmd.req_type,
                e
            );
            return self.to_ioerr(cmd);
        }

        qs.counters
            .outstanding_in_bdev
            .set(qs.counters.outstanding_in_bdev.get() + 1);
        qs.uncomp_bdev_cmds.set(qs.uncomp_bdev_cmds.get() + 1);
        cmd.base.bdev_dispatched = true;
        false
    }

    /// Stage the backend name and push it to the first payload descriptor,
    /// truncated to whatever the guest allotted.
    fn handle_get_id(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        cmd.base.state = CmdState::WriteStatus;
        let name = self.bdev.bdev_name();
        let cap = cmd.req.cap as usize;
        if cap > 0 {
            let n = name.len().min(cap - 1);
            unsafe {
                std::ptr::copy_nonoverlapping(name.as_ptr(), cmd.req.ptr, n);
                *cmd.req.ptr.add(n) = 0;
            }
        }

        let d1 = cmd.base.chain.get(1);
        let len = (name.len() as u32 + 1).min(d1.len).min(cmd.req.cap);
        if len == 0 {
            return true;
        }
        cmd.base.join.set(1);
        cmd.base.total_in_len += len;
        log::debug!(
            "queue:{} cmd:{} WRITE_DEVID: pa {:#x} len {}",
            self.cfg.idx,
            cmd.base.idx,
            d1.addr,
            len
        );
        let local = cmd.req.dma_at(0, len);
        let remote = RemoteSlice {
            addr: d1.addr,
            len,
            rkey: self.cfg.dma_mkey,
        };
        let rc = self.dma.write(local, remote, cmd.token());
        self.mark_dirty(qs, d1.addr, len, false);
        if let Err(e) = rc {
            err_on_cmd!(
                self,
                cmd,
                "failed while executing command {}, {}",
                cmd.req_type,
                e
            );
            return self.to_ioerr(cmd);
        }
        qs.counters
            .outstanding_to_host
            .set(qs.counters.outstanding_to_host.get() + 1);
        false
    }

    fn sm_out_data_done(&self, cmd: &mut BlkCommand, status: OpStatus) -> bool {
        if status == OpStatus::Err {
            cmd.status = VIRTIO_BLK_S_IOERR;
        }
        cmd.base.state = CmdState::WriteStatus;
        true
    }

    /// One remote write per payload descriptor, pushing backend data out to
    /// the guest ranges the chain names.
    fn sm_in_data_done(&self, cmd: &mut BlkCommand, status: OpStatus, qs: &QueueState) -> bool {
        if status == OpStatus::Err {
            err_on_cmd!(self, cmd, "failed to read from block device, send ioerr to host");
            return self.to_ioerr(cmd);
        }

        cmd.base.join.set(cmd.base.chain.len() - NUM_HDR_FTR_DESCS);
        cmd.base.state = CmdState::WriteStatus;
        let mut offset = 0u32;
        for i in 1..cmd.base.chain.len() - 1 {
            let d = cmd.base.chain.get(i);
            log::debug!(
                "queue:{} cmd:{} WRITE_DATA: pa {:#x} len {}",
                self.cfg.idx,
                cmd.base.idx,
                d.addr,
                d.len
            );
            let local = cmd.req.dma_at(offset, d.len);
            let remote = RemoteSlice {
                addr: d.addr,
                len: d.len,
                rkey: self.cfg.dma_mkey,
            };
            if self.dma.write(local, remote, cmd.token()).is_err() {
                cmd.status = VIRTIO_BLK_S_IOERR;
                cmd.base.state = CmdState::WriteStatus;
                return true;
            }
            self.mark_dirty(qs, d.addr, d.len, false);
            offset += d.len;
            cmd.base.total_in_len += d.len;
        }
        qs.counters
            .outstanding_to_host
            .set(qs.counters.outstanding_to_host.get() + 1);
        false
    }

    fn sm_write_status(&self, cmd: &mut BlkCommand, status: OpStatus, qs: &QueueState) -> bool {
        if status == OpStatus::Err && cmd.status == VIRTIO_BLK_S_OK {
            cmd.status = VIRTIO_BLK_S_IOERR;
        }
        let last = cmd.base.chain.last();
        log::debug!(
            "queue:{} cmd:{} WRITE_STATUS: pa {:#x} status {}",
            self.cfg.idx,
            cmd.base.idx,
            last.addr,
            cmd.status
        );
        cmd.base.state = CmdState::SendComp;
        let remote = RemoteSlice {
            addr: last.addr,
            len: BLK_FTR_BYTES as u32,
            rkey: self.cfg.dma_mkey,
        };
        if let Err(e) = self.dma.write_short(&[cmd.status], remote) {
            err_on_cmd!(self, cmd, "failed to send status, {}", e);
            return self.to_fatal(cmd);
        }
        self.mark_dirty(qs, last.addr, BLK_FTR_BYTES as u32, false);
        true
    }

    fn sm_send_comp(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        if self.cfg.force_in_order && cmd.base.cmd_available_index != qs.ctrl_used_index.get() {
            // Park until every earlier arrival has sent its completion.
            log::debug!(
                "queue:{} cmd:{} arrival {} waits for in-order turn {}",
                self.cfg.idx,
                cmd.base.idx,
                cmd.base.cmd_available_index,
                qs.ctrl_used_index.get()
            );
            cmd.base.state = CmdState::SendInOrderComp;
            return false;
        }

        let comp = BlkCompletion {
            descr_head_idx: cmd.base.descr_head_idx,
            len: cmd.base.total_in_len,
        };
        if let Err(e) = self.dma.send_completion(&comp.encode()) {
            err_on_cmd!(self, cmd, "failed to send completion, {}", e);
            return self.to_fatal(cmd);
        }
        self.mark_dirty(qs, 0, 0, true);
        qs.ctrl_used_index
            .set(qs.ctrl_used_index.get().wrapping_add(1));
        cmd.base.state = CmdState::Release;
        true
    }

    fn sm_release(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        // Commands failed during a detach were never dispatched, so only
        // dispatched ones move the detach counter.
        if cmd.base.bdev_dispatched {
            qs.uncomp_bdev_cmds.set(qs.uncomp_bdev_cmds.get() - 1);
            cmd.base.bdev_dispatched = false;
        }
        if let Some(chunk) = cmd.pool_chunk.take() {
            if let Some(pool) = &self.pool {
                pool.free(chunk);
            }
        }
        cmd.dbuf = None;
        cmd.base.chain.reset();
        qs.counters
            .outstanding_total
            .set(qs.counters.outstanding_total.get() - 1);
        qs.counters.completed.set(qs.counters.completed.get() + 1);
        cmd.base.state = CmdState::Idle;
        false
    }

    fn sm_fatal(&self, cmd: &mut BlkCommand, qs: &QueueState) -> bool {
        if !cmd.base.fatal_counted {
            err_on_cmd!(self, cmd, "command stuck in fatal state until queue reset");
            qs.counters.fatal.set(qs.counters.fatal.get() + 1);
            cmd.base.fatal_counted = true;
        }
        false
    }
}

impl VirtqOps for BlkDev {
    type Cmd = BlkCommand;

    fn handle(&self, cmd: &mut BlkCommand, status: OpStatus, qs: &QueueState) -> bool {
        log::trace!(
            "queue:{} cmd:{} sm state: {:?}",
            self.cfg.idx,
            cmd.base.idx,
            cmd.base.state
        );
        match cmd.base.state {
            CmdState::Idle => self.sm_idle(cmd),
            CmdState::FetchCmdDescs => self.sm_fetch_cmd_descs(cmd, status, qs),
            CmdState::ReadHeader => self.sm_read_header(cmd, qs),
            CmdState::ParseHeader => self.sm_parse_header(cmd, status),
            CmdState::ReadData => self.sm_read_data(cmd, qs),
            CmdState::HandleReq => self.sm_handle_req(cmd, status, qs),
            CmdState::OutDataDone => self.sm_out_data_done(cmd, status),
            CmdState::InDataDone => self.sm_in_data_done(cmd, status, qs),
            CmdState::WriteStatus => self.sm_write_status(cmd, status, qs),
            CmdState::SendComp | CmdState::SendInOrderComp => self.sm_send_comp(cmd, qs),
            CmdState::Release => self.sm_release(cmd, qs),
            CmdState::FatalErr => self.sm_fatal(cmd, qs),
        }
    }
}
