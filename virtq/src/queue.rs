//! Queue driver: slot dispatch, completion fan-in and drain accounting.
//!
//! A [`Virtq`] owns one command slot per queue entry and runs each through
//! the state machine as commands arrive and as transport, backend and pool
//! completions come back. Everything here executes on the queue's single
//! thread; interior mutability replaces locking.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bdev::{BdevOpStatus, BdevToken, BlkBackend};
use crate::blk::VIRTIO_BLK_S_IOERR;
use crate::buffer::{MemPool, PoolChunk, PoolToken};
use crate::cmd::BlkDev;
use crate::config::QueueConfig;
use crate::desc::Desc;
use crate::dirty::DirtyLog;
use crate::error::Result;
use crate::sm::{self, CmdState, OpStatus, QueueState, VirtqCmd, VirtqOps};
use crate::stats::{CmdCounters, IoStats};
use crate::transport::{DmaChannel, DmaToken, MemRegistry};

/// A single emulated queue and its command slots.
pub struct Virtq<D: VirtqOps> {
    idx: u16,
    size: u16,
    force_in_order: bool,
    dev: D,
    qs: QueueState,
    cmds: RefCell<Vec<D::Cmd>>,
}

/// The block flavor; the only one currently implemented.
pub type BlkVirtq = Virtq<BlkDev>;

impl<D: VirtqOps> Virtq<D> {
    fn progress_cmd(&self, slot: u16, status: OpStatus) {
        {
            let mut cmds = self.cmds.borrow_mut();
            sm::progress(&self.dev, &mut cmds[slot as usize], &self.qs, status);
        }
        if self.force_in_order {
            self.wake_in_order();
        }
    }

    /// Re-drive parked commands whose completion turn has arrived.
    ///
    /// In-order slots are assigned by arrival sequence, so the command owning
    /// sequence number `n` always sits in slot `n % size`.
    fn wake_in_order(&self) {
        loop {
            let seq = self.qs.ctrl_used_index.get();
            let slot = (seq % self.size) as usize;
            let mut cmds = self.cmds.borrow_mut();
            let cmd = &mut cmds[slot];
            if cmd.base().state != CmdState::SendInOrderComp
                || cmd.base().cmd_available_index != seq
            {
                break;
            }
            sm::progress(&self.dev, cmd, &self.qs, OpStatus::Ok);
        }
    }

    /// Transport completion fan-in.
    ///
    /// Each completion retires one operation of the slot's current batch; the
    /// machine resumes only once the whole batch has landed, with `Err` if
    /// any operation in it failed.
    pub fn dma_done(&self, token: DmaToken, status: OpStatus) {
        let slot = token.cmd_idx;
        if slot >= self.size {
            log::warn!("queue:{} dma completion for unknown slot {}", self.idx, slot);
            return;
        }
        let batch_status = {
            let mut cmds = self.cmds.borrow_mut();
            let base = cmds[slot as usize].base_mut();
            if base.state == CmdState::Idle || base.join.pending() == 0 {
                log::warn!("queue:{} cmd:{} stale dma completion dropped", self.idx, slot);
                return;
            }
            if status == OpStatus::Err {
                base.dma_err = true;
            }
            if !base.join.complete_one() {
                return;
            }
            let st = if base.dma_err {
                OpStatus::Err
            } else {
                OpStatus::Ok
            };
            base.dma_err = false;
            st
        };
        let c = &self.qs.counters.outstanding_to_host;
        c.set(c.get() - 1);
        self.progress_cmd(slot, batch_status);
    }

    /// No command holds the queue in any of its async stages.
    ///
    /// Slots stuck in the fatal state never release, so once a fatal error
    /// has been seen only the in-flight counters are consulted.
    pub fn drained(&self) -> bool {
        let c = &self.qs.counters;
        if c.fatal.get() != 0 {
            c.outstanding_in_bdev.get() == 0 && c.outstanding_to_host.get() == 0
        } else {
            c.outstanding_total.get() == 0
                && c.outstanding_in_bdev.get() == 0
                && c.outstanding_to_host.get() == 0
        }
    }

    /// Fail commands at dispatch instead of handing them to the backend.
    pub fn bdev_detach_begin(&self) {
        self.qs.pending_bdev_detach.set(true);
    }

    pub fn bdev_detach_clear(&self) {
        self.qs.pending_bdev_detach.set(false);
    }

    pub fn bdev_detach_pending(&self) -> bool {
        self.qs.pending_bdev_detach.get()
    }

    /// Commands dispatched to the backend and not yet released.
    pub fn uncompleted_bdev_cmds(&self) -> u32 {
        self.qs.uncomp_bdev_cmds.get()
    }

    /// Toggle dirty-page tracking of writes into host memory.
    pub fn set_log_writes(&self, on: bool) {
        self.qs.log_writes.set(on);
    }

    pub fn counters(&self) -> &CmdCounters {
        &self.qs.counters
    }

    pub fn idx(&self) -> u16 {
        self.idx
    }

    pub fn depth(&self) -> u16 {
        self.size
    }
}

impl<D: VirtqOps> Drop for Virtq<D> {
    fn drop(&mut self) {
        let c = &self.qs.counters;
        if c.outstanding_total.get() != 0 {
            log::warn!(
                "queue:{} destroyed with {} outstanding commands",
                self.idx,
                c.outstanding_total.get()
            );
        }
        if c.fatal.get() != 0 {
            log::warn!(
                "queue:{} destroyed with {} commands in fatal state",
                self.idx,
                c.fatal.get()
            );
        }
    }
}

impl BlkVirtq {
    pub fn new(
        cfg: QueueConfig,
        dma: Rc<dyn DmaChannel>,
        bdev: Rc<dyn BlkBackend>,
        registry: Rc<dyn MemRegistry>,
        pool: Option<Rc<dyn MemPool>>,
        dirty: Option<Rc<dyn DirtyLog>>,
    ) -> Result<Self> {
        let idx = cfg.idx;
        let size = cfg.size;
        let force_in_order = cfg.force_in_order;
        let dev = BlkDev::new(cfg, dma, bdev, registry, pool, dirty)?;
        let cmds = RefCell::new(dev.cmd_slots());
        log::debug!(
            "queue:{} created, size {} in_order {}",
            idx,
            size,
            force_in_order
        );
        Ok(Virtq {
            idx,
            size,
            force_in_order,
            dev,
            qs: QueueState::default(),
            cmds,
        })
    }

    /// Entry point for a tunneled command.
    ///
    /// `descs` carries whatever descriptors rode along with the request;
    /// missing chain elements are fetched from the configured descriptor
    /// table.
    pub fn on_command(&self, descr_head_idx: u16, descs: &[Desc]) {
        let avail = self.qs.ctrl_available_index.get();
        let slot = if self.force_in_order {
            avail % self.size
        } else {
            descr_head_idx % self.size
        };
        {
            let mut cmds = self.cmds.borrow_mut();
            let cmd = &mut cmds[slot as usize];
            if cmd.base.state != CmdState::Idle {
                log::error!(
                    "queue:{} slot {} is still busy, dropping command head {}",
                    self.idx,
                    slot,
                    descr_head_idx
                );
                let f = &self.qs.counters.fatal;
                f.set(f.get() + 1);
                return;
            }
            cmd.begin(descr_head_idx, avail);
            if descs.len() > cmd.base.chain.capacity() as usize {
                cmd.base.chain.grow(descs.len() as u16);
            }
            for d in descs {
                cmd.base.chain.push(*d);
            }
        }
        self.qs.ctrl_available_index.set(avail.wrapping_add(1));
        let t = &self.qs.counters.outstanding_total;
        t.set(t.get() + 1);
        self.progress_cmd(slot, OpStatus::Ok);
    }

    /// Backend completion fan-in.
    pub fn bdev_done(&self, token: BdevToken, status: BdevOpStatus) {
        let slot = token.cmd_idx;
        if slot >= self.size {
            log::warn!("queue:{} bdev completion for unknown slot {}", self.idx, slot);
            return;
        }
        {
            let mut cmds = self.cmds.borrow_mut();
            let cmd = &mut cmds[slot as usize];
            let stat = self.dev.stats.for_type(cmd.req_type);
            match status {
                BdevOpStatus::Success => {
                    if let Some(s) = stat {
                        s.success.set(s.success.get() + 1);
                    }
                }
                BdevOpStatus::Failed => {
                    if let Some(s) = stat {
                        s.fail.set(s.fail.get() + 1);
                    }
                    log::error!(
                        "queue:{} cmd_idx:{} err: failed to execute command on bdev",
                        self.idx,
                        slot
                    );
                    cmd.status = VIRTIO_BLK_S_IOERR;
                    cmd.base.state = CmdState::WriteStatus;
                }
            }
        }
        let c = &self.qs.counters.outstanding_in_bdev;
        c.set(c.get() - 1);
        self.progress_cmd(slot, OpStatus::Ok);
    }

    /// Memory-pool chunk delivery for a command parked in header parsing.
    pub fn pool_ready(&self, token: PoolToken, chunk: PoolChunk) {
        let slot = token.cmd_idx;
        if slot >= self.size {
            log::warn!("queue:{} pool chunk for unknown slot {}", self.idx, slot);
            return;
        }
        self.cmds.borrow_mut()[slot as usize].install_chunk(chunk);
        self.progress_cmd(slot, OpStatus::Ok);
    }

    pub fn stats(&self) -> &IoStats {
        &self.dev.stats
    }
}
