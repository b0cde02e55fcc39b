//! Generic per-command state machine.
//!
//! A command slot walks a fixed set of states; each state handler either
//! finishes synchronously and advances, or submits asynchronous work and
//! suspends until a completion re-enters the machine. The device-specific
//! part lives behind [`VirtqOps`]; the queue driver only sees states and
//! the progress loop.

use std::cell::Cell;

use crate::desc::DescChain;
use crate::stats::CmdCounters;

/// Lifecycle states of one command slot.
///
/// Handlers set the next state before submitting asynchronous work, so a
/// completion always lands in the state that consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    /// Slot is free. Entering the machine here is an error.
    Idle,
    /// Fetching descriptor-chain elements from the guest table.
    FetchCmdDescs,
    /// Reading the request header from guest memory.
    ReadHeader,
    /// Header bytes arrived; decode and route the request.
    ParseHeader,
    /// Reading write-payload data from guest memory.
    ReadData,
    /// Submitting the request to the storage backend.
    HandleReq,
    /// Backend finished a write-class request.
    OutDataDone,
    /// Backend finished a read-class request; push data to the guest.
    InDataDone,
    /// Writing the one-byte status footer to guest memory.
    WriteStatus,
    /// Sending the completion element.
    SendComp,
    /// Parked until every earlier arrival has completed.
    SendInOrderComp,
    /// Returning resources and freeing the slot.
    Release,
    /// Unrecoverable per-queue error; the slot is never auto-released.
    FatalErr,
}

/// Outcome fed into a state handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    Err,
}

/// Join counter for a fan-out batch of asynchronous operations.
///
/// Armed with the batch size before submission; each completion calls
/// [`complete_one`](Self::complete_one) and only the last one resumes the
/// machine.
#[derive(Debug, Default)]
pub struct JoinCounter {
    count: Cell<u16>,
}

impl JoinCounter {
    #[inline]
    pub fn set(&self, n: u16) {
        self.count.set(n);
    }

    /// Count one completion; true when the batch is done.
    #[inline]
    pub fn complete_one(&self) -> bool {
        debug_assert!(self.count.get() > 0);
        let left = self.count.get() - 1;
        self.count.set(left);
        left == 0
    }

    #[inline]
    pub fn pending(&self) -> u16 {
        self.count.get()
    }
}

/// State shared by every command slot of a queue.
///
/// `Cell`s throughout: the queue is driven from one thread and handlers
/// reach this through a shared reference.
#[derive(Debug, Default)]
pub struct QueueState {
    pub counters: CmdCounters,
    /// Arrival sequence; assigned to a command when it enters the queue.
    pub ctrl_available_index: Cell<u16>,
    /// Completion sequence; advanced when a completion element is sent.
    pub ctrl_used_index: Cell<u16>,
    /// Backend submissions not yet completed, across detach cycles.
    pub uncomp_bdev_cmds: Cell<u32>,
    /// Set while the backend is detaching; new backend work is refused.
    pub pending_bdev_detach: Cell<bool>,
    /// Report guest writes to the dirty log.
    pub log_writes: Cell<bool>,
}

/// Fields every command slot carries, device-specific or not.
#[derive(Debug)]
pub struct CmdBase {
    /// Slot index, also the completion-routing token value.
    pub idx: u16,
    /// Head descriptor index of the in-flight request.
    pub descr_head_idx: u16,
    /// Arrival sequence number, used for in-order completion.
    pub cmd_available_index: u16,
    pub state: CmdState,
    pub join: JoinCounter,
    /// A transfer in the current batch failed.
    pub dma_err: bool,
    pub num_merges: u16,
    /// Bytes moving guest-to-backend or backend-to-guest.
    pub total_seg_len: u32,
    /// Bytes actually written to guest memory, reported in the completion.
    pub total_in_len: u32,
    pub chain: DescChain,
    /// Command was cut short by a backend detach.
    pub in_bdev_detach: bool,
    /// Command holds a live backend submission.
    pub bdev_dispatched: bool,
    /// Fatal transition already counted for this command.
    pub fatal_counted: bool,
}

impl CmdBase {
    pub fn new(idx: u16, chain_cap: u16) -> Self {
        Self {
            idx,
            descr_head_idx: 0,
            cmd_available_index: 0,
            state: CmdState::Idle,
            join: JoinCounter::default(),
            dma_err: false,
            num_merges: 0,
            total_seg_len: 0,
            total_in_len: 0,
            chain: DescChain::new(chain_cap),
            in_bdev_detach: false,
            bdev_dispatched: false,
            fatal_counted: false,
        }
    }

    /// Clear per-request state for reuse. The caller sets the head index,
    /// arrival sequence and entry state afterwards.
    pub fn reset(&mut self) {
        self.join.set(0);
        self.dma_err = false;
        self.num_merges = 0;
        self.total_seg_len = 0;
        self.total_in_len = 0;
        self.chain.reset();
        self.in_bdev_detach = false;
        self.bdev_dispatched = false;
        self.fatal_counted = false;
    }
}

/// Access to the common slot fields.
pub trait VirtqCmd {
    fn base(&self) -> &CmdBase;
    fn base_mut(&mut self) -> &mut CmdBase;
}

/// Device-specific state handling.
pub trait VirtqOps {
    type Cmd: VirtqCmd;

    /// Run the handler for the command's current state.
    ///
    /// Returns true when the handler finished synchronously and the machine
    /// should run the next state, false when the command suspended (or
    /// parked) waiting for an external event.
    fn handle(&self, cmd: &mut Self::Cmd, status: OpStatus, qs: &QueueState) -> bool;
}

/// Drive a command until it suspends.
///
/// `status` is the outcome of the event that resumed the command; it is
/// passed unchanged to every handler in the synchronous run, and each
/// handler decides whether it applies to its own entry.
pub fn progress<D: VirtqOps>(dev: &D, cmd: &mut D::Cmd, qs: &QueueState, status: OpStatus) {
    while dev.handle(cmd, status, qs) {}
}
