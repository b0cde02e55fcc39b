//! Common test utilities for virtq integration tests.
//!
//! Models the world around a queue: a flat guest-memory arena, a transport
//! that queues DMA operations until the test pumps them, an in-memory block
//! backend with deferred completions and a chunk pool. Completions are only
//! ever delivered from the test body, mirroring how the real collaborators
//! call back from their own progress loops.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::rc::Rc;

use virtq::{
    BdevOpStatus, BdevToken, BlkBackend, BlkHdr, BlkVirtq, Desc, DescFlags, DirtyLog, DirtyPageMap,
    DmaChannel, DmaSlice, DmaToken, Iovec, MemPool, MemRegistry, OpStatus, PoolChunk, PoolToken,
    QueueConfig, RemoteSlice,
};

// =============================================================================
// Guest memory
// =============================================================================

/// Flat arena standing in for host-physical guest memory.
///
/// Addresses handed to descriptors live at `BASE + offset` so a stray real
/// pointer is caught by the bounds checks.
pub struct GuestMem {
    mem: RefCell<Vec<u8>>,
    next: Cell<u64>,
}

const GUEST_BASE: u64 = 0x4000_0000;

impl GuestMem {
    pub fn new(size: usize) -> Rc<Self> {
        Rc::new(GuestMem {
            mem: RefCell::new(vec![0u8; size]),
            next: Cell::new(GUEST_BASE),
        })
    }

    fn off(&self, addr: u64, len: usize) -> usize {
        let off = addr.checked_sub(GUEST_BASE).expect("address below arena") as usize;
        assert!(off + len <= self.mem.borrow().len(), "address past arena");
        off
    }

    /// Bump-allocate a guest region.
    pub fn alloc(&self, len: usize, align: u64) -> u64 {
        let addr = (self.next.get() + align - 1) & !(align - 1);
        self.next.set(addr + len as u64);
        self.off(addr, len);
        addr
    }

    pub fn write(&self, addr: u64, data: &[u8]) {
        let off = self.off(addr, data.len());
        self.mem.borrow_mut()[off..off + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let off = self.off(addr, len);
        self.mem.borrow()[off..off + len].to_vec()
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        self.read(addr, 1)[0]
    }
}

// =============================================================================
// Memory registry
// =============================================================================

pub struct MockRegistry {
    next: Cell<u32>,
    live: RefCell<HashSet<u32>>,
}

impl MockRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(MockRegistry {
            next: Cell::new(1),
            live: RefCell::new(HashSet::new()),
        })
    }

    pub fn live(&self) -> usize {
        self.live.borrow().len()
    }
}

impl MemRegistry for MockRegistry {
    unsafe fn register(&self, _addr: *mut u8, _len: usize) -> io::Result<u32> {
        let key = self.next.get();
        self.next.set(key + 1);
        self.live.borrow_mut().insert(key);
        Ok(key)
    }

    fn deregister(&self, lkey: u32) {
        self.live.borrow_mut().remove(&lkey);
    }
}

// =============================================================================
// DMA transport
// =============================================================================

enum DmaKind {
    Read,
    Write,
}

struct DmaOp {
    kind: DmaKind,
    local: DmaSlice,
    remote: RemoteSlice,
    token: DmaToken,
}

/// Transport mock: submissions queue up, the test pumps them to completion.
pub struct MockDma {
    mem: Rc<GuestMem>,
    pending: RefCell<VecDeque<DmaOp>>,
    /// Completion payloads sent so far.
    pub completions: RefCell<Vec<Vec<u8>>>,
    /// Reject this many upcoming read/write submissions.
    pub fail_submits: Cell<u32>,
    /// Reject this many upcoming short status writes.
    pub fail_short_writes: Cell<u32>,
    /// Reject this many upcoming completion sends.
    pub fail_sends: Cell<u32>,
}

impl MockDma {
    pub fn new(mem: Rc<GuestMem>) -> Rc<Self> {
        Rc::new(MockDma {
            mem,
            pending: RefCell::new(VecDeque::new()),
            completions: RefCell::new(Vec::new()),
            fail_submits: Cell::new(0),
            fail_short_writes: Cell::new(0),
            fail_sends: Cell::new(0),
        })
    }

    fn take_fail(&self, counter: &Cell<u32>) -> bool {
        let n = counter.get();
        if n > 0 {
            counter.set(n - 1);
            return true;
        }
        false
    }

    fn submit(&self, kind: DmaKind, local: DmaSlice, remote: RemoteSlice, token: DmaToken) -> io::Result<()> {
        if self.take_fail(&self.fail_submits) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected dma submit failure"));
        }
        self.pending.borrow_mut().push_back(DmaOp {
            kind,
            local,
            remote,
            token,
        });
        Ok(())
    }

    fn execute(&self, op: &DmaOp) {
        match op.kind {
            DmaKind::Read => {
                let data = self.mem.read(op.remote.addr, op.remote.len as usize);
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), op.local.addr as *mut u8, data.len());
                }
            }
            DmaKind::Write => {
                let data = unsafe {
                    std::slice::from_raw_parts(op.local.addr as *const u8, op.local.len as usize)
                };
                self.mem.write(op.remote.addr, data);
            }
        }
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Complete every queued operation, including ones queued while pumping.
    pub fn deliver_all(&self, q: &BlkVirtq) {
        loop {
            let op = self.pending.borrow_mut().pop_front();
            let Some(op) = op else { break };
            self.execute(&op);
            q.dma_done(op.token, OpStatus::Ok);
        }
    }

    /// Complete the oldest queued operation with the given status.
    ///
    /// Failed operations do not touch memory, like a transport error would
    /// leave the target undefined but never half-written here.
    pub fn deliver_one(&self, q: &BlkVirtq, status: OpStatus) {
        let op = self.pending.borrow_mut().pop_front();
        let Some(op) = op else {
            panic!("no pending dma op to deliver");
        };
        if status == OpStatus::Ok {
            self.execute(&op);
        }
        q.dma_done(op.token, status);
    }
}

impl DmaChannel for MockDma {
    fn read(&self, local: DmaSlice, remote: RemoteSlice, comp: DmaToken) -> io::Result<()> {
        self.submit(DmaKind::Read, local, remote, comp)
    }

    fn write(&self, local: DmaSlice, remote: RemoteSlice, comp: DmaToken) -> io::Result<()> {
        self.submit(DmaKind::Write, local, remote, comp)
    }

    fn write_short(&self, data: &[u8], remote: RemoteSlice) -> io::Result<()> {
        if self.take_fail(&self.fail_short_writes) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected short write failure"));
        }
        self.mem.write(remote.addr, data);
        Ok(())
    }

    fn send_completion(&self, payload: &[u8]) -> io::Result<()> {
        if self.take_fail(&self.fail_sends) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected completion send failure"));
        }
        self.completions.borrow_mut().push(payload.to_vec());
        Ok(())
    }
}

// =============================================================================
// Block backend
// =============================================================================

enum BdevOp {
    Read {
        buf: *mut u8,
        offset: u64,
        len: usize,
        token: BdevToken,
    },
    Write {
        src: *const u8,
        offset: u64,
        len: usize,
        token: BdevToken,
    },
    Flush {
        len: u64,
        token: BdevToken,
    },
    ReadV {
        iovs: Vec<Iovec>,
        offset_blocks: u64,
        token: BdevToken,
    },
    WriteV {
        iovs: Vec<Iovec>,
        offset_blocks: u64,
        token: BdevToken,
    },
}

impl BdevOp {
    fn token(&self) -> BdevToken {
        match self {
            BdevOp::Read { token, .. }
            | BdevOp::Write { token, .. }
            | BdevOp::Flush { token, .. }
            | BdevOp::ReadV { token, .. }
            | BdevOp::WriteV { token, .. } => *token,
        }
    }
}

/// In-memory disk with deferred completions.
pub struct MockBdev {
    mem: Rc<GuestMem>,
    disk: RefCell<Vec<u8>>,
    block_size: u32,
    name: String,
    pending: RefCell<VecDeque<BdevOp>>,
    /// Reject this many upcoming submissions.
    pub fail_submits: Cell<u32>,
    /// Answer for zero-copy parameter validation.
    pub zcopy_ok: Cell<bool>,
    pub flushes: Cell<u32>,
    pub last_flush_len: Cell<u64>,
    pub plain_reads: Cell<u32>,
    pub plain_writes: Cell<u32>,
    pub zcopy_reads: Cell<u32>,
    pub zcopy_writes: Cell<u32>,
}

impl MockBdev {
    pub fn new(mem: Rc<GuestMem>, block_size: u32, num_blocks: u64, name: &str) -> Rc<Self> {
        Rc::new(MockBdev {
            mem,
            disk: RefCell::new(vec![0u8; (block_size as u64 * num_blocks) as usize]),
            block_size,
            name: name.to_string(),
            pending: RefCell::new(VecDeque::new()),
            fail_submits: Cell::new(0),
            zcopy_ok: Cell::new(false),
            flushes: Cell::new(0),
            last_flush_len: Cell::new(0),
            plain_reads: Cell::new(0),
            plain_writes: Cell::new(0),
            zcopy_reads: Cell::new(0),
            zcopy_writes: Cell::new(0),
        })
    }

    fn take_fail(&self) -> io::Result<()> {
        let n = self.fail_submits.get();
        if n > 0 {
            self.fail_submits.set(n - 1);
            return Err(io::Error::new(io::ErrorKind::Other, "injected bdev submit failure"));
        }
        Ok(())
    }

    pub fn pending_ops(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn fill_disk(&self, offset: u64, data: &[u8]) {
        let off = offset as usize;
        self.disk.borrow_mut()[off..off + data.len()].copy_from_slice(data);
    }

    pub fn disk_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let off = offset as usize;
        self.disk.borrow()[off..off + len].to_vec()
    }

    fn apply(&self, op: &BdevOp) {
        match op {
            BdevOp::Read { buf, offset, len, .. } => {
                let data = self.disk_at(*offset, *len);
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), *buf, data.len());
                }
            }
            BdevOp::Write { src, offset, len, .. } => {
                let data = unsafe { std::slice::from_raw_parts(*src, *len) };
                self.fill_disk(*offset, data);
            }
            BdevOp::Flush { len, .. } => {
                self.flushes.set(self.flushes.get() + 1);
                self.last_flush_len.set(*len);
            }
            BdevOp::ReadV {
                iovs,
                offset_blocks,
                ..
            } => {
                let mut offset = offset_blocks * self.block_size as u64;
                for iov in iovs {
                    let data = self.disk_at(offset, iov.len as usize);
                    self.mem.write(iov.addr, &data);
                    offset += iov.len as u64;
                }
            }
            BdevOp::WriteV {
                iovs,
                offset_blocks,
                ..
            } => {
                let mut offset = offset_blocks * self.block_size as u64;
                for iov in iovs {
                    let data = self.mem.read(iov.addr, iov.len as usize);
                    self.fill_disk(offset, &data);
                    offset += iov.len as u64;
                }
            }
        }
    }

    fn finish(&self, q: &BlkVirtq, op: BdevOp, status: BdevOpStatus) {
        if status == BdevOpStatus::Success {
            self.apply(&op);
        }
        q.bdev_done(op.token(), status);
    }

    /// Complete every pending operation successfully, oldest first.
    pub fn complete_all(&self, q: &BlkVirtq) {
        loop {
            let op = self.pending.borrow_mut().pop_front();
            let Some(op) = op else { break };
            self.finish(q, op, BdevOpStatus::Success);
        }
    }

    pub fn complete_one(&self, q: &BlkVirtq, status: BdevOpStatus) {
        let op = self
            .pending
            .borrow_mut()
            .pop_front()
            .expect("no pending bdev op");
        self.finish(q, op, status);
    }

    /// Complete the newest pending operation first, for reordering tests.
    pub fn complete_newest(&self, q: &BlkVirtq, status: BdevOpStatus) {
        let op = self
            .pending
            .borrow_mut()
            .pop_back()
            .expect("no pending bdev op");
        self.finish(q, op, status);
    }
}

impl BlkBackend for MockBdev {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.disk.borrow().len() as u64 / self.block_size as u64
    }

    fn bdev_name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: *mut u8, offset: u64, len: usize, comp: BdevToken, _pg_id: u32) -> io::Result<()> {
        self.take_fail()?;
        self.plain_reads.set(self.plain_reads.get() + 1);
        self.pending.borrow_mut().push_back(BdevOp::Read {
            buf,
            offset,
            len,
            token: comp,
        });
        Ok(())
    }

    fn write(&self, src: *const u8, offset: u64, len: usize, comp: BdevToken, _pg_id: u32) -> io::Result<()> {
        self.take_fail()?;
        self.plain_writes.set(self.plain_writes.get() + 1);
        self.pending.borrow_mut().push_back(BdevOp::Write {
            src,
            offset,
            len,
            token: comp,
        });
        Ok(())
    }

    fn flush(&self, _offset: u64, len: u64, comp: BdevToken, _pg_id: u32) -> io::Result<()> {
        self.take_fail()?;
        self.pending
            .borrow_mut()
            .push_back(BdevOp::Flush { len, token: comp });
        Ok(())
    }

    fn zcopy_validate_params(&self, _iovs: &[Iovec], _offset: u64, _len: u64) -> bool {
        self.zcopy_ok.get()
    }

    fn readv_blocks(
        &self,
        iovs: &[Iovec],
        offset_blocks: u64,
        _num_blocks: u64,
        comp: BdevToken,
        _pg_id: u32,
    ) -> io::Result<()> {
        self.take_fail()?;
        self.zcopy_reads.set(self.zcopy_reads.get() + 1);
        self.pending.borrow_mut().push_back(BdevOp::ReadV {
            iovs: iovs.to_vec(),
            offset_blocks,
            token: comp,
        });
        Ok(())
    }

    fn writev_blocks(
        &self,
        iovs: &[Iovec],
        offset_blocks: u64,
        _num_blocks: u64,
        comp: BdevToken,
        _pg_id: u32,
    ) -> io::Result<()> {
        self.take_fail()?;
        self.zcopy_writes.set(self.zcopy_writes.get() + 1);
        self.pending.borrow_mut().push_back(BdevOp::WriteV {
            iovs: iovs.to_vec(),
            offset_blocks,
            token: comp,
        });
        Ok(())
    }
}

// =============================================================================
// Chunk pool
// =============================================================================

/// Pool mock: allocations queue up and are delivered by the test.
pub struct MockPool {
    backing: RefCell<Vec<Box<[u8]>>>,
    pending: RefCell<VecDeque<(u32, PoolToken)>>,
    pub freed: Cell<u32>,
    pub fail_allocs: Cell<u32>,
}

impl MockPool {
    pub fn new() -> Rc<Self> {
        Rc::new(MockPool {
            backing: RefCell::new(Vec::new()),
            pending: RefCell::new(VecDeque::new()),
            freed: Cell::new(0),
            fail_allocs: Cell::new(0),
        })
    }

    pub fn pending_allocs(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Hand out a chunk for every queued allocation.
    pub fn deliver_all(&self, q: &BlkVirtq) {
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some((len, token)) = next else { break };
            let mut buf = vec![0u8; len as usize].into_boxed_slice();
            let chunk = PoolChunk {
                ptr: buf.as_mut_ptr(),
                len,
                lkey: 0x7000 + self.backing.borrow().len() as u32,
            };
            self.backing.borrow_mut().push(buf);
            q.pool_ready(token, chunk);
        }
    }
}

impl MemPool for MockPool {
    fn alloc(&self, len: u32, comp: PoolToken) -> io::Result<()> {
        let n = self.fail_allocs.get();
        if n > 0 {
            self.fail_allocs.set(n - 1);
            return Err(io::Error::new(io::ErrorKind::Other, "injected pool failure"));
        }
        self.pending.borrow_mut().push_back((len, comp));
        Ok(())
    }

    fn free(&self, _chunk: PoolChunk) {
        self.freed.set(self.freed.get() + 1);
    }
}

// =============================================================================
// Queue harness
// =============================================================================

pub struct TestQueue {
    pub gm: Rc<GuestMem>,
    pub dma: Rc<MockDma>,
    pub bdev: Rc<MockBdev>,
    pub reg: Rc<MockRegistry>,
    pub pool: Option<Rc<MockPool>>,
    pub q: BlkVirtq,
}

impl TestQueue {
    /// Pump transport and backend until neither has pending work.
    pub fn pump(&self) {
        loop {
            if self.dma.pending_ops() == 0 && self.bdev.pending_ops() == 0 {
                if let Some(pool) = &self.pool {
                    if pool.pending_allocs() > 0 {
                        pool.deliver_all(&self.q);
                        continue;
                    }
                }
                break;
            }
            self.dma.deliver_all(&self.q);
            self.bdev.complete_all(&self.q);
        }
    }

    /// Decoded head index and length of the n-th completion element.
    pub fn completion(&self, n: usize) -> (u16, u32) {
        let comps = self.dma.completions.borrow();
        let c = virtq::BlkCompletion::decode(
            comps[n].as_slice().try_into().expect("completion element size"),
        );
        (c.descr_head_idx, c.len)
    }

    pub fn completion_count(&self) -> usize {
        self.dma.completions.borrow().len()
    }
}

pub fn setup(cfg: QueueConfig) -> TestQueue {
    setup_full(cfg, false, None)
}

pub fn setup_full(cfg: QueueConfig, use_pool: bool, dirty: Option<Rc<DirtyPageMap>>) -> TestQueue {
    let gm = GuestMem::new(4 << 20);
    let dma = MockDma::new(gm.clone());
    let bdev = MockBdev::new(gm.clone(), 512, 2048, "mock-disk0");
    let reg = MockRegistry::new();
    let pool = if use_pool { Some(MockPool::new()) } else { None };
    let q = BlkVirtq::new(
        cfg,
        dma.clone(),
        bdev.clone(),
        reg.clone(),
        pool.clone().map(|p| p as Rc<dyn MemPool>),
        dirty.map(|d| d as Rc<dyn DirtyLog>),
    )
    .expect("queue creation failed");
    TestQueue {
        gm,
        dma,
        bdev,
        reg,
        pool,
        q,
    }
}

// =============================================================================
// Chain builders
// =============================================================================

pub struct BuiltChain {
    pub descs: Vec<Desc>,
    pub ftr_addr: u64,
    pub seg_addrs: Vec<u64>,
}

/// Footer poison value; a completed command must overwrite it.
pub const FTR_POISON: u8 = 0xaa;

/// Lay out a split chain in guest memory: header descriptor, one descriptor
/// per `(len, device_writes)` segment, footer descriptor.
pub fn build_chain(gm: &GuestMem, req_type: u32, sector: u64, segs: &[(u32, bool)]) -> BuiltChain {
    let hdr = BlkHdr {
        req_type,
        ioprio: 0,
        sector,
    };
    let hdr_addr = gm.alloc(16, 16);
    let mut hdr_bytes = [0u8; 16];
    hdr.encode_to(&mut hdr_bytes);
    gm.write(hdr_addr, &hdr_bytes);

    let seg_addrs: Vec<u64> = segs.iter().map(|(len, _)| gm.alloc(*len as usize, 512)).collect();
    let ftr_addr = gm.alloc(1, 1);
    gm.write(ftr_addr, &[FTR_POISON]);

    let total = segs.len() as u16 + 2;
    let mut descs = Vec::with_capacity(total as usize);
    descs.push(Desc {
        addr: hdr_addr,
        len: 16,
        flags: DescFlags::NEXT,
        next: 1,
    });
    for (i, (len, device_writes)) in segs.iter().enumerate() {
        let mut flags = DescFlags::NEXT;
        if *device_writes {
            flags |= DescFlags::WRITE;
        }
        descs.push(Desc {
            addr: seg_addrs[i],
            len: *len,
            flags,
            next: i as u16 + 2,
        });
    }
    descs.push(Desc {
        addr: ftr_addr,
        len: 1,
        flags: DescFlags::WRITE,
        next: 0,
    });
    BuiltChain {
        descs,
        ftr_addr,
        seg_addrs,
    }
}

/// Lay out header, data and footer contiguously behind a single descriptor,
/// the shape a merging tunnel produces.
pub fn build_merged_chain(gm: &GuestMem, req_type: u32, sector: u64, data_len: u32, device_writes: bool) -> BuiltChain {
    let hdr = BlkHdr {
        req_type,
        ioprio: 0,
        sector,
    };
    let base = gm.alloc(16 + data_len as usize + 1, 512);
    let mut hdr_bytes = [0u8; 16];
    hdr.encode_to(&mut hdr_bytes);
    gm.write(base, &hdr_bytes);
    let ftr_addr = base + 16 + data_len as u64;
    gm.write(ftr_addr, &[FTR_POISON]);

    let flags = if device_writes {
        DescFlags::WRITE
    } else {
        DescFlags::empty()
    };
    BuiltChain {
        descs: vec![Desc {
            addr: base,
            len: 16 + data_len + 1,
            flags,
            next: 0,
        }],
        ftr_addr,
        seg_addrs: vec![base + 16],
    }
}

/// Encode a descriptor array into guest memory as a table.
pub fn write_desc_table(gm: &GuestMem, addr: u64, descs: &[Desc]) {
    let mut buf = [0u8; 16];
    for (i, d) in descs.iter().enumerate() {
        d.encode_to(&mut buf);
        gm.write(addr + i as u64 * 16, &buf);
    }
}

/// Deterministic payload bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
