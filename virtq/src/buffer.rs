//! DMA-registered staging buffers.
//!
//! Request payloads that cannot move zero-copy are staged in local memory
//! the transport can address. [`DmaBuffer`] owns one registered allocation;
//! [`BufSlice`] is a cheap window into one (the per-command view of a shared
//! slab). [`MemPool`] is the external-allocation seam for queues that borrow
//! staging memory instead of owning it.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::transport::{DmaSlice, MemRegistry};

/// Alignment for staging buffers (cache line aligned).
pub const DMA_BUF_ALIGN: usize = 64;

/// A registered staging buffer.
///
/// The memory is zero-initialized, registered with the queue's
/// [`MemRegistry`] on creation and deregistered before it is freed.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    lkey: u32,
    registry: Rc<dyn MemRegistry>,
}

impl DmaBuffer {
    /// Allocate and register `capacity` bytes.
    pub fn new(registry: &Rc<dyn MemRegistry>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::AllocFailed { len: 0 });
        }

        let layout = Layout::from_size_align(capacity, DMA_BUF_ALIGN)
            .map_err(|_| Error::AllocFailed { len: capacity })?;

        let ptr = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::AllocFailed { len: capacity });
            }
            NonNull::new_unchecked(ptr)
        };

        let lkey = match unsafe { registry.register(ptr.as_ptr(), capacity) } {
            Ok(lkey) => lkey,
            Err(e) => {
                unsafe { dealloc(ptr.as_ptr(), layout) };
                return Err(Error::Io(e));
            }
        };

        Ok(Self {
            ptr,
            capacity,
            lkey,
            registry: Rc::clone(registry),
        })
    }

    /// Local key covering the whole allocation.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Window of `len` bytes starting at `offset`.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> BufSlice {
        debug_assert!(offset + len <= self.capacity);
        BufSlice {
            // Safety: offset stays inside the allocation.
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) },
            len,
            lkey: self.lkey,
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.registry.deregister(self.lkey);
        // Layout was validated in new().
        if let Ok(layout) = Layout::from_size_align(self.capacity, DMA_BUF_ALIGN) {
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

/// A borrowed window of a [`DmaBuffer`].
///
/// Plain pointer plus key; the owning buffer outlives every slice handed to
/// a command slot.
#[derive(Clone, Copy)]
pub struct BufSlice {
    ptr: NonNull<u8>,
    len: usize,
    lkey: u32,
}

impl BufSlice {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// DMA descriptor for `len` bytes at `offset` within the slice.
    #[inline]
    pub fn dma(&self, offset: usize, len: u32) -> DmaSlice {
        debug_assert!(offset + len as usize <= self.len);
        DmaSlice {
            addr: self.ptr.as_ptr() as u64 + offset as u64,
            len,
            lkey: self.lkey,
        }
    }
}

/// A staging chunk handed out by an external [`MemPool`].
#[derive(Debug, Clone, Copy)]
pub struct PoolChunk {
    pub ptr: *mut u8,
    pub len: u32,
    pub lkey: u32,
}

/// Completion routing token for one pending pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolToken {
    pub(crate) cmd_idx: u16,
}

/// External staging-memory provider.
///
/// `alloc` is asynchronous: the chunk arrives later through the queue's
/// `pool_ready` entry point, never from inside the `alloc` call itself.
pub trait MemPool {
    /// Request a registered chunk of at least `len` bytes.
    fn alloc(&self, len: u32, comp: PoolToken) -> io::Result<()>;

    /// Return a chunk obtained through `alloc`.
    fn free(&self, chunk: PoolChunk);
}
