//! Descriptor chain model and normalization.
//!
//! A command arrives as an ordered chain of (address, length, flags)
//! descriptors over guest memory. Before any remote data movement the chain
//! is normalized so element 0 is exactly the request header and the last
//! element is exactly the status footer; runs of physically contiguous
//! same-direction payload descriptors can then be merged to cut down the
//! number of remote-memory operations.

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Descriptor flags, matching the virtio wire encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// The chain continues at `next`.
        const NEXT = 1;
        /// The device writes to this descriptor (guest reads it).
        const WRITE = 2;
        /// The descriptor points at an indirect table.
        const INDIRECT = 4;
    }
}

/// Wire size of one descriptor.
/// Layout: addr (8) + len (4) + flags (2) + next (2) = 16 bytes, little endian.
pub const DESC_BYTES: usize = 16;

/// One guest-memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

impl Desc {
    /// Decode a descriptor from its 16-byte wire form.
    #[inline]
    pub fn decode_from(buf: &[u8; DESC_BYTES]) -> Desc {
        Desc {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: DescFlags::from_bits_retain(u16::from_le_bytes(buf[12..14].try_into().unwrap())),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        }
    }

    /// Encode a descriptor into its 16-byte wire form.
    #[inline]
    pub fn encode_to(&self, buf: &mut [u8; DESC_BYTES]) {
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..14].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[14..16].copy_from_slice(&self.next.to_le_bytes());
    }

    /// Device-writable descriptor (guest expects data here).
    #[inline]
    pub fn is_write(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }

    /// The chain continues after this descriptor.
    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags.contains(DescFlags::NEXT)
    }
}

/// Result of normalizing a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    /// Total payload bytes (everything between header and footer).
    pub total_seg_len: u32,
    /// Number of descriptors folded away by merging.
    pub num_merges: u16,
}

/// Growable descriptor storage for one command slot.
///
/// Sized for the common case (`seg_max` payload descriptors plus header and
/// footer) and grown at most once per command when a longer chain shows up;
/// `reset()` restores the static capacity when the slot is released.
#[derive(Debug)]
pub struct DescChain {
    descs: Box<[Desc]>,
    num: u16,
    static_cap: u16,
    grown: bool,
}

impl DescChain {
    pub fn new(static_cap: u16) -> Self {
        DescChain {
            descs: vec![Desc::default(); static_cap as usize].into_boxed_slice(),
            num: 0,
            static_cap,
            grown: false,
        }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.num
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.descs.len() as u16
    }

    /// Storage was grown beyond the static capacity for the current command.
    #[inline]
    pub fn grown(&self) -> bool {
        self.grown
    }

    #[inline]
    pub fn get(&self, i: u16) -> Desc {
        self.descs[i as usize]
    }

    #[inline]
    pub fn last(&self) -> Desc {
        debug_assert!(self.num > 0);
        self.descs[self.num as usize - 1]
    }

    /// Payload descriptors: everything between header and footer.
    ///
    /// Empty until the chain holds both a header and a footer element.
    #[inline]
    pub fn payload(&self) -> &[Desc] {
        if self.num < 2 {
            return &[];
        }
        &self.descs[1..self.num as usize - 1]
    }

    #[inline]
    pub fn as_slice(&self) -> &[Desc] {
        &self.descs[..self.num as usize]
    }

    /// Grow the storage, copying the current contents. The old storage is
    /// released only after the copy. No-op when `new_cap` does not exceed
    /// the current capacity.
    pub fn grow(&mut self, new_cap: u16) {
        if new_cap <= self.capacity() {
            return;
        }
        let mut bigger = vec![Desc::default(); new_cap as usize].into_boxed_slice();
        bigger[..self.num as usize].copy_from_slice(&self.descs[..self.num as usize]);
        self.descs = bigger;
        self.grown = true;
    }

    /// Append a descriptor. The caller grows the chain first when full.
    pub fn push(&mut self, d: Desc) {
        debug_assert!(self.num < self.capacity());
        self.descs[self.num as usize] = d;
        self.num += 1;
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num == self.capacity()
    }

    /// Drop the current chain and restore static storage.
    pub fn reset(&mut self) {
        if self.grown {
            self.descs = vec![Desc::default(); self.static_cap as usize].into_boxed_slice();
            self.grown = false;
        }
        self.num = 0;
    }

    fn make_room(&mut self) {
        if self.is_full() {
            self.grow(self.capacity() + 2);
        }
    }

    /// Split header and footer out of payload descriptors.
    ///
    /// If element 0 carries more than the header, the chain is shifted right
    /// and element 0 trimmed to exactly the header; if the last element
    /// carries more than the footer, its final bytes are carved into a new
    /// footer element. Each case adds one element.
    fn split_hdr_ftr(&mut self, hdr: u32, ftr: u32) -> Result<()> {
        let n = self.num as usize;
        if n == 0 {
            return Err(Error::ChainTooShort(0));
        }
        if self.descs[0].len != hdr {
            if self.descs[0].len < hdr {
                return Err(Error::BadChainGeometry {
                    hdr_len: self.descs[0].len,
                    ftr_len: self.last().len,
                });
            }
            self.make_room();
            self.descs.copy_within(0..n, 1);
            self.num += 1;
            self.descs[0].len = hdr;
            self.descs[1].addr = self.descs[1].addr.wrapping_add(hdr as u64);
            self.descs[1].len -= hdr;
        }
        let last = self.num as usize - 1;
        if self.descs[last].len > ftr {
            self.make_room();
            self.descs[last].len -= ftr;
            let d = self.descs[last];
            self.descs[self.num as usize] = Desc {
                addr: d.addr.wrapping_add(d.len as u64),
                len: ftr,
                flags: d.flags,
                next: 0,
            };
            self.num += 1;
        }
        Ok(())
    }

    /// Merge physically contiguous same-direction payload descriptors.
    ///
    /// Single left-to-right pass: descriptor `i` folds into the previous
    /// surviving descriptor iff its address continues it exactly and the
    /// WRITE bit matches; a fold whose combined length would not fit in
    /// 32 bits is skipped. Non-adjacent mergeable descriptors stay
    /// unmerged. Returns the number of descriptors folded away.
    pub fn merge_adjacent(&mut self) -> u16 {
        let n = self.num as usize;
        let mut merged_index = 1usize;
        let mut copy_to = 2usize;
        let mut merges = 0u16;
        let mut i = 2usize;
        while i + 1 < n {
            let d = self.descs[i];
            let m = self.descs[merged_index];
            let contiguous = d.addr == m.addr.wrapping_add(m.len as u64)
                && (d.flags & DescFlags::WRITE) == (m.flags & DescFlags::WRITE);
            match m.len.checked_add(d.len) {
                Some(combined) if contiguous => {
                    self.descs[merged_index].len = combined;
                    self.descs[merged_index].next = d.next;
                    merges += 1;
                }
                _ => {
                    if i != copy_to {
                        self.descs[copy_to] = d;
                    }
                    merged_index = copy_to;
                    copy_to += 1;
                }
            }
            i += 1;
        }
        // Move the footer down past the folded descriptors.
        if i < n && i != copy_to {
            self.descs[copy_to] = self.descs[i];
        }
        self.num -= merges;
        merges
    }

    /// Normalize the chain: split, optionally merge, validate shape.
    ///
    /// `hdr` and `ftr` are the device's fixed header and footer sizes. On
    /// success element 0 is the header, the last element the footer, and
    /// the returned info carries the payload total and the merge count. An
    /// error means the chain is malformed and the command must not touch
    /// guest memory.
    pub fn process(&mut self, hdr: u32, ftr: u32, merge: bool) -> Result<ChainInfo> {
        self.split_hdr_ftr(hdr, ftr)?;
        let num_merges = if merge { self.merge_adjacent() } else { 0 };
        if self.num < 2 {
            return Err(Error::ChainTooShort(self.num));
        }
        let hdr_len = self.descs[0].len;
        let ftr_len = self.last().len;
        if hdr_len != hdr || ftr_len != ftr {
            return Err(Error::BadChainGeometry { hdr_len, ftr_len });
        }
        let total_seg_len = self.payload().iter().map(|d| d.len as u64).sum::<u64>();
        if total_seg_len > u32::MAX as u64 {
            return Err(Error::BadChainGeometry { hdr_len, ftr_len });
        }
        Ok(ChainInfo {
            total_seg_len: total_seg_len as u32,
            num_merges,
        })
    }
}
