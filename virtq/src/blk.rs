//! virtio-blk protocol definitions.
//!
//! Request layout on the wire: a 16-byte header descriptor
//! (type / ioprio / sector, little endian), payload descriptors, and a
//! 1-byte status footer descriptor the device writes last.

/// Device-to-guest read (the device writes payload to the guest).
pub const VIRTIO_BLK_T_IN: u32 = 0;
/// Guest-to-device write (the device reads payload from the guest).
pub const VIRTIO_BLK_T_OUT: u32 = 1;
/// Flush volatile write cache.
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
/// Device identify: report the backing device name.
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

/// Request completed successfully.
pub const VIRTIO_BLK_S_OK: u8 = 0;
/// Request failed in the device or backend.
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
/// Request type not supported.
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Size of the identify payload.
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

/// Request header size on the wire.
pub const BLK_HDR_BYTES: usize = 16;
/// Status footer size on the wire.
pub const BLK_FTR_BYTES: usize = 1;

/// Bytes per virtio-blk sector. The header's sector field is always in
/// 512-byte units regardless of the backend block size.
pub const SECTOR_BYTES: u64 = 512;

/// Header + footer elements framing every descriptor chain.
pub const NUM_HDR_FTR_DESCS: u16 = 2;

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlkHdr {
    pub req_type: u32,
    pub ioprio: u32,
    pub sector: u64,
}

impl BlkHdr {
    /// Decode a header from its 16-byte wire form.
    #[inline]
    pub fn decode_from(buf: &[u8; BLK_HDR_BYTES]) -> BlkHdr {
        BlkHdr {
            req_type: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ioprio: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sector: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }

    /// Encode a header into its 16-byte wire form.
    #[inline]
    pub fn encode_to(&self, buf: &mut [u8; BLK_HDR_BYTES]) {
        buf[0..4].copy_from_slice(&self.req_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ioprio.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sector.to_le_bytes());
    }
}

/// Completion element size.
/// Layout: descr_head_idx (2) + reserved (2) + len (4) = 8 bytes.
pub const COMP_BYTES: usize = 8;

/// Completion sent to the transport when a command finishes.
///
/// `len` counts the bytes written to device-writable guest memory (payload
/// and identify data; the status byte is not included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkCompletion {
    pub descr_head_idx: u16,
    pub len: u32,
}

impl BlkCompletion {
    #[inline]
    pub fn encode(&self) -> [u8; COMP_BYTES] {
        let mut buf = [0u8; COMP_BYTES];
        buf[0..2].copy_from_slice(&self.descr_head_idx.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    #[inline]
    pub fn decode(buf: &[u8; COMP_BYTES]) -> BlkCompletion {
        BlkCompletion {
            descr_head_idx: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            len: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}
