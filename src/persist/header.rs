use crate::{Error, Result};

pub const HEADER_SIZE: usize = 32;
pub const RECORD_ALIGN: usize = 8;
pub const FLAGS_OFFSET: usize = 4;

/// Record is fully written and may be read.
pub const FLAG_COMMITTED: u8 = 1;
/// No more records in this segment; continue in the next one.
pub const FLAG_ROLL: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub flags: u8,
    pub checksum: u32,
    pub seq: u64,
    pub timestamp_ns: u64,
}

impl RecordHeader {
    pub fn new(length: u32, seq: u64, timestamp_ns: u64, checksum: u32) -> Self {
        Self {
            length,
            flags: 0,
            checksum,
            seq,
            timestamp_ns,
        }
    }

    pub fn roll_marker() -> Self {
        Self {
            length: 0,
            flags: FLAG_ROLL,
            checksum: 0,
            seq: 0,
            timestamp_ns: 0,
        }
    }

    // Layout: length(0..4) flags(4) pad(5..8) checksum(8..12) pad(12..16)
    //         seq(16..24) timestamp_ns(24..32)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[FLAGS_OFFSET] = self.flags;
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("record header truncated"));
        }
        Ok(Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().expect("slice length")),
            flags: bytes[FLAGS_OFFSET],
            checksum: u32::from_le_bytes(bytes[8..12].try_into().expect("slice length")),
            seq: u64::from_le_bytes(bytes[16..24].try_into().expect("slice length")),
            timestamp_ns: u64::from_le_bytes(bytes[24..32].try_into().expect("slice length")),
        })
    }

    pub fn is_committed(&self) -> bool {
        self.flags & FLAG_COMMITTED != 0
    }

    pub fn is_roll(&self) -> bool {
        self.flags & FLAG_ROLL != 0
    }

    /// Header plus payload, padded to `RECORD_ALIGN`.
    pub fn record_len(&self) -> usize {
        record_len(self.length as usize)
    }

    pub fn crc32(payload: &[u8]) -> u32 {
        use crc32fast::Hasher;
        let mut hasher = Hasher::new();
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if Self::crc32(payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

pub fn record_len(payload_len: usize) -> usize {
    align_up(HEADER_SIZE + payload_len, RECORD_ALIGN)
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
