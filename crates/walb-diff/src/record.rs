//! The 32-byte diff record.

use bytes::{Buf, BufMut};
use walb_core::checksum::sum32;
use walb_core::{Compression, Error, Result, LOGICAL_BLOCK_SIZE};

/// Serialized size of a diff record in bytes.
pub const DIFF_RECORD_SIZE: usize = 32;

const FLAG_EXIST: u8 = 1 << 0;
const FLAG_ALLZERO: u8 = 1 << 1;
const FLAG_DISCARD: u8 = 1 << 2;

/// What a record stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffRecordKind {
    /// Carries payload bytes.
    Normal,
    /// No payload; the range reads as zeroes.
    AllZero,
    /// No payload; the range is a hole.
    Discard,
}

/// Metadata of one diff IO.
///
/// `io_address` and `io_blocks` are in logical blocks; `data_offset` and
/// `data_size` locate the (possibly compressed) payload relative to the
/// containing pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffRecord {
    /// IO address in logical blocks.
    pub io_address: u64,
    /// IO size in logical blocks.
    pub io_blocks: u32,
    flags: u8,
    /// Payload compression.
    pub compression: Compression,
    /// Payload offset in bytes, relative to the end of the pack header.
    pub data_offset: u32,
    /// Payload size in bytes.
    pub data_size: u32,
    /// Payload checksum (salt 0) over the stored (compressed) bytes.
    pub checksum: u32,
}

impl DiffRecord {
    /// A normal record with an uncompressed payload of `io_blocks` blocks.
    #[must_use]
    pub fn normal(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: FLAG_EXIST,
            compression: Compression::None,
            data_offset: 0,
            data_size: io_blocks * LOGICAL_BLOCK_SIZE as u32,
            checksum: 0,
        }
    }

    /// An all-zero record.
    #[must_use]
    pub fn all_zero(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: FLAG_EXIST | FLAG_ALLZERO,
            ..Default::default()
        }
    }

    /// A discard record.
    #[must_use]
    pub fn discard(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: FLAG_EXIST | FLAG_DISCARD,
            ..Default::default()
        }
    }

    /// One past the last logical block this record covers.
    #[must_use]
    pub fn end_io_address(&self) -> u64 {
        self.io_address + u64::from(self.io_blocks)
    }

    /// Whether the payload is compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.compression.is_compressed()
    }

    /// Whether this record carries payload.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.flags & (FLAG_ALLZERO | FLAG_DISCARD) == 0
    }

    /// Whether this is an all-zero record.
    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        self.flags & FLAG_ALLZERO != 0
    }

    /// Whether this is a discard record.
    #[must_use]
    pub fn is_discard(&self) -> bool {
        self.flags & FLAG_DISCARD != 0
    }

    /// The record kind.
    pub fn kind(&self) -> Result<DiffRecordKind> {
        match (self.is_all_zero(), self.is_discard()) {
            (false, false) => Ok(DiffRecordKind::Normal),
            (true, false) => Ok(DiffRecordKind::AllZero),
            (false, true) => Ok(DiffRecordKind::Discard),
            (true, true) => Err(Error::invalid_format(
                "record has both ALLZERO and DISCARD".to_string(),
            )),
        }
    }

    /// Turn this into a normal record, keeping the address range.
    pub fn set_normal(&mut self) {
        self.flags = FLAG_EXIST;
    }

    /// Turn this into an all-zero record.
    pub fn set_all_zero(&mut self) {
        self.flags = FLAG_EXIST | FLAG_ALLZERO;
        self.compression = Compression::None;
        self.data_size = 0;
        self.checksum = 0;
    }

    /// Turn this into a discard record.
    pub fn set_discard(&mut self) {
        self.flags = FLAG_EXIST | FLAG_DISCARD;
        self.compression = Compression::None;
        self.data_size = 0;
        self.checksum = 0;
    }

    /// Whether `rhs` fully covers this record's range.
    #[must_use]
    pub fn is_overwritten_by(&self, rhs: &Self) -> bool {
        rhs.io_address <= self.io_address && self.end_io_address() <= rhs.end_io_address()
    }

    /// Whether the two ranges intersect.
    #[must_use]
    pub fn is_overlapped(&self, rhs: &Self) -> bool {
        self.io_address < rhs.end_io_address() && rhs.io_address < self.end_io_address()
    }

    /// Check structural invariants.
    pub fn verify(&self) -> Result<()> {
        if self.flags & FLAG_EXIST == 0 {
            return Err(Error::invalid_format("record EXIST flag not set".to_string()));
        }
        if self.io_blocks == 0 {
            return Err(Error::invalid_format("record io_blocks is zero".to_string()));
        }
        let kind = self.kind()?;
        if kind != DiffRecordKind::Normal {
            if self.data_size != 0 || self.is_compressed() {
                return Err(Error::invalid_format(format!(
                    "non-normal record with payload: {self:?}"
                )));
            }
        } else if !self.is_compressed()
            && self.data_size != self.io_blocks * LOGICAL_BLOCK_SIZE as u32
        {
            return Err(Error::invalid_format(format!(
                "uncompressed data_size mismatch: {self:?}"
            )));
        }
        Ok(())
    }

    /// Serialize into the 32-byte wire form.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.io_address);
        buf.put_u32_le(self.io_blocks);
        buf.put_u8(self.flags);
        buf.put_u8(self.compression.to_wire());
        buf.put_u16_le(0);
        buf.put_u32_le(self.data_offset);
        buf.put_u32_le(self.data_size);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(0);
    }

    /// Parse the 32-byte wire form.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < DIFF_RECORD_SIZE {
            return Err(Error::invalid_format("short diff record".to_string()));
        }
        let io_address = buf.get_u64_le();
        let io_blocks = buf.get_u32_le();
        let flags = buf.get_u8();
        let compression = Compression::from_wire(buf.get_u8())?;
        let _ = buf.get_u16_le();
        let data_offset = buf.get_u32_le();
        let data_size = buf.get_u32_le();
        let checksum = buf.get_u32_le();
        let _ = buf.get_u32_le();
        Ok(Self { io_address, io_blocks, flags, compression, data_offset, data_size, checksum })
    }

    /// Split a non-compressed record into pieces of at most `max_io_blocks`
    /// blocks, covering consecutive address ranges.
    ///
    /// The returned records carry no valid `data_offset` or `checksum`;
    /// the caller recomputes both when the payload slices are known.
    pub fn split_all(&self, max_io_blocks: u32) -> Result<Vec<Self>> {
        if max_io_blocks == 0 {
            return Err(Error::internal("split with max_io_blocks 0".to_string()));
        }
        if self.is_compressed() {
            return Err(Error::internal("cannot split a compressed record".to_string()));
        }
        let mut out = Vec::new();
        let mut addr = self.io_address;
        let mut remaining = self.io_blocks;
        while remaining > 0 {
            let blks = remaining.min(max_io_blocks);
            let mut rec = *self;
            rec.io_address = addr;
            rec.io_blocks = blks;
            rec.data_offset = 0;
            rec.checksum = 0;
            if rec.is_normal() {
                rec.data_size = blks * LOGICAL_BLOCK_SIZE as u32;
            }
            out.push(rec);
            addr += u64::from(blks);
            remaining -= blks;
        }
        Ok(out)
    }

    /// Recompute the payload checksum field from `data`.
    pub fn update_checksum(&mut self, data: &[u8]) {
        self.checksum = if data.is_empty() { 0 } else { sum32(data, 0) };
    }
}

impl std::fmt::Display for DiffRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wdiff_rec: {}\t{}\t{}\t{}\t{}\t{:08x}\t{}{}",
            self.io_address,
            self.io_blocks,
            self.compression,
            self.data_offset,
            self.data_size,
            self.checksum,
            if self.is_all_zero() { "Z" } else { "-" },
            if self.is_discard() { "D" } else { "-" },
        )
    }
}
