//! The 4 KiB pack header of the sorted format.

use bytes::BufMut;
use walb_core::checksum::{self, sum32};
use walb_core::{Error, Result};

use crate::record::{DiffRecord, DIFF_RECORD_SIZE};

/// Size of a pack header block in bytes.
pub const DIFF_PACK_SIZE: usize = 4096;

const PACK_FIXED_SIZE: usize = 16;

/// Maximum number of records one pack can hold.
pub const MAX_N_RECORDS_IN_PACK: usize = (DIFF_PACK_SIZE - PACK_FIXED_SIZE) / DIFF_RECORD_SIZE;

/// Maximum aggregated payload size of one pack (32 MiB).
pub const MAX_PACK_TOTAL_SIZE: u32 = 32 * 1024 * 1024;

const FLAG_END: u8 = 1 << 0;

/// A pack header: up to [`MAX_N_RECORDS_IN_PACK`] records whose payloads
/// follow the header back to back, in record order.
#[derive(Debug, Clone)]
pub struct DiffPackHeader {
    records: Vec<DiffRecord>,
    total_size: u32,
    is_end: bool,
}

impl Default for DiffPackHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffPackHeader {
    /// An empty pack.
    #[must_use]
    pub fn new() -> Self {
        Self { records: Vec::new(), total_size: 0, is_end: false }
    }

    /// The terminator pack.
    #[must_use]
    pub fn end() -> Self {
        Self { records: Vec::new(), total_size: 0, is_end: true }
    }

    /// Records in this pack.
    #[must_use]
    pub fn records(&self) -> &[DiffRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Aggregated payload size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Whether the END flag is set.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.is_end
    }

    /// Whether the pack holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `rec` would fit.
    #[must_use]
    pub fn can_add(&self, rec: &DiffRecord) -> bool {
        if self.records.len() >= MAX_N_RECORDS_IN_PACK {
            return false;
        }
        if !self.records.is_empty()
            && self.total_size.saturating_add(rec.data_size) > MAX_PACK_TOTAL_SIZE
        {
            return false;
        }
        true
    }

    /// Try to add a record; its `data_offset` is assigned from the current
    /// payload tail. Returns false when the pack is full.
    pub fn add(&mut self, mut rec: DiffRecord) -> bool {
        if !self.can_add(&rec) {
            return false;
        }
        rec.data_offset = self.total_size;
        self.total_size += rec.data_size;
        self.records.push(rec);
        true
    }

    /// Reset to an empty pack.
    pub fn clear(&mut self) {
        self.records.clear();
        self.total_size = 0;
        self.is_end = false;
    }

    /// Serialize the 4 KiB block with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DIFF_PACK_SIZE);
        buf.put_u32_le(0); // checksum, patched below
        buf.put_u16_le(self.records.len() as u16);
        buf.put_u8(if self.is_end { FLAG_END } else { 0 });
        buf.put_u8(0);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(0);
        for rec in &self.records {
            rec.encode(&mut buf);
        }
        buf.resize(DIFF_PACK_SIZE, 0);
        let csum = checksum::self_checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate a 4 KiB pack block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DIFF_PACK_SIZE {
            return Err(Error::invalid_format("short diff pack".to_string()));
        }
        let data = &data[..DIFF_PACK_SIZE];
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("diff pack checksum mismatch".to_string()));
        }
        let n_records = u16::from_le_bytes([data[4], data[5]]) as usize;
        let flags = data[6];
        let total_size = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if n_records > MAX_N_RECORDS_IN_PACK {
            return Err(Error::invalid_format(format!("diff pack n_records {n_records}")));
        }
        let mut records = Vec::with_capacity(n_records);
        let mut cursor = &data[PACK_FIXED_SIZE..];
        let mut sum = 0u32;
        let mut expected_offset = 0u32;
        for _ in 0..n_records {
            let rec = DiffRecord::decode(&mut cursor)?;
            rec.verify()?;
            if rec.data_offset != expected_offset {
                return Err(Error::invalid_format(format!(
                    "diff pack data offset skew: {} != {}",
                    rec.data_offset, expected_offset
                )));
            }
            expected_offset += rec.data_size;
            sum += rec.data_size;
            records.push(rec);
        }
        if sum != total_size {
            return Err(Error::invalid_format(format!(
                "diff pack total size mismatch: {sum} != {total_size}"
            )));
        }
        Ok(Self { records, total_size, is_end: flags & FLAG_END != 0 })
    }
}
