//! Log pack framing.
//!
//! A log pack is one physical block of header followed by the data blocks
//! of its records. Header and data checksums are salted with the device's
//! log checksum salt.

use bytes::{Buf, BufMut};
use walb_core::checksum::{self, sum32};
use walb_core::{Error, Result, LOGICAL_BLOCK_SIZE};

/// Serialized size of a log record in bytes.
pub const LOG_RECORD_SIZE: usize = 32;

/// Sector type tag of a log pack header.
const LOGPACK_SECTOR_TYPE: u16 = 0x000b;

const PACK_FIXED_SIZE: usize = 24;

const FLAG_EXIST: u32 = 1 << 0;
const FLAG_PADDING: u32 = 1 << 1;
const FLAG_DISCARD: u32 = 1 << 2;

/// One log record: a write (or discard, or ring padding) captured by the
/// kernel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    /// Data checksum with the device salt; zero for discard and padding.
    pub checksum: u32,
    flags: u32,
    /// Write offset on the data device, logical blocks.
    pub offset: u64,
    /// Write size, logical blocks.
    pub io_size: u32,
    /// Data position inside the pack, physical blocks from the header.
    pub lsid_local: u16,
    /// Lsid of this record.
    pub lsid: u64,
}

impl LogRecord {
    /// Whether the record slot is used.
    #[must_use]
    pub fn is_exist(&self) -> bool {
        self.flags & FLAG_EXIST != 0
    }

    /// Whether this is ring padding (skipped blocks, no IO).
    #[must_use]
    pub fn is_padding(&self) -> bool {
        self.flags & FLAG_PADDING != 0
    }

    /// Whether this is a discard record (no data blocks).
    #[must_use]
    pub fn is_discard(&self) -> bool {
        self.flags & FLAG_DISCARD != 0
    }

    /// Whether this record carries data blocks.
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.is_exist() && !self.is_padding() && !self.is_discard()
    }

    /// Data size of this record on the log device, physical blocks.
    #[must_use]
    pub fn io_size_pb(&self, pbs: u32) -> u64 {
        if self.is_discard() {
            return 0;
        }
        let bytes = u64::from(self.io_size) * LOGICAL_BLOCK_SIZE as u64;
        bytes.div_ceil(u64::from(pbs))
    }

    /// Data size in logical blocks.
    #[must_use]
    pub fn io_size_lb(&self) -> u32 {
        self.io_size
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.flags);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.io_size);
        buf.put_u16_le(self.lsid_local);
        buf.put_u16_le(0);
        buf.put_u64_le(self.lsid);
    }

    fn decode<B: Buf>(buf: &mut B) -> Self {
        let checksum = buf.get_u32_le();
        let flags = buf.get_u32_le();
        let offset = buf.get_u64_le();
        let io_size = buf.get_u32_le();
        let lsid_local = buf.get_u16_le();
        let _ = buf.get_u16_le();
        let lsid = buf.get_u64_le();
        Self { checksum, flags, offset, io_size, lsid_local, lsid }
    }
}

/// A log pack header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPackHeader {
    pbs: u32,
    salt: u32,
    logpack_lsid: u64,
    records: Vec<LogRecord>,
    total_io_size: u16,
    n_padding: u16,
}

impl LogPackHeader {
    /// An empty pack at `lsid`.
    #[must_use]
    pub fn new(pbs: u32, salt: u32, lsid: u64) -> Self {
        Self { pbs, salt, logpack_lsid: lsid, records: Vec::new(), total_io_size: 0, n_padding: 0 }
    }

    /// Maximum records one header block can carry.
    #[must_use]
    pub fn max_records(pbs: u32) -> usize {
        (pbs as usize - PACK_FIXED_SIZE) / LOG_RECORD_SIZE
    }

    /// The pack's lsid.
    #[must_use]
    pub fn logpack_lsid(&self) -> u64 {
        self.logpack_lsid
    }

    /// Records in the pack.
    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn n_records(&self) -> usize {
        self.records.len()
    }

    /// Whether the pack has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total data size of the pack in physical blocks.
    #[must_use]
    pub fn total_io_size_pb(&self) -> u64 {
        u64::from(self.total_io_size)
    }

    /// Lsid of the pack that follows this one.
    #[must_use]
    pub fn next_logpack_lsid(&self) -> u64 {
        self.logpack_lsid + 1 + self.total_io_size_pb()
    }

    /// Append a normal write record; `data` must be `io_size * 512`
    /// bytes. Returns false when the header block is full.
    pub fn add_normal(&mut self, offset: u64, io_size: u32, data: &[u8]) -> Result<bool> {
        if data.len() != io_size as usize * LOGICAL_BLOCK_SIZE {
            return Err(Error::internal("log record payload size mismatch".to_string()));
        }
        if self.records.len() >= Self::max_records(self.pbs) {
            return Ok(false);
        }
        let rec = LogRecord {
            checksum: sum32(data, self.salt),
            flags: FLAG_EXIST,
            offset,
            io_size,
            lsid_local: 1 + self.total_io_size,
            lsid: self.logpack_lsid + 1 + u64::from(self.total_io_size),
        };
        self.total_io_size += rec.io_size_pb(self.pbs) as u16;
        self.records.push(rec);
        Ok(true)
    }

    /// Append a discard record.
    pub fn add_discard(&mut self, offset: u64, io_size: u32) -> bool {
        if self.records.len() >= Self::max_records(self.pbs) {
            return false;
        }
        self.records.push(LogRecord {
            checksum: 0,
            flags: FLAG_EXIST | FLAG_DISCARD,
            offset,
            io_size,
            lsid_local: 1 + self.total_io_size,
            lsid: self.logpack_lsid + 1 + u64::from(self.total_io_size),
        });
        true
    }

    /// Append a padding record spanning `size_pb` physical blocks.
    pub fn add_padding(&mut self, size_pb: u16) -> bool {
        if self.records.len() >= Self::max_records(self.pbs) {
            return false;
        }
        let io_size = u32::from(size_pb) * (self.pbs / LOGICAL_BLOCK_SIZE as u32);
        self.records.push(LogRecord {
            checksum: 0,
            flags: FLAG_EXIST | FLAG_PADDING,
            offset: 0,
            io_size,
            lsid_local: 1 + self.total_io_size,
            lsid: self.logpack_lsid + 1 + u64::from(self.total_io_size),
        });
        self.n_padding += 1;
        self.total_io_size += size_pb;
        true
    }

    /// Serialize the header block with a valid salted self-checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pbs as usize);
        buf.put_u32_le(0); // checksum, patched below
        buf.put_u16_le(LOGPACK_SECTOR_TYPE);
        buf.put_u16_le(self.total_io_size);
        buf.put_u64_le(self.logpack_lsid);
        buf.put_u16_le(self.records.len() as u16);
        buf.put_u16_le(self.n_padding);
        buf.put_u32_le(0);
        for rec in &self.records {
            rec.encode(&mut buf);
        }
        buf.resize(self.pbs as usize, 0);
        let csum = checksum::self_checksum(&buf, self.salt);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate a header block read at `expected_lsid`.
    pub fn decode(data: &[u8], pbs: u32, salt: u32, expected_lsid: u64) -> Result<Self> {
        if data.len() != pbs as usize {
            return Err(Error::invalid_format("short log pack header".to_string()));
        }
        if sum32(data, salt) != 0 {
            return Err(Error::invalid_format(format!(
                "log pack header checksum mismatch at lsid {expected_lsid}"
            )));
        }
        let mut c = data;
        let _checksum = c.get_u32_le();
        let sector_type = c.get_u16_le();
        if sector_type != LOGPACK_SECTOR_TYPE {
            return Err(Error::invalid_format(format!("bad log sector type {sector_type:#x}")));
        }
        let total_io_size = c.get_u16_le();
        let logpack_lsid = c.get_u64_le();
        if logpack_lsid != expected_lsid {
            return Err(Error::invalid_format(format!(
                "log pack lsid mismatch: header {logpack_lsid} expected {expected_lsid}"
            )));
        }
        let n_records = c.get_u16_le() as usize;
        let n_padding = c.get_u16_le();
        let _ = c.get_u32_le();
        if n_records > Self::max_records(pbs) {
            return Err(Error::invalid_format(format!("log pack n_records {n_records}")));
        }
        let mut records = Vec::with_capacity(n_records);
        for _ in 0..n_records {
            let rec = LogRecord::decode(&mut c);
            if !rec.is_exist() {
                return Err(Error::invalid_format("log record without EXIST".to_string()));
            }
            records.push(rec);
        }
        Ok(Self { pbs, salt, logpack_lsid, records, total_io_size, n_padding })
    }

    /// Verify a record's data against its salted checksum.
    pub fn verify_record_data(&self, idx: usize, data: &[u8]) -> Result<()> {
        let rec = &self.records[idx];
        if !rec.is_normal() {
            return Ok(());
        }
        let csum = sum32(data, self.salt);
        if csum != rec.checksum {
            return Err(Error::invalid_format(format!(
                "log record data checksum mismatch at lsid {}: {csum:08x} != {:08x}",
                rec.lsid, rec.checksum
            )));
        }
        Ok(())
    }

    /// Drop the records from `idx` on, shrinking the pack. Used when the
    /// tail of a pack turns out to be torn.
    pub fn shrink(&mut self, idx: usize) {
        self.records.truncate(idx);
        self.total_io_size =
            self.records.iter().map(|r| r.io_size_pb(self.pbs) as u16).sum();
        self.n_padding = self.records.iter().filter(|r| r.is_padding()).count() as u16;
    }

    /// Slice the pack's data region into per-record logical payloads,
    /// verifying the salted data checksums.
    ///
    /// `data_region` holds the pack's `total_io_size` physical blocks.
    /// Non-normal records yield empty payloads.
    pub fn extract_record_data(&self, data_region: &[u8]) -> Result<Vec<Vec<u8>>> {
        let pbs = self.pbs as usize;
        if data_region.len() != self.total_io_size as usize * pbs {
            return Err(Error::invalid_format("log pack data region size mismatch".to_string()));
        }
        let mut out = Vec::with_capacity(self.records.len());
        for (i, rec) in self.records.iter().enumerate() {
            if !rec.is_normal() {
                out.push(Vec::new());
                continue;
            }
            let from = (rec.lsid_local as usize - 1) * pbs;
            let span = rec.io_size_pb(self.pbs) as usize * pbs;
            if from + span > data_region.len() {
                return Err(Error::invalid_format("log record data out of pack".to_string()));
            }
            let payload =
                data_region[from..from + rec.io_size as usize * LOGICAL_BLOCK_SIZE].to_vec();
            self.verify_record_data(i, &payload)?;
            out.push(payload);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(blocks: usize, fill: u8) -> Vec<u8> {
        vec![fill; blocks * LOGICAL_BLOCK_SIZE]
    }

    #[test]
    fn test_max_records() {
        assert_eq!(LogPackHeader::max_records(512), 15);
        assert_eq!(LogPackHeader::max_records(4096), 127);
    }

    #[test]
    fn test_encode_decode() {
        let salt = 0x1234;
        let mut pack = LogPackHeader::new(512, salt, 100);
        assert!(pack.add_normal(8, 4, &data(4, 0xaa)).unwrap());
        assert!(pack.add_discard(100, 64));
        assert!(pack.add_normal(200, 1, &data(1, 0xbb)).unwrap());
        // 4 lb at pbs 512 = 4 pb; 1 lb = 1 pb.
        assert_eq!(pack.total_io_size_pb(), 5);
        assert_eq!(pack.next_logpack_lsid(), 106);

        let buf = pack.encode();
        let back = LogPackHeader::decode(&buf, 512, salt, 100).unwrap();
        assert_eq!(back, pack);
        assert_eq!(back.records()[0].lsid_local, 1);
        assert_eq!(back.records()[2].lsid_local, 5);

        back.verify_record_data(0, &data(4, 0xaa)).unwrap();
        assert!(back.verify_record_data(0, &data(4, 0xab)).is_err());
    }

    #[test]
    fn test_wrong_lsid_rejected() {
        let pack = LogPackHeader::new(512, 7, 100);
        let buf = pack.encode();
        assert!(LogPackHeader::decode(&buf, 512, 7, 101).is_err());
    }

    #[test]
    fn test_wrong_salt_rejected() {
        let pack = LogPackHeader::new(512, 7, 100);
        let buf = pack.encode();
        assert!(LogPackHeader::decode(&buf, 512, 8, 100).is_err());
    }

    #[test]
    fn test_padding_and_shrink() {
        let mut pack = LogPackHeader::new(512, 0, 0);
        pack.add_normal(0, 2, &data(2, 1)).unwrap();
        pack.add_padding(6);
        assert_eq!(pack.total_io_size_pb(), 8);
        pack.shrink(1);
        assert_eq!(pack.n_records(), 1);
        assert_eq!(pack.total_io_size_pb(), 2);
    }
}
