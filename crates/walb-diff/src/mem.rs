//! In-memory diff map with overlap resolution.

use std::collections::BTreeMap;

use walb_core::checksum::sum32;
use walb_core::{Error, Result, LOGICAL_BLOCK_SIZE};

use crate::header::DiffFileHeader;
use crate::record::DiffRecord;
use crate::sorted::{SortedDiffReader, SortedDiffWriter};

/// A record paired with its uncompressed payload.
#[derive(Debug, Clone, Default)]
pub struct DiffRecIo {
    rec: DiffRecord,
    io: Vec<u8>,
}

impl DiffRecIo {
    /// Pair a record with its payload. The payload of a non-normal record
    /// must be empty; a normal record must be uncompressed with a matching
    /// payload length.
    pub fn new(rec: DiffRecord, io: Vec<u8>) -> Result<Self> {
        rec.verify()?;
        if rec.is_normal() {
            if rec.is_compressed() {
                return Err(Error::internal(
                    "DiffRecIo requires uncompressed payload".to_string(),
                ));
            }
            if rec.data_size as usize != io.len() {
                return Err(Error::internal(format!(
                    "payload size mismatch: rec {} io {}",
                    rec.data_size,
                    io.len()
                )));
            }
        } else if !io.is_empty() {
            return Err(Error::internal("non-normal record with payload".to_string()));
        }
        Ok(Self { rec, io })
    }

    /// The record.
    #[must_use]
    pub fn record(&self) -> &DiffRecord {
        &self.rec
    }

    /// The payload.
    #[must_use]
    pub fn io(&self) -> &[u8] {
        &self.io
    }

    /// Take the parts.
    #[must_use]
    pub fn into_parts(self) -> (DiffRecord, Vec<u8>) {
        (self.rec, self.io)
    }

    /// Whether the payload checksum matches the record.
    #[must_use]
    pub fn is_checksum_valid(&self) -> bool {
        if !self.rec.is_normal() {
            return true;
        }
        sum32(&self.io, 0) == self.rec.checksum
    }

    /// Split into pieces of at most `max_io_blocks`, slicing the payload
    /// along with the address ranges.
    pub fn split_all(&self, max_io_blocks: u32) -> Result<Vec<Self>> {
        let recs = self.rec.split_all(max_io_blocks)?;
        let mut out = Vec::with_capacity(recs.len());
        let mut off = 0usize;
        for mut rec in recs {
            let io = if self.rec.is_normal() {
                let len = rec.io_blocks as usize * LOGICAL_BLOCK_SIZE;
                let piece = self.io[off..off + len].to_vec();
                off += len;
                rec.update_checksum(&piece);
                piece
            } else {
                Vec::new()
            };
            out.push(Self { rec, io });
        }
        Ok(out)
    }

    /// Subtract `rhs`'s address range from this entry, returning 0, 1, or
    /// 2 residual entries carrying slices of this payload.
    pub fn minus(&self, rhs: &Self) -> Result<Vec<Self>> {
        if !self.rec.is_overlapped(&rhs.rec) {
            return Err(Error::internal("minus on non-overlapped records".to_string()));
        }
        let lb = LOGICAL_BLOCK_SIZE;
        let mut out = Vec::new();

        // Fully shadowed: nothing remains.
        if self.rec.is_overwritten_by(&rhs.rec) {
            return Ok(out);
        }

        // rhs is strictly inside: left and right residuals.
        if rhs.rec.is_overwritten_by(&self.rec) {
            let blks0 = (rhs.rec.io_address - self.rec.io_address) as u32;
            let blks1 = (self.rec.end_io_address() - rhs.rec.end_io_address()) as u32;
            if blks0 > 0 {
                out.push(self.slice(self.rec.io_address, blks0, 0)?);
            }
            if blks1 > 0 {
                let addr = self.rec.end_io_address() - u64::from(blks1);
                let off = (addr - self.rec.io_address) as usize * lb;
                out.push(self.slice(addr, blks1, off)?);
            }
            return Ok(out);
        }

        // rhs covers the tail: keep the head.
        if self.rec.io_address < rhs.rec.io_address {
            let blks = (rhs.rec.io_address - self.rec.io_address) as u32;
            out.push(self.slice(self.rec.io_address, blks, 0)?);
            return Ok(out);
        }

        // rhs covers the head: keep the tail.
        let cut = (rhs.rec.end_io_address() - self.rec.io_address) as u32;
        let addr = self.rec.io_address + u64::from(cut);
        let blks = self.rec.io_blocks - cut;
        let off = cut as usize * lb;
        out.push(self.slice(addr, blks, off)?);
        Ok(out)
    }

    fn slice(&self, addr: u64, blocks: u32, payload_off: usize) -> Result<Self> {
        let mut rec = self.rec;
        rec.io_address = addr;
        rec.io_blocks = blocks;
        if self.rec.is_normal() {
            let len = blocks as usize * LOGICAL_BLOCK_SIZE;
            let io = self.io[payload_off..payload_off + len].to_vec();
            rec.data_size = len as u32;
            rec.update_checksum(&io);
            Self::new(rec, io)
        } else {
            rec.data_size = 0;
            Self::new(rec, Vec::new())
        }
    }
}

/// Sorted map of non-overlapping diff entries, keyed by IO address.
///
/// [`DiffMemory::add`] maintains the non-overlap invariant by subtracting
/// the new range from every existing overlapping entry; newer data wins,
/// so callers must feed entries oldest first.
pub struct DiffMemory {
    map: BTreeMap<u64, DiffRecIo>,
    n_ios: u64,
    n_blocks: u64,
    max_io_blocks: u32,
}

impl Default for DiffMemory {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DiffMemory {
    /// An empty map. `max_io_blocks` > 0 pre-splits inserted entries.
    #[must_use]
    pub fn new(max_io_blocks: u32) -> Self {
        Self { map: BTreeMap::new(), n_ios: 0, n_blocks: 0, max_io_blocks }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total logical blocks covered.
    #[must_use]
    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    /// Insert an entry, resolving overlaps so the new data wins.
    pub fn add(&mut self, rec: DiffRecord, io: Vec<u8>) -> Result<()> {
        let new_entry = DiffRecIo::new(rec, io)?;
        let addr0 = rec.io_address;
        let addr1 = rec.end_io_address();

        // The first overlap candidate may start before addr0.
        let start = match self.map.range(..=addr0).next_back() {
            Some((&k, entry)) if entry.record().end_io_address() > addr0 => k,
            _ => addr0,
        };
        let overlapped: Vec<u64> = self
            .map
            .range(start..addr1)
            .filter(|(_, e)| e.record().is_overlapped(&rec))
            .map(|(&k, _)| k)
            .collect();

        let mut displaced = Vec::with_capacity(overlapped.len());
        for k in overlapped {
            let entry = self.map.remove(&k).expect("key collected above");
            self.n_ios -= 1;
            self.n_blocks -= u64::from(entry.record().io_blocks);
            displaced.push(entry);
        }
        for entry in displaced {
            for residual in entry.minus(&new_entry)? {
                self.insert_entry(residual);
            }
        }

        if self.max_io_blocks > 0 && self.max_io_blocks < rec.io_blocks {
            for piece in new_entry.split_all(self.max_io_blocks)? {
                self.insert_entry(piece);
            }
        } else {
            self.insert_entry(new_entry);
        }
        Ok(())
    }

    fn insert_entry(&mut self, entry: DiffRecIo) {
        self.n_ios += 1;
        self.n_blocks += u64::from(entry.record().io_blocks);
        self.map.insert(entry.record().io_address, entry);
    }

    /// Iterate entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &DiffRecIo> {
        self.map.values()
    }

    /// Remove and return every entry ending at or before `addr`, in
    /// address order.
    pub fn drain_upto(&mut self, addr: u64) -> Vec<DiffRecIo> {
        let keys: Vec<u64> = self
            .map
            .iter()
            .take_while(|(_, e)| e.record().end_io_address() <= addr)
            .map(|(&k, _)| k)
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let entry = self.map.remove(&k).expect("key collected above");
            self.n_ios -= 1;
            self.n_blocks -= u64::from(entry.record().io_blocks);
            out.push(entry);
        }
        out
    }

    /// Write the map as a sorted wdiff.
    pub fn write_to<W: std::io::Write>(
        &self,
        writer: &mut SortedDiffWriter<W>,
        compression: walb_core::Compression,
    ) -> Result<()> {
        for entry in self.map.values() {
            writer.compress_and_write_diff(*entry.record(), entry.io(), compression, 0)?;
        }
        Ok(())
    }

    /// Populate the map from a sorted wdiff stream (header already read).
    pub fn read_from<R: std::io::Read>(
        &mut self,
        reader: &mut SortedDiffReader<R>,
    ) -> Result<()> {
        while let Some((rec, data)) = reader.read_and_uncompress_diff()? {
            self.add(rec, data)?;
        }
        Ok(())
    }

    /// Check the sorted/non-overlapping invariant and the statistics.
    pub fn verify(&self) -> Result<()> {
        let mut prev: Option<&DiffRecIo> = None;
        let mut n_blocks = 0u64;
        for entry in self.map.values() {
            if let Some(p) = prev {
                if p.record().end_io_address() > entry.record().io_address {
                    return Err(Error::internal(format!(
                        "overlapping entries at {}",
                        entry.record().io_address
                    )));
                }
            }
            n_blocks += u64::from(entry.record().io_blocks);
            prev = Some(entry);
        }
        if n_blocks != self.n_blocks || self.map.len() as u64 != self.n_ios {
            return Err(Error::internal("diff memory statistics mismatch".to_string()));
        }
        Ok(())
    }

    /// A file header suitable for [`DiffMemory::write_to`] output.
    #[must_use]
    pub fn make_header(uuid: [u8; 16]) -> DiffFileHeader {
        DiffFileHeader::new(crate::header::DiffFormat::Sorted, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal(addr: u64, blocks: u32, fill: u8) -> (DiffRecord, Vec<u8>) {
        let data = vec![fill; blocks as usize * LOGICAL_BLOCK_SIZE];
        let mut rec = DiffRecord::normal(addr, blocks);
        rec.update_checksum(&data);
        (rec, data)
    }

    fn entry(addr: u64, blocks: u32, fill: u8) -> DiffRecIo {
        let (rec, data) = normal(addr, blocks, fill);
        DiffRecIo::new(rec, data).unwrap()
    }

    #[test]
    fn test_minus_inner() {
        // Scenario: a=(100,10,0xAA), b=(102,6) -> [(100,2),(108,2)].
        let a = entry(100, 10, 0xaa);
        let b = entry(102, 6, 0xbb);
        let v = a.minus(&b).unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].record().io_address, 100);
        assert_eq!(v[0].record().io_blocks, 2);
        assert_eq!(v[1].record().io_address, 108);
        assert_eq!(v[1].record().io_blocks, 2);
        for r in &v {
            assert_eq!(r.io().len(), 2 * LOGICAL_BLOCK_SIZE);
            assert!(r.io().iter().all(|&x| x == 0xaa));
            assert!(r.is_checksum_valid());
        }
    }

    #[test]
    fn test_minus_shadowed() {
        let a = entry(102, 4, 0xaa);
        let b = entry(100, 10, 0xbb);
        assert!(a.minus(&b).unwrap().is_empty());
    }

    #[test]
    fn test_minus_head_tail() {
        let a = entry(100, 8, 0xaa);
        // rhs covers the tail.
        let v = a.minus(&entry(104, 8, 0xbb)).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].record().io_address, 100);
        assert_eq!(v[0].record().io_blocks, 4);
        // rhs covers the head.
        let v = a.minus(&entry(96, 8, 0xbb)).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].record().io_address, 104);
        assert_eq!(v[0].record().io_blocks, 4);
    }

    #[test]
    fn test_minus_covers_address_difference() {
        // addresses(a - b) == addresses(a) \ addresses(b), payload intact.
        let a = entry(10, 16, 0x7e);
        for (baddr, bblks) in [(0u64, 12u32), (20, 4), (12, 30), (9, 18)] {
            let b = entry(baddr, bblks, 0x00);
            if !a.record().is_overlapped(b.record()) {
                continue;
            }
            let v = a.minus(&b).unwrap();
            let mut covered: Vec<u64> = Vec::new();
            for r in &v {
                covered.extend(r.record().io_address..r.record().end_io_address());
                assert!(r.io().iter().all(|&x| x == 0x7e));
            }
            let expected: Vec<u64> = (10..26)
                .filter(|x| !(baddr..baddr + u64::from(bblks)).contains(x))
                .collect();
            assert_eq!(covered, expected);
        }
    }

    #[test]
    fn test_minus_non_normal() {
        let a = DiffRecIo::new(DiffRecord::discard(100, 10), Vec::new()).unwrap();
        let b = entry(102, 2, 0x11);
        let v = a.minus(&b).unwrap();
        assert_eq!(v.len(), 2);
        assert!(v.iter().all(|r| r.record().is_discard()));
        assert!(v.iter().all(|r| r.io().is_empty()));
    }

    #[test]
    fn test_memory_add_keeps_invariant() {
        let mut mem = DiffMemory::new(0);
        mem.add(normal(0, 8, 0x11).0, normal(0, 8, 0x11).1).unwrap();
        mem.add(normal(4, 8, 0x22).0, normal(4, 8, 0x22).1).unwrap();
        mem.add(normal(2, 2, 0x33).0, normal(2, 2, 0x33).1).unwrap();
        mem.verify().unwrap();

        // Union of ranges is preserved.
        let covered: u64 = mem.iter().map(|e| u64::from(e.record().io_blocks)).sum();
        assert_eq!(covered, 12);

        // Newest data wins on the intersections.
        let entries: Vec<_> = mem.iter().collect();
        assert_eq!(entries[0].record().io_address, 0);
        assert_eq!(entries[0].record().io_blocks, 2);
        assert!(entries[0].io().iter().all(|&x| x == 0x11));
        assert_eq!(entries[1].record().io_address, 2);
        assert!(entries[1].io().iter().all(|&x| x == 0x33));
    }

    #[test]
    fn test_memory_pre_split() {
        let mut mem = DiffMemory::new(4);
        let (rec, data) = normal(0, 10, 0x55);
        mem.add(rec, data).unwrap();
        mem.verify().unwrap();
        let sizes: Vec<u32> = mem.iter().map(|e| e.record().io_blocks).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_drain_upto() {
        let mut mem = DiffMemory::new(0);
        for addr in [0u64, 8, 16, 24] {
            let (rec, data) = normal(addr, 4, addr as u8);
            mem.add(rec, data).unwrap();
        }
        let drained = mem.drain_upto(16);
        assert_eq!(drained.len(), 2);
        assert_eq!(mem.len(), 2);
        mem.verify().unwrap();
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut mem = DiffMemory::new(0);
        for addr in [32u64, 0, 16] {
            let (rec, data) = normal(addr, 4, addr as u8 + 1);
            mem.add(rec, data).unwrap();
        }
        let mut writer = SortedDiffWriter::new(Vec::new());
        writer.write_header(&DiffMemory::make_header([3; 16])).unwrap();
        mem.write_to(&mut writer, walb_core::Compression::Snappy).unwrap();
        let buf = writer.close().unwrap();

        let mut reader = SortedDiffReader::new(buf.as_slice());
        reader.read_header().unwrap();
        let mut back = DiffMemory::new(0);
        back.read_from(&mut reader).unwrap();
        back.verify().unwrap();
        assert_eq!(back.len(), 3);
        let addrs: Vec<u64> = back.iter().map(|e| e.record().io_address).collect();
        assert_eq!(addrs, vec![0, 16, 32]);
    }
}
