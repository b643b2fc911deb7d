//! Indexed wdiff reader and writer.
//!
//! Payload blobs land in file order as they arrive (no sorting needed
//! during construction); the sorted index and its super footer are written
//! on close. Several index records may alias one blob through
//! `io_offset`/`orig_blocks`.

use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut};
use walb_core::checksum::{self, sum32};
use walb_core::{compress, Compression, Error, Result, LOGICAL_BLOCK_SIZE};

use crate::header::{DiffFileHeader, DiffFormat, DIFF_FILE_HEADER_SIZE};
use crate::record::DiffRecord;

/// Serialized size of an index record in bytes.
pub const INDEXED_RECORD_SIZE: usize = 48;

/// Serialized size of the index super footer in bytes.
pub const INDEX_SUPER_SIZE: usize = 24;

const FLAG_EXIST: u8 = 1 << 0;
const FLAG_ALLZERO: u8 = 1 << 1;
const FLAG_DISCARD: u8 = 1 << 2;

/// An index record of the indexed wdiff format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexedDiffRecord {
    /// IO address in logical blocks.
    pub io_address: u64,
    /// IO size in logical blocks.
    pub io_blocks: u32,
    /// EXIST/ALLZERO/DISCARD bits.
    pub flags: u8,
    /// Compression of the referenced blob.
    pub compression: Compression,
    /// Blob offset in the whole file, bytes.
    pub data_offset: u64,
    /// Blob size, bytes.
    pub data_size: u32,
    /// Offset of this IO inside the decompressed blob, logical blocks.
    pub io_offset: u32,
    /// Size of the decompressed blob, logical blocks.
    pub orig_blocks: u32,
    /// Checksum of the compressed blob, salt 0.
    pub io_checksum: u32,
}

impl IndexedDiffRecord {
    /// A normal record owning a whole blob.
    #[must_use]
    pub fn normal(io_address: u64, io_blocks: u32) -> Self {
        Self {
            io_address,
            io_blocks,
            flags: FLAG_EXIST,
            orig_blocks: io_blocks,
            ..Default::default()
        }
    }

    /// An all-zero record.
    #[must_use]
    pub fn all_zero(io_address: u64, io_blocks: u32) -> Self {
        Self { io_address, io_blocks, flags: FLAG_EXIST | FLAG_ALLZERO, ..Default::default() }
    }

    /// A discard record.
    #[must_use]
    pub fn discard(io_address: u64, io_blocks: u32) -> Self {
        Self { io_address, io_blocks, flags: FLAG_EXIST | FLAG_DISCARD, ..Default::default() }
    }

    /// One past the last logical block this record covers.
    #[must_use]
    pub fn end_io_address(&self) -> u64 {
        self.io_address + u64::from(self.io_blocks)
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

    /// Check structural invariants.
    pub fn verify(&self) -> Result<()> {
        if self.flags & FLAG_EXIST == 0 {
            return Err(Error::invalid_format("index record EXIST flag not set".to_string()));
        }
        if self.io_blocks == 0 {
            return Err(Error::invalid_format("index record io_blocks is zero".to_string()));
        }
        if self.is_all_zero() && self.is_discard() {
            return Err(Error::invalid_format(
                "index record has both ALLZERO and DISCARD".to_string(),
            ));
        }
        if self.is_normal() && self.io_offset + self.io_blocks > self.orig_blocks {
            return Err(Error::invalid_format(format!(
                "index record slice out of blob: {self:?}"
            )));
        }
        Ok(())
    }

    /// Serialize the 48-byte wire form with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; INDEXED_RECORD_SIZE] {
        let mut buf = [0u8; INDEXED_RECORD_SIZE];
        {
            let mut c = &mut buf[..];
            c.put_u64_le(self.io_address);
            c.put_u32_le(self.io_blocks);
            c.put_u8(self.flags);
            c.put_u8(self.compression.to_wire());
            c.put_u16_le(0);
            c.put_u64_le(self.data_offset);
            c.put_u32_le(self.data_size);
            c.put_u32_le(self.io_offset);
            c.put_u32_le(self.orig_blocks);
            c.put_u32_le(0);
            c.put_u32_le(self.io_checksum);
            c.put_u32_le(0); // rec_checksum, patched below
        }
        let csum = checksum::self_checksum(&buf, 0);
        buf[44..48].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate the 48-byte wire form.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < INDEXED_RECORD_SIZE {
            return Err(Error::invalid_format("short index record".to_string()));
        }
        let data = &data[..INDEXED_RECORD_SIZE];
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("index record checksum mismatch".to_string()));
        }
        let mut c = data;
        let io_address = c.get_u64_le();
        let io_blocks = c.get_u32_le();
        let flags = c.get_u8();
        let compression = Compression::from_wire(c.get_u8())?;
        let _ = c.get_u16_le();
        let data_offset = c.get_u64_le();
        let data_size = c.get_u32_le();
        let io_offset = c.get_u32_le();
        let orig_blocks = c.get_u32_le();
        let _ = c.get_u32_le();
        let io_checksum = c.get_u32_le();
        let rec = Self {
            io_address,
            io_blocks,
            flags,
            compression,
            data_offset,
            data_size,
            io_offset,
            orig_blocks,
            io_checksum,
        };
        rec.verify()?;
        Ok(rec)
    }
}

/// The index super footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffIndexSuper {
    /// Offset of the first index record in the file, bytes.
    pub index_offset: u64,
    /// Number of index records.
    pub n_records: u32,
    /// Number of payload blobs.
    pub n_data: u32,
}

impl DiffIndexSuper {
    /// Serialize with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; INDEX_SUPER_SIZE] {
        let mut buf = [0u8; INDEX_SUPER_SIZE];
        {
            let mut c = &mut buf[..];
            c.put_u64_le(self.index_offset);
            c.put_u32_le(self.n_records);
            c.put_u32_le(self.n_data);
            c.put_u32_le(0);
            c.put_u32_le(0); // checksum, patched below
        }
        let csum = checksum::self_checksum(&buf, 0);
        buf[20..24].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < INDEX_SUPER_SIZE {
            return Err(Error::invalid_format("short index super".to_string()));
        }
        let data = &data[..INDEX_SUPER_SIZE];
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("index super checksum mismatch".to_string()));
        }
        let mut c = data;
        Ok(Self {
            index_offset: c.get_u64_le(),
            n_records: c.get_u32_le(),
            n_data: c.get_u32_le(),
        })
    }
}

/// Writer of the indexed format. Records may arrive in any address order.
pub struct IndexedDiffWriter<W: Write> {
    out: W,
    offset: u64,
    index: Vec<IndexedDiffRecord>,
    n_data: u32,
    wrote_header: bool,
}

impl<W: Write> IndexedDiffWriter<W> {
    /// Wrap an output stream.
    pub fn new(out: W) -> Self {
        Self { out, offset: 0, index: Vec::new(), n_data: 0, wrote_header: false }
    }

    /// Write the file header. Must be called exactly once, first.
    pub fn write_header(&mut self, header: &DiffFileHeader) -> Result<()> {
        if self.wrote_header {
            return Err(Error::internal("header already written".to_string()));
        }
        if header.format != DiffFormat::Indexed {
            return Err(Error::internal("indexed writer needs an indexed header".to_string()));
        }
        self.out.write_all(&header.encode())?;
        self.offset = DIFF_FILE_HEADER_SIZE as u64;
        self.wrote_header = true;
        Ok(())
    }

    /// Write one record; a normal record's `data` is the stored
    /// (already compressed, if any) blob for this record alone.
    pub fn write_diff(&mut self, mut rec: IndexedDiffRecord, data: &[u8]) -> Result<()> {
        if !self.wrote_header {
            return Err(Error::internal("write_header must be called first".to_string()));
        }
        if rec.is_normal() {
            rec.data_offset = self.offset;
            rec.data_size = data.len() as u32;
            rec.io_checksum = sum32(data, 0);
            self.out.write_all(data)?;
            self.offset += data.len() as u64;
            self.n_data += 1;
        }
        rec.verify()?;
        self.index.push(rec);
        Ok(())
    }

    /// Compress `data` and write one normal record.
    pub fn compress_and_write_diff(
        &mut self,
        mut rec: IndexedDiffRecord,
        data: &[u8],
        ty: Compression,
        level: i32,
    ) -> Result<()> {
        if !rec.is_normal() || !ty.is_compressed() {
            rec.compression = Compression::None;
            return self.write_diff(rec, data);
        }
        let packed = compress::compress(ty, data, level)?;
        rec.compression = ty;
        self.write_diff(rec, &packed)
    }

    /// Push an index record that aliases an already-written blob.
    /// The caller fills every blob field.
    pub fn add_alias_record(&mut self, rec: IndexedDiffRecord) -> Result<()> {
        rec.verify()?;
        if rec.is_normal() && rec.data_offset + u64::from(rec.data_size) > self.offset {
            return Err(Error::internal("alias record points past written data".to_string()));
        }
        self.index.push(rec);
        Ok(())
    }

    /// Sort the index, write it with the super footer, and return the
    /// inner stream.
    pub fn finish(mut self) -> Result<W> {
        self.index.sort_by_key(|r| r.io_address);
        for pair in self.index.windows(2) {
            if pair[1].io_address < pair[0].end_io_address() {
                return Err(Error::invalid_format(format!(
                    "overlapping index records at {}",
                    pair[1].io_address
                )));
            }
        }
        // Align index records to 8 bytes.
        let pad = (8 - (self.offset % 8) as usize) % 8;
        self.out.write_all(&[0u8; 8][..pad])?;
        let index_offset = self.offset + pad as u64;
        for rec in &self.index {
            self.out.write_all(&rec.encode())?;
        }
        let sup = DiffIndexSuper {
            index_offset,
            n_records: self.index.len() as u32,
            n_data: self.n_data,
        };
        self.out.write_all(&sup.encode())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reader of the indexed format.
///
/// Construction loads and verifies the index; payloads are fetched on
/// demand. The last decompressed blob is cached so aliasing records that
/// share a blob do not decompress it repeatedly.
pub struct IndexedDiffReader<R: Read + Seek> {
    input: R,
    header: DiffFileHeader,
    records: Vec<IndexedDiffRecord>,
    next: usize,
    cache: Option<(u64, Vec<u8>)>,
}

impl<R: Read + Seek> IndexedDiffReader<R> {
    /// Load the header and index from `input`.
    pub fn new(mut input: R) -> Result<Self> {
        let mut hbuf = [0u8; DIFF_FILE_HEADER_SIZE];
        input.seek(SeekFrom::Start(0))?;
        input.read_exact(&mut hbuf)?;
        let header = DiffFileHeader::decode(&hbuf)?;
        if header.format != DiffFormat::Indexed {
            return Err(Error::invalid_format("not an indexed wdiff".to_string()));
        }

        let file_size = input.seek(SeekFrom::End(0))?;
        if file_size < (DIFF_FILE_HEADER_SIZE + INDEX_SUPER_SIZE) as u64 {
            return Err(Error::invalid_format("indexed wdiff too small".to_string()));
        }
        let mut sbuf = [0u8; INDEX_SUPER_SIZE];
        input.seek(SeekFrom::Start(file_size - INDEX_SUPER_SIZE as u64))?;
        input.read_exact(&mut sbuf)?;
        let sup = DiffIndexSuper::decode(&sbuf)?;

        let index_size = sup.n_records as u64 * INDEXED_RECORD_SIZE as u64;
        if sup.index_offset + index_size + INDEX_SUPER_SIZE as u64 != file_size {
            return Err(Error::invalid_format("index super geometry mismatch".to_string()));
        }
        input.seek(SeekFrom::Start(sup.index_offset))?;
        let mut records = Vec::with_capacity(sup.n_records as usize);
        let mut rbuf = [0u8; INDEXED_RECORD_SIZE];
        for _ in 0..sup.n_records {
            input.read_exact(&mut rbuf)?;
            records.push(IndexedDiffRecord::decode(&rbuf)?);
        }
        for pair in records.windows(2) {
            if pair[1].io_address < pair[0].end_io_address() {
                return Err(Error::invalid_format("index records overlap".to_string()));
            }
        }
        Ok(Self { input, header, records, next: 0, cache: None })
    }

    /// The file header.
    #[must_use]
    pub fn header(&self) -> &DiffFileHeader {
        &self.header
    }

    /// The sorted index.
    #[must_use]
    pub fn records(&self) -> &[IndexedDiffRecord] {
        &self.records
    }

    /// Point lookup: the record covering logical block `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: u64) -> Option<&IndexedDiffRecord> {
        let i = self.records.partition_point(|r| r.end_io_address() <= addr);
        let rec = self.records.get(i)?;
        (rec.io_address <= addr).then_some(rec)
    }

    /// Sequential read: the next record converted to a plain record with
    /// its uncompressed payload. `None` when the index is exhausted.
    pub fn read_diff(&mut self) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        let Some(irec) = self.records.get(self.next).copied() else {
            return Ok(None);
        };
        self.next += 1;
        let (rec, data) = self.materialize(&irec)?;
        Ok(Some((rec, data)))
    }

    /// Turn an index record into `(DiffRecord, uncompressed payload)`.
    pub fn materialize(&mut self, irec: &IndexedDiffRecord) -> Result<(DiffRecord, Vec<u8>)> {
        let mut rec = DiffRecord::normal(irec.io_address, irec.io_blocks);
        if irec.is_all_zero() {
            rec.set_all_zero();
            return Ok((rec, Vec::new()));
        }
        if irec.is_discard() {
            rec.set_discard();
            return Ok((rec, Vec::new()));
        }
        let blob = self.read_blob(irec)?;
        let from = irec.io_offset as usize * LOGICAL_BLOCK_SIZE;
        let to = from + irec.io_blocks as usize * LOGICAL_BLOCK_SIZE;
        if to > blob.len() {
            return Err(Error::invalid_format(format!(
                "index record slice out of blob: {irec:?}"
            )));
        }
        let data = blob[from..to].to_vec();
        rec.data_size = data.len() as u32;
        rec.update_checksum(&data);
        Ok((rec, data))
    }

    fn read_blob(&mut self, irec: &IndexedDiffRecord) -> Result<&[u8]> {
        if self.cache.as_ref().map(|(off, _)| *off) != Some(irec.data_offset) {
            let mut raw = vec![0u8; irec.data_size as usize];
            self.input.seek(SeekFrom::Start(irec.data_offset))?;
            self.input.read_exact(&mut raw)?;
            let csum = sum32(&raw, 0);
            if csum != irec.io_checksum {
                return Err(Error::invalid_format(format!(
                    "blob checksum mismatch: rec {:08x} data {csum:08x}",
                    irec.io_checksum
                )));
            }
            let orig_size = irec.orig_blocks as usize * LOGICAL_BLOCK_SIZE;
            let blob = compress::uncompress(irec.compression, &raw, orig_size)?;
            self.cache = Some((irec.data_offset, blob));
        }
        Ok(&self.cache.as_ref().expect("cache filled above").1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn blocks(n: usize, fill: u8) -> Vec<u8> {
        vec![fill; n * LOGICAL_BLOCK_SIZE]
    }

    fn build_sample() -> Vec<u8> {
        let mut writer = IndexedDiffWriter::new(Vec::new());
        writer
            .write_header(&DiffFileHeader::new(DiffFormat::Indexed, [5; 16]))
            .unwrap();
        // Unsorted arrival order.
        writer
            .compress_and_write_diff(
                IndexedDiffRecord::normal(300, 4),
                &blocks(4, 0xcc),
                Compression::Lz4,
                0,
            )
            .unwrap();
        writer.write_diff(IndexedDiffRecord::all_zero(100, 8), &[]).unwrap();
        writer
            .compress_and_write_diff(
                IndexedDiffRecord::normal(0, 2),
                &blocks(2, 0x11),
                Compression::Zstd,
                0,
            )
            .unwrap();
        writer.write_diff(IndexedDiffRecord::discard(500, 16), &[]).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_roundtrip_sorted_on_read() {
        let buf = build_sample();
        let mut reader = IndexedDiffReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(reader.header().uuid, [5; 16]);
        let addrs: Vec<u64> = reader.records().iter().map(|r| r.io_address).collect();
        assert_eq!(addrs, vec![0, 100, 300, 500]);

        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 0);
        assert_eq!(data, blocks(2, 0x11));
        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert!(rec.is_all_zero());
        assert!(data.is_empty());
        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 300);
        assert_eq!(data, blocks(4, 0xcc));
        let (rec, _) = reader.read_diff().unwrap().unwrap();
        assert!(rec.is_discard());
        assert!(reader.read_diff().unwrap().is_none());
    }

    #[test]
    fn test_point_lookup() {
        let buf = build_sample();
        let reader = IndexedDiffReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(reader.lookup(0).unwrap().io_address, 0);
        assert_eq!(reader.lookup(1).unwrap().io_address, 0);
        assert!(reader.lookup(2).is_none());
        assert_eq!(reader.lookup(107).unwrap().io_address, 100);
        assert_eq!(reader.lookup(515).unwrap().io_address, 500);
        assert!(reader.lookup(516 + 15).is_none());
    }

    #[test]
    fn test_alias_records_share_a_blob() {
        let mut writer = IndexedDiffWriter::new(Vec::new());
        writer
            .write_header(&DiffFileHeader::new(DiffFormat::Indexed, [5; 16]))
            .unwrap();
        // One 8-block blob referenced by two 4-block slices.
        let mut data = blocks(4, 0xaa);
        data.extend_from_slice(&blocks(4, 0xbb));
        let mut first = IndexedDiffRecord::normal(1000, 4);
        first.orig_blocks = 8;
        writer.write_diff(first, &data).unwrap();
        let written = &writer.index[0];
        let mut second = IndexedDiffRecord::normal(1004, 4);
        second.orig_blocks = 8;
        second.io_offset = 4;
        second.data_offset = written.data_offset;
        second.data_size = written.data_size;
        second.io_checksum = written.io_checksum;
        writer.add_alias_record(second).unwrap();
        let buf = writer.finish().unwrap();

        let mut reader = IndexedDiffReader::new(Cursor::new(buf)).unwrap();
        let (rec, d) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 1000);
        assert_eq!(d, blocks(4, 0xaa));
        let (rec, d) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 1004);
        assert_eq!(d, blocks(4, 0xbb));
    }

    #[test]
    fn test_overlap_rejected_on_finish() {
        let mut writer = IndexedDiffWriter::new(Vec::new());
        writer
            .write_header(&DiffFileHeader::new(DiffFormat::Indexed, [5; 16]))
            .unwrap();
        writer.write_diff(IndexedDiffRecord::all_zero(0, 8), &[]).unwrap();
        writer.write_diff(IndexedDiffRecord::all_zero(4, 8), &[]).unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_footer_corruption_detected() {
        let mut buf = build_sample();
        let n = buf.len();
        buf[n - 3] ^= 1;
        assert!(IndexedDiffReader::new(Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_index_corruption_detected() {
        let mut buf = build_sample();
        let n = buf.len();
        // Inside the first index record.
        buf[n - INDEX_SUPER_SIZE - 4 * INDEXED_RECORD_SIZE + 9] ^= 1;
        assert!(IndexedDiffReader::new(Cursor::new(buf)).is_err());
    }
}
