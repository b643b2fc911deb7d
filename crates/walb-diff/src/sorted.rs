//! Sorted wdiff reader and writer.
//!
//! The sorted format is streaming and append-only: header, then packs of
//! records + payloads, then a terminator pack with the END flag.

use std::collections::VecDeque;
use std::io::{Read, Write};

use walb_core::checksum::sum32;
use walb_core::{compress, Compression, Error, Result};

use crate::header::{DiffFileHeader, DIFF_FILE_HEADER_SIZE};
use crate::pack::{DiffPackHeader, DIFF_PACK_SIZE};
use crate::record::DiffRecord;

/// Streaming writer of the sorted format.
///
/// Records must be fed in strictly increasing address order; the writer
/// flushes the current pack whenever the next record would exceed the
/// record-count or payload-size bound.
pub struct SortedDiffWriter<W: Write> {
    out: W,
    pack: DiffPackHeader,
    payloads: VecDeque<Vec<u8>>,
    wrote_header: bool,
    closed: bool,
}

impl<W: Write> SortedDiffWriter<W> {
    /// Wrap an output stream.
    pub fn new(out: W) -> Self {
        Self {
            out,
            pack: DiffPackHeader::new(),
            payloads: VecDeque::new(),
            wrote_header: false,
            closed: false,
        }
    }

    /// Write the file header. Must be called exactly once, first.
    pub fn write_header(&mut self, header: &DiffFileHeader) -> Result<()> {
        if self.wrote_header {
            return Err(Error::internal("header already written".to_string()));
        }
        self.out.write_all(&header.encode())?;
        self.wrote_header = true;
        Ok(())
    }

    /// Append one record with its stored payload (compressed or not).
    ///
    /// For a normal record `data.len()` must equal `rec.data_size` and
    /// `rec.checksum` must already cover `data`.
    pub fn write_diff(&mut self, rec: DiffRecord, data: Vec<u8>) -> Result<()> {
        if !self.wrote_header {
            return Err(Error::internal("write_header must be called first".to_string()));
        }
        rec.verify()?;
        if rec.data_size as usize != data.len() {
            return Err(Error::internal(format!(
                "payload size mismatch: rec {} data {}",
                rec.data_size,
                data.len()
            )));
        }
        if !self.pack.add(rec) {
            self.flush_pack()?;
            if !self.pack.add(rec) {
                return Err(Error::internal("record does not fit an empty pack".to_string()));
            }
        }
        self.payloads.push_back(data);
        Ok(())
    }

    /// Compress (if not already) and append one record.
    pub fn compress_and_write_diff(
        &mut self,
        rec: DiffRecord,
        data: &[u8],
        ty: Compression,
        level: i32,
    ) -> Result<()> {
        if !rec.is_normal() || rec.is_compressed() || !ty.is_compressed() {
            return self.write_diff(rec, data.to_vec());
        }
        let packed = compress::compress(ty, data, level)?;
        let mut out_rec = rec;
        out_rec.compression = ty;
        out_rec.data_size = packed.len() as u32;
        out_rec.update_checksum(&packed);
        self.write_diff(out_rec, packed)
    }

    /// Write the buffered pack, if any.
    pub fn flush_pack(&mut self) -> Result<()> {
        if self.pack.is_empty() {
            return Ok(());
        }
        self.out.write_all(&self.pack.encode())?;
        while let Some(data) = self.payloads.pop_front() {
            self.out.write_all(&data)?;
        }
        self.pack.clear();
        Ok(())
    }

    /// Flush and write the terminator pack, returning the inner stream.
    pub fn close(mut self) -> Result<W> {
        if self.closed {
            return Err(Error::internal("writer already closed".to_string()));
        }
        self.flush_pack()?;
        self.out.write_all(&DiffPackHeader::end().encode())?;
        self.out.flush()?;
        self.closed = true;
        Ok(self.out)
    }
}

/// Streaming reader of the sorted format.
pub struct SortedDiffReader<R: Read> {
    input: R,
    pack: DiffPackHeader,
    rec_idx: usize,
    read_header: bool,
    reached_end: bool,
}

impl<R: Read> SortedDiffReader<R> {
    /// Wrap an input stream.
    pub fn new(input: R) -> Self {
        Self {
            input,
            pack: DiffPackHeader::new(),
            rec_idx: 0,
            read_header: false,
            reached_end: false,
        }
    }

    /// Read and validate the file header. Must be called exactly once,
    /// first.
    pub fn read_header(&mut self) -> Result<DiffFileHeader> {
        if self.read_header {
            return Err(Error::internal("header already read".to_string()));
        }
        let mut buf = [0u8; DIFF_FILE_HEADER_SIZE];
        self.input.read_exact(&mut buf)?;
        let header = DiffFileHeader::decode(&buf)?;
        self.read_header = true;
        Ok(header)
    }

    /// Read the next record and its stored payload.
    ///
    /// Returns `None` at the terminator pack (or clean end of stream).
    pub fn read_diff(&mut self) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        if !self.read_header {
            return Err(Error::internal("read_header must be called first".to_string()));
        }
        if self.reached_end {
            return Ok(None);
        }
        if self.rec_idx == self.pack.n_records() && !self.read_pack()? {
            return Ok(None);
        }
        let rec = self.pack.records()[self.rec_idx];
        let mut data = vec![0u8; rec.data_size as usize];
        if !data.is_empty() {
            self.input.read_exact(&mut data)?;
            let csum = sum32(&data, 0);
            if csum != rec.checksum {
                return Err(Error::invalid_format(format!(
                    "diff payload checksum mismatch: rec {:08x} data {csum:08x}",
                    rec.checksum
                )));
            }
        }
        self.rec_idx += 1;
        Ok(Some((rec, data)))
    }

    /// Like [`read_diff`](Self::read_diff) but returns uncompressed
    /// payload; the record's compression is cleared and its size and
    /// checksum recomputed.
    pub fn read_and_uncompress_diff(&mut self) -> Result<Option<(DiffRecord, Vec<u8>)>> {
        let Some((mut rec, data)) = self.read_diff()? else {
            return Ok(None);
        };
        if !rec.is_compressed() {
            return Ok(Some((rec, data)));
        }
        let orig_size = rec.io_blocks as usize * walb_core::LOGICAL_BLOCK_SIZE;
        let raw = compress::uncompress(rec.compression, &data, orig_size)?;
        rec.compression = Compression::None;
        rec.data_size = raw.len() as u32;
        rec.update_checksum(&raw);
        Ok(Some((rec, raw)))
    }

    fn read_pack(&mut self) -> Result<bool> {
        let mut buf = vec![0u8; DIFF_PACK_SIZE];
        match read_exact_or_eof(&mut self.input, &mut buf)? {
            false => {
                // Clean end of stream without a terminator pack; tolerated
                // so a truncated-but-pack-aligned stream still drains.
                self.reached_end = true;
                return Ok(false);
            }
            true => {}
        }
        let pack = DiffPackHeader::decode(&buf)?;
        if pack.is_end() {
            self.reached_end = true;
            return Ok(false);
        }
        self.pack = pack;
        self.rec_idx = 0;
        Ok(true)
    }
}

/// Read exactly `buf.len()` bytes, or return `false` on a clean EOF at
/// offset zero. A partial block is an error.
fn read_exact_or_eof<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::invalid_format("truncated diff pack".to_string()));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::DiffFormat;
    use walb_core::LOGICAL_BLOCK_SIZE;

    fn test_header() -> DiffFileHeader {
        DiffFileHeader::new(DiffFormat::Sorted, [9u8; 16])
    }

    fn payload(blocks: usize, fill: u8) -> Vec<u8> {
        vec![fill; blocks * LOGICAL_BLOCK_SIZE]
    }

    fn write_sample(compressed: bool) -> Vec<u8> {
        let mut writer = SortedDiffWriter::new(Vec::new());
        writer.write_header(&test_header()).unwrap();

        let data = payload(4, 0xaa);
        let mut rec = DiffRecord::normal(100, 4);
        rec.update_checksum(&data);
        if compressed {
            writer
                .compress_and_write_diff(rec, &data, Compression::Snappy, 0)
                .unwrap();
        } else {
            writer.write_diff(rec, data).unwrap();
        }

        writer.write_diff(DiffRecord::all_zero(200, 8), Vec::new()).unwrap();
        writer.write_diff(DiffRecord::discard(300, 16), Vec::new()).unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let buf = write_sample(false);
        let mut reader = SortedDiffReader::new(buf.as_slice());
        let header = reader.read_header().unwrap();
        assert_eq!(header, test_header());

        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 100);
        assert_eq!(data, payload(4, 0xaa));

        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert!(rec.is_all_zero());
        assert!(data.is_empty());

        let (rec, _) = reader.read_diff().unwrap().unwrap();
        assert!(rec.is_discard());

        assert!(reader.read_diff().unwrap().is_none());
        // Idempotent at end.
        assert!(reader.read_diff().unwrap().is_none());
    }

    #[test]
    fn test_compressed_roundtrip() {
        let buf = write_sample(true);
        let mut reader = SortedDiffReader::new(buf.as_slice());
        reader.read_header().unwrap();
        let (rec, data) = reader.read_and_uncompress_diff().unwrap().unwrap();
        assert!(!rec.is_compressed());
        assert_eq!(rec.data_size as usize, 4 * LOGICAL_BLOCK_SIZE);
        assert_eq!(data, payload(4, 0xaa));
    }

    #[test]
    fn test_payload_corruption_detected() {
        let mut buf = write_sample(false);
        // Flip a byte inside the first payload (after header + pack).
        let off = DIFF_FILE_HEADER_SIZE + DIFF_PACK_SIZE + 17;
        buf[off] ^= 1;
        let mut reader = SortedDiffReader::new(buf.as_slice());
        reader.read_header().unwrap();
        assert!(reader.read_diff().is_err());
    }

    #[test]
    fn test_pack_flushes_when_full() {
        let mut writer = SortedDiffWriter::new(Vec::new());
        writer.write_header(&test_header()).unwrap();
        // More records than fit a single pack.
        let n = crate::pack::MAX_N_RECORDS_IN_PACK + 5;
        for i in 0..n {
            writer
                .write_diff(DiffRecord::all_zero(i as u64 * 10, 1), Vec::new())
                .unwrap();
        }
        let buf = writer.close().unwrap();
        let mut reader = SortedDiffReader::new(buf.as_slice());
        reader.read_header().unwrap();
        let mut count = 0;
        while reader.read_diff().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, n);
    }

    #[test]
    fn test_truncated_stream() {
        let buf = write_sample(false);
        // Drop the terminator pack and half the last payload.
        let cut = buf.len() - DIFF_PACK_SIZE - 7;
        let mut reader = SortedDiffReader::new(&buf[..cut]);
        reader.read_header().unwrap();
        // First record still reads; further reads hit the torn stream.
        let mut saw_error = false;
        loop {
            match reader.read_diff() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }
}
