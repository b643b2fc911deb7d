//! Wlog to wdiff conversion.

use std::io::Write;

use walb_core::checksum::is_all_zero;
use walb_core::{Compression, Error, Result, UUID_SIZE};
use walb_diff::{
    DiffFileHeader, DiffFormat, DiffMemory, DiffRecord, IndexedDiffRecord, IndexedDiffWriter,
    SortedDiffWriter,
};

use crate::pack::LogPackHeader;

/// Converts an ordered stream of log packs into a wdiff.
///
/// Packs must arrive in lsid order: later writes overwrite earlier ones
/// through the diff-memory overlap resolution. The whole range is
/// buffered before writing, which keeps the sorted output globally
/// sorted.
pub struct WlogConverter {
    mem: DiffMemory,
}

impl WlogConverter {
    /// A converter splitting output records to at most `max_io_blocks`
    /// logical blocks (0 disables splitting).
    #[must_use]
    pub fn new(max_io_blocks: u32) -> Self {
        Self { mem: DiffMemory::new(max_io_blocks) }
    }

    /// Number of buffered diff entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Whether nothing has been buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Feed one log pack.
    pub fn add_pack(&mut self, pack: &LogPackHeader, payloads: &[Vec<u8>]) -> Result<()> {
        if payloads.len() != pack.n_records() {
            return Err(Error::internal("payload count mismatch".to_string()));
        }
        for (rec, payload) in pack.records().iter().zip(payloads) {
            if rec.is_padding() {
                continue;
            }
            if rec.is_discard() {
                self.mem
                    .add(DiffRecord::discard(rec.offset, rec.io_size_lb()), Vec::new())?;
                continue;
            }
            if is_all_zero(payload) {
                self.mem
                    .add(DiffRecord::all_zero(rec.offset, rec.io_size_lb()), Vec::new())?;
                continue;
            }
            let mut drec = DiffRecord::normal(rec.offset, rec.io_size_lb());
            drec.update_checksum(payload);
            self.mem.add(drec, payload.clone())?;
        }
        Ok(())
    }

    /// Write the buffered diff as a sorted wdiff.
    pub fn write_sorted<W: Write>(
        self,
        out: W,
        uuid: [u8; UUID_SIZE],
        compression: Compression,
    ) -> Result<W> {
        let mut writer = SortedDiffWriter::new(out);
        writer.write_header(&DiffFileHeader::new(DiffFormat::Sorted, uuid))?;
        self.mem.write_to(&mut writer, compression)?;
        writer.close()
    }

    /// Write the buffered diff as an indexed wdiff.
    pub fn write_indexed<W: Write>(
        self,
        out: W,
        uuid: [u8; UUID_SIZE],
        compression: Compression,
    ) -> Result<W> {
        let mut writer = IndexedDiffWriter::new(out);
        writer.write_header(&DiffFileHeader::new(DiffFormat::Indexed, uuid))?;
        for entry in self.mem.iter() {
            let rec = entry.record();
            let irec = if rec.is_all_zero() {
                IndexedDiffRecord::all_zero(rec.io_address, rec.io_blocks)
            } else if rec.is_discard() {
                IndexedDiffRecord::discard(rec.io_address, rec.io_blocks)
            } else {
                IndexedDiffRecord::normal(rec.io_address, rec.io_blocks)
            };
            writer.compress_and_write_diff(irec, entry.io(), compression, 0)?;
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walb_core::LOGICAL_BLOCK_SIZE;
    use walb_diff::{IndexedDiffReader, SortedDiffReader};

    fn feed_sample(conv: &mut WlogConverter) {
        let salt = 1;
        let mut p0 = LogPackHeader::new(512, salt, 0);
        p0.add_normal(100, 2, &vec![0xaa; 1024]).unwrap();
        p0.add_discard(300, 8);
        p0.add_normal(200, 1, &vec![0x00; 512]).unwrap();
        let d0 = vec![vec![0xaa; 1024], Vec::new(), vec![0x00; 512]];
        conv.add_pack(&p0, &d0).unwrap();

        // A later pack overwrites part of the first write.
        let mut p1 = LogPackHeader::new(512, salt, p0.next_logpack_lsid());
        p1.add_normal(101, 1, &vec![0xbb; 512]).unwrap();
        conv.add_pack(&p1, &[vec![0xbb; 512]]).unwrap();
    }

    #[test]
    fn test_convert_to_sorted() {
        let mut conv = WlogConverter::new(0);
        feed_sample(&mut conv);
        let buf = conv.write_sorted(Vec::new(), [7; 16], Compression::Snappy).unwrap();

        let mut reader = SortedDiffReader::new(buf.as_slice());
        let header = reader.read_header().unwrap();
        assert_eq!(header.uuid, [7; 16]);
        let mut got = Vec::new();
        while let Some((rec, data)) = reader.read_and_uncompress_diff().unwrap() {
            got.push((rec.io_address, rec.io_blocks, rec.is_discard(), rec.is_all_zero(), data));
        }
        // (100,1) normal 0xaa, (101,1) normal 0xbb, (200,1) allzero,
        // (300,8) discard.
        assert_eq!(got.len(), 4);
        assert_eq!((got[0].0, got[0].1), (100, 1));
        assert!(got[0].4.iter().all(|&b| b == 0xaa));
        assert_eq!((got[1].0, got[1].1), (101, 1));
        assert!(got[1].4.iter().all(|&b| b == 0xbb));
        assert!(got[2].3, "all-zero write becomes an ALLZERO record");
        assert!(got[3].2, "discard log becomes a DISCARD record");
    }

    #[test]
    fn test_convert_to_indexed() {
        let mut conv = WlogConverter::new(0);
        feed_sample(&mut conv);
        let buf = conv.write_indexed(Vec::new(), [7; 16], Compression::Lz4).unwrap();
        let mut reader = IndexedDiffReader::new(std::io::Cursor::new(buf)).unwrap();
        let addrs: Vec<u64> = reader.records().iter().map(|r| r.io_address).collect();
        assert_eq!(addrs, vec![100, 101, 200, 300]);
        let (rec, data) = reader.read_diff().unwrap().unwrap();
        assert_eq!(rec.io_address, 100);
        assert_eq!(data.len(), LOGICAL_BLOCK_SIZE);
    }

    #[test]
    fn test_split_to_max_io_blocks() {
        let mut conv = WlogConverter::new(4);
        let mut pack = LogPackHeader::new(512, 0, 0);
        pack.add_normal(1000, 10, &vec![0x42; 10 * LOGICAL_BLOCK_SIZE]).unwrap();
        conv.add_pack(&pack, &[vec![0x42; 10 * LOGICAL_BLOCK_SIZE]]).unwrap();
        let buf = conv.write_sorted(Vec::new(), [0; 16], Compression::None).unwrap();

        let mut reader = SortedDiffReader::new(buf.as_slice());
        reader.read_header().unwrap();
        let mut sizes = Vec::new();
        while let Some((rec, _)) = reader.read_diff().unwrap() {
            sizes.push((rec.io_address, rec.io_blocks));
        }
        assert_eq!(sizes, vec![(1000, 4), (1004, 4), (1008, 2)]);
    }
}
