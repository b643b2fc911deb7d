//! Synchronous ring-buffer reader.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use walb_core::Result;

use crate::pack::LogPackHeader;
use crate::super_block::SuperBlock;
use crate::wdev::FileWdev;

/// Reads log packs from an ldev with plain positional reads.
///
/// Each physical block is addressed through the ring, so wraps need no
/// special casing beyond the modular offset math.
pub struct WldevReader {
    file: File,
    super_block: SuperBlock,
    lsid: u64,
}

impl WldevReader {
    /// Open an ldev image for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let wdev = FileWdev::open(path)?;
        Self::from_wdev(&wdev)
    }

    /// Attach to an open device.
    pub fn from_wdev(wdev: &FileWdev) -> Result<Self> {
        let super_block = wdev.super_block()?;
        let file = File::open(wdev.path())?;
        let lsid = super_block.oldest_lsid();
        Ok(Self { file, super_block, lsid })
    }

    /// The device super sector as read at open time.
    #[must_use]
    pub fn super_block(&self) -> &SuperBlock {
        &self.super_block
    }

    /// The lsid the next [`WldevReader::read_pack`] will read.
    #[must_use]
    pub fn current_lsid(&self) -> u64 {
        self.lsid
    }

    /// Restart reading from `lsid`.
    pub fn reset(&mut self, lsid: u64) {
        self.lsid = lsid;
    }

    /// Read `n` physical blocks starting at `lsid` without advancing the
    /// cursor.
    pub fn read_pb_at(&self, lsid: u64, n: usize) -> Result<Vec<u8>> {
        let pbs = self.super_block.pbs() as usize;
        let mut out = vec![0u8; n * pbs];
        for i in 0..n {
            let off = self.super_block.offset_from_lsid(lsid + i as u64)
                * u64::from(self.super_block.pbs());
            self.file.read_exact_at(&mut out[i * pbs..(i + 1) * pbs], off)?;
        }
        Ok(out)
    }

    /// Read the pack at the cursor and advance past it.
    ///
    /// Fails with `InvalidFormat` on a bad pack header or data checksum;
    /// callers bound reading by the permanent lsid, so a bad block inside
    /// the bound is corruption, not end of log.
    pub fn read_pack(&mut self) -> Result<(LogPackHeader, Vec<Vec<u8>>)> {
        let header_block = self.read_pb_at(self.lsid, 1)?;
        let pack = LogPackHeader::decode(
            &header_block,
            self.super_block.pbs(),
            self.super_block.salt(),
            self.lsid,
        )?;
        let data_region = self.read_pb_at(self.lsid + 1, pack.total_io_size_pb() as usize)?;
        let payloads = pack.extract_record_data(&data_region)?;
        self.lsid = pack.next_logpack_lsid();
        Ok((pack, payloads))
    }
}
