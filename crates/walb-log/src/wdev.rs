//! The wdev control boundary.
//!
//! The kernel driver is out of scope; the core only consumes the small
//! control surface below. [`FileWdev`] realizes it over a regular file
//! formatted as a log device, which is what the tools and the test
//! suites drive.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walb_core::{Error, Result, UUID_SIZE};

use crate::pack::LogPackHeader;
use crate::super_block::SuperBlock;

/// Parameters of the device start control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WdevStartParams {
    /// Maximum log pack size in KiB.
    pub max_logpack_kb: u32,
    /// Maximum pending data in MiB.
    pub max_pending_mb: u32,
    /// Minimum pending data in MiB.
    pub min_pending_mb: u32,
    /// Queue stopping period in milliseconds.
    pub queue_stop_timeout_ms: u32,
    /// Log flush interval size in MiB.
    pub log_flush_interval_mb: u32,
    /// Log flush interval period in milliseconds.
    pub log_flush_interval_ms: u32,
    /// Number of packs in bulk.
    pub n_pack_bulk: u32,
    /// Number of IOs in bulk.
    pub n_io_bulk: u32,
}

impl Default for WdevStartParams {
    fn default() -> Self {
        Self {
            max_logpack_kb: 32,
            max_pending_mb: 32,
            min_pending_mb: 16,
            queue_stop_timeout_ms: 100,
            log_flush_interval_mb: 16,
            log_flush_interval_ms: 100,
            n_pack_bulk: 128,
            n_io_bulk: 1024,
        }
    }
}

/// The control operations the core issues against a wdev.
pub trait WdevOps: Send + Sync {
    /// Physical block size of the log device.
    fn pbs(&self) -> Result<u32>;
    /// Device uuid from the super sector.
    fn uuid(&self) -> Result<[u8; UUID_SIZE]>;
    /// The kernel's tail pointer.
    fn get_oldest_lsid(&self) -> Result<u64>;
    /// Watermark up to which log packs are durable on the ldev.
    fn get_permanent_lsid(&self) -> Result<u64>;
    /// Whether the log ring has overflowed.
    fn is_overflow(&self) -> Result<bool>;
    /// Release wlogs before `lsid` (advance the tail pointer).
    fn erase_wal(&self, lsid: u64) -> Result<()>;
    /// Discard all wlogs and restart the log from lsid 0 with a fresh
    /// uuid.
    fn reset_wal(&self) -> Result<()>;
    /// Start the device.
    fn start(&self, params: &WdevStartParams) -> Result<()>;
    /// Stop the device.
    fn stop(&self) -> Result<()>;
    /// Ring buffer capacity in physical blocks.
    fn log_capacity_pb(&self) -> Result<u64>;
    /// Occupied part of the ring in physical blocks.
    fn log_usage_pb(&self) -> Result<u64>;
}

/// Sidecar control state of a [`FileWdev`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CtlState {
    running: bool,
    overflow: bool,
    params: Option<WdevStartParams>,
}

/// An entry appended to a [`FileWdev`] log.
#[derive(Debug, Clone)]
pub enum WlogEntry {
    /// A write of `data` at `offset` logical blocks.
    Write {
        /// Offset on the data device, logical blocks.
        offset: u64,
        /// Payload; length must be a multiple of 512.
        data: Vec<u8>,
    },
    /// A discard of `io_size` logical blocks at `offset`.
    Discard {
        /// Offset on the data device, logical blocks.
        offset: u64,
        /// Size in logical blocks.
        io_size: u32,
    },
}

/// A log device backed by a regular file.
///
/// The super sector is the source of truth for the lsid counters; the
/// running/overflow bits live in a sidecar file next to the image.
/// [`FileWdev::append_pack`] plays the role of the kernel journaling
/// writes, which is how the tools and tests produce wlogs.
pub struct FileWdev {
    path: PathBuf,
    pbs: u32,
}

impl FileWdev {
    /// Create and format a device image.
    pub fn format(
        path: &Path,
        pbs: u32,
        ldev_size_pb: u64,
        device_size_lb: u64,
        name: &str,
    ) -> Result<Self> {
        let uuid = *uuid_v4().as_bytes();
        let salt = u32::from_le_bytes(uuid_v4().as_bytes()[..4].try_into().expect("4 bytes"));
        let sb = SuperBlock::format(pbs, ldev_size_pb, device_size_lb, name, uuid, salt)?;
        let mut file =
            OpenOptions::new().create(true).truncate(true).read(true).write(true).open(path)?;
        file.set_len(ldev_size_pb * u64::from(pbs))?;
        sb.write_to(&mut file)?;
        let wdev = Self { path: path.to_path_buf(), pbs };
        wdev.save_ctl(&CtlState::default())?;
        Ok(wdev)
    }

    /// Open an existing device image, probing the physical block size.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        for pbs in [512u32, 4096] {
            let mut buf = vec![0u8; pbs as usize];
            file.seek(SeekFrom::Start(0))?;
            if file.read_exact(&mut buf).is_err() {
                continue;
            }
            if SuperBlock::decode(&buf).is_ok() {
                return Ok(Self { path: path.to_path_buf(), pbs });
            }
        }
        Err(Error::invalid_format(format!("not a walb ldev image: {}", path.display())))
    }

    /// Path of the device image.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Physical block size.
    #[must_use]
    pub fn pbs(&self) -> u32 {
        self.pbs
    }

    /// Read the current super sector from disk.
    pub fn super_block(&self) -> Result<SuperBlock> {
        let mut file = File::open(&self.path)?;
        SuperBlock::read_from(&mut file, self.pbs)
    }

    fn update_super(&self, f: impl FnOnce(&mut SuperBlock)) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut sb = SuperBlock::read_from(&mut file, self.pbs)?;
        f(&mut sb);
        sb.write_to(&mut file)
    }

    fn ctl_path(&self) -> PathBuf {
        let mut p = self.path.clone().into_os_string();
        p.push(".ctl");
        PathBuf::from(p)
    }

    fn load_ctl(&self) -> Result<CtlState> {
        match std::fs::read(self.ctl_path()) {
            Ok(data) => bincode::deserialize(&data)
                .map_err(|e| Error::invalid_format(format!("wdev control state: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CtlState::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn save_ctl(&self, state: &CtlState) -> Result<()> {
        let data = bincode::serialize(state)
            .map_err(|e| Error::internal(format!("wdev control state: {e}")))?;
        std::fs::write(self.ctl_path(), data)?;
        Ok(())
    }

    /// Append one log pack, playing the kernel's role.
    ///
    /// Returns the lsid of the appended pack. Fails with `Overflow` when
    /// the ring has no room, leaving the overflow flag set until
    /// [`WdevOps::reset_wal`].
    pub fn append_pack(&self, entries: &[WlogEntry]) -> Result<u64> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let mut sb = SuperBlock::read_from(&mut file, self.pbs)?;
        let lsid = sb.written_lsid();

        let mut pack = LogPackHeader::new(self.pbs, sb.salt(), lsid);
        let mut data_blocks: Vec<u8> = Vec::new();
        for entry in entries {
            match entry {
                WlogEntry::Write { offset, data } => {
                    if data.is_empty() || data.len() % walb_core::LOGICAL_BLOCK_SIZE != 0 {
                        return Err(Error::internal("bad wlog write payload".to_string()));
                    }
                    let io_size = (data.len() / walb_core::LOGICAL_BLOCK_SIZE) as u32;
                    if !pack.add_normal(*offset, io_size, data)? {
                        return Err(Error::internal("too many records for one pack".to_string()));
                    }
                    data_blocks.extend_from_slice(data);
                    // Pad to the physical block boundary.
                    let rem = data_blocks.len() % self.pbs as usize;
                    if rem != 0 {
                        data_blocks.resize(data_blocks.len() + self.pbs as usize - rem, 0);
                    }
                }
                WlogEntry::Discard { offset, io_size } => {
                    if !pack.add_discard(*offset, *io_size) {
                        return Err(Error::internal("too many records for one pack".to_string()));
                    }
                }
            }
        }

        let need_pb = 1 + pack.total_io_size_pb();
        let used_pb = sb.written_lsid() - sb.oldest_lsid();
        if used_pb + need_pb > sb.ring_buffer_size() {
            let mut ctl = self.load_ctl()?;
            ctl.overflow = true;
            self.save_ctl(&ctl)?;
            return Err(Error::Overflow(format!("ring full at lsid {lsid}")));
        }

        self.write_pb(&file, &sb, lsid, &pack.encode())?;
        if !data_blocks.is_empty() {
            self.write_pb(&file, &sb, lsid + 1, &data_blocks)?;
        }
        file.sync_data()?;
        sb.set_written_lsid(pack.next_logpack_lsid());
        sb.write_to(&mut file)?;
        Ok(lsid)
    }

    /// Write `data` (a whole number of physical blocks) starting at
    /// `lsid`, wrapping around the ring.
    fn write_pb(&self, file: &File, sb: &SuperBlock, lsid: u64, data: &[u8]) -> Result<()> {
        let pbs = self.pbs as usize;
        for (i, chunk) in data.chunks(pbs).enumerate() {
            let off = sb.offset_from_lsid(lsid + i as u64) * u64::from(self.pbs);
            file.write_all_at(chunk, off)?;
        }
        Ok(())
    }
}

impl WdevOps for FileWdev {
    fn pbs(&self) -> Result<u32> {
        Ok(self.pbs)
    }

    fn uuid(&self) -> Result<[u8; UUID_SIZE]> {
        Ok(self.super_block()?.uuid())
    }

    fn get_oldest_lsid(&self) -> Result<u64> {
        Ok(self.super_block()?.oldest_lsid())
    }

    fn get_permanent_lsid(&self) -> Result<u64> {
        Ok(self.super_block()?.written_lsid())
    }

    fn is_overflow(&self) -> Result<bool> {
        Ok(self.load_ctl()?.overflow)
    }

    fn erase_wal(&self, lsid: u64) -> Result<()> {
        self.update_super(|sb| {
            let clamped = lsid.min(sb.written_lsid());
            if clamped > sb.oldest_lsid() {
                sb.set_oldest_lsid(clamped);
            }
        })
    }

    fn reset_wal(&self) -> Result<()> {
        self.update_super(|sb| {
            sb.set_oldest_lsid(0);
            sb.set_written_lsid(0);
            sb.set_uuid(*uuid_v4().as_bytes());
        })?;
        let mut ctl = self.load_ctl()?;
        ctl.overflow = false;
        self.save_ctl(&ctl)
    }

    fn start(&self, params: &WdevStartParams) -> Result<()> {
        let mut ctl = self.load_ctl()?;
        if ctl.running {
            return Err(Error::bad_state("device already running".to_string()));
        }
        ctl.running = true;
        ctl.params = Some(params.clone());
        self.save_ctl(&ctl)
    }

    fn stop(&self) -> Result<()> {
        let mut ctl = self.load_ctl()?;
        if !ctl.running {
            return Err(Error::bad_state("device not running".to_string()));
        }
        ctl.running = false;
        self.save_ctl(&ctl)
    }

    fn log_capacity_pb(&self) -> Result<u64> {
        Ok(self.super_block()?.ring_buffer_size())
    }

    fn log_usage_pb(&self) -> Result<u64> {
        let sb = self.super_block()?;
        Ok(sb.written_lsid() - sb.oldest_lsid())
    }
}

fn uuid_v4() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mkdev(dir: &TempDir, ring_pb: u64) -> FileWdev {
        FileWdev::format(&dir.path().join("ldev"), 512, ring_pb + 2, 1 << 20, "wdev0").unwrap()
    }

    #[test]
    fn test_format_open() {
        let dir = TempDir::new().unwrap();
        let wdev = mkdev(&dir, 64);
        let reopened = FileWdev::open(wdev.path()).unwrap();
        assert_eq!(reopened.pbs(), 512);
        assert_eq!(reopened.uuid().unwrap(), wdev.uuid().unwrap());
    }

    #[test]
    fn test_append_advances_lsids() {
        let dir = TempDir::new().unwrap();
        let wdev = mkdev(&dir, 64);
        assert_eq!(wdev.get_permanent_lsid().unwrap(), 0);
        let lsid = wdev
            .append_pack(&[WlogEntry::Write { offset: 0, data: vec![1u8; 1024] }])
            .unwrap();
        assert_eq!(lsid, 0);
        // Header + 2 lb of data at pbs 512 = 3 pb.
        assert_eq!(wdev.get_permanent_lsid().unwrap(), 3);
        assert_eq!(wdev.get_oldest_lsid().unwrap(), 0);
    }

    #[test]
    fn test_erase_wal() {
        let dir = TempDir::new().unwrap();
        let wdev = mkdev(&dir, 64);
        wdev.append_pack(&[WlogEntry::Write { offset: 0, data: vec![1u8; 512] }]).unwrap();
        wdev.erase_wal(2).unwrap();
        assert_eq!(wdev.get_oldest_lsid().unwrap(), 2);
        // Clamped to the written watermark.
        wdev.erase_wal(1000).unwrap();
        assert_eq!(wdev.get_oldest_lsid().unwrap(), wdev.get_permanent_lsid().unwrap());
    }

    #[test]
    fn test_overflow_and_reset() {
        let dir = TempDir::new().unwrap();
        let wdev = mkdev(&dir, 8);
        // Each pack needs 1 + 2 pb.
        wdev.append_pack(&[WlogEntry::Write { offset: 0, data: vec![1u8; 1024] }]).unwrap();
        wdev.append_pack(&[WlogEntry::Write { offset: 8, data: vec![2u8; 1024] }]).unwrap();
        let err = wdev
            .append_pack(&[WlogEntry::Write { offset: 16, data: vec![3u8; 1024] }])
            .unwrap_err();
        assert!(matches!(err, Error::Overflow(_)));
        assert!(wdev.is_overflow().unwrap());

        let uuid_before = wdev.uuid().unwrap();
        wdev.reset_wal().unwrap();
        assert!(!wdev.is_overflow().unwrap());
        assert_eq!(wdev.get_permanent_lsid().unwrap(), 0);
        assert_ne!(wdev.uuid().unwrap(), uuid_before);
    }

    #[test]
    fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let wdev = mkdev(&dir, 16);
        wdev.start(&WdevStartParams::default()).unwrap();
        assert!(wdev.start(&WdevStartParams::default()).is_err());
        wdev.stop().unwrap();
        assert!(wdev.stop().is_err());
    }
}
