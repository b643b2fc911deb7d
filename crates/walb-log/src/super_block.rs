// Copyright 2026 WalB Tools Dev
// SPDX-License-Identifier: Apache-2.0

//! The ldev super sector.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut};
use walb_core::checksum::{self, sum32};
use walb_core::{Error, Result, UUID_SIZE};

/// Sector type tag of a super sector.
pub const SUPER_SECTOR_TYPE: u16 = 0x000f;

const SUPER_VERSION: u16 = 1;
const NAME_SIZE: usize = 64;
const FIXED_SIZE: usize = 4 + 2 + 2 + 4 + 4 + 4 + 4 + UUID_SIZE + NAME_SIZE + 8 + 8 + 8 + 8;

/// The super sector of a log device.
///
/// Two copies live in the first two physical blocks; the ring buffer
/// starts right after them. `offset_from_lsid` maps an lsid to its
/// physical-block position inside the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pbs: u32,
    salt: u32,
    uuid: [u8; UUID_SIZE],
    name: String,
    ring_buffer_size: u64,
    oldest_lsid: u64,
    written_lsid: u64,
    device_size: u64,
}

impl SuperBlock {
    /// Build a fresh super sector for a device of `ldev_size_pb` physical
    /// blocks.
    pub fn format(
        pbs: u32,
        ldev_size_pb: u64,
        device_size_lb: u64,
        name: &str,
        uuid: [u8; UUID_SIZE],
        salt: u32,
    ) -> Result<Self> {
        if !pbs.is_power_of_two() || pbs < 512 {
            return Err(Error::invalid_format(format!("bad physical block size {pbs}")));
        }
        if (FIXED_SIZE as u32) > pbs {
            return Err(Error::invalid_format("pbs smaller than super sector".to_string()));
        }
        if ldev_size_pb <= Self::ring_buffer_offset_static() {
            return Err(Error::invalid_format("ldev too small for a ring buffer".to_string()));
        }
        if name.len() >= NAME_SIZE {
            return Err(Error::invalid_format(format!("device name too long: {name}")));
        }
        Ok(Self {
            pbs,
            salt,
            uuid,
            name: name.to_string(),
            ring_buffer_size: ldev_size_pb - Self::ring_buffer_offset_static(),
            oldest_lsid: 0,
            written_lsid: 0,
            device_size: device_size_lb,
        })
    }

    /// Physical block size in bytes.
    #[must_use]
    pub fn pbs(&self) -> u32 {
        self.pbs
    }

    /// Log checksum salt.
    #[must_use]
    pub fn salt(&self) -> u32 {
        self.salt
    }

    /// Device uuid.
    #[must_use]
    pub fn uuid(&self) -> [u8; UUID_SIZE] {
        self.uuid
    }

    /// Set the device uuid.
    pub fn set_uuid(&mut self, uuid: [u8; UUID_SIZE]) {
        self.uuid = uuid;
    }

    /// Device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ring buffer size in physical blocks.
    #[must_use]
    pub fn ring_buffer_size(&self) -> u64 {
        self.ring_buffer_size
    }

    /// The kernel's tail pointer: wlogs before this may be gone.
    #[must_use]
    pub fn oldest_lsid(&self) -> u64 {
        self.oldest_lsid
    }

    /// Watermark up to which log packs are durably on the device.
    #[must_use]
    pub fn written_lsid(&self) -> u64 {
        self.written_lsid
    }

    /// Data-device size in logical blocks.
    #[must_use]
    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    /// Advance the tail pointer.
    pub fn set_oldest_lsid(&mut self, lsid: u64) {
        self.oldest_lsid = lsid;
    }

    /// Advance the written watermark.
    pub fn set_written_lsid(&mut self, lsid: u64) {
        self.written_lsid = lsid;
    }

    /// Set the log checksum salt.
    pub fn set_salt(&mut self, salt: u32) {
        self.salt = salt;
    }

    fn ring_buffer_offset_static() -> u64 {
        2 // super sector copies at pb 0 and pb 1.
    }

    /// First physical block of the ring buffer.
    #[must_use]
    pub fn ring_buffer_offset(&self) -> u64 {
        Self::ring_buffer_offset_static()
    }

    /// Physical-block offset of `lsid` on the device.
    #[must_use]
    pub fn offset_from_lsid(&self, lsid: u64) -> u64 {
        self.ring_buffer_offset() + lsid % self.ring_buffer_size
    }

    /// Serialize one pbs-sized sector with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pbs as usize);
        buf.put_u32_le(0); // checksum, patched below
        buf.put_u16_le(SUPER_SECTOR_TYPE);
        buf.put_u16_le(SUPER_VERSION);
        buf.put_u32_le(512);
        buf.put_u32_le(self.pbs);
        buf.put_u32_le(0);
        buf.put_u32_le(self.salt);
        buf.put_slice(&self.uuid);
        let mut name = [0u8; NAME_SIZE];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf.put_slice(&name);
        buf.put_u64_le(self.ring_buffer_size);
        buf.put_u64_le(self.oldest_lsid);
        buf.put_u64_le(self.written_lsid);
        buf.put_u64_le(self.device_size);
        buf.resize(self.pbs as usize, 0);
        let csum = checksum::self_checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate one pbs-sized sector.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_SIZE {
            return Err(Error::invalid_format("short super sector".to_string()));
        }
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("super sector checksum mismatch".to_string()));
        }
        let mut c = data;
        let _checksum = c.get_u32_le();
        let sector_type = c.get_u16_le();
        if sector_type != SUPER_SECTOR_TYPE {
            return Err(Error::invalid_format(format!("bad sector type {sector_type:#x}")));
        }
        let version = c.get_u16_le();
        if version != SUPER_VERSION {
            return Err(Error::invalid_format(format!("unsupported super version {version}")));
        }
        let logical_bs = c.get_u32_le();
        if logical_bs != 512 {
            return Err(Error::invalid_format(format!("bad logical block size {logical_bs}")));
        }
        let pbs = c.get_u32_le();
        if pbs as usize != data.len() {
            return Err(Error::invalid_format("super sector size disagrees with pbs".to_string()));
        }
        let _metadata_size = c.get_u32_le();
        let salt = c.get_u32_le();
        let mut uuid = [0u8; UUID_SIZE];
        c.copy_to_slice(&mut uuid);
        let mut name_raw = [0u8; NAME_SIZE];
        c.copy_to_slice(&mut name_raw);
        let name_end = name_raw.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let name = String::from_utf8_lossy(&name_raw[..name_end]).into_owned();
        let ring_buffer_size = c.get_u64_le();
        let oldest_lsid = c.get_u64_le();
        let written_lsid = c.get_u64_le();
        let device_size = c.get_u64_le();
        if ring_buffer_size == 0 {
            return Err(Error::invalid_format("zero ring buffer".to_string()));
        }
        Ok(Self {
            pbs,
            salt,
            uuid,
            name,
            ring_buffer_size,
            oldest_lsid,
            written_lsid,
            device_size,
        })
    }

    /// Read a super sector from an ldev, trying the second copy if the
    /// first is torn.
    pub fn read_from(file: &mut File, pbs: u32) -> Result<Self> {
        let mut buf = vec![0u8; pbs as usize];
        for copy in 0..2u64 {
            file.seek(SeekFrom::Start(copy * u64::from(pbs)))?;
            if file.read_exact(&mut buf).is_err() {
                continue;
            }
            match Self::decode(&buf) {
                Ok(sb) => return Ok(sb),
                Err(e) => {
                    tracing::warn!(copy, error = %e, "super sector copy unreadable");
                }
            }
        }
        Err(Error::invalid_format("no valid super sector".to_string()))
    }

    /// Write both super sector copies and flush.
    pub fn write_to(&self, file: &mut File) -> Result<()> {
        let buf = self.encode();
        for copy in 0..2u64 {
            file.seek(SeekFrom::Start(copy * u64::from(self.pbs)))?;
            file.write_all(&buf)?;
        }
        file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Display for SuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "pbs: {}", self.pbs)?;
        writeln!(f, "salt: {:08x}", self.salt)?;
        writeln!(f, "ringBufferSize: {}", self.ring_buffer_size)?;
        writeln!(f, "oldestLsid: {}", self.oldest_lsid)?;
        writeln!(f, "writtenLsid: {}", self.written_lsid)?;
        write!(f, "deviceSize: {}", self.device_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        SuperBlock::format(512, 1026, 1 << 20, "wdev0", [3; 16], 0xfeed).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut sb = sample();
        sb.set_oldest_lsid(100);
        sb.set_written_lsid(345);
        let buf = sb.encode();
        assert_eq!(buf.len(), 512);
        let back = SuperBlock::decode(&buf).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn test_ring_offsets() {
        let sb = sample();
        assert_eq!(sb.ring_buffer_size(), 1024);
        assert_eq!(sb.offset_from_lsid(0), 2);
        assert_eq!(sb.offset_from_lsid(1023), 2 + 1023);
        // Wrap.
        assert_eq!(sb.offset_from_lsid(1024), 2);
        assert_eq!(sb.offset_from_lsid(1030), 2 + 6);
    }

    #[test]
    fn test_corruption_detected() {
        let mut buf = sample().encode();
        buf[40] ^= 1;
        assert!(SuperBlock::decode(&buf).is_err());
    }

    #[test]
    fn test_file_roundtrip_prefers_valid_copy() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ldev");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let sb = sample();
        sb.write_to(&mut file).unwrap();

        // Corrupt the first copy; the second still loads.
        use std::io::{Seek, SeekFrom, Write};
        file.seek(SeekFrom::Start(17)).unwrap();
        file.write_all(&[0xff; 8]).unwrap();
        let back = SuperBlock::read_from(&mut file, 512).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn test_format_validation() {
        assert!(SuperBlock::format(500, 1024, 0, "x", [0; 16], 0).is_err());
        assert!(SuperBlock::format(512, 2, 0, "x", [0; 16], 0).is_err());
        let long = "n".repeat(64);
        assert!(SuperBlock::format(512, 1024, 0, &long, [0; 16], 0).is_err());
    }
}
