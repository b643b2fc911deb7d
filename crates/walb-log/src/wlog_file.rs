//! Portable wlog stream format.
//!
//! Tools exchange extracted wlogs as a flat stream: a 64-byte header
//! followed by log packs (header block + data region each), ending at
//! EOF. This is what `wlog-show` and `wlog-to-wdiff` consume.

use std::io::{Read, Write};

use bytes::{Buf, BufMut};
use walb_core::checksum::{self, sum32};
use walb_core::{Error, Result, UUID_SIZE};

use crate::pack::LogPackHeader;

const WLOG_MAGIC: u32 = 0x474f_4c57; // "WLOG"
const WLOG_VERSION: u16 = 1;
const HEADER_SIZE: usize = 64;

/// Header of a wlog stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WlogFileHeader {
    /// Physical block size of the originating device.
    pub pbs: u32,
    /// Log checksum salt of the originating device.
    pub salt: u32,
    /// Device uuid.
    pub uuid: [u8; UUID_SIZE],
    /// First lsid in the stream.
    pub begin_lsid: u64,
    /// One past the last lsid in the stream.
    pub end_lsid: u64,
}

impl WlogFileHeader {
    /// Serialize with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut c = &mut buf[..];
            c.put_u32_le(0); // checksum, patched below
            c.put_u32_le(WLOG_MAGIC);
            c.put_u16_le(WLOG_VERSION);
            c.put_u16_le(0);
            c.put_u32_le(self.pbs);
            c.put_u32_le(self.salt);
            c.put_slice(&self.uuid);
            c.put_u64_le(self.begin_lsid);
            c.put_u64_le(self.end_lsid);
        }
        let csum = checksum::self_checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::invalid_format("short wlog header".to_string()));
        }
        let data = &data[..HEADER_SIZE];
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("wlog header checksum mismatch".to_string()));
        }
        let mut c = data;
        let _checksum = c.get_u32_le();
        if c.get_u32_le() != WLOG_MAGIC {
            return Err(Error::invalid_format("bad wlog magic".to_string()));
        }
        let version = c.get_u16_le();
        if version != WLOG_VERSION {
            return Err(Error::invalid_format(format!("unsupported wlog version {version}")));
        }
        let _ = c.get_u16_le();
        let pbs = c.get_u32_le();
        let salt = c.get_u32_le();
        let mut uuid = [0u8; UUID_SIZE];
        c.copy_to_slice(&mut uuid);
        let begin_lsid = c.get_u64_le();
        let end_lsid = c.get_u64_le();
        Ok(Self { pbs, salt, uuid, begin_lsid, end_lsid })
    }
}

/// Writes a wlog stream.
pub struct WlogFileWriter<W: Write> {
    out: W,
    pbs: u32,
    wrote_header: bool,
}

impl<W: Write> WlogFileWriter<W> {
    /// Wrap an output stream.
    pub fn new(out: W) -> Self {
        Self { out, pbs: 0, wrote_header: false }
    }

    /// Write the stream header.
    pub fn write_header(&mut self, header: &WlogFileHeader) -> Result<()> {
        if self.wrote_header {
            return Err(Error::internal("header already written".to_string()));
        }
        self.out.write_all(&header.encode())?;
        self.pbs = header.pbs;
        self.wrote_header = true;
        Ok(())
    }

    /// Write one pack: its header block and the reconstructed data
    /// region.
    pub fn write_pack(&mut self, pack: &LogPackHeader, payloads: &[Vec<u8>]) -> Result<()> {
        if !self.wrote_header {
            return Err(Error::internal("write_header must be called first".to_string()));
        }
        if payloads.len() != pack.n_records() {
            return Err(Error::internal("payload count mismatch".to_string()));
        }
        self.out.write_all(&pack.encode())?;
        let pbs = self.pbs as usize;
        let mut region = vec![0u8; pack.total_io_size_pb() as usize * pbs];
        for (rec, payload) in pack.records().iter().zip(payloads) {
            if !rec.is_normal() {
                continue;
            }
            let from = (rec.lsid_local as usize - 1) * pbs;
            region[from..from + payload.len()].copy_from_slice(payload);
        }
        self.out.write_all(&region)?;
        Ok(())
    }

    /// Flush and return the inner stream.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads a wlog stream.
pub struct WlogFileReader<R: Read> {
    input: R,
    header: Option<WlogFileHeader>,
    next_lsid: u64,
}

impl<R: Read> WlogFileReader<R> {
    /// Wrap an input stream.
    pub fn new(input: R) -> Self {
        Self { input, header: None, next_lsid: 0 }
    }

    /// Read the stream header.
    pub fn read_header(&mut self) -> Result<WlogFileHeader> {
        if self.header.is_some() {
            return Err(Error::internal("header already read".to_string()));
        }
        let mut buf = [0u8; HEADER_SIZE];
        self.input.read_exact(&mut buf)?;
        let header = WlogFileHeader::decode(&buf)?;
        self.next_lsid = header.begin_lsid;
        self.header = Some(header);
        Ok(header)
    }

    /// Read the next pack, or `None` at the end of the stream.
    pub fn read_pack(&mut self) -> Result<Option<(LogPackHeader, Vec<Vec<u8>>)>> {
        let header = self
            .header
            .ok_or_else(|| Error::internal("read_header must be called first".to_string()))?;
        if self.next_lsid >= header.end_lsid {
            return Ok(None);
        }
        let pbs = header.pbs as usize;
        let mut block = vec![0u8; pbs];
        self.input.read_exact(&mut block)?;
        let pack = LogPackHeader::decode(&block, header.pbs, header.salt, self.next_lsid)?;
        let mut region = vec![0u8; pack.total_io_size_pb() as usize * pbs];
        self.input.read_exact(&mut region)?;
        let payloads = pack.extract_record_data(&region)?;
        self.next_lsid = pack.next_logpack_lsid();
        Ok(Some((pack, payloads)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip() {
        let salt = 0xabcd;
        let mut p0 = LogPackHeader::new(512, salt, 0);
        p0.add_normal(8, 2, &vec![0x11; 1024]).unwrap();
        p0.add_discard(50, 8);
        let mut p1 = LogPackHeader::new(512, salt, p0.next_logpack_lsid());
        p1.add_normal(16, 1, &vec![0x22; 512]).unwrap();

        let header = WlogFileHeader {
            pbs: 512,
            salt,
            uuid: [9; 16],
            begin_lsid: 0,
            end_lsid: p1.next_logpack_lsid(),
        };
        let mut writer = WlogFileWriter::new(Vec::new());
        writer.write_header(&header).unwrap();
        writer.write_pack(&p0, &[vec![0x11; 1024], Vec::new()]).unwrap();
        writer.write_pack(&p1, &[vec![0x22; 512]]).unwrap();
        let buf = writer.finish().unwrap();

        let mut reader = WlogFileReader::new(buf.as_slice());
        let back = reader.read_header().unwrap();
        assert_eq!(back, header);
        let (pack, data) = reader.read_pack().unwrap().unwrap();
        assert_eq!(pack.n_records(), 2);
        assert_eq!(data[0], vec![0x11; 1024]);
        let (pack, data) = reader.read_pack().unwrap().unwrap();
        assert_eq!(pack.logpack_lsid(), 3);
        assert_eq!(data[0], vec![0x22; 512]);
        assert!(reader.read_pack().unwrap().is_none());
    }
}
