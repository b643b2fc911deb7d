//! The 32-byte wdiff file header shared by both container formats.

use bytes::{Buf, BufMut};
use walb_core::checksum::{self, sum32};
use walb_core::{Error, Result, UUID_SIZE};

/// Wdiff format version.
pub const WALB_DIFF_VERSION: u16 = 2;

/// Serialized size of the file header in bytes.
pub const DIFF_FILE_HEADER_SIZE: usize = 32;

/// Container format of a wdiff file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DiffFormat {
    /// Pack-framed, sorted by address.
    #[default]
    Sorted = 0,
    /// Payload run + index footer.
    Indexed = 1,
}

impl DiffFormat {
    fn from_wire(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Sorted),
            1 => Ok(Self::Indexed),
            _ => Err(Error::invalid_format(format!("unknown wdiff type {v}"))),
        }
    }
}

/// Wdiff file header: version, container format, and the uuid of the
/// device the diff belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffFileHeader {
    /// Container format.
    pub format: DiffFormat,
    /// Identity of the target block device.
    pub uuid: [u8; UUID_SIZE],
}

impl DiffFileHeader {
    /// A header for the given format and device uuid.
    #[must_use]
    pub fn new(format: DiffFormat, uuid: [u8; UUID_SIZE]) -> Self {
        Self { format, uuid }
    }

    /// Serialize with a valid self-checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; DIFF_FILE_HEADER_SIZE] {
        let mut buf = [0u8; DIFF_FILE_HEADER_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u32_le(0); // checksum, patched below
            cursor.put_u16_le(WALB_DIFF_VERSION);
            cursor.put_u8(self.format as u8);
            cursor.put_u8(0);
            cursor.put_u32_le(0);
            cursor.put_u32_le(0);
            cursor.put_slice(&self.uuid);
        }
        let csum = checksum::self_checksum(&buf, 0);
        buf[0..4].copy_from_slice(&csum.to_le_bytes());
        buf
    }

    /// Parse and validate a header block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DIFF_FILE_HEADER_SIZE {
            return Err(Error::invalid_format("short wdiff header".to_string()));
        }
        let data = &data[..DIFF_FILE_HEADER_SIZE];
        if sum32(data, 0) != 0 {
            return Err(Error::invalid_format("wdiff header checksum mismatch".to_string()));
        }
        let mut buf = data;
        let _checksum = buf.get_u32_le();
        let version = buf.get_u16_le();
        if version != WALB_DIFF_VERSION {
            return Err(Error::invalid_format(format!("unsupported wdiff version {version}")));
        }
        let format = DiffFormat::from_wire(buf.get_u8())?;
        let _ = buf.get_u8();
        let _ = buf.get_u32_le();
        let _ = buf.get_u32_le();
        let mut uuid = [0u8; UUID_SIZE];
        buf.copy_to_slice(&mut uuid);
        Ok(Self { format, uuid })
    }
}
