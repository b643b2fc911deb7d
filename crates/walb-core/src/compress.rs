//! Compression codecs for diff payloads.
//!
//! The wire format identifies a codec by a one-byte id; the set and the ids
//! are fixed by the wdiff format and must not change.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression type of a diff payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    #[default]
    None = 0,
    /// Gzip (deflate with gzip wrapper).
    Gzip = 1,
    /// Snappy raw block format.
    Snappy = 2,
    /// LZMA (xz container).
    Lzma = 3,
    /// LZ4 block format.
    Lz4 = 4,
    /// Zstandard.
    Zstd = 5,
}

impl Compression {
    /// Parse a wire codec id.
    pub fn from_wire(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            3 => Ok(Self::Lzma),
            4 => Ok(Self::Lz4),
            5 => Ok(Self::Zstd),
            _ => Err(Error::invalid_format(format!("unknown compression type {id}"))),
        }
    }

    /// The wire codec id.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    /// Whether this codec actually compresses.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lzma => "lzma",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lzma" => Ok(Self::Lzma),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(Error::Config(format!("unknown compression name: {s}"))),
        }
    }
}

/// Compress `data` with the given codec.
///
/// `level` is codec-specific; 0 selects the codec default.
pub fn compress(ty: Compression, data: &[u8], level: i32) -> Result<Vec<u8>> {
    match ty {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let lvl = if level == 0 {
                flate2::Compression::default()
            } else {
                flate2::Compression::new(level as u32)
            };
            let mut enc = flate2::read::GzEncoder::new(data, lvl);
            let mut out = Vec::new();
            enc.read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::invalid_format(format!("snappy compress: {e}"))),
        Compression::Lzma => {
            let lvl = if level == 0 { 6 } else { level as u32 };
            let mut enc = xz2::read::XzEncoder::new(data, lvl);
            let mut out = Vec::new();
            enc.read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Lz4 => Ok(lz4_flex::block::compress(data)),
        Compression::Zstd => {
            zstd::bulk::compress(data, level).map_err(Error::Io)
        }
    }
}

/// Uncompress `data`, producing exactly `orig_size` bytes.
///
/// Fails with `InvalidFormat` if the payload is corrupt or the output size
/// does not match.
pub fn uncompress(ty: Compression, data: &[u8], orig_size: usize) -> Result<Vec<u8>> {
    let out = match ty {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut dec = flate2::read::GzDecoder::new(data);
            let mut out = Vec::with_capacity(orig_size);
            dec.read_to_end(&mut out)
                .map_err(|e| Error::invalid_format(format!("gzip uncompress: {e}")))?;
            out
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::invalid_format(format!("snappy uncompress: {e}")))?,
        Compression::Lzma => {
            let mut dec = xz2::read::XzDecoder::new(data);
            let mut out = Vec::with_capacity(orig_size);
            dec.read_to_end(&mut out)
                .map_err(|e| Error::invalid_format(format!("lzma uncompress: {e}")))?;
            out
        }
        Compression::Lz4 => lz4_flex::block::decompress(data, orig_size)
            .map_err(|e| Error::invalid_format(format!("lz4 uncompress: {e}")))?,
        Compression::Zstd => zstd::bulk::decompress(data, orig_size)
            .map_err(|e| Error::invalid_format(format!("zstd uncompress: {e}")))?,
    };
    if out.len() != orig_size {
        return Err(Error::invalid_format(format!(
            "uncompressed size mismatch: got {} want {orig_size}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODECS: [Compression; 6] = [
        Compression::None,
        Compression::Gzip,
        Compression::Snappy,
        Compression::Lzma,
        Compression::Lz4,
        Compression::Zstd,
    ];

    fn sample_data() -> Vec<u8> {
        // Compressible but non-trivial content.
        (0..8192u32).map(|i| ((i / 64) % 251) as u8).collect()
    }

    #[test]
    fn test_roundtrip_all_codecs() {
        let data = sample_data();
        for codec in CODECS {
            let packed = compress(codec, &data, 0).unwrap();
            let unpacked = uncompress(codec, &packed, data.len()).unwrap();
            assert_eq!(unpacked, data, "codec {codec}");
        }
    }

    #[test]
    fn test_wire_ids_are_stable() {
        assert_eq!(Compression::None.to_wire(), 0);
        assert_eq!(Compression::Gzip.to_wire(), 1);
        assert_eq!(Compression::Snappy.to_wire(), 2);
        assert_eq!(Compression::Lzma.to_wire(), 3);
        assert_eq!(Compression::Lz4.to_wire(), 4);
        assert_eq!(Compression::Zstd.to_wire(), 5);
        for codec in CODECS {
            assert_eq!(Compression::from_wire(codec.to_wire()).unwrap(), codec);
        }
        assert!(Compression::from_wire(6).is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let data = sample_data();
        let packed = compress(Compression::Snappy, &data, 0).unwrap();
        assert!(uncompress(Compression::Snappy, &packed, data.len() + 1).is_err());
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let data = sample_data();
        let mut packed = compress(Compression::Zstd, &data, 0).unwrap();
        let mid = packed.len() / 2;
        packed[mid] ^= 0xff;
        assert!(uncompress(Compression::Zstd, &packed, data.len()).is_err());
    }
}
