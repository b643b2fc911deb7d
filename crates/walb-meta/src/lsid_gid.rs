//! Checkpoint records pairing an lsid with a gid.

use serde::{Deserialize, Serialize};
use walb_core::{Error, Result};

/// A checkpoint `(lsid, gid)` with the mergeability of the wlog range that
/// ends here. The storage daemon keeps a durable FIFO of these to delimit
/// wlog-transfer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLsidGid {
    /// Log sequence id on the wdev.
    pub lsid: u64,
    /// Snapshot id assigned by the storage daemon.
    pub gid: u64,
    /// Whether the diff cut at this checkpoint may be merged upstream.
    pub is_mergeable: bool,
    /// Creation time, unix seconds.
    pub timestamp: u64,
}

impl Default for MetaLsidGid {
    fn default() -> Self {
        Self { lsid: u64::MAX, gid: u64::MAX, is_mergeable: false, timestamp: 0 }
    }
}

impl MetaLsidGid {
    /// Construct a checkpoint.
    #[must_use]
    pub fn new(lsid: u64, gid: u64, is_mergeable: bool, timestamp: u64) -> Self {
        Self { lsid, gid, is_mergeable, timestamp }
    }

    /// Basic sanity check.
    pub fn verify(&self) -> Result<()> {
        // The initial done record is (MAX, MAX); anything else must have
        // a real lsid.
        if self.lsid == u64::MAX && self.gid != u64::MAX {
            return Err(Error::invalid_format(format!("MetaLsidGid: bad lsid: {self}")));
        }
        Ok(())
    }
}

impl std::fmt::Display for MetaLsidGid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lsid:{} gid:{} merge:{} ts:{}",
            self.lsid,
            self.gid,
            if self.is_mergeable { 1 } else { 0 },
            crate::format_timestamp(self.timestamp)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip() {
        let rec = MetaLsidGid::new(12345, 42, true, 1_400_000_000);
        let data = bincode::serialize(&rec).unwrap();
        let back: MetaLsidGid = bincode::deserialize(&data).unwrap();
        assert_eq!(back, rec);
    }
}
