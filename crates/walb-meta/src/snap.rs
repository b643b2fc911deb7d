//! Snapshot identifiers.

use serde::{Deserialize, Serialize};
use walb_core::{Error, Result};

/// A snapshot marker over the gid axis.
///
/// A *clean* snapshot is a single point (`gidB == gidE`). A *dirty* snapshot
/// is a range meaning "the volume state is somewhere between these two
/// snapshots"; it arises when wlogs are cut mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaSnap {
    /// Begin gid.
    pub gid_b: u64,
    /// End gid. Equal to `gid_b` for a clean snapshot.
    pub gid_e: u64,
}

impl Default for MetaSnap {
    fn default() -> Self {
        Self::clean(0)
    }
}

impl MetaSnap {
    /// A clean snapshot at `gid`.
    #[must_use]
    pub const fn clean(gid: u64) -> Self {
        Self { gid_b: gid, gid_e: gid }
    }

    /// A snapshot range. Dirty iff `gid_b < gid_e`.
    #[must_use]
    pub const fn range(gid_b: u64, gid_e: u64) -> Self {
        Self { gid_b, gid_e }
    }

    /// Whether this is a clean (single-point) snapshot.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.gid_b == self.gid_e
    }

    /// Whether this is a dirty (range) snapshot.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.gid_b != self.gid_e
    }

    /// Check the `gid_b <= gid_e` invariant.
    pub fn verify(&self) -> Result<()> {
        if self.gid_b <= self.gid_e {
            Ok(())
        } else {
            Err(Error::invalid_format(format!("MetaSnap: gidB > gidE: {self}")))
        }
    }

    /// Parse a `|gid|` or `|gidB,gidE|` string.
    pub fn parse(s: &str) -> Result<Self> {
        let inner = s
            .strip_prefix('|')
            .and_then(|t| t.strip_suffix('|'))
            .ok_or_else(|| Error::invalid_format(format!("bad MetaSnap string: {s}")))?;
        let snap = match inner.split_once(',') {
            Some((b, e)) => Self::range(parse_gid(b)?, parse_gid(e)?),
            None => Self::clean(parse_gid(inner)?),
        };
        snap.verify()?;
        Ok(snap)
    }
}

fn parse_gid(s: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| Error::invalid_format(format!("bad gid: {s}")))
}

impl std::fmt::Display for MetaSnap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_clean() {
            write!(f, "|{}|", self.gid_b)
        } else {
            write!(f, "|{},{}|", self.gid_b, self.gid_e)
        }
    }
}

impl std::str::FromStr for MetaSnap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Whether `diff_snap_b` (the left endpoint of a diff) can be applied to
/// `snap`: the diff's begin range must cover the snapshot entirely.
#[must_use]
pub fn can_apply_snap(snap: &MetaSnap, diff_snap_b: &MetaSnap) -> bool {
    diff_snap_b.gid_b <= snap.gid_b && snap.gid_e <= diff_snap_b.gid_e
}

/// The snapshot reached by applying a diff `snapB -> snapE` to `snap`.
///
/// Progress already made past the diff's end range is preserved.
#[must_use]
pub fn apply_snap(snap: &MetaSnap, diff_snap_e: &MetaSnap) -> MetaSnap {
    MetaSnap {
        gid_b: diff_snap_e.gid_b,
        gid_e: diff_snap_e.gid_e.max(snap.gid_e),
    }
}
