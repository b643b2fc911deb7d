//! Diff metadata and the wdiff file-name codec.

use serde::{Deserialize, Serialize};
use walb_core::{Error, Result};

use crate::snap::{apply_snap, can_apply_snap, MetaSnap};
use crate::{format_timestamp, parse_timestamp};

/// Metadata of one wdiff: the snapshot transition `snapB -> snapE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MetaDiff {
    /// Transition source.
    pub snap_b: MetaSnap,
    /// Transition target.
    pub snap_e: MetaSnap,
    /// Creation time, unix seconds.
    pub timestamp: u64,
    /// False at an explicit snapshot boundary: merging through this diff
    /// is forbidden.
    pub is_mergeable: bool,
    /// True if this diff is the result of merges that crossed a compaction.
    pub is_comp_diff: bool,
}

impl MetaDiff {
    /// A clean-to-clean diff `|gid_b| -> |gid_e|`.
    #[must_use]
    pub fn clean(gid_b: u64, gid_e: u64, timestamp: u64) -> Self {
        Self {
            snap_b: MetaSnap::clean(gid_b),
            snap_e: MetaSnap::clean(gid_e),
            timestamp,
            is_mergeable: false,
            is_comp_diff: false,
        }
    }

    /// Construct from both snapshots.
    #[must_use]
    pub fn new(snap_b: MetaSnap, snap_e: MetaSnap, timestamp: u64, is_mergeable: bool) -> Self {
        Self { snap_b, snap_e, timestamp, is_mergeable, is_comp_diff: false }
    }

    /// Whether both endpoints are clean.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.snap_b.is_clean() && self.snap_e.is_clean()
    }

    /// Whether either endpoint is dirty.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.is_clean()
    }

    /// Check the diff invariants: both snapshots are valid, the transition
    /// makes progress, and a dirty source is fully consumed.
    pub fn verify(&self) -> Result<()> {
        self.snap_b.verify()?;
        self.snap_e.verify()?;
        if self.snap_b.gid_b >= self.snap_e.gid_b {
            return Err(Error::invalid_format(format!("MetaDiff: no progress: {self}")));
        }
        if self.snap_b.is_dirty() && self.snap_e.gid_b < self.snap_b.gid_e {
            return Err(Error::invalid_format(format!(
                "MetaDiff: dirty source not consumed: {self}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for MetaDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}-->{}",
            if self.is_mergeable { "M" } else { "-" },
            if self.is_comp_diff { "C" } else { "-" },
            self.snap_b,
            self.snap_e
        )
    }
}

/// Whether `b` can be merged onto `a` (i.e. `merge(a, b)` is meaningful).
///
/// `b` must be mergeable and its source must be compatible with `a`'s
/// target. Compaction diffs only merge at exact snapshot boundaries.
#[must_use]
pub fn can_merge(a: &MetaDiff, b: &MetaDiff) -> bool {
    if !b.is_mergeable {
        return false;
    }
    if a.is_comp_diff || b.is_comp_diff {
        return b.snap_b == a.snap_e;
    }
    a.snap_e.gid_b <= b.snap_b.gid_b && b.snap_b.gid_e <= a.snap_e.gid_e
}

/// Merge two diffs. The caller must have checked [`can_merge`].
#[must_use]
pub fn merge(a: &MetaDiff, b: &MetaDiff) -> MetaDiff {
    MetaDiff {
        snap_b: a.snap_b,
        snap_e: apply_snap(&a.snap_e, &b.snap_e),
        timestamp: a.timestamp.max(b.timestamp),
        is_mergeable: a.is_mergeable && b.is_mergeable,
        is_comp_diff: a.is_comp_diff || b.is_comp_diff,
    }
}

/// Whether `diff` can be applied on top of `snap`.
#[must_use]
pub fn can_apply(snap: &MetaSnap, diff: &MetaDiff) -> bool {
    can_apply_snap(snap, &diff.snap_b)
}

/// The snapshot reached by applying `diff` to `snap`.
#[must_use]
pub fn apply(snap: &MetaSnap, diff: &MetaDiff) -> MetaSnap {
    apply_snap(snap, &diff.snap_e)
}

/// Build the canonical wdiff file name for a diff:
/// `YYYYMMDDhhmmss-{M|-}{C|-}-<gids>.wdiff` with two gids for a clean
/// transition, four for a dirty one.
#[must_use]
pub fn create_diff_file_name(diff: &MetaDiff) -> String {
    let mut s = format_timestamp(diff.timestamp);
    s.push('-');
    s.push(if diff.is_mergeable { 'M' } else { '-' });
    s.push(if diff.is_comp_diff { 'C' } else { '-' });
    let gids: Vec<u64> = if diff.is_dirty() {
        vec![diff.snap_b.gid_b, diff.snap_b.gid_e, diff.snap_e.gid_b, diff.snap_e.gid_e]
    } else {
        vec![diff.snap_b.gid_b, diff.snap_e.gid_b]
    };
    for gid in gids {
        s.push('-');
        s.push_str(&gid.to_string());
    }
    s.push_str(".wdiff");
    s
}

/// Parse a wdiff file name back into its [`MetaDiff`].
pub fn parse_diff_file_name(name: &str) -> Result<MetaDiff> {
    let bad = || Error::invalid_format(format!("bad wdiff file name: {name}"));
    // Shortest valid form: "YYYYMMDDhhmmss-MC-0-1.wdiff"
    if name.len() < 27 || !name.is_ascii() {
        return Err(bad());
    }
    let timestamp = parse_timestamp(&name[0..14])?;
    let bytes = name.as_bytes();
    if bytes[14] != b'-' || bytes[17] != b'-' {
        return Err(bad());
    }
    let is_mergeable = bytes[15] == b'M';
    let is_comp_diff = bytes[16] == b'C';
    let rest = name[18..].strip_suffix(".wdiff").ok_or_else(bad)?;
    let gids: Vec<u64> = rest
        .split('-')
        .map(|t| t.parse::<u64>().map_err(|_| bad()))
        .collect::<Result<_>>()?;
    let (snap_b, snap_e) = match gids.as_slice() {
        [b, e] => (MetaSnap::clean(*b), MetaSnap::clean(*e)),
        [b0, b1, e0, e1] => (MetaSnap::range(*b0, *b1), MetaSnap::range(*e0, *e1)),
        _ => return Err(bad()),
    };
    let diff = MetaDiff { snap_b, snap_e, timestamp, is_mergeable, is_comp_diff };
    diff.verify()?;
    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        MetaDiff::clean(0, 1, 0).verify().unwrap();
        // No progress.
        assert!(MetaDiff::clean(1, 1, 0).verify().is_err());
        // Dirty source must be consumed.
        let d = MetaDiff::new(MetaSnap::range(0, 5), MetaSnap::range(3, 6), 0, true);
        assert!(d.verify().is_err());
        let d = MetaDiff::new(MetaSnap::range(0, 5), MetaSnap::range(5, 6), 0, true);
        d.verify().unwrap();
    }

    #[test]
    fn test_file_name_roundtrip_clean() {
        let mut diff = MetaDiff::clean(3, 7, 1_400_000_000);
        diff.is_mergeable = true;
        let name = create_diff_file_name(&diff);
        assert!(name.ends_with("-M--3-7.wdiff"));
        assert_eq!(parse_diff_file_name(&name).unwrap(), diff);
    }

    #[test]
    fn test_file_name_roundtrip_dirty() {
        let mut diff =
            MetaDiff::new(MetaSnap::range(3, 5), MetaSnap::range(5, 8), 1_400_000_000, false);
        diff.is_comp_diff = true;
        let name = create_diff_file_name(&diff);
        assert!(name.contains("--C-3-5-5-8.wdiff"));
        assert_eq!(parse_diff_file_name(&name).unwrap(), diff);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_diff_file_name("x.wdiff").is_err());
        assert!(parse_diff_file_name("20140101000000-M--3.wdiff").is_err());
        assert!(parse_diff_file_name("20140101000000-M--3-7-9.wdiff").is_err());
        assert!(parse_diff_file_name("20140101000000_M--3-7.wdiff").is_err());
        // Regression on ordering.
        assert!(parse_diff_file_name("20140101000000-M--7-3.wdiff").is_err());
    }

    #[test]
    fn test_merge_semantics() {
        let a = MetaDiff::new(MetaSnap::clean(0), MetaSnap::clean(2), 10, true);
        let mut b = MetaDiff::new(MetaSnap::clean(2), MetaSnap::clean(5), 20, true);
        assert!(can_merge(&a, &b));
        let m = merge(&a, &b);
        assert_eq!(m.snap_b, MetaSnap::clean(0));
        assert_eq!(m.snap_e, MetaSnap::clean(5));
        assert_eq!(m.timestamp, 20);
        assert!(m.is_mergeable);
        assert!(!m.is_comp_diff);

        // Non-mergeable boundary stops a merge.
        b.is_mergeable = false;
        assert!(!can_merge(&a, &b));
    }

    #[test]
    fn test_comp_diff_requires_exact_boundary() {
        let mut a = MetaDiff::new(MetaSnap::clean(0), MetaSnap::range(2, 4), 10, true);
        a.is_comp_diff = true;
        // Loose overlap is not enough for a compaction diff.
        let b = MetaDiff::new(MetaSnap::range(2, 3), MetaSnap::clean(5), 20, true);
        assert!(!can_merge(&a, &b));
        let b = MetaDiff::new(MetaSnap::range(2, 4), MetaSnap::clean(5), 20, true);
        assert!(can_merge(&a, &b));
        assert!(merge(&a, &b).is_comp_diff);
    }

    #[test]
    fn test_loose_merge_compat() {
        // b's source nests inside a's target range.
        let a = MetaDiff::new(MetaSnap::clean(0), MetaSnap::range(2, 6), 10, true);
        let b = MetaDiff::new(MetaSnap::range(3, 5), MetaSnap::range(6, 7), 20, true);
        assert!(can_merge(&a, &b));
        let m = merge(&a, &b);
        assert_eq!(m.snap_e, MetaSnap::range(6, 7));
    }
}
