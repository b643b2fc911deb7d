//! Base-image state markers.

use serde::{Deserialize, Serialize};
use walb_core::{Error, Result};

use crate::diff::MetaDiff;
use crate::snap::{apply_snap, can_apply_snap, MetaSnap};

/// State of a base image.
///
/// *Resting*: the image is exactly `snap_b`. *Applying*: a merged diff
/// `snap_b -> snap_e` is being written into the image; after a crash the
/// apply must be resumed or restarted before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    /// Current base snapshot.
    pub snap_b: MetaSnap,
    /// Apply target. Equal to `snap_b` when resting.
    pub snap_e: MetaSnap,
    /// True while a merged diff is being applied.
    pub is_applying: bool,
    /// Time of the last state change, unix seconds.
    pub timestamp: u64,
    /// True if this state sits at a non-mergeable boundary and is therefore
    /// an unambiguous restore target.
    pub is_explicit: bool,
}

impl Default for MetaState {
    fn default() -> Self {
        Self::resting(MetaSnap::clean(0), 0)
    }
}

impl MetaState {
    /// A resting state at `snap`.
    #[must_use]
    pub fn resting(snap: MetaSnap, timestamp: u64) -> Self {
        Self { snap_b: snap, snap_e: snap, is_applying: false, timestamp, is_explicit: true }
    }

    /// An applying state `snap_b -> snap_e`.
    #[must_use]
    pub fn applying(snap_b: MetaSnap, snap_e: MetaSnap, timestamp: u64) -> Self {
        Self { snap_b, snap_e, is_applying: true, timestamp, is_explicit: false }
    }

    /// Whether an apply is in flight.
    #[must_use]
    pub fn is_applying(&self) -> bool {
        self.is_applying
    }

    /// Check invariants.
    pub fn verify(&self) -> Result<()> {
        self.snap_b.verify()?;
        self.snap_e.verify()?;
        if self.is_applying && self.snap_b.gid_b >= self.snap_e.gid_b {
            return Err(Error::invalid_format(format!("MetaState: bad apply range: {self}")));
        }
        Ok(())
    }

    /// Parse `<|s|>-ts` or `<|s|-->|e|>-ts`. The timestamp suffix is
    /// optional; a missing one parses as zero.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::invalid_format(format!("bad MetaState string: {s}"));
        let rest = s.strip_prefix('<').ok_or_else(bad)?;
        let close = rest.find('>').ok_or_else(bad)?;
        let (snaps, tail) = rest.split_at(close);
        let tail = &tail[1..];
        let timestamp = match tail.strip_prefix('-') {
            Some(ts) => crate::parse_timestamp(ts)?,
            None if tail.is_empty() => 0,
            None => return Err(bad()),
        };
        let st = match snaps.split_once("-->") {
            Some((b, e)) => {
                Self::applying(MetaSnap::parse(b)?, MetaSnap::parse(e)?, timestamp)
            }
            None => Self::resting(MetaSnap::parse(snaps)?, timestamp),
        };
        st.verify()?;
        Ok(st)
    }
}

impl std::fmt::Display for MetaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_applying {
            write!(f, "<{}-->{}>-{}", self.snap_b, self.snap_e, crate::format_timestamp(self.timestamp))
        } else {
            write!(f, "<{}>-{}", self.snap_b, crate::format_timestamp(self.timestamp))
        }
    }
}

/// Whether `diff` can be applied on top of `st`.
///
/// During an in-flight apply only diffs that do not overshoot the apply
/// target are allowed.
#[must_use]
pub fn can_apply_state(st: &MetaState, diff: &MetaDiff) -> bool {
    if !can_apply_snap(&st.snap_b, &diff.snap_b) {
        return false;
    }
    if st.is_applying {
        return diff.snap_e.gid_b <= st.snap_e.gid_b;
    }
    true
}

/// The state after applying `diff` to `st`.
///
/// Applying through an in-flight range keeps the state in `applying` until
/// the target is reached.
#[must_use]
pub fn apply_state(st: &MetaState, diff: &MetaDiff) -> MetaState {
    let snap_b = apply_snap(&st.snap_b, &diff.snap_e);
    if st.is_applying && snap_b.gid_b < st.snap_e.gid_b {
        MetaState::applying(snap_b, st.snap_e, diff.timestamp)
    } else {
        MetaState::resting(snap_b, diff.timestamp)
    }
}

/// The applying-marker state for applying `diffs` (in order) to `st`.
#[must_use]
pub fn applying_state(st: &MetaState, diffs: &[MetaDiff]) -> MetaState {
    let mut snap = st.snap_b;
    let mut ts = st.timestamp;
    for d in diffs {
        snap = apply_snap(&snap, &d.snap_e);
        ts = ts.max(d.timestamp);
    }
    MetaState::applying(st.snap_b, snap, ts)
}

/// Apply a whole diff list to `st`.
#[must_use]
pub fn apply_state_all(st: &MetaState, diffs: &[MetaDiff]) -> MetaState {
    let mut cur = *st;
    for d in diffs {
        cur = apply_state(&cur, d);
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let st = MetaState::resting(MetaSnap::clean(5), 1_400_000_000);
        let s = st.to_string();
        let parsed = MetaState::parse(&s).unwrap();
        assert_eq!(parsed.snap_b, st.snap_b);
        assert!(!parsed.is_applying);
        assert_eq!(parsed.timestamp, st.timestamp);

        let st = MetaState::applying(MetaSnap::clean(5), MetaSnap::range(8, 9), 1_400_000_000);
        let parsed = MetaState::parse(&st.to_string()).unwrap();
        assert!(parsed.is_applying);
        assert_eq!(parsed.snap_e, MetaSnap::range(8, 9));
    }

    #[test]
    fn test_parse_without_timestamp() {
        let st = MetaState::parse("<|3|>").unwrap();
        assert_eq!(st.snap_b, MetaSnap::clean(3));
        assert_eq!(st.timestamp, 0);
        assert!(MetaState::parse("|3|").is_err());
        assert!(MetaState::parse("<|3|>x").is_err());
    }

    #[test]
    fn test_apply_progresses_through_applying() {
        let st = MetaState::applying(MetaSnap::clean(0), MetaSnap::clean(2), 0);
        let d1 = MetaDiff::clean(0, 1, 10);
        let d2 = MetaDiff::clean(1, 2, 20);
        let d3 = MetaDiff::clean(2, 3, 30);

        assert!(can_apply_state(&st, &d1));
        // Overshooting the in-flight target is rejected.
        assert!(!can_apply_state(&st, &d3));

        let mid = apply_state(&st, &d1);
        assert!(mid.is_applying);
        let done = apply_state(&mid, &d2);
        assert!(!done.is_applying);
        assert_eq!(done.snap_b, MetaSnap::clean(2));
        // Once resting, further applies are normal.
        assert!(can_apply_state(&done, &d3));
    }

    #[test]
    fn test_applying_state_marker() {
        let st = MetaState::resting(MetaSnap::clean(0), 0);
        let diffs = [MetaDiff::clean(0, 1, 10), MetaDiff::clean(1, 3, 20)];
        let marker = applying_state(&st, &diffs);
        assert!(marker.is_applying);
        assert_eq!(marker.snap_b, MetaSnap::clean(0));
        assert_eq!(marker.snap_e, MetaSnap::clean(3));
        assert_eq!(marker.timestamp, 20);
    }
}
