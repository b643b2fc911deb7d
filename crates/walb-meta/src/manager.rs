// Copyright 2026 WalB Tools Dev
// SPDX-License-Identifier: Apache-2.0

//! The per-volume diff index.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use walb_core::{Error, Result};

use crate::diff::{self, can_merge, merge, MetaDiff};
use crate::snap::MetaSnap;
use crate::state::{apply_state, apply_state_all, can_apply_state, MetaState};

type Map = BTreeMap<u64, Vec<MetaDiff>>;

/// Thread-safe index over the diffs of one volume.
///
/// Diffs are keyed by `snap_b.gid_b`; several dirty diffs may share one key.
/// A single lock guards the map, so every public operation is atomic and
/// readers observe a consistent snapshot.
#[derive(Default)]
pub struct MetaDiffManager {
    map: Mutex<Map>,
}

impl MetaDiffManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a diff. Fails if an identical diff is already present.
    pub fn add(&self, diff: MetaDiff) -> Result<()> {
        diff.verify()?;
        let mut map = self.map.lock();
        Self::add_nolock(&mut map, diff)
    }

    /// Remove a diff. Fails if it is not present.
    pub fn erase(&self, diff: &MetaDiff) -> Result<()> {
        let mut map = self.map.lock();
        Self::erase_nolock(&mut map, diff, true)
    }

    /// Remove several diffs, ignoring ones that are already gone.
    pub fn erase_all(&self, diffs: &[MetaDiff]) {
        let mut map = self.map.lock();
        for d in diffs {
            let _ = Self::erase_nolock(&mut map, d, false);
        }
    }

    /// Whether an identical diff is registered.
    #[must_use]
    pub fn exists(&self, diff: &MetaDiff) -> bool {
        let map = self.map.lock();
        map.get(&diff.snap_b.gid_b)
            .is_some_and(|v| v.contains(diff))
    }

    /// Number of registered diffs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().values().map(Vec::len).sum()
    }

    /// Whether no diff is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// All diffs with `gid0 <= snap_b.gid_b < gid1`, in key order.
    pub fn get_all_in_range(&self, gid0: u64, gid1: u64) -> Result<Vec<MetaDiff>> {
        if gid0 >= gid1 {
            return Err(Error::internal(format!("bad gid range [{gid0}, {gid1})")));
        }
        let map = self.map.lock();
        Ok(map.range(gid0..gid1).flat_map(|(_, v)| v.iter().copied()).collect())
    }

    /// Every registered diff, in key order.
    #[must_use]
    pub fn get_all(&self) -> Vec<MetaDiff> {
        let map = self.map.lock();
        map.values().flat_map(|v| v.iter().copied()).collect()
    }

    /// `(min snap_b.gid_b, max snap_e.gid_b)` over all diffs; `(0, 0)` when
    /// empty.
    #[must_use]
    pub fn get_min_max_gid(&self) -> (u64, u64) {
        let map = self.map.lock();
        if map.is_empty() {
            return (0, 0);
        }
        let mut min = u64::MAX;
        let mut max = 0;
        for d in map.values().flatten() {
            min = min.min(d.snap_b.gid_b);
            max = max.max(d.snap_e.gid_b);
        }
        (min, max)
    }

    /// Flip `is_mergeable` on every diff whose `snap_b.gid_b == gid`.
    ///
    /// `enable = true` creates an explicit snapshot boundary (clears the
    /// flag); `enable = false` removes it. Returns the changed diffs, or
    /// `None` if no diff starts at `gid`.
    pub fn change_snapshot(&self, gid: u64, enable: bool) -> Option<Vec<MetaDiff>> {
        let mut map = self.map.lock();
        let chain = map.get_mut(&gid)?;
        let mut changed = Vec::new();
        for d in chain.iter_mut() {
            if d.is_mergeable == enable {
                d.is_mergeable = !enable;
                changed.push(*d);
            }
        }
        Some(changed)
    }

    /// Remove and return every diff that is not on the apply path from
    /// `snap`.
    pub fn gc(&self, snap: &MetaSnap) -> Vec<MetaDiff> {
        let mut map = self.map.lock();
        let keep = Self::applicable_list_nolock(&map, snap, |_, _| true);
        for d in &keep {
            let _ = Self::erase_nolock(&mut map, d, false);
        }
        let garbage: Vec<MetaDiff> = map.values().flatten().copied().collect();
        map.clear();
        for d in keep {
            let _ = Self::add_nolock(&mut map, d);
        }
        garbage
    }

    /// Remove and return every diff fully contained in `[gid_b, gid_e)`,
    /// except an exact cover of the whole range.
    pub fn gc_range(&self, gid_b: u64, gid_e: u64) -> Vec<MetaDiff> {
        let mut map = self.map.lock();
        let mut garbage = Vec::new();
        for (_, chain) in map.range_mut(gid_b..) {
            chain.retain(|d| {
                let contained = gid_b <= d.snap_b.gid_b
                    && d.snap_e.gid_b <= gid_e
                    && !(gid_b == d.snap_b.gid_b && gid_e == d.snap_e.gid_b);
                if contained {
                    garbage.push(*d);
                }
                !contained
            });
        }
        map.retain(|_, chain| !chain.is_empty());
        garbage
    }

    /// Remove and return every diff that ends at or before `gid`.
    pub fn erase_before_gid(&self, gid: u64) -> Vec<MetaDiff> {
        let mut map = self.map.lock();
        let mut removed = Vec::new();
        for (&key, chain) in map.iter_mut() {
            if key >= gid {
                break;
            }
            chain.retain(|d| {
                if d.snap_e.gid_b <= gid {
                    removed.push(*d);
                    false
                } else {
                    true
                }
            });
        }
        map.retain(|_, chain| !chain.is_empty());
        removed
    }

    /// Greedy forward walk: at each step, the applicable candidate with the
    /// largest `snap_e.gid_b` is chosen.
    #[must_use]
    pub fn get_applicable_diff_list(&self, snap: &MetaSnap) -> Vec<MetaDiff> {
        let map = self.map.lock();
        Self::applicable_list_nolock(&map, snap, |_, _| true)
    }

    /// Applicable walk stopped once the reached snapshot would pass
    /// `max_gid`.
    #[must_use]
    pub fn get_applicable_diff_list_by_gid(&self, snap: &MetaSnap, max_gid: u64) -> Vec<MetaDiff> {
        let map = self.map.lock();
        Self::applicable_list_nolock(&map, snap, |_, reached| reached.gid_b <= max_gid)
    }

    /// Starting at the first diff after `gid`, greedily collect a mergeable
    /// run. `pred` sees each would-be-merged diff and can bound the run by
    /// size or time.
    pub fn get_mergeable_diff_list(
        &self,
        gid: u64,
        mut pred: impl FnMut(&MetaDiff) -> bool,
    ) -> Vec<MetaDiff> {
        let map = self.map.lock();
        let first = Self::first_diffs_nolock(&map, gid);
        let Some(head) = Self::max_progress(&first) else {
            return Vec::new();
        };
        let mut out = vec![head];
        let mut merged = head;
        loop {
            let candidates = Self::mergeable_candidates_nolock(&map, &merged);
            let Some(next) = Self::max_progress(&candidates) else {
                break;
            };
            if !pred(&next) {
                break;
            }
            merged = merge(&merged, &next);
            out.push(next);
        }
        out
    }

    /// The longest applicable prefix that can also be merged into a single
    /// diff.
    #[must_use]
    pub fn get_applicable_and_mergeable_diff_list(&self, snap: &MetaSnap) -> Vec<MetaDiff> {
        let mut v = self.get_applicable_diff_list(snap);
        if v.is_empty() {
            return v;
        }
        let mut acc = v[0];
        let mut n = 1;
        while n < v.len() {
            if !can_merge(&acc, &v[n]) {
                break;
            }
            acc = merge(&acc, &v[n]);
            n += 1;
        }
        v.truncate(n);
        v
    }

    /// The unique diff sequence that completes an in-flight apply.
    ///
    /// Empty for a resting state. A hard error means the persisted diffs
    /// can no longer construct the applying range; the volume needs
    /// operator attention.
    pub fn get_minimum_applicable_diff_list(&self, st: &MetaState) -> Result<Vec<MetaDiff>> {
        let map = self.map.lock();
        Self::minimum_applicable_nolock(&map, st)
    }

    /// The diff list to apply to reach (at most) `target_gid`, forcing
    /// through an in-flight apply first.
    pub fn get_diff_list_to_apply(&self, st: &MetaState, target_gid: u64) -> Result<Vec<MetaDiff>> {
        let map = self.map.lock();
        let applicable =
            Self::applicable_list_nolock(&map, &st.snap_b, |_, reached| reached.gid_b <= target_gid);
        let min = Self::minimum_applicable_nolock(&map, st)?;
        if min.len() > applicable.len() {
            Ok(min)
        } else {
            Ok(applicable)
        }
    }

    /// The diff list whose application lands exactly on `target`; empty if
    /// no such list exists.
    pub fn get_diff_list_to_sync(&self, st: &MetaState, target: &MetaSnap) -> Result<Vec<MetaDiff>> {
        let map = self.map.lock();
        let applicable =
            Self::applicable_list_nolock(&map, &st.snap_b, |_, reached| reached.gid_b <= target.gid_b);
        let min = Self::minimum_applicable_nolock(&map, st)?;
        if min.len() > applicable.len() {
            return Ok(Vec::new());
        }
        let reached = apply_state_all(st, &applicable);
        if reached.snap_b == *target {
            Ok(applicable)
        } else {
            Ok(Vec::new())
        }
    }

    /// The diff list to restore the clean snapshot `gid`; empty if it is
    /// not restorable.
    pub fn get_diff_list_to_restore(&self, st: &MetaState, gid: u64) -> Result<Vec<MetaDiff>> {
        self.get_diff_list_to_sync(st, &MetaSnap::clean(gid))
    }

    /// Every clean state reachable by applying some prefix of the
    /// applicable list.
    ///
    /// With `is_all` false, only explicit states (at non-mergeable
    /// boundaries or the end of history) are reported.
    pub fn get_restorable_list(&self, st: &MetaState, is_all: bool) -> Result<Vec<MetaState>> {
        let map = self.map.lock();
        let applicable = Self::applicable_list_nolock(&map, &st.snap_b, |_, _| true);
        let min = Self::minimum_applicable_nolock(&map, st)?;
        if min.len() > applicable.len() {
            return Err(Error::internal(format!(
                "applicable list shorter than minimum list: {} < {}",
                applicable.len(),
                min.len()
            )));
        }
        let mut out = Vec::new();
        let mut cur = apply_state_all(st, &min);
        if cur.snap_b.is_clean() {
            out.push(cur);
        }
        for i in min.len()..applicable.len() {
            cur = apply_state(&cur, &applicable[i]);
            let is_last = i + 1 == applicable.len();
            let is_explicit = is_last || !applicable[i + 1].is_mergeable;
            cur.is_explicit = is_explicit;
            if cur.snap_b.is_clean() && (is_all || is_explicit) {
                out.push(cur);
            }
        }
        Ok(out)
    }

    /// The gids of every restorable clean snapshot.
    pub fn get_clean_snapshot_list(&self, st: &MetaState) -> Result<Vec<u64>> {
        Ok(self.get_restorable_list(st, true)?.iter().map(|s| s.snap_b.gid_b).collect())
    }

    /// The earliest clean state reachable from `st`.
    pub fn get_oldest_clean_state(&self, st: &MetaState) -> Result<MetaState> {
        let map = self.map.lock();
        let min = Self::minimum_applicable_nolock(&map, st)?;
        let mut cur = apply_state_all(st, &min);
        loop {
            if cur.snap_b.is_clean() {
                return Ok(cur);
            }
            let candidates = Self::applicable_candidates_nolock(&map, &cur.snap_b);
            let Some(d) = Self::max_progress(&candidates) else {
                return Err(Error::internal("no clean snapshot reachable".to_string()));
            };
            cur = apply_state(&cur, &d);
        }
    }

    /// The latest snapshot (possibly dirty) reachable from `st`.
    #[must_use]
    pub fn get_latest_snapshot(&self, st: &MetaState) -> MetaSnap {
        let map = self.map.lock();
        let applicable = Self::applicable_list_nolock(&map, &st.snap_b, |_, _| true);
        let mut snap = st.snap_b;
        for d in &applicable {
            snap = diff::apply(&snap, d);
        }
        snap
    }

    // ---- internals; callers hold the lock ----

    fn add_nolock(map: &mut Map, diff: MetaDiff) -> Result<()> {
        let chain = map.entry(diff.snap_b.gid_b).or_default();
        if chain.contains(&diff) {
            return Err(Error::internal(format!("diff already exists: {diff}")));
        }
        chain.push(diff);
        Ok(())
    }

    fn erase_nolock(map: &mut Map, diff: &MetaDiff, strict: bool) -> Result<()> {
        let found = match map.get_mut(&diff.snap_b.gid_b) {
            Some(chain) => {
                let before = chain.len();
                chain.retain(|d| d != diff);
                let removed = before != chain.len();
                if chain.is_empty() {
                    map.remove(&diff.snap_b.gid_b);
                }
                removed
            }
            None => false,
        };
        if !found && strict {
            return Err(Error::not_found(format!("diff not found: {diff}")));
        }
        Ok(())
    }

    /// All diffs sharing the smallest key at or after `gid`.
    fn first_diffs_nolock(map: &Map, gid: u64) -> Vec<MetaDiff> {
        match map.range(gid..).next() {
            Some((_, chain)) => chain.clone(),
            None => Vec::new(),
        }
    }

    /// Candidates applicable to `snap`.
    ///
    /// Fast path: only diffs keyed exactly at `snap.gid_b` (log-n lookup).
    /// Slow path, taken when the fast path finds nothing: linear scan with
    /// an early break once keys pass `snap.gid_e`.
    fn applicable_candidates_nolock(map: &Map, snap: &MetaSnap) -> Vec<MetaDiff> {
        let fast: Vec<MetaDiff> = map
            .get(&snap.gid_b)
            .map(|chain| {
                chain.iter().filter(|d| diff::can_apply(snap, d)).copied().collect()
            })
            .unwrap_or_default();
        if !fast.is_empty() {
            return fast;
        }
        let mut out = Vec::new();
        for d in map.values().flatten() {
            if snap.gid_e < d.snap_b.gid_b {
                break;
            }
            if diff::can_apply(snap, d) {
                out.push(*d);
            }
        }
        out
    }

    /// Candidates mergeable onto `diff`, same two-tier search.
    fn mergeable_candidates_nolock(map: &Map, diff: &MetaDiff) -> Vec<MetaDiff> {
        let fast: Vec<MetaDiff> = map
            .get(&diff.snap_e.gid_b)
            .map(|chain| {
                chain.iter().filter(|d| *d != diff && can_merge(diff, d)).copied().collect()
            })
            .unwrap_or_default();
        if !fast.is_empty() {
            return fast;
        }
        let mut out = Vec::new();
        for d in map.values().flatten() {
            if diff.snap_e.gid_e < d.snap_b.gid_b {
                break;
            }
            if d != diff && can_merge(diff, d) {
                out.push(*d);
            }
        }
        out
    }

    fn max_progress(v: &[MetaDiff]) -> Option<MetaDiff> {
        v.iter().copied().max_by_key(|d| d.snap_e.gid_b)
    }

    fn applicable_list_nolock(
        map: &Map,
        snap: &MetaSnap,
        mut pred: impl FnMut(&MetaDiff, &MetaSnap) -> bool,
    ) -> Vec<MetaDiff> {
        let mut out = Vec::new();
        let mut cur = *snap;
        loop {
            let candidates = Self::applicable_candidates_nolock(map, &cur);
            let Some(d) = Self::max_progress(&candidates) else {
                break;
            };
            let next = diff::apply(&cur, &d);
            if !pred(&d, &next) {
                break;
            }
            cur = next;
            out.push(d);
        }
        out
    }

    fn minimum_applicable_nolock(map: &Map, st: &MetaState) -> Result<Vec<MetaDiff>> {
        if !st.is_applying() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut cur = *st;
        while cur.is_applying() {
            let candidates = Self::applicable_candidates_nolock(map, &cur.snap_b);
            let chosen = candidates
                .iter()
                .filter(|d| can_apply_state(&cur, d))
                .max_by_key(|d| d.snap_e.gid_b)
                .copied();
            let Some(d) = chosen else {
                return Err(Error::internal(format!(
                    "cannot complete in-flight apply from {cur}"
                )));
            };
            cur = apply_state(&cur, &d);
            out.push(d);
        }
        Ok(out)
    }
}
