//! Persistent per-volume data of the archive daemon.
//!
//! Layout under the volume directory: `state`, `uuid`, `base` (the
//! [`MetaState`] marker), the base image file `image`, restored images
//! named `r_<volId>_<gid>`, and the wdiff files themselves.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use rand::Rng;
use walb_core::{fsutil, Error, Result, LOGICAL_BLOCK_SIZE, UUID_SIZE};
use walb_diff::{DiffMerger, MergeInput};
use walb_meta::{
    apply_state_all, applying_state, create_diff_file_name, parse_diff_file_name, MetaDiff,
    MetaDiffManager, MetaState,
};

use crate::daemon::state;

const IMAGE_NAME: &str = "image";
const RESTORE_PREFIX: &str = "r_";

/// Resting states persisted in the `state` file.
const PERSISTENT_STATES: &[&str] = &[state::SYNC_READY, state::ARCHIVED, state::STOPPED];

/// Persistent data of one archive volume.
pub struct ArchiveVolInfo {
    vol_dir: PathBuf,
    vol_id: String,
}

impl ArchiveVolInfo {
    /// Attach to (a possibly not yet created) volume directory.
    #[must_use]
    pub fn new(base_dir: &Path, vol_id: &str) -> Self {
        Self { vol_dir: base_dir.join(vol_id), vol_id: vol_id.to_string() }
    }

    /// The volume id.
    #[must_use]
    pub fn vol_id(&self) -> &str {
        &self.vol_id
    }

    /// The volume directory.
    #[must_use]
    pub fn vol_dir(&self) -> &Path {
        &self.vol_dir
    }

    /// Whether the volume directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.vol_dir.is_dir()
    }

    /// Create the volume directory with initial metadata.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.vol_dir)?;
        self.set_uuid([0u8; UUID_SIZE])?;
        self.set_meta_state(&MetaState::default())?;
        self.set_state(state::SYNC_READY)
    }

    /// Remove the volume directory (image and restores included).
    pub fn clear(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.vol_dir)?;
        Ok(())
    }

    /// The persisted state string.
    pub fn get_state(&self) -> Result<String> {
        fsutil::load_text(&self.vol_dir, "state")
    }

    /// Persist a resting state.
    pub fn set_state(&self, new_state: &str) -> Result<()> {
        if !PERSISTENT_STATES.contains(&new_state) {
            return Err(Error::bad_state(format!("not a persistent state: {new_state}")));
        }
        fsutil::save_text(&self.vol_dir, "state", new_state)
    }

    /// The persisted device uuid.
    pub fn get_uuid(&self) -> Result<[u8; UUID_SIZE]> {
        let data = fsutil::load_bytes(&self.vol_dir, "uuid")?;
        data.try_into()
            .map_err(|_| Error::invalid_format("bad uuid file".to_string()))
    }

    /// Persist the device uuid.
    pub fn set_uuid(&self, uuid: [u8; UUID_SIZE]) -> Result<()> {
        fsutil::save_bytes(&self.vol_dir, "uuid", &uuid)
    }

    /// The base-image state marker.
    pub fn get_meta_state(&self) -> Result<MetaState> {
        fsutil::load_record(&self.vol_dir, "base")
    }

    /// Persist the base-image state marker.
    pub fn set_meta_state(&self, st: &MetaState) -> Result<()> {
        st.verify()?;
        fsutil::save_record(&self.vol_dir, "base", st)
    }

    /// The base image path.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.vol_dir.join(IMAGE_NAME)
    }

    /// The name of a restored image for `gid`.
    #[must_use]
    pub fn restored_image_name(&self, gid: u64) -> String {
        format!("{RESTORE_PREFIX}{}_{gid}", self.vol_id)
    }

    /// Create the base image of `size_lb` logical blocks (zero filled).
    pub fn create_image(&self, size_lb: u64) -> Result<()> {
        if size_lb == 0 {
            return Err(Error::internal("image size must be positive".to_string()));
        }
        let path = self.image_path();
        if path.exists() {
            let cur = std::fs::metadata(&path)?.len() / LOGICAL_BLOCK_SIZE as u64;
            if cur != size_lb {
                return Err(Error::bad_state(format!(
                    "image exists with different size: {cur} != {size_lb}"
                )));
            }
            return Ok(());
        }
        let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        file.set_len(size_lb * LOGICAL_BLOCK_SIZE as u64)?;
        file.sync_all()?;
        Ok(())
    }

    /// The path of the wdiff file for `diff`.
    #[must_use]
    pub fn diff_path(&self, diff: &MetaDiff) -> PathBuf {
        self.vol_dir.join(create_diff_file_name(diff))
    }

    /// Scan the volume directory for wdiff files.
    pub fn scan_diffs(&self) -> Result<Vec<MetaDiff>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.vol_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".wdiff") {
                continue;
            }
            match parse_diff_file_name(&name) {
                Ok(diff) => out.push(diff),
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "ignoring unparsable wdiff name");
                }
            }
        }
        Ok(out)
    }

    /// Rebuild `mgr` from the directory contents.
    pub fn reload_manager(&self, mgr: &MetaDiffManager) -> Result<()> {
        for diff in self.scan_diffs()? {
            let _ = mgr.add(diff);
        }
        Ok(())
    }

    /// A fresh temp path inside the volume directory.
    #[must_use]
    pub fn temp_recv_path(&self) -> PathBuf {
        let suffix: u32 = rand::thread_rng().gen();
        self.vol_dir.join(format!(".recv-{suffix:08x}.tmp"))
    }

    /// Open the diff files of `diffs`, re-listing and retrying up to
    /// `max_retry` times when a file disappears under us (a concurrent
    /// GC), then return the merger inputs.
    pub fn open_diffs(
        &self,
        mgr: &MetaDiffManager,
        st: &MetaState,
        target_gid: u64,
        max_retry: usize,
        restore: bool,
    ) -> Result<(Vec<MetaDiff>, Vec<MergeInput>)> {
        let mut retry = 0;
        loop {
            let diffs = if restore {
                mgr.get_diff_list_to_restore(st, target_gid)?
            } else {
                mgr.get_diff_list_to_apply(st, target_gid)?
            };
            let mut inputs = Vec::with_capacity(diffs.len());
            let mut ok = true;
            for d in &diffs {
                match MergeInput::open(&self.diff_path(d)) {
                    Ok(input) => inputs.push(input),
                    Err(e) => {
                        retry += 1;
                        if retry >= max_retry {
                            return Err(Error::internal(format!(
                                "cannot open diff set after {retry} retries: {e}"
                            )));
                        }
                        tracing::warn!(vol = %self.vol_id, error = %e,
                            "diff set changed underfoot, retrying");
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                return Ok((diffs, inputs));
            }
        }
    }

    /// Write a merged diff stream into an image file. Discard and
    /// all-zero ranges are materialized as zero fill.
    pub fn apply_merger_to_image(
        &self,
        mut merger: DiffMerger,
        image_path: &Path,
    ) -> Result<()> {
        merger.prepare()?;
        let file = OpenOptions::new().read(true).write(true).open(image_path)?;
        let size_lb = std::fs::metadata(image_path)?.len() / LOGICAL_BLOCK_SIZE as u64;
        let mut zero: Vec<u8> = Vec::new();
        while let Some(entry) = merger.get_and_remove()? {
            let (rec, data) = entry.into_parts();
            if rec.end_io_address() > size_lb {
                return Err(Error::invalid_format(format!(
                    "diff record beyond image end: {} > {size_lb}",
                    rec.end_io_address()
                )));
            }
            let offset = rec.io_address * LOGICAL_BLOCK_SIZE as u64;
            if rec.is_normal() {
                file.write_all_at(&data, offset)?;
            } else {
                let len = rec.io_blocks as usize * LOGICAL_BLOCK_SIZE;
                if zero.len() < len {
                    zero.resize(len, 0);
                }
                file.write_all_at(&zero[..len], offset)?;
            }
        }
        file.sync_data()?;
        Ok(())
    }

    /// Apply diffs up to `target_gid` into the base image.
    ///
    /// The `applying` marker brackets the write so a crash is recovered
    /// by re-running apply. Applied diffs are garbage collected.
    pub fn apply(
        &self,
        mgr: &MetaDiffManager,
        target_gid: u64,
        max_retry: usize,
    ) -> Result<bool> {
        let st0 = self.get_meta_state()?;
        let (diffs, inputs) = self.open_diffs(mgr, &st0, target_gid, max_retry, false)?;
        if diffs.is_empty() {
            return Ok(false);
        }
        let marker = applying_state(&st0, &diffs);
        self.set_meta_state(&marker)?;

        let mut merger = DiffMerger::new(false);
        for input in inputs {
            merger.add_input(input);
        }
        self.apply_merger_to_image(merger, &self.image_path())?;

        let done = apply_state_all(&st0, &diffs);
        self.set_meta_state(&done)?;

        // Applied diffs are garbage now.
        for diff in mgr.erase_before_gid(done.snap_b.gid_b) {
            let _ = std::fs::remove_file(self.diff_path(&diff));
        }
        Ok(true)
    }

    /// Resume an interrupted apply if the persisted marker says one was
    /// in flight.
    pub fn recover_apply(&self, mgr: &MetaDiffManager, max_retry: usize) -> Result<bool> {
        let st = self.get_meta_state()?;
        if !st.is_applying() {
            return Ok(false);
        }
        tracing::info!(vol = %self.vol_id, state = %st, "resuming interrupted apply");
        self.apply(mgr, st.snap_e.gid_b, max_retry)?;
        Ok(true)
    }

    /// Materialize the clean snapshot `gid` as `r_<volId>_<gid>`.
    ///
    /// Returns false when the snapshot is already restored or not
    /// restorable.
    pub fn restore(&self, mgr: &MetaDiffManager, gid: u64, max_retry: usize) -> Result<bool> {
        let target = self.vol_dir.join(self.restored_image_name(gid));
        if target.exists() {
            return Ok(false);
        }
        let st0 = self.get_meta_state()?;
        let (diffs, inputs) = self.open_diffs(mgr, &st0, gid, max_retry, true)?;
        if diffs.is_empty() && !(st0.snap_b.is_clean() && st0.snap_b.gid_b == gid) {
            return Ok(false);
        }

        let tmp = self.vol_dir.join(format!("{}_tmp", self.restored_image_name(gid)));
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }
        std::fs::copy(self.image_path(), &tmp)?;
        if !diffs.is_empty() {
            let mut merger = DiffMerger::new(false);
            for input in inputs {
                merger.add_input(input);
            }
            self.apply_merger_to_image(merger, &tmp)?;
        }
        std::fs::rename(&tmp, &target)?;
        fsutil::sync_dir(&self.vol_dir)?;
        Ok(true)
    }

    /// Delete a restored image. Returns false when it does not exist.
    pub fn drop_restored(&self, gid: u64) -> Result<bool> {
        let target = self.vol_dir.join(self.restored_image_name(gid));
        if !target.exists() {
            return Ok(false);
        }
        std::fs::remove_file(target)?;
        Ok(true)
    }

    /// The gids of every restored image.
    pub fn list_restored(&self) -> Result<Vec<u64>> {
        let prefix = format!("{RESTORE_PREFIX}{}_", self.vol_id);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.vol_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(gid_str) = name.strip_prefix(&prefix) {
                if let Ok(gid) = gid_str.parse() {
                    out.push(gid);
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Remove diffs that no apply path from the base can reach.
    pub fn gc_diffs(&self, mgr: &MetaDiffManager) -> Result<usize> {
        let st = self.get_meta_state()?;
        let garbage = mgr.gc(&st.snap_b);
        let n = garbage.len();
        for diff in garbage {
            let _ = std::fs::remove_file(self.diff_path(&diff));
        }
        Ok(n)
    }

    /// Candidate runs for background consolidation inside `[ts0, ts1)`:
    /// mergeable runs split at boundaries, choosing the run with the
    /// smallest average file size. Single files are not candidates.
    pub fn candidates_to_consolidate(
        &self,
        mgr: &MetaDiffManager,
        ts0: u64,
        ts1: u64,
    ) -> Result<Vec<MetaDiff>> {
        let all: Vec<MetaDiff> = mgr
            .get_all()
            .into_iter()
            .filter(|d| ts0 <= d.timestamp && d.timestamp < ts1)
            .collect();
        let mut runs: Vec<Vec<MetaDiff>> = Vec::new();
        let mut run: Vec<MetaDiff> = Vec::new();
        for diff in all {
            if let Some(last) = run.last() {
                if !walb_meta::can_merge(last, &diff) {
                    runs.push(std::mem::take(&mut run));
                }
            }
            run.push(diff);
        }
        if !run.is_empty() {
            runs.push(run);
        }

        let mut best: Option<(f64, Vec<MetaDiff>)> = None;
        for run in runs {
            if run.len() < 2 {
                continue;
            }
            let total: u64 = run
                .iter()
                .map(|d| std::fs::metadata(self.diff_path(d)).map(|m| m.len()).unwrap_or(0))
                .sum();
            let avg = total as f64 / run.len() as f64;
            if best.as_ref().map_or(true, |(b, _)| avg < *b) {
                best = Some((avg, run));
            }
        }
        Ok(best.map(|(_, run)| run).unwrap_or_default())
    }

    /// Status lines for operators.
    pub fn status(&self, mgr: &MetaDiffManager) -> Result<Vec<String>> {
        let mut v = Vec::new();
        if !self.exists() {
            return Ok(v);
        }
        v.push(format!("volId {}", self.vol_id));
        v.push(format!("state {}", self.get_state()?));
        let st = self.get_meta_state()?;
        v.push(format!("base {st}"));
        v.push(format!("latest {}", mgr.get_latest_snapshot(&st)));
        let restored = self.list_restored()?;
        v.push(format!("numRestored {}", restored.len()));
        for gid in restored {
            v.push(format!("restored {gid}"));
        }
        let diffs = mgr.get_applicable_diff_list(&st.snap_b);
        v.push(format!("numWdiff {}", diffs.len()));
        for d in diffs {
            let size = std::fs::metadata(self.diff_path(&d)).map(|m| m.len()).unwrap_or(0);
            v.push(format!("wdiff {d} {} {size}", u8::from(d.is_mergeable)));
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use walb_core::Compression;
    use walb_diff::{DiffFileHeader, DiffFormat, DiffRecord, SortedDiffWriter};
    use walb_meta::MetaSnap;

    const UUID: [u8; 16] = [4; 16];

    fn setup(size_lb: u64) -> (TempDir, ArchiveVolInfo, MetaDiffManager) {
        let dir = TempDir::new().unwrap();
        let info = ArchiveVolInfo::new(dir.path(), "vol0");
        info.init().unwrap();
        info.create_image(size_lb).unwrap();
        info.set_uuid(UUID).unwrap();
        (dir, info, MetaDiffManager::new())
    }

    /// Write a wdiff whose records are (addr, blocks, fill) triples.
    fn write_wdiff(
        info: &ArchiveVolInfo,
        mgr: &MetaDiffManager,
        gid_b: u64,
        gid_e: u64,
        mergeable: bool,
        records: &[(u64, u32, u8)],
    ) -> MetaDiff {
        let mut diff = MetaDiff::clean(gid_b, gid_e, 1_400_000_000 + gid_e);
        diff.is_mergeable = mergeable;
        let file = std::fs::File::create(info.diff_path(&diff)).unwrap();
        let mut writer = SortedDiffWriter::new(std::io::BufWriter::new(file));
        writer.write_header(&DiffFileHeader::new(DiffFormat::Sorted, UUID)).unwrap();
        for &(addr, blocks, fill) in records {
            let data = vec![fill; blocks as usize * LOGICAL_BLOCK_SIZE];
            let mut rec = DiffRecord::normal(addr, blocks);
            rec.update_checksum(&data);
            writer
                .compress_and_write_diff(rec, &data, Compression::Snappy, 0)
                .unwrap();
        }
        writer.close().unwrap();
        mgr.add(diff).unwrap();
        diff
    }

    fn read_image_block(path: &Path, lb: u64) -> u8 {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = std::fs::File::open(path).unwrap();
        f.seek(SeekFrom::Start(lb * LOGICAL_BLOCK_SIZE as u64)).unwrap();
        let mut b = [0u8; 1];
        f.read_exact(&mut b).unwrap();
        b[0]
    }

    #[test]
    fn test_init_state_and_meta() {
        let (_dir, info, _mgr) = setup(64);
        assert_eq!(info.get_state().unwrap(), state::SYNC_READY);
        let st = info.get_meta_state().unwrap();
        assert_eq!(st.snap_b, MetaSnap::clean(0));
        assert!(!st.is_applying());
        assert!(info.set_state("Nope").is_err());
    }

    #[test]
    fn test_apply_writes_image_and_gc() {
        let (_dir, info, mgr) = setup(64);
        write_wdiff(&info, &mgr, 0, 1, false, &[(0, 4, 0x11)]);
        write_wdiff(&info, &mgr, 1, 2, true, &[(2, 4, 0x22)]);

        let applied = info.apply(&mgr, 2, 3).unwrap();
        assert!(applied);
        let st = info.get_meta_state().unwrap();
        assert!(!st.is_applying());
        assert_eq!(st.snap_b, MetaSnap::clean(2));

        let img = info.image_path();
        assert_eq!(read_image_block(&img, 0), 0x11);
        assert_eq!(read_image_block(&img, 1), 0x11);
        assert_eq!(read_image_block(&img, 2), 0x22);
        assert_eq!(read_image_block(&img, 5), 0x22);
        assert_eq!(read_image_block(&img, 6), 0x00);

        // Applied diffs were removed with their files.
        assert!(mgr.is_empty());
        assert!(info.scan_diffs().unwrap().is_empty());
    }

    #[test]
    fn test_recover_interrupted_apply() {
        let (_dir, info, mgr) = setup(64);
        let d1 = write_wdiff(&info, &mgr, 0, 1, false, &[(0, 2, 0x11)]);
        let d2 = write_wdiff(&info, &mgr, 1, 2, true, &[(2, 2, 0x22)]);
        // Simulate a crash after the marker was persisted but before the
        // write completed.
        let st0 = info.get_meta_state().unwrap();
        let marker = applying_state(&st0, &[d1, d2]);
        info.set_meta_state(&marker).unwrap();

        assert!(info.recover_apply(&mgr, 3).unwrap());
        let st = info.get_meta_state().unwrap();
        assert_eq!(st.snap_b, MetaSnap::clean(2));
        assert!(!st.is_applying());
        assert_eq!(read_image_block(&info.image_path(), 0), 0x11);
        assert_eq!(read_image_block(&info.image_path(), 2), 0x22);
    }

    #[test]
    fn test_restore_materializes_snapshot() {
        let (_dir, info, mgr) = setup(64);
        write_wdiff(&info, &mgr, 0, 1, false, &[(0, 2, 0x11)]);
        write_wdiff(&info, &mgr, 1, 2, true, &[(0, 1, 0x22)]);

        // Restore gid 1: only the first diff applies.
        assert!(info.restore(&mgr, 1, 3).unwrap());
        let restored = info.vol_dir().join(info.restored_image_name(1));
        assert_eq!(read_image_block(&restored, 0), 0x11);
        assert_eq!(read_image_block(&restored, 1), 0x11);
        // Base image untouched.
        assert_eq!(read_image_block(&info.image_path(), 0), 0x00);

        // Restore gid 2: both diffs.
        assert!(info.restore(&mgr, 2, 3).unwrap());
        let restored2 = info.vol_dir().join(info.restored_image_name(2));
        assert_eq!(read_image_block(&restored2, 0), 0x22);
        assert_eq!(read_image_block(&restored2, 1), 0x11);

        // Already restored.
        assert!(!info.restore(&mgr, 1, 3).unwrap());
        assert_eq!(info.list_restored().unwrap(), vec![1, 2]);
        assert!(info.drop_restored(1).unwrap());
        assert!(!info.drop_restored(1).unwrap());
    }

    #[test]
    fn test_restore_unreachable_gid() {
        let (_dir, info, mgr) = setup(64);
        write_wdiff(&info, &mgr, 0, 1, false, &[(0, 2, 0x11)]);
        assert!(!info.restore(&mgr, 9, 3).unwrap());
    }

    #[test]
    fn test_gc_removes_unreachable_diffs() {
        let (_dir, info, mgr) = setup(64);
        write_wdiff(&info, &mgr, 0, 1, false, &[(0, 2, 0x11)]);
        // Leftover diff from a previous history, unreachable from |0|.
        write_wdiff(&info, &mgr, 10, 11, false, &[(0, 1, 0x99)]);
        let n = info.gc_diffs(&mgr).unwrap();
        assert_eq!(n, 1);
        assert_eq!(mgr.len(), 1);
        assert_eq!(info.scan_diffs().unwrap().len(), 1);
    }

    #[test]
    fn test_consolidation_candidates() {
        let (_dir, info, mgr) = setup(64);
        write_wdiff(&info, &mgr, 0, 1, false, &[(0, 1, 1)]);
        write_wdiff(&info, &mgr, 1, 2, true, &[(0, 1, 2)]);
        write_wdiff(&info, &mgr, 2, 3, true, &[(0, 1, 3)]);
        // Boundary: not mergeable.
        write_wdiff(&info, &mgr, 3, 4, false, &[(0, 1, 4)]);

        let run = info
            .candidates_to_consolidate(&mgr, 0, u64::MAX)
            .unwrap();
        assert_eq!(run.len(), 3);
        assert_eq!(run[0].snap_b.gid_b, 0);
        assert_eq!(run[2].snap_e.gid_b, 3);

        // A time window that cuts the run down to one file yields no
        // candidates.
        let lone = info
            .candidates_to_consolidate(&mgr, 1_400_000_001, 1_400_000_002)
            .unwrap();
        assert!(lone.is_empty());
    }
}
