//! Persistent per-volume data of the storage daemon.
//!
//! Volume directory layout: `state`, `uuid`, `path` (the wdev path),
//! `done` (the last fully transferred checkpoint), and `queue` (the
//! durable checkpoint FIFO).

use std::path::{Path, PathBuf};

use walb_core::{fsutil, Error, Result, MEBI, UUID_SIZE};
use walb_log::WdevOps;
use walb_meta::{now, MetaDiff, MetaLsidGid, MetaSnap};

use crate::daemon::state;
use crate::queue_file::QueueFile;

/// Resting states persisted in the `state` file.
const PERSISTENT_STATES: &[&str] =
    &[state::SYNC_READY, state::STOPPED, state::MASTER, state::SLAVE];

/// Persistent data of one storage volume.
pub struct StorageVolInfo {
    vol_dir: PathBuf,
    vol_id: String,
}

impl StorageVolInfo {
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

    /// Create the volume directory tree: empty queue, initial state
    /// `SyncReady`, unset done record and uuid.
    pub fn init(&self, wdev_path: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.vol_dir)?;
        {
            let mut qf = QueueFile::open(&self.queue_path())?;
            qf.sync()?;
        }
        fsutil::save_text(&self.vol_dir, "path", &wdev_path.display().to_string())?;
        self.set_state(state::SYNC_READY)?;
        self.set_done_record(&MetaLsidGid::default())?;
        self.set_uuid([0u8; UUID_SIZE])?;
        Ok(())
    }

    /// Remove the volume directory recursively.
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

    /// The wdev path this volume captures.
    pub fn get_wdev_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(fsutil::load_text(&self.vol_dir, "path")?))
    }

    /// The last fully transferred checkpoint.
    pub fn get_done_record(&self) -> Result<MetaLsidGid> {
        fsutil::load_record(&self.vol_dir, "done")
    }

    fn set_done_record(&self, rec: &MetaLsidGid) -> Result<()> {
        fsutil::save_record(&self.vol_dir, "done", rec)
    }

    fn queue_path(&self) -> PathBuf {
        self.vol_dir.join("queue")
    }

    /// Discard all wlog bookkeeping: clear the queue, restart the done
    /// record at `(lsid 0, gid)`, re-read the device uuid, and return the
    /// volume to `SyncReady`. Used after a device log reset.
    pub fn reset_wlog(&self, gid: u64, wdev: &dyn WdevOps) -> Result<()> {
        wdev.reset_wal()?;
        self.set_done_record(&MetaLsidGid::new(0, gid, false, now()))?;
        {
            let mut qf = QueueFile::open(&self.queue_path())?;
            qf.clear()?;
            qf.sync()?;
        }
        self.set_uuid(wdev.uuid()?)?;
        self.set_state(state::SYNC_READY)
    }

    /// Take a snapshot: push a fresh checkpoint with a new gid.
    /// Returns the gid.
    pub fn take_snapshot(&self, max_wlog_send_mb: u64, wdev: &dyn WdevOps) -> Result<u64> {
        let max_pb = self.max_wlog_send_pb(max_wlog_send_mb, wdev)?;
        let mut qf = QueueFile::open(&self.queue_path())?;
        self.take_snapshot_detail(max_pb, false, &mut qf, wdev)
    }

    /// Whether there are wlogs (or queued checkpoints) to transfer.
    pub fn is_required_wlog_transfer(&self, wdev: &dyn WdevOps) -> Result<bool> {
        let lsid0 = wdev.get_oldest_lsid()?;
        let lsid1 = wdev.get_permanent_lsid()?;
        if lsid0 < lsid1 {
            return Ok(true);
        }
        if lsid0 != lsid1 {
            return Err(Error::internal(format!(
                "oldest lsid {lsid0} beyond permanent lsid {lsid1}"
            )));
        }
        let qf = QueueFile::open(&self.queue_path())?;
        Ok(!qf.is_empty())
    }

    /// Delimit the next transfer unit.
    ///
    /// Returns `(recB, recE, lsidLimit)`: transfer wlogs in
    /// `[recB.lsid, lsidLimit)`; `lsidLimit <= recE.lsid`.
    pub fn prepare_wlog_transfer(
        &self,
        max_wlog_send_mb: u64,
        wdev: &dyn WdevOps,
    ) -> Result<(MetaLsidGid, MetaLsidGid, u64)> {
        let mut qf = QueueFile::open(&self.queue_path())?;
        let rec_b = self.get_done_record()?;
        let lsid0 = wdev.get_oldest_lsid()?;
        if lsid0 < rec_b.lsid {
            wdev.erase_wal(rec_b.lsid)?;
        }
        // Discard checkpoints made obsolete by the transferred prefix.
        let rec_e;
        loop {
            let Some(back) = qf.back().copied() else {
                rec_e = None;
                break;
            };
            back.verify()?;
            if back.lsid < rec_b.lsid || (back.lsid == rec_b.lsid && back.gid <= rec_b.gid) {
                qf.pop_back()?;
                continue;
            }
            rec_e = Some(back);
            break;
        }
        let max_pb = self.max_wlog_send_pb(max_wlog_send_mb, wdev)?;
        let rec_e = match rec_e {
            Some(r) => r,
            None => {
                self.take_snapshot_detail(max_pb, true, &mut qf, wdev)?;
                *qf.back().expect("snapshot just pushed")
            }
        };
        if rec_b.lsid > rec_e.lsid {
            return Err(Error::internal(format!(
                "checkpoint order violated: {rec_b} vs {rec_e}"
            )));
        }
        let lsid_limit = if rec_b.gid + 1 == rec_e.gid {
            rec_e.lsid
        } else {
            (rec_b.lsid + max_pb).min(rec_e.lsid)
        };
        Ok((rec_b, rec_e, lsid_limit))
    }

    /// The diff describing the transfer `[recB.lsid, lsidE)`.
    #[must_use]
    pub fn get_transfer_diff(
        &self,
        rec_b: &MetaLsidGid,
        rec_e: &MetaLsidGid,
        lsid_e: u64,
    ) -> MetaDiff {
        let snap_b = MetaSnap::clean(rec_b.gid);
        let snap_e = if lsid_e == rec_e.lsid {
            MetaSnap::clean(rec_e.gid)
        } else {
            MetaSnap::clean(rec_b.gid + 1)
        };
        let mut diff = MetaDiff::new(snap_b, snap_e, rec_e.timestamp, rec_b.is_mergeable);
        diff.is_comp_diff = false;
        diff
    }

    /// Record a finished transfer up to `lsid_e`. `rec_b` and `rec_e`
    /// must be unchanged since [`StorageVolInfo::prepare_wlog_transfer`].
    /// Returns whether wlogs remain.
    pub fn finish_wlog_transfer(
        &self,
        rec_b: &MetaLsidGid,
        rec_e: &MetaLsidGid,
        lsid_e: u64,
    ) -> Result<bool> {
        let done = self.get_done_record()?;
        if done.lsid != rec_b.lsid || done.gid != rec_b.gid {
            return Err(Error::internal(format!(
                "done record changed mid-transfer: {done} vs {rec_b}"
            )));
        }
        let mut qf = QueueFile::open(&self.queue_path())?;
        let Some(back) = qf.back().copied() else {
            return Err(Error::internal("queue must hold at least one record".to_string()));
        };
        if back.lsid != rec_e.lsid || back.gid != rec_e.gid {
            return Err(Error::internal(format!(
                "queue back changed mid-transfer: {back} vs {rec_e}"
            )));
        }
        if lsid_e < rec_b.lsid || lsid_e > rec_e.lsid {
            return Err(Error::internal(format!("lsidE {lsid_e} out of range")));
        }
        let new_done = if lsid_e == rec_e.lsid {
            MetaLsidGid::new(lsid_e, rec_e.gid, rec_e.is_mergeable, rec_e.timestamp)
        } else {
            MetaLsidGid::new(lsid_e, rec_b.gid + 1, true, now())
        };
        self.set_done_record(&new_done)?;
        if new_done.gid == rec_e.gid {
            qf.pop_back()?;
        }
        Ok(!qf.is_empty())
    }

    /// Verbose status lines for operators.
    pub fn status(&self, verbose: bool) -> Result<Vec<String>> {
        let mut v = Vec::new();
        if !self.exists() {
            return Ok(v);
        }
        v.push(format!("volId {}", self.vol_id));
        v.push(format!("wdevPath {}", self.get_wdev_path()?.display()));
        v.push(format!("state {}", self.get_state()?));
        v.push(format!("uuid {}", hex_string(&self.get_uuid()?)));
        if verbose {
            v.push(format!("done {}", self.get_done_record()?));
            let qf = QueueFile::open(&self.queue_path())?;
            for rec in qf.iter() {
                v.push(format!("queue {rec}"));
            }
        }
        Ok(v)
    }

    fn max_wlog_send_pb(&self, max_wlog_send_mb: u64, wdev: &dyn WdevOps) -> Result<u64> {
        let pbs = wdev.pbs()?;
        let max_pb = max_wlog_send_mb * (MEBI / u64::from(pbs));
        if max_pb == 0 {
            return Err(Error::internal("maxWlogSendPb must be positive".to_string()));
        }
        Ok(max_pb)
    }

    fn take_snapshot_detail(
        &self,
        max_pb: u64,
        is_mergeable: bool,
        qf: &mut QueueFile,
        wdev: &dyn WdevOps,
    ) -> Result<u64> {
        let pre = match qf.front() {
            Some(r) => {
                r.verify()?;
                *r
            }
            None => self.get_done_record()?,
        };
        let lsid = wdev.get_permanent_lsid()?;
        if wdev.is_overflow()? {
            return Err(Error::Overflow(format!("wlog overflow on {}", self.vol_id)));
        }
        if pre.lsid > lsid {
            return Err(Error::internal(format!(
                "checkpoint lsid {} beyond permanent lsid {lsid}",
                pre.lsid
            )));
        }
        let gid = pre.gid + 1 + (lsid - pre.lsid) / max_pb;
        let cur = MetaLsidGid::new(lsid, gid, is_mergeable, now());
        qf.push_front(cur)?;
        qf.sync()?;
        tracing::debug!(vol = %self.vol_id, rec = %cur, "took snapshot");
        Ok(gid)
    }
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
