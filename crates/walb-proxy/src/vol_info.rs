//! Persistent per-volume data of the proxy daemon.
//!
//! Layout under the volume directory:
//! - `master/`: freshly received wdiffs
//! - `slave/<archive>/`: per-archive hard links
//! - `<archive>.server`: the archive's address record

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};
use walb_core::{fsutil, Error, Result};
use walb_meta::{create_diff_file_name, parse_diff_file_name, MetaDiff};

const SERVER_SUFFIX: &str = ".server";

/// Address record of a configured archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// The archive daemon address.
    pub addr: SocketAddr,
}

/// Persistent data of one proxy volume.
pub struct ProxyVolInfo {
    vol_dir: PathBuf,
    vol_id: String,
}

impl ProxyVolInfo {
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

    /// Whether the volume directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.vol_dir.is_dir()
    }

    /// Create the directory tree.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.master_dir())?;
        std::fs::create_dir_all(self.slave_root())?;
        Ok(())
    }

    /// Remove the volume directory recursively.
    pub fn clear(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.vol_dir)?;
        Ok(())
    }

    /// The master directory.
    #[must_use]
    pub fn master_dir(&self) -> PathBuf {
        self.vol_dir.join("master")
    }

    fn slave_root(&self) -> PathBuf {
        self.vol_dir.join("slave")
    }

    /// The per-archive slave directory.
    #[must_use]
    pub fn slave_dir(&self, archive: &str) -> PathBuf {
        self.slave_root().join(archive)
    }

    /// A fresh temp path inside the master directory, safe to rename
    /// into place on the same filesystem.
    #[must_use]
    pub fn temp_recv_path(&self) -> PathBuf {
        let suffix: u32 = rand::thread_rng().gen();
        self.master_dir().join(format!(".recv-{suffix:08x}.tmp"))
    }

    /// Register an archive: persist its address record and create its
    /// slave directory.
    pub fn add_archive(&self, name: &str, addr: SocketAddr) -> Result<()> {
        if self.archive_record(name).is_ok() {
            return Err(Error::bad_state(format!("archive already exists: {name}")));
        }
        std::fs::create_dir_all(self.slave_dir(name))?;
        fsutil::save_record(
            &self.vol_dir,
            &format!("{name}{SERVER_SUFFIX}"),
            &ArchiveRecord { addr },
        )
    }

    /// Remove an archive: its record, its slave directory, and every
    /// link inside.
    pub fn remove_archive(&self, name: &str) -> Result<()> {
        self.archive_record(name)?;
        std::fs::remove_file(self.vol_dir.join(format!("{name}{SERVER_SUFFIX}")))?;
        std::fs::remove_dir_all(self.slave_dir(name))?;
        Ok(())
    }

    /// The persisted address record of an archive.
    pub fn archive_record(&self, name: &str) -> Result<ArchiveRecord> {
        fsutil::load_record(&self.vol_dir, &format!("{name}{SERVER_SUFFIX}"))
    }

    /// Every configured archive with its address.
    pub fn list_archives(&self) -> Result<Vec<(String, SocketAddr)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.vol_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(archive) = name.strip_suffix(SERVER_SUFFIX) {
                let rec: ArchiveRecord = fsutil::load_record(&self.vol_dir, &name)?;
                out.push((archive.to_string(), rec.addr));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Scan a directory for wdiff files.
    pub fn scan_diffs(dir: &Path) -> Result<Vec<MetaDiff>> {
        let mut out = Vec::new();
        if !dir.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(dir)? {
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

    /// Hard-link a freshly arrived master file into every archive's
    /// slave directory, then drop master entries the link made obsolete.
    ///
    /// Returns the archives that received a link.
    pub fn fan_out(&self, diff: &MetaDiff) -> Result<Vec<String>> {
        let name = create_diff_file_name(diff);
        let master_path = self.master_dir().join(&name);
        if !master_path.is_file() {
            return Err(Error::not_found(format!("master wdiff missing: {name}")));
        }
        let mut linked = Vec::new();
        for (archive, _) in self.list_archives()? {
            let target = self.slave_dir(&archive).join(&name);
            if target.exists() {
                continue; // retried transfer; the link is already there
            }
            std::fs::hard_link(&master_path, &target)?;
            linked.push(archive);
        }
        self.remove_master_before_gid(diff.snap_e.gid_b)?;
        Ok(linked)
    }

    /// Unlink master files fully covered below `gid`.
    pub fn remove_master_before_gid(&self, gid: u64) -> Result<()> {
        for diff in Self::scan_diffs(&self.master_dir())? {
            if diff.snap_e.gid_b <= gid {
                let path = self.master_dir().join(create_diff_file_name(&diff));
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Unlink slave files fully covered below `gid`. Returns the removed
    /// diffs.
    pub fn remove_slave_before_gid(&self, archive: &str, gid: u64) -> Result<Vec<MetaDiff>> {
        let dir = self.slave_dir(archive);
        let mut removed = Vec::new();
        for diff in Self::scan_diffs(&dir)? {
            if diff.snap_e.gid_b <= gid {
                std::fs::remove_file(dir.join(create_diff_file_name(&diff)))?;
                removed.push(diff);
            }
        }
        Ok(removed)
    }

    /// Status lines for operators.
    pub fn status(&self) -> Result<Vec<String>> {
        let mut v = Vec::new();
        if !self.exists() {
            return Ok(v);
        }
        v.push(format!("volId {}", self.vol_id));
        let archives = self.list_archives()?;
        v.push(format!("numArchive {}", archives.len()));
        for (name, addr) in &archives {
            v.push(format!("archive {name} {addr}"));
            for diff in Self::scan_diffs(&self.slave_dir(name))? {
                v.push(format!("  wdiff {diff}"));
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn diff(gid_b: u64, gid_e: u64) -> MetaDiff {
        let mut d = MetaDiff::clean(gid_b, gid_e, 1_400_000_000);
        d.is_mergeable = true;
        d
    }

    fn write_master_file(info: &ProxyVolInfo, d: &MetaDiff) {
        let path = info.master_dir().join(create_diff_file_name(d));
        std::fs::write(path, b"dummy wdiff bytes").unwrap();
    }

    #[test]
    fn test_init_and_archives() {
        let dir = TempDir::new().unwrap();
        let info = ProxyVolInfo::new(dir.path(), "vol0");
        info.init().unwrap();
        info.add_archive("a0", addr(5300)).unwrap();
        info.add_archive("a1", addr(5301)).unwrap();
        assert!(info.add_archive("a0", addr(5300)).is_err());

        let archives = info.list_archives().unwrap();
        assert_eq!(archives.len(), 2);
        assert_eq!(archives[0].0, "a0");
        assert_eq!(info.archive_record("a1").unwrap().addr, addr(5301));

        info.remove_archive("a0").unwrap();
        assert_eq!(info.list_archives().unwrap().len(), 1);
        assert!(info.remove_archive("a0").is_err());
    }

    #[test]
    fn test_fan_out_links_and_cleans_master() {
        let dir = TempDir::new().unwrap();
        let info = ProxyVolInfo::new(dir.path(), "vol0");
        info.init().unwrap();
        info.add_archive("a0", addr(5300)).unwrap();
        info.add_archive("a1", addr(5301)).unwrap();

        let d = diff(0, 1);
        write_master_file(&info, &d);
        let linked = info.fan_out(&d).unwrap();
        assert_eq!(linked.len(), 2);
        let name = create_diff_file_name(&d);
        assert!(info.slave_dir("a0").join(&name).is_file());
        assert!(info.slave_dir("a1").join(&name).is_file());
        // The master copy was dropped once every archive had its link.
        assert!(!info.master_dir().join(&name).exists());

        // The slave copies are independent: removing one does not affect
        // the other.
        info.remove_slave_before_gid("a0", 1).unwrap();
        assert!(!info.slave_dir("a0").join(&name).exists());
        assert!(info.slave_dir("a1").join(&name).is_file());
    }

    #[test]
    fn test_fan_out_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let info = ProxyVolInfo::new(dir.path(), "vol0");
        info.init().unwrap();
        info.add_archive("a0", addr(5300)).unwrap();
        let d = diff(0, 1);
        write_master_file(&info, &d);
        info.fan_out(&d).unwrap();
        // A retried arrival recreates the master file and fans out again.
        write_master_file(&info, &d);
        let linked = info.fan_out(&d).unwrap();
        assert!(linked.is_empty());
    }

    #[test]
    fn test_scan_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        let info = ProxyVolInfo::new(dir.path(), "vol0");
        info.init().unwrap();
        let d = diff(3, 7);
        write_master_file(&info, &d);
        std::fs::write(info.master_dir().join("notes.txt"), b"x").unwrap();
        std::fs::write(info.master_dir().join("broken.wdiff"), b"x").unwrap();
        let diffs = ProxyVolInfo::scan_diffs(&info.master_dir()).unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0], d);
    }
}
