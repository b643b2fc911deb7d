//! Durable small-file I/O.
//!
//! Volume metadata lives in small files inside the volume directory.
//! Every write goes through a temp file in the same directory, is synced
//! with fdatasync, renamed into place, and the directory itself is synced
//! so the rename survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Sync a directory so renamed entries are persisted.
pub fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// A temp-file path in `dir` that will not collide with other writers.
fn temp_path(dir: &Path) -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    dir.join(format!(".tmp-{:08x}", suffix))
}

/// Write `data` to `dir/name` atomically.
pub fn save_bytes(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let tmp = temp_path(dir);
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    file.write_all(data)?;
    file.sync_data()?;
    drop(file);
    let target = dir.join(name);
    fs::rename(&tmp, &target)?;
    sync_dir(dir)?;
    Ok(())
}

/// Read the full contents of `dir/name`.
pub fn load_bytes(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(name);
    let mut file = File::open(&path)
        .map_err(|e| map_not_found(e, &path))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Write a serde value to `dir/name` atomically (bincode encoding).
pub fn save_record<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let data = bincode::serialize(value)
        .map_err(|e| Error::internal(format!("serialize {name}: {e}")))?;
    save_bytes(dir, name, &data)
}

/// Read a serde value from `dir/name` (bincode encoding).
pub fn load_record<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let data = load_bytes(dir, name)?;
    bincode::deserialize(&data)
        .map_err(|e| Error::invalid_format(format!("{}: {e}", dir.join(name).display())))
}

/// Write a text value to `dir/name` atomically.
pub fn save_text(dir: &Path, name: &str, value: &str) -> Result<()> {
    save_bytes(dir, name, value.as_bytes())
}

/// Read a text value from `dir/name`, trimming a trailing newline.
pub fn load_text(dir: &Path, name: &str) -> Result<String> {
    let data = load_bytes(dir, name)?;
    let s = String::from_utf8(data)
        .map_err(|e| Error::invalid_format(format!("{}: {e}", dir.join(name).display())))?;
    Ok(s.trim_end_matches('\n').to_string())
}

fn map_not_found(e: std::io::Error, path: &Path) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(path.display().to_string())
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Rec {
        a: u64,
        b: String,
    }

    #[test]
    fn test_save_load_record() {
        let dir = TempDir::new().unwrap();
        let rec = Rec { a: 42, b: "hello".into() };
        save_record(dir.path(), "rec", &rec).unwrap();
        let loaded: Rec = load_record(dir.path(), "rec").unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = TempDir::new().unwrap();
        save_text(dir.path(), "state", "SyncReady").unwrap();
        save_text(dir.path(), "state", "Master").unwrap();
        assert_eq!(load_text(dir.path(), "state").unwrap(), "Master");
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = load_text(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
