//! Snapshot and diff metadata for WalB volumes.
//!
//! A volume's history is a DAG over snapshot identifiers (`gid`). Each wdiff
//! file carries a [`MetaDiff`] describing the snapshot transition it encodes;
//! the [`MetaDiffManager`] indexes the diffs of one volume and answers which
//! diffs to apply, merge, or garbage-collect for any target snapshot.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod diff;
mod lsid_gid;
mod manager;
mod snap;
mod state;

pub use diff::{
    can_merge, create_diff_file_name, merge, parse_diff_file_name, MetaDiff,
};
pub use lsid_gid::MetaLsidGid;
pub use manager::MetaDiffManager;
pub use snap::{apply_snap, can_apply_snap, MetaSnap};
pub use state::{
    apply_state, apply_state_all, applying_state, can_apply_state, MetaState,
};

/// Format a unix timestamp as `YYYYMMDDhhmmss` (UTC).
#[must_use]
pub fn format_timestamp(ts: u64) -> String {
    use chrono::{DateTime, Utc};
    match DateTime::<Utc>::from_timestamp(ts as i64, 0) {
        Some(dt) => dt.format("%Y%m%d%H%M%S").to_string(),
        None => "00000000000000".to_string(),
    }
}

/// Parse a `YYYYMMDDhhmmss` (UTC) string into a unix timestamp.
pub fn parse_timestamp(s: &str) -> walb_core::Result<u64> {
    use chrono::NaiveDateTime;
    let dt = NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S")
        .map_err(|e| walb_core::Error::invalid_format(format!("bad timestamp {s}: {e}")))?;
    Ok(dt.and_utc().timestamp() as u64)
}

/// The current unix time in seconds.
#[must_use]
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = 1_400_000_000;
        let s = format_timestamp(ts);
        assert_eq!(s.len(), 14);
        assert_eq!(parse_timestamp(&s).unwrap(), ts);
    }

    #[test]
    fn test_bad_timestamp() {
        assert!(parse_timestamp("not-a-time").is_err());
        assert!(parse_timestamp("2014").is_err());
    }
}
