//! The archive daemon.
//!
//! Keeps the base image of every volume plus its wdiff history. Received
//! diffs are indexed by the meta-diff manager; apply absorbs a merged
//! diff prefix into the base image behind an `applying` crash marker;
//! restore materializes any restorable snapshot as an image copy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod daemon;
mod vol_info;

pub use daemon::{
    register_handlers, state, Archive, ArchiveTaskRunner, ArchiveVolState,
    ChangeSnapshotReq, FullBkpReq, GidReq, InitVolReq, VolReq,
};
pub use vol_info::ArchiveVolInfo;
