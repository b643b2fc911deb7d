//! The storage daemon.
//!
//! Owns the wdev/ldev pair of each volume: takes snapshots by pushing
//! checkpoints onto a durable queue, cuts the wlog into transfer units,
//! converts them to wdiffs, and sends them to the configured proxies.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod daemon;
mod monitor;
mod queue_file;
mod vol_info;

pub use daemon::{
    register_handlers, state, InitVolReq, ResetVolReq, StartReq, Storage, StorageVolState,
    VolReq, WlogSendRunner,
};
pub use monitor::{proxy_monitor, wdev_monitor, ProxyManager};
pub use queue_file::QueueFile;
pub use vol_info::StorageVolInfo;
