//! The proxy daemon.
//!
//! Receives wdiffs from storage nodes into a per-volume `master`
//! directory, hard-links each file into one subdirectory per configured
//! archive, and forwards the diffs downstream asynchronously. Hard links
//! make the fan-out O(1) and let each archive advance independently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod daemon;
mod forwarder;
mod vol_info;

pub use daemon::{
    register_handlers, state, ArchiveInfoReq, Proxy, ProxyVolState, StopReq, VolReq,
};
pub use forwarder::{forward_task_name, ForwardRunner};
pub use vol_info::{ArchiveRecord, ProxyVolInfo};
