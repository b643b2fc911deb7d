//! Per-archive forwarders.
//!
//! One background task per `(volume, archive)` pair merges the queued
//! wdiffs in the archive's slave directory into a single transfer and
//! ships it with `wdiff-send`. Successful transfers unlink the consumed
//! files so each archive advances independently.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use walb_core::{Compression, Error, Result};
use walb_diff::DiffMerger;
use walb_meta::{create_diff_file_name, merge, MetaDiff};
use walb_proto::{
    connect, send_wdiff_stream, TaskRunner, WdiffSendReq, PROTO_WDIFF_SEND,
};

use crate::daemon::{state, Proxy};

/// Background task name of one `(volume, archive)` forward unit.
#[must_use]
pub fn forward_task_name(vol_id: &str, archive: &str) -> String {
    format!("{vol_id}/{archive}")
}

fn split_task_name(name: &str) -> Result<(&str, &str)> {
    name.split_once('/')
        .ok_or_else(|| Error::internal(format!("bad forward task name: {name}")))
}

/// Forwards queued wdiffs of one archive downstream.
pub struct ForwardRunner {
    proxy: Arc<Proxy>,
}

impl ForwardRunner {
    /// Build a runner over the daemon context.
    #[must_use]
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }

    /// Pick the diffs to merge into one transfer, bounded by the
    /// configured count and total size.
    fn pick_transfer_diffs(&self, vol_id: &str, archive: &str) -> Result<Vec<MetaDiff>> {
        let ctx = &self.proxy;
        let st = ctx.vol_state(vol_id);
        let mgr = st.archive_mgr(archive)?;
        let (min_gid, _) = mgr.get_min_max_gid();
        if mgr.is_empty() {
            return Ok(Vec::new());
        }
        let info = ctx.vol_info(vol_id);
        let slave_dir = info.slave_dir(archive);
        let mut total: u64 = 0;
        let mut count = 0usize;
        let max_nr = ctx.max_wdiff_send_nr;
        let max_size = ctx.max_wdiff_send_size;
        let diffs = mgr.get_mergeable_diff_list(min_gid, |d| {
            count += 1;
            if count >= max_nr {
                return false;
            }
            let size = std::fs::metadata(slave_dir.join(create_diff_file_name(d)))
                .map(|m| m.len())
                .unwrap_or(0);
            total += size;
            total <= max_size
        });
        Ok(diffs)
    }

    async fn forward_one(&self, vol_id: &str, archive: &str) -> Result<bool> {
        let ctx = &self.proxy;
        let info = ctx.vol_info(vol_id);
        let record = info.archive_record(archive)?;
        let diffs = self.pick_transfer_diffs(vol_id, archive)?;
        if diffs.is_empty() {
            return Ok(false);
        }
        let merged_meta = diffs[1..]
            .iter()
            .fold(diffs[0], |acc, d| merge(&acc, d));
        debug!(vol = %vol_id, archive, n = diffs.len(), diff = %merged_meta, "forwarding");

        let slave_dir = info.slave_dir(archive);
        let paths: Vec<_> =
            diffs.iter().map(|d| slave_dir.join(create_diff_file_name(d))).collect();
        let mut merger = DiffMerger::new(true);
        merger.add_wdiff_files(&paths)?;
        merger.prepare()?;
        let uuid = merger.uuid();

        let mut stream =
            connect(record.addr, &ctx.node_id, PROTO_WDIFF_SEND, ctx.socket_timeout).await?;
        let req = WdiffSendReq { vol_id: vol_id.to_string(), diff: merged_meta, uuid };
        let control = ctx.control.clone();
        send_wdiff_stream(&mut stream, &req, move || {
            control.check()?;
            match merger.get_and_remove()? {
                Some(entry) => {
                    let (mut rec, data) = entry.into_parts();
                    if rec.is_normal() {
                        let packed =
                            walb_core::compress::compress(Compression::Snappy, &data, 0)?;
                        rec.compression = Compression::Snappy;
                        rec.data_size = packed.len() as u32;
                        rec.update_checksum(&packed);
                        Ok(Some((rec, packed)))
                    } else {
                        Ok(Some((rec, data)))
                    }
                }
                None => Ok(None),
            }
        })
        .await?;

        // Acked: drop the consumed links and their index entries.
        let st = ctx.vol_state(vol_id);
        let mgr = st.archive_mgr(archive)?;
        mgr.erase_all(&diffs);
        for path in &paths {
            let _ = std::fs::remove_file(path);
        }
        info!(vol = %vol_id, archive, diff = %merged_meta, "wdiff forwarded");
        Ok(!mgr.is_empty())
    }
}

#[async_trait]
impl TaskRunner for ForwardRunner {
    async fn run_task(&self, name: &str) -> Result<()> {
        let (vol_id, archive) = split_task_name(name)?;
        let st = self.proxy.vol_state(vol_id);
        // Forwarding runs while the volume accepts diffs, including the
        // receive and drain transients (a task queued mid-receive must
        // not be dropped).
        let cur = st.sm.get();
        if cur != state::STARTED
            && cur != state::T_WLOG_RECV
            && cur != state::T_WAIT_FOR_EMPTY
        {
            return Ok(());
        }
        match self.forward_one(vol_id, archive).await {
            Ok(true) => {
                if let Some(queue) = self.proxy.task_queue.get() {
                    queue.push(name);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
