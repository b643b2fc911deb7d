//! Archive daemon context, state machine, and protocol handlers.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{info, warn};
use walb_core::{Error, Result, StateMachine};
use walb_meta::{create_diff_file_name, MetaDiffManager, MetaState};
use walb_proto::{
    recv_msg, recv_wdiff_stream, send_msg, ProtocolHandler, ProtocolServer, Reply,
    ServerControl, TaskQueue, TaskRunner, WdiffSendReq, PROTO_WDIFF_SEND,
};

use crate::vol_info::ArchiveVolInfo;

/// Archive state names, resting and transient.
pub mod state {
    /// No volume data.
    pub const CLEAR: &str = "Clear";
    /// Initialized, waiting for the base image.
    pub const SYNC_READY: &str = "SyncReady";
    /// Serving: accepting diffs, apply and restore allowed.
    pub const ARCHIVED: &str = "Archived";
    /// Paused.
    pub const STOPPED: &str = "Stopped";

    /// Transient: volume initialization.
    pub const T_INIT_VOL: &str = "InitVol";
    /// Transient: volume removal.
    pub const T_CLEAR_VOL: &str = "ClearVol";
    /// Transient: full sync hand-off.
    pub const T_FULL_SYNC: &str = "FullSync";
    /// Transient: hash sync hand-off.
    pub const T_HASH_SYNC: &str = "HashSync";
    /// Transient: receiving a wdiff.
    pub const T_WDIFF_RECV: &str = "WdiffRecv";
    /// Transient: stopping.
    pub const T_STOP: &str = "Stop";
    /// Transient: starting.
    pub const T_START: &str = "Start";
}

/// The archive state transition table.
static STATE_TABLE: &[(&str, &str)] = &[
    (state::CLEAR, state::T_INIT_VOL),
    (state::T_INIT_VOL, state::SYNC_READY),
    (state::SYNC_READY, state::T_CLEAR_VOL),
    (state::STOPPED, state::T_CLEAR_VOL),
    (state::T_CLEAR_VOL, state::CLEAR),
    (state::SYNC_READY, state::T_FULL_SYNC),
    (state::T_FULL_SYNC, state::ARCHIVED),
    (state::ARCHIVED, state::T_HASH_SYNC),
    (state::T_HASH_SYNC, state::ARCHIVED),
    (state::STOPPED, state::T_START),
    (state::T_START, state::ARCHIVED),
    (state::ARCHIVED, state::T_STOP),
    (state::T_STOP, state::STOPPED),
    (state::ARCHIVED, state::T_WDIFF_RECV),
    (state::T_WDIFF_RECV, state::ARCHIVED),
];

/// States in which a `wdiff-send` request is accepted.
const ACCEPT_FOR_WDIFF_SEND: &[&str] = &[state::ARCHIVED, state::T_WDIFF_RECV];

/// In-memory state of one archive volume.
pub struct ArchiveVolState {
    /// The volume state machine.
    pub sm: StateMachine,
    /// Index over the volume's diff files.
    pub mgr: MetaDiffManager,
}

/// The archive daemon context.
pub struct Archive {
    /// Node id used in greetings.
    pub node_id: String,
    /// Base directory holding the volume directories.
    pub base_dir: PathBuf,
    /// Open-retry ceiling for restore and apply.
    pub restore_max_retry: usize,
    /// Socket timeout for transfers.
    pub socket_timeout: Duration,
    /// Shutdown control.
    pub control: ServerControl,
    /// Background queue for apply/restore tasks; set once the dispatcher
    /// is up.
    pub task_queue: OnceLock<TaskQueue>,
    vol_states: DashMap<String, Arc<ArchiveVolState>>,
}

impl Archive {
    /// Build the daemon context.
    #[must_use]
    pub fn new(
        node_id: String,
        base_dir: PathBuf,
        restore_max_retry: usize,
        socket_timeout: Duration,
        control: ServerControl,
    ) -> Self {
        Self {
            node_id,
            base_dir,
            restore_max_retry,
            socket_timeout,
            control,
            task_queue: OnceLock::new(),
            vol_states: DashMap::new(),
        }
    }

    /// The volume state, recovering the state file, the diff index, and
    /// any interrupted apply on first access.
    pub fn vol_state(&self, vol_id: &str) -> Arc<ArchiveVolState> {
        self.vol_states
            .entry(vol_id.to_string())
            .or_insert_with(|| {
                let info = self.vol_info(vol_id);
                let initial =
                    info.get_state().unwrap_or_else(|_| state::CLEAR.to_string());
                let st = ArchiveVolState {
                    sm: StateMachine::new(&initial, STATE_TABLE),
                    mgr: MetaDiffManager::new(),
                };
                if info.exists() {
                    if let Err(e) = info.reload_manager(&st.mgr) {
                        warn!(vol = %vol_id, error = %e, "diff reload failed");
                    }
                    match info.recover_apply(&st.mgr, self.restore_max_retry) {
                        Ok(true) => info!(vol = %vol_id, "interrupted apply recovered"),
                        Ok(false) => {}
                        Err(e) => warn!(vol = %vol_id, error = %e, "apply recovery failed"),
                    }
                }
                Arc::new(st)
            })
            .clone()
    }

    /// The persistent data of a volume.
    #[must_use]
    pub fn vol_info(&self, vol_id: &str) -> ArchiveVolInfo {
        ArchiveVolInfo::new(&self.base_dir, vol_id)
    }

    /// Volume ids present under the base directory.
    #[must_use]
    pub fn list_volumes(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }
}

// ---- control messages ----

/// Request naming just a volume.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolReq {
    /// Volume id.
    pub vol_id: String,
}

/// `init-vol` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct InitVolReq {
    /// Volume id.
    pub vol_id: String,
}

/// A request naming a volume and a gid.
#[derive(Debug, Serialize, Deserialize)]
pub struct GidReq {
    /// Volume id.
    pub vol_id: String,
    /// Target gid.
    pub gid: u64,
}

/// `full-bkp` bookkeeping request: create the base image.
#[derive(Debug, Serialize, Deserialize)]
pub struct FullBkpReq {
    /// Volume id.
    pub vol_id: String,
    /// Image size in logical blocks.
    pub size_lb: u64,
    /// Device uuid.
    pub uuid: [u8; 16],
}

macro_rules! reply_result {
    ($stream:expr, $result:expr) => {{
        let reply = match &$result {
            Ok(v) => Reply::Ok(v.clone()),
            Err(e) => Reply::from_error(e),
        };
        send_msg($stream, &reply).await?;
        Ok(())
    }};
}

struct InitVolHandler;

#[async_trait]
impl ProtocolHandler<Archive> for InitVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: InitVolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::CLEAR, state::T_INIT_VOL)?;
            ctx.vol_info(&req.vol_id).init()?;
            tran.commit(state::SYNC_READY)?;
            info!(vol = %req.vol_id, "archive volume initialized");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct ClearVolHandler;

#[async_trait]
impl ProtocolHandler<Archive> for ClearVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let cur = st.sm.get();
            let tran = st.sm.begin(&cur, state::T_CLEAR_VOL)?;
            ctx.vol_info(&req.vol_id).clear()?;
            tran.commit(state::CLEAR)?;
            info!(vol = %req.vol_id, "archive volume cleared");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

/// Full-backup bookkeeping: create the base image and enter `Archived`.
/// The bulk image transfer itself is outside the replication core.
struct FullBkpHandler;

#[async_trait]
impl ProtocolHandler<Archive> for FullBkpHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: FullBkpReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::SYNC_READY, state::T_FULL_SYNC)?;
            let info = ctx.vol_info(&req.vol_id);
            info.create_image(req.size_lb)?;
            info.set_uuid(req.uuid)?;
            info.set_meta_state(&MetaState::default())?;
            info.set_state(state::ARCHIVED)?;
            tran.commit(state::ARCHIVED)?;
            info!(vol = %req.vol_id, size_lb = req.size_lb, "base image created");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StartHandler;

#[async_trait]
impl ProtocolHandler<Archive> for StartHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::STOPPED, state::T_START)?;
            ctx.vol_info(&req.vol_id).set_state(state::ARCHIVED)?;
            tran.commit(state::ARCHIVED)?;
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StopHandler;

#[async_trait]
impl ProtocolHandler<Archive> for StopHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::ARCHIVED, state::T_STOP)?;
            ctx.vol_info(&req.vol_id).set_state(state::STOPPED)?;
            tran.commit(state::STOPPED)?;
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct RestoreHandler;

#[async_trait]
impl ProtocolHandler<Archive> for RestoreHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: GidReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::ARCHIVED])?;
            let queue = ctx
                .task_queue
                .get()
                .ok_or_else(|| Error::internal("task queue not running".to_string()))?;
            queue.push(&format!("restore:{}:{}", req.vol_id, req.gid));
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct ApplyHandler;

#[async_trait]
impl ProtocolHandler<Archive> for ApplyHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: GidReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::ARCHIVED])?;
            let state = ctx.vol_info(&req.vol_id).get_meta_state()?;
            if st.mgr.get_diff_list_to_apply(&state, req.gid)?.is_empty() {
                return Err(Error::not_found(format!(
                    "nothing to apply up to gid {}",
                    req.gid
                )));
            }
            let queue = ctx
                .task_queue
                .get()
                .ok_or_else(|| Error::internal("task queue not running".to_string()))?;
            queue.push(&format!("apply:{}:{}", req.vol_id, req.gid));
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

/// `change-snapshot` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeSnapshotReq {
    /// Volume id.
    pub vol_id: String,
    /// Gid whose outgoing diffs change.
    pub gid: u64,
    /// True pins an explicit snapshot boundary at `gid`; false removes
    /// it.
    pub enable: bool,
}

struct ChangeSnapshotHandler;

#[async_trait]
impl ProtocolHandler<Archive> for ChangeSnapshotHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: ChangeSnapshotReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::ARCHIVED, state::STOPPED])?;
            let changed = st
                .mgr
                .change_snapshot(req.gid, req.enable)
                .ok_or_else(|| Error::not_found(format!("no diff starts at gid {}", req.gid)))?;
            // The flag is part of the file name; rename to persist it.
            let info = ctx.vol_info(&req.vol_id);
            for new_diff in &changed {
                let mut old_diff = *new_diff;
                old_diff.is_mergeable = !new_diff.is_mergeable;
                std::fs::rename(info.diff_path(&old_diff), info.diff_path(new_diff))?;
            }
            Ok(changed.len())
        })();
        reply_result!(stream, result)
    }
}

struct RestorableHandler;

#[async_trait]
impl ProtocolHandler<Archive> for RestorableHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::ARCHIVED, state::STOPPED])?;
            let meta = ctx.vol_info(&req.vol_id).get_meta_state()?;
            st.mgr.get_clean_snapshot_list(&meta)
        })();
        reply_result!(stream, result)
    }
}

struct GcHandler;

#[async_trait]
impl ProtocolHandler<Archive> for GcHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::ARCHIVED, state::STOPPED])?;
            let queue = ctx
                .task_queue
                .get()
                .ok_or_else(|| Error::internal("task queue not running".to_string()))?;
            queue.push(&format!("gc:{}", req.vol_id));
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct GetStateHandler;

#[async_trait]
impl ProtocolHandler<Archive> for GetStateHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result: Result<String> = Ok(ctx.vol_state(&req.vol_id).sm.get());
        reply_result!(stream, result)
    }
}

struct StatusHandler;

#[async_trait]
impl ProtocolHandler<Archive> for StatusHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let st = ctx.vol_state(&req.vol_id);
        let result = ctx.vol_info(&req.vol_id).status(&st.mgr);
        reply_result!(stream, result)
    }
}

/// The `wdiff-send` receive side of the archive.
struct WdiffRecvHandler;

#[async_trait]
impl ProtocolHandler<Archive> for WdiffRecvHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Archive>) -> Result<()> {
        let req: WdiffSendReq = recv_msg(stream).await?;
        let st = ctx.vol_state(&req.vol_id);

        let accept = (|| {
            req.diff.verify()?;
            st.sm.verify_in(ACCEPT_FOR_WDIFF_SEND)?;
            let info = ctx.vol_info(&req.vol_id);
            let uuid = info.get_uuid()?;
            if uuid != [0u8; 16] && uuid != req.uuid {
                return Err(Error::invalid_format("device uuid mismatch".to_string()));
            }
            Ok(())
        })();
        if let Err(e) = accept {
            let reply: Reply<()> = Reply::from_error(&e);
            send_msg(stream, &reply).await?;
            return Err(e);
        }
        send_msg(stream, &Reply::Ok(())).await?;

        let tran = match st.sm.begin(state::ARCHIVED, state::T_WDIFF_RECV) {
            Ok(t) => Some(t),
            Err(_) => None,
        };
        let info = ctx.vol_info(&req.vol_id);
        let tmp = info.temp_recv_path();
        let outcome = match recv_wdiff_stream(stream, &tmp, req.uuid).await {
            Ok(()) => {
                if st.mgr.exists(&req.diff) {
                    // Retried transfer; keep the first arrival.
                    let _ = std::fs::remove_file(&tmp);
                    Ok(())
                } else {
                    let name = create_diff_file_name(&req.diff);
                    std::fs::rename(&tmp, info.vol_dir().join(&name))
                        .map_err(Error::Io)
                        .and_then(|()| {
                            st.mgr.add(req.diff)?;
                            info!(vol = %req.vol_id, diff = %req.diff, "wdiff archived");
                            Ok(())
                        })
                }
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        };
        walb_proto::ack_wdiff_stream(stream, &outcome).await?;
        if let Some(tran) = tran {
            tran.commit(state::ARCHIVED)?;
        }
        outcome
    }
}

/// Register every archive protocol on `server`.
pub fn register_handlers(server: &mut ProtocolServer<Archive>) {
    server.register("init-vol", Arc::new(InitVolHandler));
    server.register("clear-vol", Arc::new(ClearVolHandler));
    server.register("full-bkp", Arc::new(FullBkpHandler));
    server.register("start", Arc::new(StartHandler));
    server.register("stop", Arc::new(StopHandler));
    server.register("restore", Arc::new(RestoreHandler));
    server.register("apply", Arc::new(ApplyHandler));
    server.register("restorable", Arc::new(RestorableHandler));
    server.register("change-snapshot", Arc::new(ChangeSnapshotHandler));
    server.register("gc", Arc::new(GcHandler));
    server.register("get-state", Arc::new(GetStateHandler));
    server.register("status", Arc::new(StatusHandler));
    server.register(PROTO_WDIFF_SEND, Arc::new(WdiffRecvHandler));
}

/// Background runner for archive tasks.
///
/// Task names: `apply:<vol>:<gid>`, `restore:<vol>:<gid>`, `gc:<vol>`.
pub struct ArchiveTaskRunner {
    archive: Arc<Archive>,
}

impl ArchiveTaskRunner {
    /// Build a runner over the daemon context.
    #[must_use]
    pub fn new(archive: Arc<Archive>) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl TaskRunner for ArchiveTaskRunner {
    async fn run_task(&self, name: &str) -> Result<()> {
        let parts: Vec<&str> = name.split(':').collect();
        let ctx = &self.archive;
        match parts.as_slice() {
            ["apply", vol_id, gid] => {
                let gid: u64 = gid
                    .parse()
                    .map_err(|_| Error::internal(format!("bad task name: {name}")))?;
                let st = ctx.vol_state(vol_id);
                let info = ctx.vol_info(vol_id);
                let applied = info.apply(&st.mgr, gid, ctx.restore_max_retry)?;
                info!(vol = %vol_id, gid, applied, "apply task finished");
                Ok(())
            }
            ["restore", vol_id, gid] => {
                let gid: u64 = gid
                    .parse()
                    .map_err(|_| Error::internal(format!("bad task name: {name}")))?;
                let st = ctx.vol_state(vol_id);
                let info = ctx.vol_info(vol_id);
                let restored = info.restore(&st.mgr, gid, ctx.restore_max_retry)?;
                info!(vol = %vol_id, gid, restored, "restore task finished");
                Ok(())
            }
            ["gc", vol_id] => {
                let st = ctx.vol_state(vol_id);
                let info = ctx.vol_info(vol_id);
                let n = info.gc_diffs(&st.mgr)?;
                info!(vol = %vol_id, removed = n, "gc task finished");
                Ok(())
            }
            _ => Err(Error::internal(format!("unknown task: {name}"))),
        }
    }
}
