//! Proxy daemon context, state machine, and protocol handlers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{info, warn};
use walb_core::{Error, Result, StateMachine};
use walb_meta::{create_diff_file_name, MetaDiffManager};
use walb_proto::{
    recv_msg, recv_wdiff_stream, send_msg, ProtocolHandler, ProtocolServer, Reply,
    ServerControl, TaskQueue, WdiffSendReq, PROTO_WDIFF_SEND,
};

use crate::forwarder::forward_task_name;
use crate::vol_info::ProxyVolInfo;

/// Proxy state names, resting and transient. Proxy states are not
/// persisted; they are reconstructed from the directory tree on start.
pub mod state {
    /// No volume data.
    pub const CLEAR: &str = "Clear";
    /// Volume exists but does not accept diffs.
    pub const STOPPED: &str = "Stopped";
    /// Accepting diffs and forwarding.
    pub const STARTED: &str = "Started";

    /// Transient: starting.
    pub const T_START: &str = "Start";
    /// Transient: stopping.
    pub const T_STOP: &str = "Stop";
    /// Transient: volume removal.
    pub const T_CLEAR_VOL: &str = "ClearVol";
    /// Transient: archive registration.
    pub const T_ADD_ARCHIVE_INFO: &str = "AddArchiveInfo";
    /// Transient: archive removal.
    pub const T_DELETE_ARCHIVE_INFO: &str = "DeleteArchiveInfo";
    /// Transient: receiving a wdiff.
    pub const T_WLOG_RECV: &str = "WlogRecv";
    /// Transient: draining before stop.
    pub const T_WAIT_FOR_EMPTY: &str = "WaitForEmpty";
}

/// The proxy state transition table.
static STATE_TABLE: &[(&str, &str)] = &[
    (state::CLEAR, state::T_ADD_ARCHIVE_INFO),
    (state::T_ADD_ARCHIVE_INFO, state::STOPPED),
    (state::STOPPED, state::T_CLEAR_VOL),
    (state::T_CLEAR_VOL, state::CLEAR),
    (state::STOPPED, state::T_ADD_ARCHIVE_INFO),
    (state::STOPPED, state::T_DELETE_ARCHIVE_INFO),
    (state::T_DELETE_ARCHIVE_INFO, state::STOPPED),
    (state::T_DELETE_ARCHIVE_INFO, state::CLEAR),
    (state::STOPPED, state::T_START),
    (state::T_START, state::STARTED),
    (state::STARTED, state::T_STOP),
    (state::T_STOP, state::STOPPED),
    (state::STARTED, state::T_WLOG_RECV),
    (state::T_WLOG_RECV, state::STARTED),
    (state::STARTED, state::T_WAIT_FOR_EMPTY),
    (state::T_WAIT_FOR_EMPTY, state::STOPPED),
];

/// States in which a `wdiff-send` request is accepted.
const ACCEPT_FOR_WDIFF_SEND: &[&str] =
    &[state::STARTED, state::T_WLOG_RECV, state::T_WAIT_FOR_EMPTY];

/// In-memory state of one proxy volume.
pub struct ProxyVolState {
    /// The volume state machine.
    pub sm: StateMachine,
    /// Index over the master directory.
    pub master_mgr: MetaDiffManager,
    archive_mgrs: DashMap<String, Arc<MetaDiffManager>>,
}

impl ProxyVolState {
    /// The diff index of one archive's slave directory.
    pub fn archive_mgr(&self, archive: &str) -> Result<Arc<MetaDiffManager>> {
        self.archive_mgrs
            .get(archive)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| Error::not_found(format!("archive not configured: {archive}")))
    }

    fn ensure_archive_mgr(&self, archive: &str) -> Arc<MetaDiffManager> {
        self.archive_mgrs
            .entry(archive.to_string())
            .or_insert_with(|| Arc::new(MetaDiffManager::new()))
            .clone()
    }

    fn drop_archive_mgr(&self, archive: &str) {
        self.archive_mgrs.remove(archive);
    }
}

/// The proxy daemon context.
pub struct Proxy {
    /// Node id used in greetings.
    pub node_id: String,
    /// Base directory holding the volume directories.
    pub base_dir: PathBuf,
    /// Maximum merged bytes per forward.
    pub max_wdiff_send_size: u64,
    /// Maximum merged files per forward.
    pub max_wdiff_send_nr: usize,
    /// Socket timeout for outbound transfers.
    pub socket_timeout: Duration,
    /// Shutdown control.
    pub control: ServerControl,
    /// Background queue for forward tasks; set once the dispatcher is
    /// up.
    pub task_queue: OnceLock<TaskQueue>,
    vol_states: DashMap<String, Arc<ProxyVolState>>,
}

impl Proxy {
    /// Build the daemon context.
    #[must_use]
    pub fn new(
        node_id: String,
        base_dir: PathBuf,
        max_wdiff_send_size: u64,
        max_wdiff_send_nr: usize,
        socket_timeout: Duration,
        control: ServerControl,
    ) -> Self {
        Self {
            node_id,
            base_dir,
            max_wdiff_send_size,
            max_wdiff_send_nr,
            socket_timeout,
            control,
            task_queue: OnceLock::new(),
            vol_states: DashMap::new(),
        }
    }

    /// The volume state, reloading the diff indexes from disk on first
    /// access.
    pub fn vol_state(&self, vol_id: &str) -> Arc<ProxyVolState> {
        self.vol_states
            .entry(vol_id.to_string())
            .or_insert_with(|| {
                let info = self.vol_info(vol_id);
                let initial = if info.exists() { state::STOPPED } else { state::CLEAR };
                let st = ProxyVolState {
                    sm: StateMachine::new(initial, STATE_TABLE),
                    master_mgr: MetaDiffManager::new(),
                    archive_mgrs: DashMap::new(),
                };
                if info.exists() {
                    if let Err(e) = reload_vol(&info, &st) {
                        warn!(vol = %vol_id, error = %e, "volume reload failed");
                    }
                }
                Arc::new(st)
            })
            .clone()
    }

    /// The persistent data of a volume.
    #[must_use]
    pub fn vol_info(&self, vol_id: &str) -> ProxyVolInfo {
        ProxyVolInfo::new(&self.base_dir, vol_id)
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

    /// Queue a forward task for every archive of a volume.
    pub fn queue_forwards(&self, vol_id: &str) -> Result<()> {
        let info = self.vol_info(vol_id);
        if let Some(queue) = self.task_queue.get() {
            for (archive, _) in info.list_archives()? {
                queue.push(&forward_task_name(vol_id, &archive));
            }
        }
        Ok(())
    }
}

fn reload_vol(info: &ProxyVolInfo, st: &ProxyVolState) -> Result<()> {
    for diff in ProxyVolInfo::scan_diffs(&info.master_dir())? {
        let _ = st.master_mgr.add(diff);
    }
    for (archive, _) in info.list_archives()? {
        let mgr = st.ensure_archive_mgr(&archive);
        for diff in ProxyVolInfo::scan_diffs(&info.slave_dir(&archive))? {
            let _ = mgr.add(diff);
        }
    }
    Ok(())
}

// ---- control messages ----

/// Request naming just a volume.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolReq {
    /// Volume id.
    pub vol_id: String,
}

/// Archive registration request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveInfoReq {
    /// Volume id.
    pub vol_id: String,
    /// Archive name.
    pub archive: String,
    /// Archive daemon address (ignored on delete).
    pub addr: Option<SocketAddr>,
}

/// Stop request.
#[derive(Debug, Serialize, Deserialize)]
pub struct StopReq {
    /// Volume id.
    pub vol_id: String,
    /// Drain queued diffs before stopping.
    pub wait_for_empty: bool,
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

struct AddArchiveInfoHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for AddArchiveInfoHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: ArchiveInfoReq = recv_msg(stream).await?;
        let result = (|| {
            let addr = req
                .addr
                .ok_or_else(|| Error::internal("archive address required".to_string()))?;
            let st = ctx.vol_state(&req.vol_id);
            let cur = st.sm.get();
            let tran = st.sm.begin(&cur, state::T_ADD_ARCHIVE_INFO)?;
            let info = ctx.vol_info(&req.vol_id);
            if !info.exists() {
                info.init()?;
            }
            info.add_archive(&req.archive, addr)?;
            st.ensure_archive_mgr(&req.archive);
            tran.commit(state::STOPPED)?;
            info!(vol = %req.vol_id, archive = %req.archive, %addr, "archive added");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct DeleteArchiveInfoHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for DeleteArchiveInfoHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: ArchiveInfoReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::STOPPED, state::T_DELETE_ARCHIVE_INFO)?;
            let info = ctx.vol_info(&req.vol_id);
            info.remove_archive(&req.archive)?;
            st.drop_archive_mgr(&req.archive);
            let empty = info.list_archives()?.is_empty();
            if empty {
                info.clear()?;
                tran.commit(state::CLEAR)?;
            } else {
                tran.commit(state::STOPPED)?;
            }
            info!(vol = %req.vol_id, archive = %req.archive, "archive removed");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StartHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for StartHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::STOPPED, state::T_START)?;
            tran.commit(state::STARTED)?;
            ctx.queue_forwards(&req.vol_id)?;
            info!(vol = %req.vol_id, "proxy volume started");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StopHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for StopHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: StopReq = recv_msg(stream).await?;
        let vol_id = req.vol_id.clone();
        let result = async {
            let st = ctx.vol_state(&vol_id);
            if req.wait_for_empty {
                let tran = st.sm.begin(state::STARTED, state::T_WAIT_FOR_EMPTY)?;
                // Drain: wait until every archive queue is empty.
                loop {
                    ctx.control.check()?;
                    let info = ctx.vol_info(&vol_id);
                    let mut all_empty = true;
                    for (archive, _) in info.list_archives()? {
                        if !st.archive_mgr(&archive)?.is_empty() {
                            all_empty = false;
                        }
                    }
                    if all_empty {
                        break;
                    }
                    ctx.queue_forwards(&vol_id)?;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                tran.commit(state::STOPPED)?;
            } else {
                let tran = st.sm.begin(state::STARTED, state::T_STOP)?;
                tran.commit(state::STOPPED)?;
            }
            info!(vol = %vol_id, "proxy volume stopped");
            Ok(())
        }
        .await;
        reply_result!(stream, result)
    }
}

struct ClearVolHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for ClearVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::STOPPED, state::T_CLEAR_VOL)?;
            ctx.vol_info(&req.vol_id).clear()?;
            tran.commit(state::CLEAR)?;
            info!(vol = %req.vol_id, "proxy volume cleared");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct GetStateHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for GetStateHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result: Result<String> = Ok(ctx.vol_state(&req.vol_id).sm.get());
        reply_result!(stream, result)
    }
}

struct StatusHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for StatusHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = ctx.vol_info(&req.vol_id).status();
        reply_result!(stream, result)
    }
}

/// The `wdiff-send` receive side of the proxy.
struct WdiffRecvHandler;

#[async_trait]
impl ProtocolHandler<Proxy> for WdiffRecvHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Proxy>) -> Result<()> {
        let req: WdiffSendReq = recv_msg(stream).await?;
        let st = ctx.vol_state(&req.vol_id);

        // Validate before accepting the stream.
        let accept = (|| {
            req.diff.verify()?;
            st.sm.verify_in(ACCEPT_FOR_WDIFF_SEND)
        })();
        if let Err(e) = accept {
            let reply: Reply<()> = Reply::from_error(&e);
            send_msg(stream, &reply).await?;
            return Err(e);
        }
        send_msg(stream, &Reply::Ok(())).await?;

        let tran = match st.sm.begin(state::STARTED, state::T_WLOG_RECV) {
            Ok(t) => Some(t),
            Err(_) => None, // already in a transient accepting state
        };

        let info = ctx.vol_info(&req.vol_id);
        let tmp = info.temp_recv_path();
        let outcome = match recv_wdiff_stream(stream, &tmp, req.uuid).await {
            Ok(()) => {
                if st.master_mgr.exists(&req.diff) {
                    // Retried transfer; the first arrival won.
                    let _ = std::fs::remove_file(&tmp);
                    Ok(())
                } else {
                    let name = create_diff_file_name(&req.diff);
                    std::fs::rename(&tmp, info.master_dir().join(&name))
                        .map_err(Error::Io)
                        .and_then(|()| {
                            st.master_mgr.add(req.diff)?;
                            let linked = info.fan_out(&req.diff)?;
                            for archive in &linked {
                                st.ensure_archive_mgr(archive).add(req.diff)?;
                            }
                            st.master_mgr.erase_before_gid(req.diff.snap_e.gid_b);
                            ctx.queue_forwards(&req.vol_id)?;
                            info!(vol = %req.vol_id, diff = %req.diff, "wdiff received");
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
            tran.commit(state::STARTED)?;
        }
        outcome
    }
}

/// Register every proxy protocol on `server`.
pub fn register_handlers(server: &mut ProtocolServer<Proxy>) {
    server.register("add-archive-info", Arc::new(AddArchiveInfoHandler));
    server.register("delete-archive-info", Arc::new(DeleteArchiveInfoHandler));
    server.register("start", Arc::new(StartHandler));
    server.register("stop", Arc::new(StopHandler));
    server.register("clear-vol", Arc::new(ClearVolHandler));
    server.register("get-state", Arc::new(GetStateHandler));
    server.register("status", Arc::new(StatusHandler));
    server.register(PROTO_WDIFF_SEND, Arc::new(WdiffRecvHandler));
}
