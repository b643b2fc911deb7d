//! Storage daemon context, state machine, and protocol handlers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{info, warn};
use walb_core::{Error, Result, StateMachine, DEFAULT_MAX_IO_LB};
use walb_log::{AsyncWldevReader, FileWdev, WdevOps, WlogConverter};
use walb_proto::{
    connect, recv_msg, send_msg, send_wdiff_stream, ProtocolHandler, ProtocolServer, Reply,
    ServerControl, TaskQueue, TaskRunner, WdiffSendReq, PROTO_WDIFF_SEND,
};

use crate::monitor::ProxyManager;
use crate::vol_info::StorageVolInfo;

/// Storage state names, resting and transient.
pub mod state {
    /// No volume data.
    pub const CLEAR: &str = "Clear";
    /// Initialized, waiting for a full or hash sync.
    pub const SYNC_READY: &str = "SyncReady";
    /// Paused.
    pub const STOPPED: &str = "Stopped";
    /// Capturing and sending wlogs.
    pub const MASTER: &str = "Master";
    /// Recording received snapshots only.
    pub const SLAVE: &str = "Slave";

    /// Transient: volume initialization.
    pub const T_INIT_VOL: &str = "InitVol";
    /// Transient: volume removal.
    pub const T_CLEAR_VOL: &str = "ClearVol";
    /// Transient: becoming a slave.
    pub const T_START_SLAVE: &str = "StartSlave";
    /// Transient: leaving slave mode.
    pub const T_STOP_SLAVE: &str = "StopSlave";
    /// Transient: full sync hand-off.
    pub const T_FULL_SYNC: &str = "FullSync";
    /// Transient: hash sync hand-off.
    pub const T_HASH_SYNC: &str = "HashSync";
    /// Transient: becoming the master.
    pub const T_START_MASTER: &str = "StartMaster";
    /// Transient: leaving master mode.
    pub const T_STOP_MASTER: &str = "StopMaster";
    /// Transient: wlog reset.
    pub const T_RESET: &str = "Reset";
    /// Transient: a wlog-send pass is running.
    pub const T_WLOG_SEND: &str = "WlogSend";
    /// Transient: wlog removal.
    pub const T_WLOG_REMOVE: &str = "WlogRemove";
}

/// The storage state transition table.
static STATE_TABLE: &[(&str, &str)] = &[
    (state::CLEAR, state::T_INIT_VOL),
    (state::T_INIT_VOL, state::SYNC_READY),
    (state::SYNC_READY, state::T_CLEAR_VOL),
    (state::STOPPED, state::T_CLEAR_VOL),
    (state::T_CLEAR_VOL, state::CLEAR),
    (state::SYNC_READY, state::T_FULL_SYNC),
    (state::T_FULL_SYNC, state::STOPPED),
    (state::SYNC_READY, state::T_HASH_SYNC),
    (state::T_HASH_SYNC, state::STOPPED),
    (state::STOPPED, state::T_RESET),
    (state::T_RESET, state::SYNC_READY),
    (state::STOPPED, state::T_START_MASTER),
    (state::T_START_MASTER, state::MASTER),
    (state::MASTER, state::T_STOP_MASTER),
    (state::T_STOP_MASTER, state::STOPPED),
    (state::STOPPED, state::T_START_SLAVE),
    (state::T_START_SLAVE, state::SLAVE),
    (state::SLAVE, state::T_STOP_SLAVE),
    (state::T_STOP_SLAVE, state::STOPPED),
    (state::MASTER, state::T_WLOG_SEND),
    (state::T_WLOG_SEND, state::MASTER),
    (state::MASTER, state::T_WLOG_REMOVE),
    (state::T_WLOG_REMOVE, state::MASTER),
];

/// In-memory state of one storage volume.
pub struct StorageVolState {
    /// The volume state machine.
    pub sm: StateMachine,
}

/// The storage daemon context, threaded into every handler.
pub struct Storage {
    /// Node id used in greetings.
    pub node_id: String,
    /// Base directory holding the volume directories.
    pub base_dir: PathBuf,
    /// Maximum wlog bytes sent in one pass, MiB.
    pub max_wlog_send_mb: u64,
    /// Socket timeout for outbound transfers.
    pub socket_timeout: Duration,
    /// Shutdown control.
    pub control: ServerControl,
    /// Proxy rotation.
    pub proxy_manager: Arc<ProxyManager>,
    /// Background queue for wlog-send tasks; set once the dispatcher is
    /// up.
    pub task_queue: OnceLock<TaskQueue>,
    vol_states: DashMap<String, Arc<StorageVolState>>,
}

impl Storage {
    /// Build the daemon context.
    #[must_use]
    pub fn new(
        node_id: String,
        base_dir: PathBuf,
        max_wlog_send_mb: u64,
        proxies: Vec<SocketAddr>,
        socket_timeout: Duration,
        control: ServerControl,
    ) -> Self {
        Self {
            node_id,
            base_dir,
            max_wlog_send_mb,
            socket_timeout,
            control,
            proxy_manager: Arc::new(ProxyManager::new(proxies)),
            task_queue: OnceLock::new(),
            vol_states: DashMap::new(),
        }
    }

    /// The volume state machine, recovered from the state file on first
    /// access.
    pub fn vol_state(&self, vol_id: &str) -> Arc<StorageVolState> {
        self.vol_states
            .entry(vol_id.to_string())
            .or_insert_with(|| {
                let initial = self
                    .vol_info(vol_id)
                    .get_state()
                    .unwrap_or_else(|_| state::CLEAR.to_string());
                Arc::new(StorageVolState { sm: StateMachine::new(&initial, STATE_TABLE) })
            })
            .clone()
    }

    /// The persistent data of a volume.
    #[must_use]
    pub fn vol_info(&self, vol_id: &str) -> StorageVolInfo {
        StorageVolInfo::new(&self.base_dir, vol_id)
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

/// `init-vol` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct InitVolReq {
    /// Volume id.
    pub vol_id: String,
    /// The wdev (ldev image) path the volume captures.
    pub wdev_path: PathBuf,
}

/// Request naming just a volume.
#[derive(Debug, Serialize, Deserialize)]
pub struct VolReq {
    /// Volume id.
    pub vol_id: String,
}

/// `start` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartReq {
    /// Volume id.
    pub vol_id: String,
    /// Master mode (`false` starts a slave).
    pub master: bool,
}

/// `reset-vol` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetVolReq {
    /// Volume id.
    pub vol_id: String,
    /// Gid the reset log restarts from.
    pub gid: u64,
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
impl ProtocolHandler<Storage> for InitVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: InitVolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::CLEAR, state::T_INIT_VOL)?;
            let info = ctx.vol_info(&req.vol_id);
            info.init(&req.wdev_path)?;
            tran.commit(state::SYNC_READY)?;
            info!(vol = %req.vol_id, "volume initialized");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct ClearVolHandler;

#[async_trait]
impl ProtocolHandler<Storage> for ClearVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let cur = st.sm.get();
            let tran = st.sm.begin(&cur, state::T_CLEAR_VOL)?;
            ctx.vol_info(&req.vol_id).clear()?;
            tran.commit(state::CLEAR)?;
            info!(vol = %req.vol_id, "volume cleared");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct ResetVolHandler;

#[async_trait]
impl ProtocolHandler<Storage> for ResetVolHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: ResetVolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::STOPPED, state::T_RESET)?;
            let info = ctx.vol_info(&req.vol_id);
            let wdev = FileWdev::open(&info.get_wdev_path()?)?;
            info.reset_wlog(req.gid, &wdev)?;
            tran.commit(state::SYNC_READY)?;
            info!(vol = %req.vol_id, gid = req.gid, "wlog reset");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

/// Performs the full-sync hand-off bookkeeping: the volume leaves
/// `SyncReady`, the wlog bookkeeping restarts at gid 0, and the volume
/// parks in `Stopped` ready to start. The bulk image copy itself is not
/// part of the replication core.
struct FullBkpHandler;

#[async_trait]
impl ProtocolHandler<Storage> for FullBkpHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let tran = st.sm.begin(state::SYNC_READY, state::T_FULL_SYNC)?;
            let info = ctx.vol_info(&req.vol_id);
            let wdev = FileWdev::open(&info.get_wdev_path()?)?;
            info.reset_wlog(0, &wdev)?;
            info.set_state(state::STOPPED)?;
            tran.commit(state::STOPPED)?;
            info!(vol = %req.vol_id, "full backup bookkeeping done");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StartHandler;

#[async_trait]
impl ProtocolHandler<Storage> for StartHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: StartReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let info = ctx.vol_info(&req.vol_id);
            let (temp, target) = if req.master {
                (state::T_START_MASTER, state::MASTER)
            } else {
                (state::T_START_SLAVE, state::SLAVE)
            };
            let tran = st.sm.begin(state::STOPPED, temp)?;
            info.set_state(target)?;
            tran.commit(target)?;
            info!(vol = %req.vol_id, target, "volume started");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct StopHandler;

#[async_trait]
impl ProtocolHandler<Storage> for StopHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            let info = ctx.vol_info(&req.vol_id);
            let cur = st.sm.get();
            let temp = match cur.as_str() {
                state::MASTER => state::T_STOP_MASTER,
                state::SLAVE => state::T_STOP_SLAVE,
                other => return Err(Error::bad_state(other.to_string())),
            };
            let tran = st.sm.begin(&cur, temp)?;
            info.set_state(state::STOPPED)?;
            tran.commit(state::STOPPED)?;
            info!(vol = %req.vol_id, "volume stopped");
            Ok(())
        })();
        reply_result!(stream, result)
    }
}

struct SnapshotHandler;

#[async_trait]
impl ProtocolHandler<Storage> for SnapshotHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = (|| {
            let st = ctx.vol_state(&req.vol_id);
            st.sm.verify_in(&[state::MASTER])?;
            let info = ctx.vol_info(&req.vol_id);
            let wdev = FileWdev::open(&info.get_wdev_path()?)?;
            let gid = info.take_snapshot(ctx.max_wlog_send_mb, &wdev)?;
            if let Some(queue) = ctx.task_queue.get() {
                queue.push(&req.vol_id);
            }
            Ok(gid)
        })();
        reply_result!(stream, result)
    }
}

struct GetStateHandler;

#[async_trait]
impl ProtocolHandler<Storage> for GetStateHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result: Result<String> = Ok(ctx.vol_state(&req.vol_id).sm.get());
        reply_result!(stream, result)
    }
}

struct StatusHandler;

#[async_trait]
impl ProtocolHandler<Storage> for StatusHandler {
    async fn handle(&self, stream: &mut TcpStream, _client: &str, ctx: Arc<Storage>) -> Result<()> {
        let req: VolReq = recv_msg(stream).await?;
        let result = ctx.vol_info(&req.vol_id).status(true);
        reply_result!(stream, result)
    }
}

/// Register every storage protocol on `server`.
pub fn register_handlers(server: &mut ProtocolServer<Storage>) {
    server.register("init-vol", Arc::new(InitVolHandler));
    server.register("clear-vol", Arc::new(ClearVolHandler));
    server.register("reset-vol", Arc::new(ResetVolHandler));
    server.register("full-bkp", Arc::new(FullBkpHandler));
    server.register("start", Arc::new(StartHandler));
    server.register("stop", Arc::new(StopHandler));
    server.register("snapshot", Arc::new(SnapshotHandler));
    server.register("get-state", Arc::new(GetStateHandler));
    server.register("status", Arc::new(StatusHandler));
}

/// The background wlog-send task: read, convert, send, record.
pub struct WlogSendRunner {
    storage: Arc<Storage>,
}

impl WlogSendRunner {
    /// Build a runner over the daemon context.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    async fn send_one(&self, vol_id: &str) -> Result<bool> {
        let ctx = &self.storage;
        let info = ctx.vol_info(vol_id);
        let wdev = FileWdev::open(&info.get_wdev_path()?)?;
        if !info.is_required_wlog_transfer(&wdev)? {
            return Ok(false);
        }
        let (rec_b, rec_e, lsid_limit) =
            info.prepare_wlog_transfer(ctx.max_wlog_send_mb, &wdev)?;

        // Read and convert the wlog range.
        let mut reader = AsyncWldevReader::open(wdev.path())?;
        reader.reset(rec_b.lsid, u64::MAX);
        let mut conv = WlogConverter::new(DEFAULT_MAX_IO_LB);
        while reader.current_lsid() < lsid_limit {
            ctx.control.check()?;
            let (pack, payloads) = reader.read_pack().await?;
            conv.add_pack(&pack, &payloads)?;
        }
        let lsid_e = reader.current_lsid();
        let uuid = wdev.uuid()?;
        let wdiff =
            conv.write_sorted(Vec::new(), uuid, walb_core::Compression::Snappy)?;

        // Ship it to the first live proxy.
        let diff = info.get_transfer_diff(&rec_b, &rec_e, lsid_e);
        let proxy = ctx
            .proxy_manager
            .get_available()
            .ok_or_else(|| Error::Timeout("no proxy available".to_string()))?;
        let mut stream =
            match connect(proxy, &ctx.node_id, PROTO_WDIFF_SEND, ctx.socket_timeout).await {
                Ok(s) => s,
                Err(e) => {
                    ctx.proxy_manager.mark_down(proxy);
                    return Err(e);
                }
            };
        let req = WdiffSendReq { vol_id: vol_id.to_string(), diff, uuid };
        let mut file_reader = walb_diff::SortedDiffReader::new(wdiff.as_slice());
        file_reader.read_header()?;
        send_wdiff_stream(&mut stream, &req, move || file_reader.read_diff()).await?;

        let remaining = info.finish_wlog_transfer(&rec_b, &rec_e, lsid_e)?;
        info!(vol = %vol_id, diff = %req.diff, lsid_e, "wlog sent");
        Ok(remaining)
    }
}

#[async_trait]
impl TaskRunner for WlogSendRunner {
    async fn run_task(&self, vol_id: &str) -> Result<()> {
        let st = self.storage.vol_state(vol_id);
        let tran = match st.sm.begin(state::MASTER, state::T_WLOG_SEND) {
            Ok(t) => t,
            Err(_) => return Ok(()), // not a master right now; nothing to do
        };
        let result = self.send_one(vol_id).await;
        match result {
            Ok(remaining) => {
                tran.commit(state::MASTER)?;
                if remaining {
                    if let Some(queue) = self.storage.task_queue.get() {
                        queue.push(vol_id);
                    }
                }
                Ok(())
            }
            Err(Error::Overflow(msg)) => {
                drop(tran); // back to Master, then stop the volume
                warn!(vol = %vol_id, %msg, "overflow during wlog-send, stopping volume");
                if st.sm.transit(state::MASTER, state::T_STOP_MASTER).is_ok() {
                    let _ = st.sm.transit(state::T_STOP_MASTER, state::STOPPED);
                    self.storage.vol_info(vol_id).set_state(state::STOPPED)?;
                }
                Err(Error::Overflow(msg))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use walb_log::WlogEntry;

    #[tokio::test]
    async fn test_overflow_stops_master() {
        let dir = TempDir::new().unwrap();
        let ldev = dir.path().join("ldev");
        // Tiny ring: the second pack overflows it.
        let wdev = FileWdev::format(&ldev, 512, 7, 1 << 20, "wdev0").unwrap();
        let control = ServerControl::new();
        let storage = Arc::new(Storage::new(
            "s0".to_string(),
            dir.path().to_path_buf(),
            1,
            Vec::new(),
            Duration::from_secs(5),
            control,
        ));
        let info = storage.vol_info("vol0");
        info.init(&ldev).unwrap();
        info.reset_wlog(0, &wdev).unwrap();
        info.set_state(state::STOPPED).unwrap();
        let st = storage.vol_state("vol0");
        st.sm.transit(state::STOPPED, state::T_START_MASTER).unwrap();
        st.sm.transit(state::T_START_MASTER, state::MASTER).unwrap();
        info.set_state(state::MASTER).unwrap();

        wdev.append_pack(&[WlogEntry::Write { offset: 0, data: vec![1; 1024] }]).unwrap();
        let _ = wdev
            .append_pack(&[WlogEntry::Write { offset: 8, data: vec![2; 1024] }]);
        assert!(wdev.is_overflow().unwrap());

        let runner = WlogSendRunner::new(Arc::clone(&storage));
        let err = TaskRunner::run_task(&runner, "vol0").await.unwrap_err();
        assert!(matches!(err, Error::Overflow(_)));
        // An overflowed master parks itself.
        assert_eq!(st.sm.get(), state::STOPPED);
        assert_eq!(info.get_state().unwrap(), state::STOPPED);
    }

    #[tokio::test]
    async fn test_wlog_send_skips_non_master() {
        let dir = TempDir::new().unwrap();
        let control = ServerControl::new();
        let storage = Arc::new(Storage::new(
            "s0".to_string(),
            dir.path().to_path_buf(),
            1,
            Vec::new(),
            Duration::from_secs(5),
            control,
        ));
        // No volume at all: the task is a no-op, not an error.
        let runner = WlogSendRunner::new(Arc::clone(&storage));
        TaskRunner::run_task(&runner, "vol0").await.unwrap();
    }
}
