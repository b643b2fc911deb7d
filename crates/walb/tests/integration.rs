//! End-to-end pipeline tests: wdev -> storage -> proxy -> archive.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use walb_log::{FileWdev, WlogEntry};
use walb_proto::{
    connect, recv_msg, send_msg, send_wdiff_stream, ProtocolServer, Reply, ServerControl,
    TaskDispatcher, WdiffSendReq, PROTO_WDIFF_SEND,
};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn spawn_archive(dir: &Path) -> (SocketAddr, Arc<walb_archive::Archive>, ServerControl) {
    let control = ServerControl::new();
    let archive = Arc::new(walb_archive::Archive::new(
        "a0".to_string(),
        dir.to_path_buf(),
        10,
        TIMEOUT,
        control.clone(),
    ));
    let runner = Arc::new(walb_archive::ArchiveTaskRunner::new(Arc::clone(&archive)));
    let queue = TaskDispatcher::start(runner, 1, Duration::from_millis(100), control.clone());
    archive.task_queue.set(queue).ok().unwrap();

    let mut server = ProtocolServer::new("a0", Arc::clone(&archive), control.clone(), 4, TIMEOUT);
    walb_archive::register_handlers(&mut server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run(listener));
    (addr, archive, control)
}

async fn spawn_proxy(dir: &Path) -> (SocketAddr, Arc<walb_proxy::Proxy>, ServerControl) {
    let control = ServerControl::new();
    let proxy = Arc::new(walb_proxy::Proxy::new(
        "p0".to_string(),
        dir.to_path_buf(),
        128 << 20,
        64,
        TIMEOUT,
        control.clone(),
    ));
    let runner = Arc::new(walb_proxy::ForwardRunner::new(Arc::clone(&proxy)));
    let queue = TaskDispatcher::start(runner, 2, Duration::from_millis(100), control.clone());
    proxy.task_queue.set(queue).ok().unwrap();

    let mut server = ProtocolServer::new("p0", Arc::clone(&proxy), control.clone(), 4, TIMEOUT);
    walb_proxy::register_handlers(&mut server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.run(listener));
    (addr, proxy, control)
}

async fn ctl_request<Req, Resp>(addr: SocketAddr, protocol: &str, req: &Req) -> Resp
where
    Req: serde::Serialize,
    Resp: serde::de::DeserializeOwned,
{
    let mut stream = connect(addr, "test-ctl", protocol, TIMEOUT).await.unwrap();
    send_msg(&mut stream, req).await.unwrap();
    let reply: Reply<Resp> = recv_msg(&mut stream).await.unwrap();
    reply.into_result().unwrap()
}

fn read_block(path: &Path, lb: u64) -> u8 {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = std::fs::File::open(path).unwrap();
    f.seek(SeekFrom::Start(lb * 512)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    b[0]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_pipeline() {
    let archive_dir = TempDir::new().unwrap();
    let proxy_dir = TempDir::new().unwrap();
    let storage_dir = TempDir::new().unwrap();

    let (archive_addr, _archive, archive_ctl) = spawn_archive(archive_dir.path()).await;
    let (proxy_addr, _proxy, proxy_ctl) = spawn_proxy(proxy_dir.path()).await;

    // A wdev with a few journaled writes.
    let ldev = storage_dir.path().join("ldev");
    let wdev = FileWdev::format(&ldev, 512, 4096, 64, "wdev0").unwrap();
    let uuid = walb_log::WdevOps::uuid(&wdev).unwrap();

    // Archive volume: init + base image.
    let () = ctl_request(
        archive_addr,
        "init-vol",
        &walb_archive::InitVolReq { vol_id: "vol0".to_string() },
    )
    .await;
    let () = ctl_request(
        archive_addr,
        "full-bkp",
        &walb_archive::FullBkpReq { vol_id: "vol0".to_string(), size_lb: 64, uuid },
    )
    .await;

    // Proxy volume: one archive, then start.
    let () = ctl_request(
        proxy_addr,
        "add-archive-info",
        &walb_proxy::ArchiveInfoReq {
            vol_id: "vol0".to_string(),
            archive: "a0".to_string(),
            addr: Some(archive_addr),
        },
    )
    .await;
    let () = ctl_request(
        proxy_addr,
        "start",
        &walb_proxy::VolReq { vol_id: "vol0".to_string() },
    )
    .await;

    // Storage volume driven directly (the daemon wiring is the same).
    let storage_control = ServerControl::new();
    let storage = Arc::new(walb_storage::Storage::new(
        "s0".to_string(),
        storage_dir.path().to_path_buf(),
        64,
        vec![proxy_addr],
        TIMEOUT,
        storage_control.clone(),
    ));
    let info = storage.vol_info("vol0");
    info.init(&ldev).unwrap();
    info.reset_wlog(0, &wdev).unwrap();
    info.set_state(walb_storage::state::STOPPED).unwrap();
    {
        let st = storage.vol_state("vol0");
        st.sm
            .transit(walb_storage::state::STOPPED, walb_storage::state::T_START_MASTER)
            .unwrap();
        st.sm
            .transit(walb_storage::state::T_START_MASTER, walb_storage::state::MASTER)
            .unwrap();
        info.set_state(walb_storage::state::MASTER).unwrap();
    }

    // Journal writes: 0xaa over blocks 0..4, 0xbb over 2..4, discard 8..12.
    wdev.append_pack(&[WlogEntry::Write { offset: 0, data: vec![0xaa; 4 * 512] }]).unwrap();
    wdev.append_pack(&[
        WlogEntry::Write { offset: 2, data: vec![0xbb; 2 * 512] },
        WlogEntry::Discard { offset: 8, io_size: 4 },
    ])
    .unwrap();

    // One wlog-send pass.
    let runner = walb_storage::WlogSendRunner::new(Arc::clone(&storage));
    walb_proto::TaskRunner::run_task(&runner, "vol0").await.unwrap();
    let done = info.get_done_record().unwrap();
    assert_eq!(done.gid, 1);

    // The diff flows proxy -> archive in the background.
    let mut restorable: Vec<u64> = Vec::new();
    for _ in 0..100 {
        restorable = ctl_request(
            archive_addr,
            "restorable",
            &walb_archive::VolReq { vol_id: "vol0".to_string() },
        )
        .await;
        if restorable.contains(&1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(restorable.contains(&1), "diff never reached the archive: {restorable:?}");

    // Restore gid 1 and verify the materialized content.
    let () = ctl_request(
        archive_addr,
        "restore",
        &walb_archive::GidReq { vol_id: "vol0".to_string(), gid: 1 },
    )
    .await;
    let restored = archive_dir.path().join("vol0").join("r_vol0_1");
    for _ in 0..100 {
        if restored.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(restored.exists(), "restore did not materialize");

    assert_eq!(read_block(&restored, 0), 0xaa);
    assert_eq!(read_block(&restored, 1), 0xaa);
    assert_eq!(read_block(&restored, 2), 0xbb);
    assert_eq!(read_block(&restored, 3), 0xbb);
    assert_eq!(read_block(&restored, 5), 0x00);
    assert_eq!(read_block(&restored, 8), 0x00);

    // The proxy advanced past the transferred diff.
    let slave = proxy_dir.path().join("vol0").join("slave").join("a0");
    for _ in 0..50 {
        if std::fs::read_dir(&slave).unwrap().next().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    archive_ctl.force_quit();
    proxy_ctl.force_quit();
    storage_control.force_quit();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wdiff_send_rejected_in_stopped_state() {
    let proxy_dir = TempDir::new().unwrap();
    let (proxy_addr, _proxy, proxy_ctl) = spawn_proxy(proxy_dir.path()).await;

    // Configure the volume but do not start it: state stays Stopped.
    let () = ctl_request(
        proxy_addr,
        "add-archive-info",
        &walb_proxy::ArchiveInfoReq {
            vol_id: "vol0".to_string(),
            archive: "a0".to_string(),
            addr: Some("127.0.0.1:1".parse().unwrap()),
        },
    )
    .await;
    let state: String = ctl_request(
        proxy_addr,
        "get-state",
        &walb_proxy::VolReq { vol_id: "vol0".to_string() },
    )
    .await;
    assert_eq!(state, "Stopped");

    let mut stream = connect(proxy_addr, "s0", PROTO_WDIFF_SEND, TIMEOUT).await.unwrap();
    let req = WdiffSendReq {
        vol_id: "vol0".to_string(),
        diff: walb_meta::MetaDiff::clean(0, 1, 0),
        uuid: [0; 16],
    };
    let err = send_wdiff_stream(&mut stream, &req, || {
        panic!("stream must not start after a reject")
    })
    .await
    .unwrap_err();
    assert!(matches!(err, walb_core::Error::BadState(_)), "got: {err}");

    proxy_ctl.force_quit();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retried_transfer_is_idempotent() {
    let archive_dir = TempDir::new().unwrap();
    let (archive_addr, archive, archive_ctl) = spawn_archive(archive_dir.path()).await;

    let () = ctl_request(
        archive_addr,
        "init-vol",
        &walb_archive::InitVolReq { vol_id: "vol0".to_string() },
    )
    .await;
    let () = ctl_request(
        archive_addr,
        "full-bkp",
        &walb_archive::FullBkpReq { vol_id: "vol0".to_string(), size_lb: 64, uuid: [7; 16] },
    )
    .await;

    let records = || {
        let data = vec![0x42u8; 512];
        let mut rec = walb_diff::DiffRecord::normal(0, 1);
        rec.update_checksum(&data);
        vec![(rec, data)]
    };
    let req = WdiffSendReq {
        vol_id: "vol0".to_string(),
        diff: walb_meta::MetaDiff::clean(0, 1, 100),
        uuid: [7; 16],
    };

    // Send the same diff twice, as a retrying client would.
    for _ in 0..2 {
        let mut stream =
            connect(archive_addr, "s0", PROTO_WDIFF_SEND, TIMEOUT).await.unwrap();
        let mut iter = records().into_iter();
        send_wdiff_stream(&mut stream, &req, move || Ok(iter.next())).await.unwrap();
    }

    // Applied once: exactly one registered diff, one file.
    let st = archive.vol_state("vol0");
    assert_eq!(st.mgr.len(), 1);
    let n_wdiffs = std::fs::read_dir(archive_dir.path().join("vol0"))
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".wdiff")
        })
        .count();
    assert_eq!(n_wdiffs, 1);

    archive_ctl.force_quit();
}
