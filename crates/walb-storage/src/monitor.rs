//! Long-lived storage monitors.
//!
//! The wdev monitor polls every volume's lsid counters and queues a
//! wlog-send task when new wlogs are durable. The proxy monitor probes
//! proxy reachability so the sender always dials a live proxy first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use walb_log::{FileWdev, WdevOps};
use walb_proto::{ServerControl, TaskQueue};

use crate::daemon::{state, Storage};

/// Tracks proxy reachability and rotates the active proxy.
pub struct ProxyManager {
    proxies: Vec<SocketAddr>,
    healthy: Mutex<Vec<bool>>,
}

impl ProxyManager {
    /// Manage `proxies` in preference order; all start healthy.
    #[must_use]
    pub fn new(proxies: Vec<SocketAddr>) -> Self {
        let n = proxies.len();
        Self { proxies, healthy: Mutex::new(vec![true; n]) }
    }

    /// The first healthy proxy, if any.
    #[must_use]
    pub fn get_available(&self) -> Option<SocketAddr> {
        let healthy = self.healthy.lock();
        self.proxies
            .iter()
            .zip(healthy.iter())
            .find(|(_, h)| **h)
            .map(|(addr, _)| *addr)
    }

    /// Mark a proxy unreachable until the next probe succeeds.
    pub fn mark_down(&self, addr: SocketAddr) {
        let mut healthy = self.healthy.lock();
        for (i, p) in self.proxies.iter().enumerate() {
            if *p == addr {
                healthy[i] = false;
            }
        }
    }

    /// Probe every proxy once.
    pub async fn check_all(&self, timeout: Duration) {
        for (i, addr) in self.proxies.iter().enumerate() {
            let up = matches!(
                tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
                Ok(Ok(_))
            );
            let mut healthy = self.healthy.lock();
            if healthy[i] != up {
                warn!(proxy = %addr, up, "proxy reachability changed");
                healthy[i] = up;
            }
        }
    }
}

/// Poll proxy reachability until shutdown.
pub async fn proxy_monitor(
    manager: Arc<ProxyManager>,
    interval: Duration,
    timeout: Duration,
    control: ServerControl,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = control.wait_quit() => break,
        }
        manager.check_all(timeout).await;
    }
}

/// Poll the wdev set for permanent-lsid advances until shutdown.
///
/// A volume in `Master` with untransferred wlogs gets a wlog-send task;
/// an overflowed volume is stopped and logged.
pub async fn wdev_monitor(
    storage: Arc<Storage>,
    queue: TaskQueue,
    interval: Duration,
    control: ServerControl,
) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            () = control.wait_quit() => break,
        }
        for vol_id in storage.list_volumes() {
            if let Err(e) = poll_volume(&storage, &queue, &vol_id) {
                warn!(vol = %vol_id, error = %e, "wdev monitor poll failed");
            }
        }
    }
}

fn poll_volume(storage: &Storage, queue: &TaskQueue, vol_id: &str) -> walb_core::Result<()> {
    let st = storage.vol_state(vol_id);
    if st.sm.get() != state::MASTER {
        return Ok(());
    }
    let info = storage.vol_info(vol_id);
    let wdev = FileWdev::open(&info.get_wdev_path()?)?;
    if wdev.is_overflow()? {
        warn!(vol = %vol_id, "wlog overflow detected, stopping volume");
        if st.sm.transit(state::MASTER, state::T_STOP_MASTER).is_ok() {
            let _ = st.sm.transit(state::T_STOP_MASTER, state::STOPPED);
            info.set_state(state::STOPPED)?;
        }
        return Ok(());
    }
    if info.is_required_wlog_transfer(&wdev)? {
        debug!(vol = %vol_id, "wlogs pending, queueing wlog-send");
        queue.push(vol_id);
    }
    Ok(())
}
