//! Background task queue and dispatcher.
//!
//! Volume-level long-running work (wlog-send, forward, apply) is queued
//! by name and serviced by a bounded worker pool so it never blocks the
//! foreground protocol handlers. A name queued while already pending is
//! dropped; failed retriable tasks are re-queued after a delay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walb_core::Result;

use crate::server::ServerControl;

/// Runs one named background task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Execute the task. A retriable error re-queues the task after the
    /// dispatcher's retry delay.
    async fn run_task(&self, name: &str) -> Result<()>;
}

/// Dedup-by-name task queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl TaskQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, pending: Arc::new(Mutex::new(HashSet::new())) }, rx)
    }

    /// Queue a task unless it is already pending.
    pub fn push(&self, name: &str) {
        let mut pending = self.pending.lock();
        if pending.contains(name) {
            return;
        }
        if self.tx.send(name.to_string()).is_ok() {
            pending.insert(name.to_string());
        }
    }

    fn finish(&self, name: &str) {
        self.pending.lock().remove(name);
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Bounded pool draining a [`TaskQueue`].
pub struct TaskDispatcher;

impl TaskDispatcher {
    /// Start `n_workers` workers running `runner` until `control` quits.
    /// Returns the queue to push into.
    pub fn start(
        runner: Arc<dyn TaskRunner>,
        n_workers: usize,
        retry_delay: Duration,
        control: ServerControl,
    ) -> TaskQueue {
        let (queue, rx) = TaskQueue::new();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..n_workers.max(1) {
            let rx = Arc::clone(&rx);
            let runner = Arc::clone(&runner);
            let queue = queue.clone();
            let control = control.clone();
            tokio::spawn(async move {
                loop {
                    let name = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            n = rx.recv() => n,
                            () = control.wait_quit() => None,
                        }
                    };
                    let Some(name) = name else { break };
                    debug!(worker, task = %name, "background task start");
                    let result = runner.run_task(&name).await;
                    queue.finish(&name);
                    match result {
                        Ok(()) => debug!(worker, task = %name, "background task done"),
                        Err(e) if e.is_retriable() && !control.is_quitting() => {
                            warn!(worker, task = %name, error = %e,
                                "background task failed, will retry");
                            let queue = queue.clone();
                            let name = name.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(retry_delay).await;
                                queue.push(&name);
                            });
                        }
                        Err(e) => {
                            warn!(worker, task = %name, error = %e, "background task failed");
                        }
                    }
                }
            });
        }
        queue
    }
}
