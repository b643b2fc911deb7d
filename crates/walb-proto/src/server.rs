//! The protocol dispatcher.
//!
//! One listener per daemon: the accept loop reads the greeting, routes
//! the connection to the handler registered under the protocol name, and
//! bounds handler concurrency with a semaphore. A shared control flag
//! implements cooperative shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};
use walb_core::{Error, Result};

use crate::frame::{recv_msg, send_msg, Greeting, GreetingReply, Reply};

/// A protocol handler bound to a daemon context `C`.
#[async_trait]
pub trait ProtocolHandler<C: Send + Sync + 'static>: Send + Sync {
    /// Serve one connection. The greeting has already been exchanged.
    async fn handle(&self, stream: &mut TcpStream, client_id: &str, ctx: Arc<C>) -> Result<()>;
}

/// Cooperative shutdown control shared by the accept loop, the monitors,
/// and long-running handlers.
#[derive(Clone, Default)]
pub struct ServerControl {
    quit: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ServerControl {
    /// A fresh control handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    pub fn force_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown is requested.
    pub async fn wait_quit(&self) {
        while !self.is_quitting() {
            self.notify.notified().await;
        }
    }

    /// Fail with `Cancelled` if shutdown was requested. Long operations
    /// call this between packs.
    pub fn check(&self) -> Result<()> {
        if self.is_quitting() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The per-daemon protocol server.
pub struct ProtocolServer<C: Send + Sync + 'static> {
    node_id: String,
    handlers: HashMap<&'static str, Arc<dyn ProtocolHandler<C>>>,
    ctx: Arc<C>,
    control: ServerControl,
    max_foreground: usize,
    socket_timeout: Duration,
}

impl<C: Send + Sync + 'static> ProtocolServer<C> {
    /// Build a server for `ctx`.
    pub fn new(
        node_id: impl Into<String>,
        ctx: Arc<C>,
        control: ServerControl,
        max_foreground: usize,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: HashMap::new(),
            ctx,
            control,
            max_foreground: max_foreground.max(1),
            socket_timeout,
        }
    }

    /// Register a handler for a protocol name.
    pub fn register(&mut self, protocol: &'static str, handler: Arc<dyn ProtocolHandler<C>>) {
        self.handlers.insert(protocol, handler);
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_foreground));
        let handlers = Arc::new(self.handlers);
        info!(node_id = %self.node_id, addr = ?listener.local_addr().ok(), "protocol server started");

        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                () = self.control.wait_quit() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(peer = %peer, "accepted connection");

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let handlers = Arc::clone(&handlers);
            let ctx = Arc::clone(&self.ctx);
            let node_id = self.node_id.clone();
            let timeout = self.socket_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) =
                    serve_connection(stream, node_id, handlers, ctx, timeout).await
                {
                    match e {
                        Error::Cancelled => {}
                        e => warn!(error = %e, "connection handler failed"),
                    }
                }
            });
        }
        info!(node_id = %self.node_id, "protocol server stopped");
        Ok(())
    }
}

async fn serve_connection<C: Send + Sync + 'static>(
    mut stream: TcpStream,
    node_id: String,
    handlers: Arc<HashMap<&'static str, Arc<dyn ProtocolHandler<C>>>>,
    ctx: Arc<C>,
    socket_timeout: Duration,
) -> Result<()> {
    let greeting: Greeting = tokio::time::timeout(socket_timeout, recv_msg(&mut stream))
        .await
        .map_err(|_| Error::Timeout("greeting".to_string()))??;

    let Some(handler) = handlers.get(greeting.protocol.as_str()).cloned() else {
        let reply =
            GreetingReply::Reject { reason: format!("unknown protocol {}", greeting.protocol) };
        send_msg(&mut stream, &reply).await?;
        return Err(Error::ProtocolMismatch(greeting.protocol));
    };
    send_msg(&mut stream, &GreetingReply::Accept { server_id: node_id }).await?;

    match handler.handle(&mut stream, &greeting.client_id, ctx).await {
        Ok(()) => Ok(()),
        Err(e @ (Error::Cancelled | Error::Internal(_))) => Err(e),
        Err(e) => {
            // Best effort: tell the client what went wrong, then close.
            let reply: Reply<()> = Reply::from_error(&e);
            let _ = send_msg(&mut stream, &reply).await;
            error!(protocol = %greeting.protocol, client = %greeting.client_id, error = %e,
                "protocol handler error");
            Err(e)
        }
    }
}

/// Dial a server and exchange the greeting.
pub async fn connect(
    addr: std::net::SocketAddr,
    client_id: &str,
    protocol: &str,
    socket_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(socket_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connect {addr}")))??;
    send_msg(
        &mut stream,
        &Greeting { client_id: client_id.to_string(), protocol: protocol.to_string() },
    )
    .await?;
    let reply: GreetingReply =
        tokio::time::timeout(socket_timeout, recv_msg(&mut stream))
            .await
            .map_err(|_| Error::Timeout("greeting reply".to_string()))??;
    match reply {
        GreetingReply::Accept { .. } => Ok(stream),
        GreetingReply::Reject { reason } => Err(Error::ProtocolMismatch(reason)),
    }
}
