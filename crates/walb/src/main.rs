// Copyright 2026 WalB Tools Dev
// SPDX-License-Identifier: Apache-2.0

//! WalB: block-level continuous replication daemons.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use walb_core::config::{Config, LogFormat};
use walb_proto::{ProtocolServer, ServerControl, TaskDispatcher};

mod cli;
mod ctl;

use cli::{Cli, Commands, DaemonArgs};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async {
        match cli.command {
            Commands::Storage(args) => run_storage(args).await,
            Commands::Proxy(args) => run_proxy(args).await,
            Commands::Archive(args) => run_archive(args).await,
            Commands::Ctl(args) => ctl::run(args).await,
            Commands::Version => {
                println!("walb {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    })
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(p)
            .with_context(|| format!("failed to read config file: {}", p.display())),
        None => {
            let default_paths =
                [PathBuf::from("walb.toml"), PathBuf::from("/etc/walb/walb.toml")];
            for p in &default_paths {
                if p.exists() {
                    return Config::from_file(p)
                        .with_context(|| format!("failed to parse {}", p.display()));
                }
            }
            Ok(Config::default())
        }
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .ok();
        }
    }
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &DaemonArgs, role: &str) {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(node_id) = &args.node_id {
        config.server.node_id = node_id.clone();
    }
    if config.server.node_id.is_empty() {
        config.server.node_id = format!("{role}-{}", config.server.bind.port());
    }
    if let Some(base_dir) = &args.base_dir {
        match role {
            "storage" => config.storage.base_dir = base_dir.clone(),
            "proxy" => config.proxy.base_dir = base_dir.clone(),
            _ => config.archive.base_dir = base_dir.clone(),
        }
    }
}

fn spawn_quit_watcher(control: ServerControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            control.force_quit();
        }
    });
}

async fn run_storage(args: DaemonArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args, "storage");
    init_logging(&config)?;
    std::fs::create_dir_all(&config.storage.base_dir)
        .context("failed to create storage base dir")?;

    let control = ServerControl::new();
    let storage = Arc::new(walb_storage::Storage::new(
        config.server.node_id.clone(),
        config.storage.base_dir.clone(),
        config.storage.max_wlog_send_mb,
        config.storage.proxies.clone(),
        config.server.socket_timeout(),
        control.clone(),
    ));

    let runner = Arc::new(walb_storage::WlogSendRunner::new(Arc::clone(&storage)));
    let queue = TaskDispatcher::start(
        runner,
        config.server.max_background_tasks,
        config.server.retry_delay(),
        control.clone(),
    );
    storage
        .task_queue
        .set(queue.clone())
        .map_err(|_| anyhow::anyhow!("task queue already set"))?;

    tokio::spawn(walb_storage::wdev_monitor(
        Arc::clone(&storage),
        queue,
        Duration::from_millis(config.storage.wdev_poll_interval_ms),
        control.clone(),
    ));
    tokio::spawn(walb_storage::proxy_monitor(
        Arc::clone(&storage.proxy_manager),
        Duration::from_millis(config.storage.proxy_poll_interval_ms),
        config.server.socket_timeout(),
        control.clone(),
    ));

    let mut server = ProtocolServer::new(
        config.server.node_id.clone(),
        storage,
        control.clone(),
        config.server.max_foreground_tasks,
        config.server.socket_timeout(),
    );
    walb_storage::register_handlers(&mut server);

    let listener =
        TcpListener::bind(config.server.bind).await.context("failed to bind")?;
    info!(addr = %config.server.bind, "walb storage daemon starting");
    spawn_quit_watcher(control);
    server.run(listener).await.context("storage server error")?;
    info!("walb storage daemon stopped");
    Ok(())
}

async fn run_proxy(args: DaemonArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args, "proxy");
    init_logging(&config)?;
    std::fs::create_dir_all(&config.proxy.base_dir)
        .context("failed to create proxy base dir")?;

    let control = ServerControl::new();
    let proxy = Arc::new(walb_proxy::Proxy::new(
        config.server.node_id.clone(),
        config.proxy.base_dir.clone(),
        config.proxy.max_wdiff_send_size,
        config.proxy.max_wdiff_send_nr,
        config.server.socket_timeout(),
        control.clone(),
    ));

    let runner = Arc::new(walb_proxy::ForwardRunner::new(Arc::clone(&proxy)));
    let queue = TaskDispatcher::start(
        runner,
        config.server.max_background_tasks,
        config.server.retry_delay(),
        control.clone(),
    );
    proxy
        .task_queue
        .set(queue)
        .map_err(|_| anyhow::anyhow!("task queue already set"))?;

    let mut server = ProtocolServer::new(
        config.server.node_id.clone(),
        proxy,
        control.clone(),
        config.server.max_foreground_tasks,
        config.server.socket_timeout(),
    );
    walb_proxy::register_handlers(&mut server);

    let listener =
        TcpListener::bind(config.server.bind).await.context("failed to bind")?;
    info!(addr = %config.server.bind, "walb proxy daemon starting");
    spawn_quit_watcher(control);
    server.run(listener).await.context("proxy server error")?;
    info!("walb proxy daemon stopped");
    Ok(())
}

async fn run_archive(args: DaemonArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    apply_overrides(&mut config, &args, "archive");
    init_logging(&config)?;
    std::fs::create_dir_all(&config.archive.base_dir)
        .context("failed to create archive base dir")?;

    let control = ServerControl::new();
    let archive = Arc::new(walb_archive::Archive::new(
        config.server.node_id.clone(),
        config.archive.base_dir.clone(),
        config.archive.restore_max_retry,
        config.server.socket_timeout(),
        control.clone(),
    ));

    let runner = Arc::new(walb_archive::ArchiveTaskRunner::new(Arc::clone(&archive)));
    let queue = TaskDispatcher::start(
        runner,
        config.server.max_background_tasks,
        config.server.retry_delay(),
        control.clone(),
    );
    archive
        .task_queue
        .set(queue)
        .map_err(|_| anyhow::anyhow!("task queue already set"))?;

    let mut server = ProtocolServer::new(
        config.server.node_id.clone(),
        archive,
        control.clone(),
        config.server.max_foreground_tasks,
        config.server.socket_timeout(),
    );
    walb_archive::register_handlers(&mut server);

    let listener =
        TcpListener::bind(config.server.bind).await.context("failed to bind")?;
    info!(addr = %config.server.bind, "walb archive daemon starting");
    spawn_quit_watcher(control);
    server.run(listener).await.context("archive server error")?;
    info!("walb archive daemon stopped");
    Ok(())
}
