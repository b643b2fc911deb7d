//! Command line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// WalB: block-level continuous replication daemons.
#[derive(Parser)]
#[command(name = "walb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the storage daemon.
    Storage(DaemonArgs),
    /// Run the proxy daemon.
    Proxy(DaemonArgs),
    /// Run the archive daemon.
    Archive(DaemonArgs),
    /// Send a control request to a daemon.
    Ctl(CtlArgs),
    /// Print version information.
    Version,
}

/// Arguments shared by the daemon subcommands.
#[derive(Args)]
pub struct DaemonArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,

    /// Base directory (overrides config).
    #[arg(short = 'd', long)]
    pub base_dir: Option<PathBuf>,

    /// Node identifier (overrides config).
    #[arg(long)]
    pub node_id: Option<String>,
}

/// Control client arguments.
#[derive(Args)]
pub struct CtlArgs {
    /// Daemon address.
    #[arg(short, long)]
    pub addr: SocketAddr,

    /// Client identifier.
    #[arg(long, default_value = "walb-ctl")]
    pub client_id: String,

    /// Socket timeout in seconds.
    #[arg(long, default_value = "60")]
    pub timeout_secs: u64,

    /// The control command.
    #[command(subcommand)]
    pub command: CtlCommands,
}

/// Control commands mapped onto the daemon protocols.
#[derive(Subcommand)]
pub enum CtlCommands {
    /// Initialize a storage volume bound to a wdev.
    InitVol {
        /// Volume id.
        vol_id: String,
        /// Wdev (ldev image) path; storage only.
        wdev_path: Option<PathBuf>,
    },
    /// Remove a volume entirely.
    ClearVol {
        /// Volume id.
        vol_id: String,
    },
    /// Reset the wlog bookkeeping of a storage volume.
    ResetVol {
        /// Volume id.
        vol_id: String,
        /// Gid to restart from.
        #[arg(default_value = "0")]
        gid: u64,
    },
    /// Full-backup bookkeeping hand-off.
    FullBkp {
        /// Volume id.
        vol_id: String,
        /// Image size in logical blocks (archive only).
        #[arg(long)]
        size_lb: Option<u64>,
        /// Device uuid in hex (archive only).
        #[arg(long)]
        uuid: Option<String>,
    },
    /// Start a volume.
    Start {
        /// Volume id.
        vol_id: String,
        /// Start as wlog-capturing master (storage only).
        #[arg(long)]
        master: bool,
    },
    /// Stop a volume.
    Stop {
        /// Volume id.
        vol_id: String,
        /// Drain queued diffs before stopping (proxy only).
        #[arg(long)]
        wait_for_empty: bool,
    },
    /// Take a snapshot on a storage volume.
    Snapshot {
        /// Volume id.
        vol_id: String,
    },
    /// Register an archive on a proxy volume.
    AddArchiveInfo {
        /// Volume id.
        vol_id: String,
        /// Archive name.
        archive: String,
        /// Archive address.
        addr: SocketAddr,
    },
    /// Remove an archive from a proxy volume.
    DeleteArchiveInfo {
        /// Volume id.
        vol_id: String,
        /// Archive name.
        archive: String,
    },
    /// Queue a restore on an archive volume.
    Restore {
        /// Volume id.
        vol_id: String,
        /// Target gid.
        gid: u64,
    },
    /// Queue an apply on an archive volume.
    Apply {
        /// Volume id.
        vol_id: String,
        /// Target gid.
        gid: u64,
    },
    /// List restorable gids of an archive volume.
    Restorable {
        /// Volume id.
        vol_id: String,
    },
    /// Print a volume's state.
    GetState {
        /// Volume id.
        vol_id: String,
    },
    /// Print a volume's detailed status.
    Status {
        /// Volume id.
        vol_id: String,
    },
}
