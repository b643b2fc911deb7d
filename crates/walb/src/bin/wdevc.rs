//! Walb device controller.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use walb_log::{FileWdev, WdevOps, WdevStartParams};

/// Control a walb device image.
#[derive(Parser)]
#[command(name = "wdevc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format a file as a log device.
    FormatLdev {
        /// Log device image path.
        ldev: PathBuf,
        /// Physical block size.
        #[arg(long, default_value = "512")]
        pbs: u32,
        /// Log device size in physical blocks.
        #[arg(long, default_value = "65536")]
        ldev_size_pb: u64,
        /// Data device size in logical blocks.
        #[arg(long, default_value = "1048576")]
        device_size_lb: u64,
        /// Device name.
        #[arg(short, long, default_value = "wdev0")]
        name: String,
    },
    /// Start the device.
    StartDev {
        /// Log device image path.
        ldev: PathBuf,
        /// Max logpack size [KiB].
        #[arg(long, default_value = "32")]
        max_logpack_kb: u32,
        /// Max pending size [MiB].
        #[arg(long, default_value = "32")]
        max_pending_mb: u32,
        /// Min pending size [MiB].
        #[arg(long, default_value = "16")]
        min_pending_mb: u32,
        /// Queue stopping period [ms].
        #[arg(long, default_value = "100")]
        queue_stop_timeout_ms: u32,
        /// Flush interval size [MiB].
        #[arg(long, default_value = "16")]
        log_flush_interval_mb: u32,
        /// Flush interval period [ms].
        #[arg(long, default_value = "100")]
        log_flush_interval_ms: u32,
        /// Number of packs in bulk.
        #[arg(long, default_value = "128")]
        n_pack_bulk: u32,
        /// Number of IOs in bulk.
        #[arg(long, default_value = "1024")]
        n_io_bulk: u32,
    },
    /// Stop the device.
    StopDev {
        /// Log device image path.
        ldev: PathBuf,
    },
    /// Print the lsid counters.
    GetLsid {
        /// Log device image path.
        ldev: PathBuf,
    },
    /// Print whether the log ring overflowed.
    IsOverflow {
        /// Log device image path.
        ldev: PathBuf,
    },
    /// Release wlogs before an lsid.
    EraseWal {
        /// Log device image path.
        ldev: PathBuf,
        /// Erase up to this lsid.
        lsid: u64,
    },
    /// Discard all wlogs and restart the log with a fresh uuid.
    ResetWal {
        /// Log device image path.
        ldev: PathBuf,
    },
    /// Print the super sector.
    Super {
        /// Log device image path.
        ldev: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::FormatLdev { ldev, pbs, ldev_size_pb, device_size_lb, name } => {
            FileWdev::format(&ldev, pbs, ldev_size_pb, device_size_lb, &name)
                .context("format failed")?;
            println!("formatted {}", ldev.display());
        }
        Commands::StartDev {
            ldev,
            max_logpack_kb,
            max_pending_mb,
            min_pending_mb,
            queue_stop_timeout_ms,
            log_flush_interval_mb,
            log_flush_interval_ms,
            n_pack_bulk,
            n_io_bulk,
        } => {
            let wdev = FileWdev::open(&ldev)?;
            wdev.start(&WdevStartParams {
                max_logpack_kb,
                max_pending_mb,
                min_pending_mb,
                queue_stop_timeout_ms,
                log_flush_interval_mb,
                log_flush_interval_ms,
                n_pack_bulk,
                n_io_bulk,
            })?;
            println!("started");
        }
        Commands::StopDev { ldev } => {
            FileWdev::open(&ldev)?.stop()?;
            println!("stopped");
        }
        Commands::GetLsid { ldev } => {
            let wdev = FileWdev::open(&ldev)?;
            println!("oldest    {}", wdev.get_oldest_lsid()?);
            println!("permanent {}", wdev.get_permanent_lsid()?);
        }
        Commands::IsOverflow { ldev } => {
            let wdev = FileWdev::open(&ldev)?;
            println!("{}", u8::from(wdev.is_overflow()?));
        }
        Commands::EraseWal { ldev, lsid } => {
            FileWdev::open(&ldev)?.erase_wal(lsid)?;
        }
        Commands::ResetWal { ldev } => {
            FileWdev::open(&ldev)?.reset_wal()?;
        }
        Commands::Super { ldev } => {
            let wdev = FileWdev::open(&ldev)?;
            println!("{}", wdev.super_block()?);
        }
    }
    Ok(())
}
