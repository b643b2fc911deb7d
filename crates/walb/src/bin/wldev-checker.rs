//! Verify the log device contents, following the ring as it grows.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use walb_log::{FileWdev, WdevOps, WldevReader};

/// Check log packs on a log device.
#[derive(Parser)]
#[command(name = "wldev-checker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log device image path.
    ldev: PathBuf,

    /// Check once and exit instead of following the device.
    #[arg(long)]
    once: bool,

    /// Poll interval while following [ms].
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Sleep before re-reading a suspect pack [ms].
    #[arg(long, default_value = "100")]
    retry_ms: u64,

    /// Dump directory for differing re-read images.
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

struct Checker {
    cli: Cli,
    wdev: FileWdev,
    n_packs: u64,
    n_retries: u64,
}

impl Checker {
    /// Verify packs in `[lsid, end)`. Returns the reached lsid.
    fn check_range(&mut self, lsid: u64, end: u64) -> Result<u64> {
        let mut reader = WldevReader::from_wdev(&self.wdev)?;
        reader.reset(lsid);
        while reader.current_lsid() < end {
            let cur = reader.current_lsid();
            match reader.read_pack() {
                Ok(_) => {
                    self.n_packs += 1;
                }
                Err(e) => {
                    eprintln!("pack at lsid {cur} unreadable: {e}; retrying");
                    self.n_retries += 1;
                    let first = reader.read_pb_at(cur, 1)?;
                    std::thread::sleep(Duration::from_millis(self.cli.retry_ms));
                    let second = reader.read_pb_at(cur, 1)?;
                    if first != second {
                        eprintln!("pack image at lsid {cur} is unstable");
                        self.dump_images(cur, &first, &second)?;
                    }
                    if self.wdev.is_overflow()? {
                        anyhow::bail!("device overflow at lsid {cur}");
                    }
                    // Re-verify after the settle delay; a second failure
                    // is corruption.
                    reader.reset(cur);
                    reader.read_pack().with_context(|| {
                        format!("pack at lsid {cur} still unreadable")
                    })?;
                    self.n_packs += 1;
                }
            }
        }
        Ok(reader.current_lsid())
    }

    fn dump_images(&self, lsid: u64, first: &[u8], second: &[u8]) -> Result<()> {
        let Some(dir) = &self.cli.dump_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(format!("lsid-{lsid}-a.bin")), first)?;
        std::fs::write(dir.join(format!("lsid-{lsid}-b.bin")), second)?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let wdev = FileWdev::open(&cli.ldev).context("cannot open ldev")?;
    let interval = Duration::from_millis(cli.interval_ms);
    let once = cli.once;
    let mut checker = Checker { cli, wdev, n_packs: 0, n_retries: 0 };

    let mut lsid = checker.wdev.get_oldest_lsid()?;
    loop {
        let end = checker.wdev.get_permanent_lsid()?;
        if lsid < end {
            lsid = checker.check_range(lsid, end)?;
        }
        if once {
            break;
        }
        if checker.wdev.is_overflow()? {
            anyhow::bail!("device overflow");
        }
        std::thread::sleep(interval);
        // The kernel may have reclaimed the tail while we slept.
        lsid = lsid.max(checker.wdev.get_oldest_lsid()?);
    }
    println!("checked {} packs ({} retries)", checker.n_packs, checker.n_retries);
    Ok(())
}
