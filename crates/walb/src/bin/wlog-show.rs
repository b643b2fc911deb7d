//! Print the contents of a wlog stream or a log device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use walb_log::{WldevReader, WlogFileReader};

/// Show wlog records.
#[derive(Parser)]
#[command(name = "wlog-show")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input: a wlog stream file, or a log device image with --ldev.
    input: PathBuf,

    /// Treat the input as a log device image and read its ring directly.
    #[arg(long)]
    ldev: bool,

    /// Begin lsid (ldev mode; default: oldest lsid).
    #[arg(short = 'b', long)]
    begin: Option<u64>,

    /// End lsid (ldev mode; default: permanent lsid).
    #[arg(short = 'e', long)]
    end: Option<u64>,
}

fn show_pack(pack: &walb_log::LogPackHeader) {
    println!("pack lsid {} records {} ioPb {}", pack.logpack_lsid(), pack.n_records(), pack.total_io_size_pb());
    for rec in pack.records() {
        let kind = if rec.is_padding() {
            "padding"
        } else if rec.is_discard() {
            "discard"
        } else {
            "normal"
        };
        println!(
            "  lsid {} {kind} offset {} ioLb {} csum {:08x}",
            rec.lsid, rec.offset, rec.io_size, rec.checksum
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.ldev {
        let mut reader = WldevReader::open(&cli.input).context("cannot open ldev")?;
        let sb = reader.super_block().clone();
        let begin = cli.begin.unwrap_or_else(|| sb.oldest_lsid());
        let end = cli.end.unwrap_or_else(|| sb.written_lsid());
        println!("{sb}");
        reader.reset(begin);
        while reader.current_lsid() < end {
            let (pack, _data) = reader.read_pack().context("read pack failed")?;
            show_pack(&pack);
        }
    } else {
        let file = std::fs::File::open(&cli.input).context("cannot open wlog file")?;
        let mut reader = WlogFileReader::new(std::io::BufReader::new(file));
        let header = reader.read_header()?;
        println!(
            "wlog pbs {} salt {:08x} lsid [{}, {})",
            header.pbs, header.salt, header.begin_lsid, header.end_lsid
        );
        while let Some((pack, _data)) = reader.read_pack()? {
            show_pack(&pack);
        }
    }
    Ok(())
}
