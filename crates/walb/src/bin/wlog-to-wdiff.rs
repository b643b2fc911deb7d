//! Convert a wlog stream to a wdiff file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use walb_core::{Compression, DEFAULT_MAX_IO_LB, LOGICAL_BLOCK_SIZE};
use walb_log::{WldevReader, WlogConverter, WlogFileReader};

/// Convert walb logs to a walb diff.
#[derive(Parser)]
#[command(name = "wlog-to-wdiff")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input wlog stream file, or a log device image with --ldev.
    input: PathBuf,

    /// Output wdiff file.
    output: PathBuf,

    /// Treat the input as a log device image.
    #[arg(long)]
    ldev: bool,

    /// Max IO size in the output wdiff [bytes]; 0 means unlimited.
    #[arg(short = 'x', long, default_value_t = DEFAULT_MAX_IO_LB as usize * LOGICAL_BLOCK_SIZE)]
    max_io_size: usize,

    /// Use the indexed format instead of the sorted format.
    #[arg(long)]
    indexed: bool,

    /// Compression codec (none, gzip, snappy, lzma, lz4, zstd).
    #[arg(long, default_value = "snappy")]
    compression: Compression,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let max_io_blocks = (cli.max_io_size / LOGICAL_BLOCK_SIZE) as u32;
    let mut conv = WlogConverter::new(max_io_blocks);
    let uuid;

    if cli.ldev {
        let mut reader = WldevReader::open(&cli.input).context("cannot open ldev")?;
        let sb = reader.super_block().clone();
        uuid = sb.uuid();
        reader.reset(sb.oldest_lsid());
        while reader.current_lsid() < sb.written_lsid() {
            let (pack, data) = reader.read_pack()?;
            conv.add_pack(&pack, &data)?;
        }
    } else {
        let file = std::fs::File::open(&cli.input).context("cannot open wlog file")?;
        let mut reader = WlogFileReader::new(std::io::BufReader::new(file));
        let header = reader.read_header()?;
        uuid = header.uuid;
        while let Some((pack, data)) = reader.read_pack()? {
            conv.add_pack(&pack, &data)?;
        }
    }

    let out = std::io::BufWriter::new(
        std::fs::File::create(&cli.output).context("cannot create output")?,
    );
    if cli.indexed {
        conv.write_indexed(out, uuid, cli.compression)?;
    } else {
        conv.write_sorted(out, uuid, cli.compression)?;
    }
    Ok(())
}
