// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::PathBuf,
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::{
    apply::{self, ApplyOptions},
    cli::status,
    config::Config,
    format::{
        rangeset::BlockRangeSet,
        transfer::{Command, TransferList},
    },
    image::{self, BlockImage, SparseImage},
    util,
};

/// Every block written by `list`.
fn written_ranges(list: &TransferList) -> BlockRangeSet {
    list.commands
        .iter()
        .filter_map(Command::target)
        .fold(BlockRangeSet::new(), |acc, t| acc.union(t))
}

pub fn apply_main(cli: &ApplyCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let block_size = cli.block_size.unwrap_or(config.block_size);
    let options = ApplyOptions {
        block_size,
        stash_limit: cli.cache_size.unwrap_or(config.cache_size),
    };

    let data = fs::read_to_string(&cli.transfer_list)
        .with_context(|| format!("Failed to read transfer list: {:?}", cli.transfer_list))?;
    let list = data
        .parse::<TransferList>()
        .with_context(|| format!("Failed to parse transfer list: {:?}", cli.transfer_list))?;

    info!(
        "Transfer list version {} writes {} blocks",
        list.version, list.total_blocks,
    );

    let temp = util::create_temp_beside(&cli.output)
        .with_context(|| format!("Failed to create temporary file for: {:?}", cli.output))?;

    if let Some(path) = &cli.source {
        status!("Copying source image: {path:?}");

        let file =
            File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
        let source = SparseImage::open(file, block_size, config.crc_mode(), cancel_signal)
            .with_context(|| format!("Failed to open image: {path:?}"))?;
        let all = BlockRangeSet::from(0..source.total_blocks());

        let mut writer = BufWriter::new(temp.as_file());
        source
            .read_blocks(&all, &mut writer, cancel_signal)
            .with_context(|| format!("Failed to copy source image: {path:?}"))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush: {:?}", temp.path()))?;
    }

    let new_data = File::open(&cli.new_data)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.new_data))?;
    let mut reader = BufReader::new(new_data);

    status!("Replaying {} commands", list.commands.len());

    let stats = apply::apply(&list, temp.as_file(), &mut reader, &options, cancel_signal)
        .with_context(|| format!("Failed to apply transfer list: {:?}", cli.transfer_list))?;

    let written = written_ranges(&list);
    let num_blocks = cli
        .num_blocks
        .unwrap_or_else(|| written.iter().last().map_or(0, |r| r.end));
    let size = num_blocks * u64::from(block_size);
    let current = temp
        .as_file()
        .metadata()
        .with_context(|| format!("Failed to stat: {:?}", temp.path()))?
        .len();
    if size > current {
        temp.as_file()
            .set_len(size)
            .with_context(|| format!("Failed to resize: {:?}", temp.path()))?;
    }

    let temp = if cli.sparse {
        status!("Converting output to sparse image");

        let raw = SparseImage::open_raw(temp.as_file(), block_size, cancel_signal)
            .with_context(|| format!("Failed to scan output: {:?}", temp.path()))?;
        let care = if cli.source.is_some() {
            BlockRangeSet::from(0..raw.total_blocks())
        } else {
            written
        };

        let sparse_temp = util::create_temp_beside(&cli.output)
            .with_context(|| format!("Failed to create temporary file for: {:?}", cli.output))?;
        let mut writer = BufWriter::new(sparse_temp.as_file());
        image::write_sparse(&raw, &care, &mut writer, cancel_signal)
            .with_context(|| format!("Failed to write sparse image: {:?}", sparse_temp.path()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush: {:?}", sparse_temp.path()))?;
        drop(writer);

        sparse_temp
    } else {
        temp
    };

    util::persist_temp(temp, &cli.output).with_context(|| {
        format!("Failed to move temporary file to output path: {:?}", cli.output)
    })?;

    status!(
        "Wrote {:?}: {} blocks, {} from new data, peak stash {} bytes",
        cli.output,
        stats.blocks_written,
        stats.new_blocks,
        stats.max_stash_bytes,
    );

    Ok(())
}

/// Replay a transfer list to rebuild the target image.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to transfer list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub transfer_list: PathBuf,

    /// Path to new data file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub new_data: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Path to source image (raw or sparse).
    ///
    /// This is required for incremental transfer lists. The source image is
    /// left untouched.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub source: Option<PathBuf>,

    /// Block size.
    #[arg(short, long, value_name = "BYTES")]
    pub block_size: Option<u32>,

    /// Maximum stash size.
    #[arg(short, long, value_name = "BYTES")]
    pub cache_size: Option<u64>,

    /// Size of the output image in blocks.
    ///
    /// Defaults to the end of the highest block written by the transfer list.
    #[arg(long, value_name = "BLOCKS")]
    pub num_blocks: Option<u64>,

    /// Write the output as a sparse image.
    ///
    /// Blocks that the transfer list never writes are stored as don't-care
    /// chunks unless a source image was given.
    #[arg(long)]
    pub sparse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_block_ranges() {
        let list = "2\n3\n0\n0\nnew 2,4,6\nzero 2,0,1\nstash 0 2,8,9\nfree 0\n"
            .parse::<TransferList>()
            .unwrap();

        assert_eq!(written_ranges(&list).to_string(), "4,0,1,4,6");
    }
}
