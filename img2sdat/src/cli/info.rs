// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fmt,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    config::Config,
    format::{
        rangeset::BlockRangeSet,
        sparse::{self, Chunk},
        transfer::{self, TransferList},
    },
    image::{BlockImage, SparseImage},
};

struct CompactView<'a, T>(&'a [T]);

impl<T: fmt::Debug> fmt::Debug for CompactView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();

        for item in self.0 {
            // No alternate mode for no inner newlines.
            list.entry(&format_args!("{item:?}"));
        }

        list.finish()
    }
}

struct ImageInfo<'a> {
    header: Option<&'a sparse::Header>,
    block_size: u32,
    total_blocks: u64,
    care_map: &'a BlockRangeSet,
    zero_blocks: &'a BlockRangeSet,
    extents: Option<&'a [Chunk]>,
}

impl fmt::Debug for ImageInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Image");
        s.field("header", &self.header)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("care_blocks", &self.care_map.total_blocks())
            .field("zero_blocks", &self.zero_blocks.total_blocks())
            .field("care_map", &format_args!("{}", self.care_map));

        if let Some(extents) = self.extents {
            s.field("extents", &CompactView(extents));
        }

        s.finish()
    }
}

#[derive(Debug)]
#[allow(dead_code)]
struct ListInfo {
    version: u32,
    total_blocks: u64,
    stash_slots: u64,
    max_stashed_blocks: u64,
    new_blocks: u64,
    commands: BTreeMap<&'static str, usize>,
}

impl ListInfo {
    fn new(list: &TransferList) -> Self {
        let mut commands = BTreeMap::new();
        for command in &list.commands {
            *commands.entry(command.name()).or_default() += 1;
        }

        Self {
            version: list.version,
            total_blocks: list.total_blocks,
            stash_slots: list.stash_slots,
            max_stashed_blocks: list.max_stashed_blocks,
            new_blocks: list.new_ranges().map(BlockRangeSet::total_blocks).sum(),
            commands,
        }
    }
}

/// Guess whether a file is a transfer list. Lists always start with a version
/// number on its own line.
fn looks_like_transfer_list(path: &Path) -> Result<bool> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;
    let mut buf = [0u8; 4];
    let mut n = 0;

    while n < buf.len() {
        let read = file
            .read(&mut buf[n..])
            .with_context(|| format!("Failed to read: {path:?}"))?;
        if read == 0 {
            break;
        }
        n += read;
    }

    let Some(line) = buf[..n].split(|b| *b == b'\n').next() else {
        return Ok(false);
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    Ok(n > line.len()
        && std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .is_some_and(|v| (transfer::MIN_VERSION..=transfer::MAX_VERSION).contains(&v)))
}

fn list_info(cli: &InfoCli) -> Result<()> {
    let data = fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read transfer list: {:?}", cli.input))?;
    let list = data
        .parse::<TransferList>()
        .with_context(|| format!("Failed to parse transfer list: {:?}", cli.input))?;

    println!("{:#?}", ListInfo::new(&list));

    if cli.verbose {
        for command in &list.commands {
            println!("{}", transfer::format_command(command, list.version));
        }
    }

    Ok(())
}

fn image_info(cli: &InfoCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let file = File::open(&cli.input)
        .with_context(|| format!("Failed to open for reading: {:?}", cli.input))?;
    let image = SparseImage::open(file, config.block_size, config.crc_mode(), cancel_signal)
        .with_context(|| format!("Failed to open image: {:?}", cli.input))?;

    let info = ImageInfo {
        header: image.sparse_header(),
        block_size: image.block_size(),
        total_blocks: image.total_blocks(),
        care_map: image.care_map(),
        zero_blocks: image.zero_blocks(),
        extents: cli.verbose.then(|| image.extents()),
    };

    println!("{info:#?}");

    Ok(())
}

pub fn info_main(cli: &InfoCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    if looks_like_transfer_list(&cli.input)? {
        list_info(cli)
    } else {
        image_info(cli, config, cancel_signal)
    }
}

/// Display information about an image or a transfer list.
///
/// Transfer lists are detected by their version header. Anything else is
/// opened as a sparse or raw image.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to image or transfer list.
    #[arg(value_name = "FILE", value_parser)]
    pub input: PathBuf,

    /// Also show every extent or command.
    #[arg(short, long)]
    pub verbose: bool,
}
