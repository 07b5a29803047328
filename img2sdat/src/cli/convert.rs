// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;

use crate::{
    cli::{status, warning},
    config::Config,
    encode::{self, Job},
};

/// Build the effective config from the config file and the command line.
fn effective_config(cli: &ConvertCli, config: &Config) -> Result<Config> {
    let mut config = config.clone();

    if let Some(dir) = &cli.output {
        config.output_dir.clone_from(dir);
    }
    if let Some(prefix) = &cli.prefix {
        config.prefix.clone_from(prefix);
    }
    if let Some(size) = cli.cache_size {
        config.cache_size = size;
    }
    if let Some(version) = cli.version {
        config.version = version;
    }
    if let Some(size) = cli.block_size {
        config.block_size = size;
    }
    if let Some(n) = cli.max_op_blocks {
        config.max_op_blocks = n;
    }
    if cli.no_new_fallback {
        config.new_fallback = false;
    }
    if cli.ignore_crc {
        config.validate_crc = false;
    }

    config.validate().context("Invalid configuration")?;

    Ok(config)
}

/// Output prefix for an input when converting several images at once.
fn stem_prefix(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Cannot derive output prefix from path: {path:?}"))?;

    Ok(stem.to_owned())
}

fn build_jobs(cli: &ConvertCli, config: &Config) -> Result<Vec<Job>> {
    if cli.input.len() == 1 {
        return Ok(vec![Job {
            input: cli.input[0].clone(),
            source: cli.source.clone(),
            prefix: config.prefix.clone(),
        }]);
    }

    if cli.source.is_some() {
        bail!("--source can only be used with a single input image");
    } else if cli.prefix.is_some() {
        bail!("--prefix can only be used with a single input image");
    }

    let mut prefixes = HashSet::new();
    let mut jobs = vec![];

    for input in &cli.input {
        let prefix = stem_prefix(input)?;
        if !prefixes.insert(prefix.clone()) {
            bail!("Multiple inputs would be written with the same prefix: {prefix:?}");
        }

        jobs.push(Job {
            input: input.clone(),
            source: None,
            prefix,
        });
    }

    Ok(jobs)
}

pub fn convert_main(cli: &ConvertCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let config = effective_config(cli, config)?;
    let jobs = build_jobs(cli, &config)?;

    if config.version < 3 {
        warning!(
            "Transfer list version {} is not supported by current updaters",
            config.version,
        );
    }

    let start = Instant::now();
    let results = encode::convert_all(&jobs, &config, cancel_signal);
    let mut failed = 0;

    for (job, result) in jobs.iter().zip(results) {
        match result {
            Ok(summary) => {
                status!(
                    "Wrote {:?}: {} blocks, {} new, {} commands",
                    summary.outputs.transfer_list,
                    summary.total_blocks,
                    summary.new_blocks,
                    summary.num_commands,
                );
            }
            Err(encode::Error::Interrupted) => bail!("Interrupted"),
            Err(e) => {
                let e = anyhow::Error::from(e)
                    .context(format!("Failed to convert: {:?}", job.input));
                warning!("{e:?}");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("Failed to convert {failed} of {} images", jobs.len());
    }

    status!("Completed after {:.1}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Convert raw or sparse images to block transfer lists.
///
/// Each image produces `<prefix>.transfer.list`, `<prefix>.new.dat`, and for
/// version 3 and newer, an empty `<prefix>.patch.dat`.
#[derive(Debug, Parser)]
pub struct ConvertCli {
    /// Path to input image.
    ///
    /// If multiple images are given, they are converted in parallel and each
    /// output prefix is the image's file name without the extension.
    #[arg(value_name = "FILE", required = true, value_parser)]
    pub input: Vec<PathBuf>,

    /// Path to source image for an incremental transfer list.
    ///
    /// Without this, the transfer list writes every block of the image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub source: Option<PathBuf>,

    /// Output directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    pub output: Option<PathBuf>,

    /// Output file name prefix.
    #[arg(short, long, value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Stash space available to the updater.
    #[arg(short, long, value_name = "BYTES")]
    pub cache_size: Option<u64>,

    /// Transfer list version.
    #[arg(short, long, value_name = "VERSION", value_parser = clap::value_parser!(u32).range(3..=4))]
    pub version: Option<u32>,

    /// Block size of raw input images.
    #[arg(short, long, value_name = "BYTES")]
    pub block_size: Option<u32>,

    /// Maximum size of a single new or zero command (0 = unlimited).
    #[arg(long, value_name = "BLOCKS")]
    pub max_op_blocks: Option<u64>,

    /// Fail if moves don't fit in the stash.
    ///
    /// By default, such moves are written as new data instead.
    #[arg(long)]
    pub no_new_fallback: bool,

    /// Don't verify CRC32 checksums in sparse images.
    #[arg(long)]
    pub ignore_crc: bool,
}
