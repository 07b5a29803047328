// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, IsTerminal},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, debug, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    cli::{apply, completion, config, convert, info},
    config::Config,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Only the message.
    #[default]
    Short,
    /// Level and target in addition to the message.
    Medium,
    /// Everything, including timestamps.
    Long,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Convert(convert::ConvertCli),
    Apply(apply::ApplyCli),
    Info(info::InfoCli),
    Config(config::ConfigCli),
    Completion(completion::CompletionCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file.
    ///
    /// Missing files are treated as empty. Options given on the command line
    /// take precedence over the config file.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,

    /// Lowest log message severity to output.
    ///
    /// The RUST_LOG environment variable can be used for finer control.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", value_enum, default_value_t)]
    pub log_format: LogFormat,
}

/// Set up the global tracing subscriber. Messages go to stderr so that they
/// don't mix with command output.
pub fn init_logging(log_level: Level, log_format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    let layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());
    let registry = tracing_subscriber::registry().with(filter);

    match log_format {
        LogFormat::Short => registry
            .with(layer.without_time().with_target(false).with_level(false))
            .init(),
        LogFormat::Medium => registry.with(layer.without_time()).init(),
        LogFormat::Long => registry.with(layer).init(),
    }
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    let config = match &cli.config {
        Some(path) => {
            debug!("Loading config: {path:?}");
            Config::load(path).with_context(|| format!("Failed to load config: {path:?}"))?
        }
        None => Config::default(),
    };

    // Conversions persist outputs from worker threads.
    #[cfg(unix)]
    crate::util::output_file_mode();

    match cli.command {
        Command::Convert(c) => convert::convert_main(&c, &config, cancel_signal),
        Command::Apply(c) => apply::apply_main(&c, &config, cancel_signal),
        Command::Info(c) => info::info_main(&c, &config, cancel_signal),
        Command::Config(c) => config::config_main(&c, cli.config.as_deref(), &config),
        Command::Completion(c) => completion::completion_main(&c),
    }
}
