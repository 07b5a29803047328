// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::{cli::status, config::Config};

pub const DEFAULT_PATH: &str = "img2sdat.toml";

fn init_subcommand(cli: &InitCli, global_path: Option<&Path>) -> Result<()> {
    let path = cli
        .output
        .as_deref()
        .or(global_path)
        .unwrap_or(Path::new(DEFAULT_PATH));

    if path.exists() && !cli.force {
        bail!("Config file already exists: {path:?}");
    }

    let data = Config::default()
        .to_commented_toml()
        .context("Failed to serialize default config")?;

    fs::write(path, data).with_context(|| format!("Failed to write config: {path:?}"))?;

    status!("Wrote default config: {path:?}");

    Ok(())
}

fn show_subcommand(config: &Config) -> Result<()> {
    let data = config.to_toml().context("Failed to serialize config")?;
    print!("{data}");

    Ok(())
}

pub fn config_main(cli: &ConfigCli, global_path: Option<&Path>, config: &Config) -> Result<()> {
    match &cli.command {
        ConfigCommand::Init(c) => init_subcommand(c, global_path),
        ConfigCommand::Show => show_subcommand(config),
    }
}

/// Write a config file with the default settings.
#[derive(Debug, Parser)]
pub struct InitCli {
    /// Path to output config file.
    ///
    /// Defaults to the path given by --config or img2sdat.toml.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: Option<PathBuf>,

    /// Overwrite an existing file.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Init(InitCli),
    /// Print the effective configuration.
    Show,
}

/// Create or inspect the configuration file.
#[derive(Debug, Parser)]
pub struct ConfigCli {
    #[command(subcommand)]
    pub command: ConfigCommand,
}
