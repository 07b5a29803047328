// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion settings. These are loaded once, optionally from a TOML file,
//! and then passed by reference to every conversion.

use std::{
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    diff::schedule::SchedulePolicy,
    format::{sparse::CrcMode, transfer},
};

/// Default stash space. This matches the cache partition size that block
/// based updaters have traditionally been able to rely on.
pub const DEFAULT_CACHE_SIZE: u64 = 402_653_184;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_VERSION: u32 = 4;
pub const DEFAULT_PREFIX: &str = "system";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config")]
    Parse(#[from] toml_edit::de::Error),
    #[error("Failed to serialize config")]
    Serialize(#[from] toml_edit::ser::Error),
    #[error("Unsupported transfer list version: {0}")]
    InvalidVersion(u32),
    #[error("Block size must be a non-zero multiple of 4: {0}")]
    InvalidBlockSize(u32),
    #[error("Prefix must be a non-empty file name: {0:?}")]
    InvalidPrefix(String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Stash space available to the updater in bytes.
    pub cache_size: u64,
    /// Directory where the output files are written.
    pub output_dir: PathBuf,
    /// File name prefix of the output files.
    pub prefix: String,
    /// Transfer list version.
    pub version: u32,
    /// Block size used for raw (non-sparse) images.
    pub block_size: u32,
    /// Maximum number of blocks in a single new or zero command. 0 means
    /// unlimited.
    pub max_op_blocks: u64,
    /// Write moves that don't fit in the stash as new data instead of failing.
    pub new_fallback: bool,
    /// Verify CRC32 checksums in sparse images.
    pub validate_crc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            output_dir: PathBuf::from("."),
            prefix: DEFAULT_PREFIX.to_owned(),
            version: DEFAULT_VERSION,
            block_size: DEFAULT_BLOCK_SIZE,
            max_op_blocks: crate::diff::schedule::DEFAULT_MAX_OP_BLOCKS,
            new_fallback: true,
            validate_crc: true,
        }
    }
}

/// Comments emitted above each key by [`Config::to_commented_toml`].
const FIELD_DOCS: &[(&str, &str)] = &[
    ("cache_size", "Stash space available to the updater in bytes."),
    ("output_dir", "Directory where the output files are written."),
    (
        "prefix",
        "Output files are named <prefix>.new.dat, <prefix>.transfer.list and\n# <prefix>.patch.dat.",
    ),
    ("version", "Transfer list version (1-4)."),
    ("block_size", "Block size of raw (non-sparse) input images."),
    (
        "max_op_blocks",
        "Maximum number of blocks in a single new or zero command (0 = unlimited).",
    ),
    (
        "new_fallback",
        "Write moves that don't fit in the stash as new data instead of failing.",
    ),
    ("validate_crc", "Verify CRC32 checksums in sparse images."),
];

impl Config {
    /// Load the config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::Read {
                    path: path.to_owned(),
                    source: e,
                });
            }
        };

        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(data)?;
        config.validate()?;

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }

    /// Like [`Self::to_toml`], but with a comment describing each key.
    pub fn to_commented_toml(&self) -> Result<String> {
        let data = self.to_toml()?;
        let mut result = String::new();

        for line in data.lines() {
            if let Some((key, _)) = line.split_once(" = ")
                && let Some((_, doc)) = FIELD_DOCS.iter().find(|(k, _)| *k == key)
            {
                if !result.is_empty() {
                    result.push('\n');
                }
                let _ = writeln!(result, "# {doc}");
            }

            result.push_str(line);
            result.push('\n');
        }

        Ok(result)
    }

    pub fn validate(&self) -> Result<()> {
        if !(transfer::MIN_VERSION..=transfer::MAX_VERSION).contains(&self.version) {
            return Err(Error::InvalidVersion(self.version));
        }

        if self.block_size == 0 || self.block_size % 4 != 0 {
            return Err(Error::InvalidBlockSize(self.block_size));
        }

        if self.prefix.is_empty()
            || self.prefix == "."
            || self.prefix == ".."
            || self.prefix.contains(['/', '\\'])
        {
            return Err(Error::InvalidPrefix(self.prefix.clone()));
        }

        Ok(())
    }

    /// Scheduling policy for images with the given block size. Version 1
    /// lists have no stash commands.
    pub fn schedule_policy(&self, block_size: u32) -> SchedulePolicy {
        let mut policy = SchedulePolicy::new(self.cache_size, block_size);

        if self.version < 2 {
            policy.stash_blocks = 0;
        }
        policy.max_op_blocks = Some(self.max_op_blocks).filter(|n| *n > 0);
        policy.new_fallback = self.new_fallback;

        policy
    }

    pub fn crc_mode(&self) -> CrcMode {
        if self.validate_crc {
            CrcMode::Validate
        } else {
            CrcMode::Ignore
        }
    }
}
