// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Block transfer list text format, as consumed by block-based OTA updaters.
//!
//! The file starts with a small header:
//!
//! ```text
//! <version>
//! <total blocks written>
//! <max simultaneous stash entries>   (version >= 2)
//! <max stashed blocks>               (version >= 2)
//! ```
//!
//! followed by one command per line. Block ranges are written in the
//! `count,start,end,...` form of [`BlockRangeSet`].

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
};

use thiserror::Error;

use crate::format::rangeset::{self, BlockRangeSet};

pub const MIN_VERSION: u32 = 1;
pub const MAX_VERSION: u32 = 4;

/// SHA-1 digest of block data.
pub type Sha1Hash = [u8; 20];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported transfer list version: {0}")]
    UnsupportedVersion(u32),
    #[error("Line {line}: Missing header field: {field}")]
    MissingHeader { line: usize, field: &'static str },
    #[error("Line {line}: Invalid integer: {value:?}")]
    InvalidInteger { line: usize, value: String },
    #[error("Line {line}: Invalid block ranges: {value:?}")]
    InvalidRanges {
        line: usize,
        value: String,
        #[source]
        source: rangeset::Error,
    },
    #[error("Line {line}: Unknown command: {name:?}")]
    UnknownCommand { line: usize, name: String },
    #[error("Line {line}: Unsupported command: {name}")]
    UnsupportedCommand { line: usize, name: String },
    #[error("Line {line}: Missing argument: {arg}")]
    MissingArgument { line: usize, arg: &'static str },
    #[error("Line {line}: Unexpected trailing argument: {value:?}")]
    TrailingArgument { line: usize, value: String },
    #[error("Line {line}: Invalid stash ID: {value:?}")]
    InvalidStashId { line: usize, value: String },
    #[error("Line {line}: Move source covers {actual} blocks, but declares {expected}")]
    SourceCountMismatch {
        line: usize,
        expected: u64,
        actual: u64,
    },
    #[error("Line {line}: Move source has {source_blocks} blocks, but target has {target_blocks}")]
    MoveSizeMismatch {
        line: usize,
        source_blocks: u64,
        target_blocks: u64,
    },
    #[error("Command #{index}: {name} is not representable in version {version}")]
    NotInVersion {
        index: usize,
        name: &'static str,
        version: u32,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Identifier of a stash entry. Version 2 uses slot numbers. Versions 3 and 4
/// use the SHA-1 digest of the stashed data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StashId {
    Slot(u32),
    Hash(Sha1Hash),
}

impl fmt::Debug for StashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for StashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slot(slot) => write!(f, "{slot}"),
            Self::Hash(hash) => f.write_str(&hex::encode(hash)),
        }
    }
}

/// A piece of a move's source buffer that comes from a stash entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StashedSource {
    pub id: StashId,
    /// Positions within the source buffer that the stashed blocks fill.
    pub buffer: BlockRangeSet,
}

/// Where a move's source buffer comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveSource {
    /// Size of the source buffer in blocks.
    pub num_blocks: u64,
    /// Blocks read from the device. [`None`] when everything is stashed.
    pub ranges: Option<BlockRangeSet>,
    /// Positions within the source buffer for [`Self::ranges`]. Only present
    /// when device blocks are combined with stashed blocks.
    pub buffer_map: Option<BlockRangeSet>,
    pub stashes: Vec<StashedSource>,
}

impl MoveSource {
    /// A source buffer made entirely of device blocks.
    pub fn direct(ranges: BlockRangeSet) -> Self {
        Self {
            num_blocks: ranges.total_blocks(),
            ranges: Some(ranges),
            buffer_map: None,
            stashes: vec![],
        }
    }

    fn covered_blocks(&self) -> u64 {
        let direct = match (&self.buffer_map, &self.ranges) {
            (Some(m), _) | (None, Some(m)) => m.total_blocks(),
            (None, None) => 0,
        };

        self.stashes
            .iter()
            .fold(direct, |n, s| n.saturating_add(s.buffer.total_blocks()))
    }
}

impl fmt::Display for MoveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.num_blocks)?;

        match &self.ranges {
            Some(r) => write!(f, " {r}")?,
            None => f.write_str(" -")?,
        }

        if let Some(m) = &self.buffer_map {
            write!(f, " {m}")?;
        }

        for stash in &self.stashes {
            write!(f, " {}:{}", stash.id, stash.buffer)?;
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Discard blocks.
    Erase(BlockRangeSet),
    /// Write the next blocks from the new data blob.
    New(BlockRangeSet),
    /// Write zeros.
    Zero(BlockRangeSet),
    /// Save device blocks into a stash entry.
    Stash { id: StashId, ranges: BlockRangeSet },
    /// Release a stash entry.
    Free { id: StashId },
    /// Assemble a source buffer and write it to the target blocks.
    Move {
        /// SHA-1 of the target data (version 3 and newer).
        hash: Option<Sha1Hash>,
        target: BlockRangeSet,
        source: MoveSource,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Erase(_) => "erase",
            Self::New(_) => "new",
            Self::Zero(_) => "zero",
            Self::Stash { .. } => "stash",
            Self::Free { .. } => "free",
            Self::Move { .. } => "move",
        }
    }

    /// Blocks modified on the device by this command.
    pub fn target(&self) -> Option<&BlockRangeSet> {
        match self {
            Self::Erase(r) | Self::New(r) | Self::Zero(r) => Some(r),
            Self::Move { target, .. } => Some(target),
            Self::Stash { .. } | Self::Free { .. } => None,
        }
    }

    fn supported_in(&self, version: u32) -> bool {
        let id_ok = |id: &StashId| match id {
            StashId::Slot(_) => version == 2,
            StashId::Hash(_) => version >= 3,
        };

        match self {
            Self::Erase(_) | Self::New(_) | Self::Zero(_) => true,
            Self::Stash { id, .. } | Self::Free { id } => id_ok(id),
            Self::Move { hash, source, .. } => {
                if version == 1 {
                    hash.is_none() && source.ranges.is_some() && source.stashes.is_empty()
                } else {
                    hash.is_some() == (version >= 3) && source.stashes.iter().all(|s| id_ok(&s.id))
                }
            }
        }
    }

    fn write(&self, f: &mut impl fmt::Write, version: u32) -> fmt::Result {
        write!(f, "{}", self.name())?;

        match self {
            Self::Erase(r) | Self::New(r) | Self::Zero(r) => write!(f, " {r}"),
            Self::Stash { id, ranges } => write!(f, " {id} {ranges}"),
            Self::Free { id } => write!(f, " {id}"),
            Self::Move {
                hash,
                target,
                source,
            } => {
                if version == 1 {
                    if let Some(ranges) = &source.ranges {
                        write!(f, " {ranges}")?;
                    }
                    return write!(f, " {target}");
                }

                if let Some(hash) = hash {
                    write!(f, " {}", hex::encode(hash))?;
                }

                write!(f, " {target} {source}")
            }
        }
    }
}

/// Peak stash usage when replaying `commands`, as the number of live entries
/// and the number of live blocks. Stashing an ID that is already live only
/// adds a reference.
pub fn stash_usage(commands: &[Command]) -> (u64, u64) {
    let mut live = HashMap::<StashId, (u64, u64)>::new();
    let mut blocks = 0u64;
    let mut max_entries = 0u64;
    let mut max_blocks = 0u64;

    for command in commands {
        match command {
            Command::Stash { id, ranges } => {
                let entry = live.entry(*id).or_insert((0, ranges.total_blocks()));
                if entry.0 == 0 {
                    blocks += entry.1;
                }
                entry.0 += 1;
            }
            Command::Free { id } => {
                if let Some(entry) = live.get_mut(id) {
                    entry.0 -= 1;
                    if entry.0 == 0 {
                        blocks -= entry.1;
                        live.remove(id);
                    }
                }
            }
            _ => continue,
        }

        max_entries = max_entries.max(live.len() as u64);
        max_blocks = max_blocks.max(blocks);
    }

    (max_entries, max_blocks)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    /// Number of blocks touched by erase, new, zero, and move commands.
    pub total_blocks: u64,
    pub stash_slots: u64,
    pub max_stashed_blocks: u64,
    pub commands: Vec<Command>,
}

impl TransferList {
    /// Build a transfer list, computing the header fields from the commands.
    /// Fails if a command can't be expressed in `version`.
    pub fn new(version: u32, commands: Vec<Command>) -> Result<Self> {
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }

        for (index, command) in commands.iter().enumerate() {
            if !command.supported_in(version) {
                return Err(Error::NotInVersion {
                    index,
                    name: command.name(),
                    version,
                });
            }
        }

        let total_blocks = commands
            .iter()
            .filter_map(Command::target)
            .map(BlockRangeSet::total_blocks)
            .sum();
        let (stash_slots, max_stashed_blocks) = stash_usage(&commands);

        Ok(Self {
            version,
            total_blocks,
            stash_slots,
            max_stashed_blocks,
            commands,
        })
    }

    /// Iterate through the target ranges of `new` commands. This is the order
    /// in which the new data blob is consumed.
    pub fn new_ranges(&self) -> impl Iterator<Item = &BlockRangeSet> {
        self.commands.iter().filter_map(|c| match c {
            Command::New(r) => Some(r),
            _ => None,
        })
    }
}

impl fmt::Display for TransferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.version)?;
        writeln!(f, "{}", self.total_blocks)?;

        if self.version >= 2 {
            writeln!(f, "{}", self.stash_slots)?;
            writeln!(f, "{}", self.max_stashed_blocks)?;
        }

        let mut line = String::new();

        for command in &self.commands {
            line.clear();
            command.write(&mut line, self.version)?;
            line.push('\n');
            f.write_str(&line)?;
        }

        Ok(())
    }
}

/// Tokenizer for a single command line that tracks the line number for error
/// reporting.
struct Args<'a> {
    line: usize,
    iter: std::str::SplitAsciiWhitespace<'a>,
}

impl<'a> Args<'a> {
    fn next(&mut self, arg: &'static str) -> Result<&'a str> {
        self.iter.next().ok_or(Error::MissingArgument {
            line: self.line,
            arg,
        })
    }

    fn int(&mut self, arg: &'static str) -> Result<u64> {
        let value = self.next(arg)?;
        parse_int(self.line, value)
    }

    fn ranges(&mut self, arg: &'static str) -> Result<BlockRangeSet> {
        let value = self.next(arg)?;
        parse_ranges(self.line, value)
    }

    fn stash_id(&mut self, version: u32) -> Result<StashId> {
        let value = self.next("stash_id")?;
        parse_stash_id(self.line, value, version)
    }

    fn finish(mut self) -> Result<()> {
        match self.iter.next() {
            Some(value) => Err(Error::TrailingArgument {
                line: self.line,
                value: value.to_owned(),
            }),
            None => Ok(()),
        }
    }
}

fn parse_int(line: usize, value: &str) -> Result<u64> {
    // Bare integers only.
    if value.starts_with('+') {
        return Err(Error::InvalidInteger {
            line,
            value: value.to_owned(),
        });
    }

    value.parse().map_err(|_| Error::InvalidInteger {
        line,
        value: value.to_owned(),
    })
}

fn parse_ranges(line: usize, value: &str) -> Result<BlockRangeSet> {
    value.parse().map_err(|e| Error::InvalidRanges {
        line,
        value: value.to_owned(),
        source: e,
    })
}

fn parse_hash(line: usize, value: &str) -> Result<Sha1Hash> {
    let mut hash = Sha1Hash::default();

    hex::decode_to_slice(value, &mut hash).map_err(|_| Error::InvalidStashId {
        line,
        value: value.to_owned(),
    })?;

    Ok(hash)
}

fn parse_stash_id(line: usize, value: &str, version: u32) -> Result<StashId> {
    if version >= 3 {
        parse_hash(line, value).map(StashId::Hash)
    } else {
        value
            .parse()
            .map(StashId::Slot)
            .map_err(|_| Error::InvalidStashId {
                line,
                value: value.to_owned(),
            })
    }
}

fn parse_move_source(args: &mut Args<'_>, version: u32) -> Result<MoveSource> {
    let num_blocks = args.int("src_blocks")?;
    let ranges = match args.next("src_ranges")? {
        "-" => None,
        value => Some(parse_ranges(args.line, value)?),
    };

    let mut buffer_map = None;
    let mut stashes = vec![];

    for value in args.iter.by_ref() {
        match value.split_once(':') {
            Some((id, buffer)) => stashes.push(StashedSource {
                id: parse_stash_id(args.line, id, version)?,
                buffer: parse_ranges(args.line, buffer)?,
            }),
            None if ranges.is_some() && buffer_map.is_none() && stashes.is_empty() => {
                buffer_map = Some(parse_ranges(args.line, value)?);
            }
            None => {
                return Err(Error::TrailingArgument {
                    line: args.line,
                    value: value.to_owned(),
                });
            }
        }
    }

    let source = MoveSource {
        num_blocks,
        ranges,
        buffer_map,
        stashes,
    };

    let actual = source.covered_blocks();
    if actual != num_blocks {
        return Err(Error::SourceCountMismatch {
            line: args.line,
            expected: num_blocks,
            actual,
        });
    }

    Ok(source)
}

fn parse_command(line: usize, text: &str, version: u32) -> Result<Command> {
    let mut args = Args {
        line,
        iter: text.split_ascii_whitespace(),
    };

    let name = args.next("command")?;
    let command = match name {
        "erase" => Command::Erase(args.ranges("ranges")?),
        "new" => Command::New(args.ranges("ranges")?),
        "zero" => Command::Zero(args.ranges("ranges")?),
        "stash" if version >= 2 => {
            let id = args.stash_id(version)?;
            let ranges = args.ranges("ranges")?;
            Command::Stash { id, ranges }
        }
        "free" if version >= 2 => Command::Free {
            id: args.stash_id(version)?,
        },
        "move" if version == 1 => {
            let source = args.ranges("src_ranges")?;
            let target = args.ranges("tgt_ranges")?;
            Command::Move {
                hash: None,
                target,
                source: MoveSource::direct(source),
            }
        }
        "move" => {
            let hash = if version >= 3 {
                Some(parse_hash(line, args.next("tgt_hash")?)?)
            } else {
                None
            };
            let target = args.ranges("tgt_ranges")?;
            let source = parse_move_source(&mut args, version)?;
            Command::Move {
                hash,
                target,
                source,
            }
        }
        "bsdiff" | "imgdiff" => {
            return Err(Error::UnsupportedCommand {
                line,
                name: name.to_owned(),
            });
        }
        _ => {
            return Err(Error::UnknownCommand {
                line,
                name: name.to_owned(),
            });
        }
    };

    args.finish()?;

    if let Command::Move { target, source, .. } = &command
        && target.total_blocks() != source.num_blocks
    {
        return Err(Error::MoveSizeMismatch {
            line,
            source_blocks: source.num_blocks,
            target_blocks: target.total_blocks(),
        });
    }

    Ok(command)
}

impl FromStr for TransferList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut lines = s.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));

        let mut header = |field| {
            let (line, value) = lines.next().ok_or(Error::MissingHeader {
                line: 0,
                field,
            })?;
            if value.is_empty() {
                return Err(Error::MissingHeader { line, field });
            }
            parse_int(line, value)
        };

        let version = header("version")?;
        let version = u32::try_from(version)
            .ok()
            .filter(|v| (MIN_VERSION..=MAX_VERSION).contains(v))
            .ok_or(Error::UnsupportedVersion(version.min(u64::from(u32::MAX)) as u32))?;
        let total_blocks = header("total_blocks")?;
        let (stash_slots, max_stashed_blocks) = if version >= 2 {
            (header("stash_slots")?, header("max_stashed_blocks")?)
        } else {
            (0, 0)
        };

        let mut commands = vec![];

        for (line, text) in lines {
            if text.is_empty() {
                continue;
            }

            commands.push(parse_command(line, text, version)?);
        }

        Ok(Self {
            version,
            total_blocks,
            stash_slots,
            max_stashed_blocks,
            commands,
        })
    }
}

/// Render a single command the way it appears in a list of `version`.
pub fn format_command(command: &Command, version: u32) -> String {
    let mut result = String::new();
    // Writing to a String can't fail.
    let _ = command.write(&mut result, version);
    result
}
