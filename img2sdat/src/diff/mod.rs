// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Computing and ordering the block operations that turn a source image into
//! a target image.

use std::fmt;

use crate::format::rangeset::BlockRangeSet;

pub mod plan;
pub mod schedule;

/// Source blocks of a move that are read back from a stash slot instead of
/// the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StashRef {
    pub slot: u32,
    pub blocks: BlockRangeSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Write zeros.
    Zero,
    /// Write literal data taken from the target image.
    New,
    /// Discard blocks that the target doesn't care about.
    Erase,
    /// Copy blocks that already exist in the source. The i-th lowest source
    /// block is written to the i-th lowest target block.
    Move {
        source: BlockRangeSet,
        stashed: Vec<StashRef>,
    },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::New => "new",
            Self::Erase => "erase",
            Self::Move { .. } => "move",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub target: BlockRangeSet,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind.name(), self.target)?;

        if let OperationKind::Move { source, stashed } = &self.kind {
            write!(f, " <- {source:?}")?;
            for stash in stashed {
                write!(f, " [slot {}: {:?}]", stash.slot, stash.blocks)?;
            }
        }

        Ok(())
    }
}

impl Operation {
    pub fn new(kind: OperationKind, target: impl Into<BlockRangeSet>) -> Self {
        Self {
            kind,
            target: target.into(),
        }
    }

    pub fn new_move(target: impl Into<BlockRangeSet>, source: impl Into<BlockRangeSet>) -> Self {
        Self::new(
            OperationKind::Move {
                source: source.into(),
                stashed: vec![],
            },
            target,
        )
    }

    /// Device blocks that this operation reads.
    pub fn source(&self) -> Option<&BlockRangeSet> {
        match &self.kind {
            OperationKind::Move { source, .. } => Some(source),
            _ => None,
        }
    }
}
