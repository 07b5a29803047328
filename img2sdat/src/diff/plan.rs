// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashMap, sync::atomic::AtomicBool};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    diff::{Operation, OperationKind},
    format::{
        rangeset::{BlockRange, BlockRangeSet},
        transfer::Sha1Hash,
    },
    image::{self, BlockImage},
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Source block size {source_size} does not match target block size {target_size}")]
    BlockSizeMismatch { source_size: u32, target_size: u32 },
    #[error("Failed to read image")]
    Image(#[from] image::Error),
    #[error("Planning was interrupted")]
    Interrupted,
}

type Result<T> = std::result::Result<T, Error>;

/// Content index of the non-zero blocks in the source image.
struct SourceIndex {
    by_hash: HashMap<Sha1Hash, Vec<u64>>,
    by_block: HashMap<u64, Sha1Hash>,
}

impl SourceIndex {
    fn build(source: &dyn BlockImage, cancel_signal: &AtomicBool) -> Result<Self> {
        let blocks = source.care_map().subtract(source.zero_blocks());
        let mut by_hash = HashMap::<_, Vec<_>>::new();
        let mut by_block = HashMap::new();
        let mut buf = vec![0u8; source.block_size() as usize];

        for block in blocks.blocks() {
            stream::check_cancel(cancel_signal).map_err(|_| Error::Interrupted)?;

            source.read_block(block, &mut buf)?;
            let hash = image::sha1(&buf);

            by_hash.entry(hash).or_default().push(block);
            by_block.insert(block, hash);
        }

        Ok(Self { by_hash, by_block })
    }

    /// Find a source block with the given content, preferring `preferred` so
    /// that consecutive moves stay contiguous.
    fn find(&self, hash: &Sha1Hash, preferred: Option<u64>) -> Option<u64> {
        let candidates = self.by_hash.get(hash)?;

        preferred
            .filter(|p| self.by_block.get(p) == Some(hash))
            .or_else(|| candidates.first().copied())
    }
}

/// Append a single-block move, extending the previous move when both its
/// target and source runs continue.
fn push_move(moves: &mut Vec<(BlockRange, BlockRange)>, target: u64, source: u64) {
    if let Some((t, s)) = moves.last_mut()
        && t.end == target
        && s.end == source
    {
        t.end += 1;
        s.end += 1;
        return;
    }

    moves.push((
        BlockRange::new(target, target + 1),
        BlockRange::new(source, source + 1),
    ));
}

/// Compute the operations that turn `source` into `target`, in ascending order
/// of the lowest target block. Blocks that `target` doesn't care about are
/// left alone unless `source` had content there, in which case they are
/// erased.
pub fn plan(
    target: &dyn BlockImage,
    source: &dyn BlockImage,
    cancel_signal: &AtomicBool,
) -> Result<Vec<Operation>> {
    if target.block_size() != source.block_size() {
        return Err(Error::BlockSizeMismatch {
            source_size: source.block_size(),
            target_size: target.block_size(),
        });
    }

    let care_map = target.care_map();
    let zero_set = target.zero_blocks().subtract(source.zero_blocks());
    let data_blocks = care_map.subtract(target.zero_blocks());
    let erase_set = source.care_map().subtract(care_map);

    let mut new_set = BlockRangeSet::new();
    let mut moves: Vec<(BlockRange, BlockRange)> = vec![];

    if source.care_map().is_empty() {
        new_set = data_blocks;
    } else {
        let index = SourceIndex::build(source, cancel_signal)?;
        let mut buf = vec![0u8; target.block_size() as usize];

        for block in data_blocks.blocks() {
            stream::check_cancel(cancel_signal).map_err(|_| Error::Interrupted)?;

            target.read_block(block, &mut buf)?;
            let hash = image::sha1(&buf);

            if index.by_block.get(&block) == Some(&hash) {
                trace!("Block {block} is unchanged");
                continue;
            }

            let preferred = moves
                .last()
                .filter(|(t, _)| t.end == block)
                .map(|(_, s)| s.end);

            match index.find(&hash, preferred) {
                Some(src) => push_move(&mut moves, block, src),
                None => new_set.insert(block..block + 1),
            }
        }
    }

    let mut ops = Vec::with_capacity(
        zero_set.num_ranges() + new_set.num_ranges() + erase_set.num_ranges() + moves.len(),
    );

    for (kind, set) in [
        (OperationKind::Zero, &zero_set),
        (OperationKind::New, &new_set),
        (OperationKind::Erase, &erase_set),
    ] {
        ops.extend(set.iter().map(|r| Operation::new(kind.clone(), *r)));
    }

    ops.extend(moves.into_iter().map(|(t, s)| Operation::new_move(t, s)));
    ops.sort_by_key(|op| op.target.min_block());

    debug!(
        "Planned {} operations: {} new, {} zero, {} moved, {} erased blocks",
        ops.len(),
        new_set.total_blocks(),
        zero_set.total_blocks(),
        ops.iter()
            .filter_map(Operation::source)
            .map(BlockRangeSet::total_blocks)
            .sum::<u64>(),
        erase_set.total_blocks(),
    );

    Ok(ops)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::{
        format::sparse::CrcMode,
        image::{EmptyImage, SparseImage},
        stream::MutexFile,
    };

    use super::*;

    type MemImage = SparseImage<MutexFile<Cursor<Vec<u8>>>>;

    fn raw(blocks: &[&[u8; 8]]) -> MemImage {
        let data = blocks.iter().flat_map(|b| b.iter().copied()).collect();

        SparseImage::open(
            MutexFile::new(Cursor::new(data)),
            8,
            CrcMode::Ignore,
            &AtomicBool::new(false),
        )
        .unwrap()
    }

    fn summary(ops: &[Operation]) -> Vec<String> {
        ops.iter().map(|op| format!("{op:?}")).collect()
    }

    const Z: &[u8; 8] = &[0; 8];
    const A: &[u8; 8] = b"aaaabbbb";
    const B: &[u8; 8] = b"bbbbcccc";
    const C: &[u8; 8] = b"ccccdddd";
    const D: &[u8; 8] = b"ddddeeee";

    #[test]
    fn full_image() {
        let target = raw(&[A, Z, B, C, Z, b"ffffffff"]);
        let ops = plan(&target, &EmptyImage::new(8), &AtomicBool::new(false)).unwrap();

        assert_eq!(
            summary(&ops),
            vec!["new {0..1}", "zero {1..2}", "new {2..4}", "zero {4..5}", "new {5..6}"],
        );
    }

    #[test]
    fn empty_target() {
        let target = raw(&[]);
        let ops = plan(&target, &EmptyImage::new(8), &AtomicBool::new(false)).unwrap();

        assert!(ops.is_empty());
    }

    #[test]
    fn incremental_moves() {
        let source = raw(&[A, B, C, Z, D]);
        let target = raw(&[B, A, C, D]);
        let ops = plan(&target, &source, &AtomicBool::new(false)).unwrap();

        assert_eq!(
            summary(&ops),
            vec![
                "move {0..1} <- {1..2}",
                "move {1..2} <- {0..1}",
                "move {3..4} <- {4..5}",
                "erase {4..5}",
            ],
        );
    }

    #[test]
    fn contiguous_moves_merge() {
        let source = raw(&[A, B, C, Z]);
        let target = raw(&[D, A, B, C]);
        let ops = plan(&target, &source, &AtomicBool::new(false)).unwrap();

        assert_eq!(summary(&ops), vec!["new {0..1}", "move {1..4} <- {0..3}"]);
    }

    #[test]
    fn zero_blocks_already_zero() {
        let source = raw(&[Z, A]);
        let target = raw(&[Z, Z]);
        let ops = plan(&target, &source, &AtomicBool::new(false)).unwrap();

        assert_eq!(summary(&ops), vec!["zero {1..2}"]);
    }

    #[test]
    fn block_size_mismatch() {
        let target = raw(&[A]);

        assert_matches!(
            plan(&target, &EmptyImage::new(4096), &AtomicBool::new(false)),
            Err(Error::BlockSizeMismatch {
                source_size: 4096,
                target_size: 8,
            })
        );
    }

    #[test]
    fn cancelled() {
        let source = raw(&[A]);
        let target = raw(&[B]);

        assert_matches!(
            plan(&target, &source, &AtomicBool::new(true)),
            Err(Error::Interrupted)
        );
    }
}
