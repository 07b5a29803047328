// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Ordering operations so that they can be replayed in place.
//!
//! A move reads blocks from the device, so it has to run before any operation
//! that overwrites those blocks. When the dependencies form a cycle, one
//! operation is run early and the blocks it would clobber are copied into a
//! stash slot first. The updater only has a bounded amount of stash space, so
//! moves that would not fit are turned into new operations instead.

use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
};

use thiserror::Error;
use topological_sort::TopologicalSort;
use tracing::{debug, warn};

use crate::{
    diff::{Operation, OperationKind, StashRef},
    format::rangeset::{BlockRange, BlockRangeSet},
};

/// Default upper bound for the size of a single new or zero operation.
pub const DEFAULT_MAX_OP_BLOCKS: u64 = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Operations #{first} and #{second} write the same blocks")]
    OverlappingTargets { first: usize, second: usize },
    #[error("Operation #{index}: Move source has {source_blocks} blocks, but target has {target_blocks}")]
    MoveSizeMismatch {
        index: usize,
        source_blocks: u64,
        target_blocks: u64,
    },
    #[error(
        "Operation #{index}: Needs {needed} stash blocks, but only {available} of {capacity} are free"
    )]
    StashBudgetExceeded {
        index: usize,
        needed: u64,
        available: u64,
        capacity: u64,
    },
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulePolicy {
    /// Stash capacity in blocks. Moves are split so that no piece is larger
    /// than this.
    pub stash_blocks: u64,
    /// Maximum size of new and zero operations. [`None`] or `0` means
    /// unlimited.
    pub max_op_blocks: Option<u64>,
    /// Whether moves that don't fit in the stash are turned into new
    /// operations. If not, scheduling fails instead.
    pub new_fallback: bool,
}

impl SchedulePolicy {
    pub fn new(cache_size: u64, block_size: u32) -> Self {
        Self {
            stash_blocks: cache_size / u64::from(block_size.max(1)),
            max_op_blocks: Some(DEFAULT_MAX_OP_BLOCKS),
            new_fallback: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Copy device blocks into a stash slot.
    Stash { slot: u32, blocks: BlockRangeSet },
    Op(Operation),
    /// Release a stash slot.
    Free { slot: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schedule {
    pub steps: Vec<Step>,
    /// Peak number of simultaneously used stash slots.
    pub stash_slots: u32,
    /// Peak number of simultaneously stashed blocks.
    pub max_stashed_blocks: u64,
}

impl Schedule {
    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.steps.iter().filter_map(|s| match s {
            Step::Op(op) => Some(op),
            _ => None,
        })
    }
}

fn validate(ops: &[Operation]) -> Result<()> {
    let mut targets = vec![];

    for (index, op) in ops.iter().enumerate() {
        if let Some(source) = op.source()
            && source.total_blocks() != op.target.total_blocks()
        {
            return Err(Error::MoveSizeMismatch {
                index,
                source_blocks: source.total_blocks(),
                target_blocks: op.target.total_blocks(),
            });
        }

        targets.extend(op.target.iter().map(|r| (*r, index)));
    }

    targets.sort_by_key(|(r, _)| r.start);

    for pair in targets.windows(2) {
        let ((prev, first), (cur, second)) = (pair[0], pair[1]);
        if prev.end > cur.start {
            return Err(Error::OverlappingTargets { first, second });
        }
    }

    Ok(())
}

/// Split oversized operations. Moves are limited by the stash size and new or
/// zero operations by the configured maximum operation size.
fn split(ops: Vec<Operation>, policy: &SchedulePolicy) -> Vec<Operation> {
    let mut result = Vec::with_capacity(ops.len());

    for op in ops {
        let limit = match op.kind {
            OperationKind::Move { .. } => Some(policy.stash_blocks),
            OperationKind::New | OperationKind::Zero => policy.max_op_blocks,
            OperationKind::Erase => None,
        };

        let Some(limit) = limit.filter(|&l| l > 0 && op.target.total_blocks() > l) else {
            result.push(op);
            continue;
        };

        let Operation {
            kind,
            mut target,
            ..
        } = op;
        let mut source = match &kind {
            OperationKind::Move { source, .. } => Some(source.clone()),
            _ => None,
        };

        while !target.is_empty() {
            let piece = target.first(limit);
            target = target.subtract(&piece);

            let piece_kind = match &mut source {
                Some(s) => {
                    let source_piece = s.first(limit);
                    *s = s.subtract(&source_piece);

                    OperationKind::Move {
                        source: source_piece,
                        stashed: vec![],
                    }
                }
                None => kind.clone(),
            };

            result.push(Operation::new(piece_kind, piece));
        }
    }

    result
}

struct Scheduler {
    policy: SchedulePolicy,
    ops: Vec<Operation>,
    /// For each operation, the moves that read blocks it writes.
    readers: Vec<BTreeSet<usize>>,
    pending: BTreeSet<usize>,
    steps: Vec<Step>,
    /// Live slots and their sizes in blocks.
    slots: BTreeMap<u32, u64>,
    stashed_blocks: u64,
    stash_slots: u32,
    max_stashed_blocks: u64,
}

impl Scheduler {
    fn new(ops: Vec<Operation>, policy: SchedulePolicy) -> Self {
        let mut targets = ops
            .iter()
            .enumerate()
            .flat_map(|(i, op)| op.target.iter().map(move |r| (*r, i)))
            .collect::<Vec<(BlockRange, usize)>>();
        targets.sort_by_key(|(r, _)| r.start);

        let mut readers = vec![BTreeSet::new(); ops.len()];

        for (reader, op) in ops.iter().enumerate() {
            let Some(source) = op.source() else {
                continue;
            };

            for range in source {
                let first = targets.partition_point(|(t, _)| t.end <= range.start);

                for &(t, writer) in &targets[first..] {
                    if t.start >= range.end {
                        break;
                    } else if writer != reader {
                        readers[writer].insert(reader);
                    }
                }
            }
        }

        Self {
            policy,
            pending: (0..ops.len()).collect(),
            ops,
            readers,
            steps: vec![],
            slots: BTreeMap::new(),
            stashed_blocks: 0,
            stash_slots: 0,
            max_stashed_blocks: 0,
        }
    }

    fn alloc_slot(&mut self, blocks: BlockRangeSet) -> u32 {
        // Reuse the lowest free slot.
        let slot = (0..)
            .find(|s| !self.slots.contains_key(s))
            .unwrap_or(u32::MAX);
        let size = blocks.total_blocks();

        self.slots.insert(slot, size);
        self.stashed_blocks += size;
        self.stash_slots = self.stash_slots.max(self.slots.len() as u32);
        self.max_stashed_blocks = self.max_stashed_blocks.max(self.stashed_blocks);
        self.steps.push(Step::Stash { slot, blocks });

        slot
    }

    fn free_slot(&mut self, slot: u32) {
        if let Some(size) = self.slots.remove(&slot) {
            self.stashed_blocks -= size;
            self.steps.push(Step::Free { slot });
        }
    }

    fn emit(&mut self, index: usize) {
        self.pending.remove(&index);

        let op = self.ops[index].clone();
        let slots = match &op.kind {
            OperationKind::Move { stashed, .. } => stashed.iter().map(|s| s.slot).collect(),
            _ => vec![],
        };

        self.steps.push(Step::Op(op));

        for slot in slots {
            self.free_slot(slot);
        }
    }

    /// Turn a move into a new operation. It then no longer depends on the
    /// contents of the device.
    fn convert_to_new(&mut self, index: usize) {
        let old = mem::replace(&mut self.ops[index].kind, OperationKind::New);

        if let OperationKind::Move { stashed, .. } = old {
            for stash in stashed {
                self.free_slot(stash.slot);
            }
        }

        for readers in &mut self.readers {
            readers.remove(&index);
        }
    }

    /// Pending moves that read blocks written by `index`.
    fn pending_readers(&self, index: usize) -> Vec<usize> {
        self.readers[index]
            .iter()
            .copied()
            .filter(|r| self.pending.contains(r))
            .collect()
    }

    /// Number of blocks that have to be stashed to run `index` early.
    fn stash_cost(&self, index: usize) -> u64 {
        self.pending_readers(index)
            .into_iter()
            .filter_map(|r| self.ops[r].source())
            .map(|s| s.intersect(&self.ops[index].target).total_blocks())
            .sum()
    }

    /// Pending operations that lie on a dependency cycle. Operations that are
    /// only blocked by a cycle are excluded. This is Tarjan's strongly
    /// connected components algorithm without recursion.
    fn cycle_members(&self) -> BTreeSet<usize> {
        let mut order = vec![usize::MAX; self.ops.len()];
        let mut low = vec![0; self.ops.len()];
        let mut on_stack = vec![false; self.ops.len()];
        let mut stack = vec![];
        let mut frames: Vec<(usize, Vec<usize>, usize)> = vec![];
        let mut members = BTreeSet::new();
        let mut counter = 0;

        for &root in &self.pending {
            if order[root] != usize::MAX {
                continue;
            }

            order[root] = counter;
            low[root] = counter;
            counter += 1;
            stack.push(root);
            on_stack[root] = true;
            frames.push((root, self.pending_readers(root), 0));

            while let Some(frame) = frames.last_mut() {
                let node = frame.0;

                if let Some(&child) = frame.1.get(frame.2) {
                    frame.2 += 1;

                    if order[child] == usize::MAX {
                        order[child] = counter;
                        low[child] = counter;
                        counter += 1;
                        stack.push(child);
                        on_stack[child] = true;
                        frames.push((child, self.pending_readers(child), 0));
                    } else if on_stack[child] {
                        low[node] = low[node].min(order[child]);
                    }

                    continue;
                }

                frames.pop();
                if let Some(parent) = frames.last() {
                    low[parent.0] = low[parent.0].min(low[node]);
                }

                if low[node] == order[node] {
                    let mut component = vec![];

                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);

                        if member == node {
                            break;
                        }
                    }

                    if component.len() > 1 {
                        members.extend(component);
                    }
                }
            }
        }

        members
    }

    /// Run an operation before all the moves that still need to read what it
    /// overwrites. Those blocks are stashed first.
    fn force(&mut self, index: usize) -> Result<()> {
        let readers = mem::take(&mut self.readers[index]);

        for reader in readers {
            if !self.pending.contains(&reader) {
                continue;
            }

            let Some(source) = self.ops[reader].source() else {
                continue;
            };
            let overlap = source.intersect(&self.ops[index].target);
            let needed = overlap.total_blocks();
            let available = self.policy.stash_blocks.saturating_sub(self.stashed_blocks);

            if needed > available {
                if !self.policy.new_fallback {
                    return Err(Error::StashBudgetExceeded {
                        index: reader,
                        needed,
                        available,
                        capacity: self.policy.stash_blocks,
                    });
                }

                warn!(
                    "Stash is full: Writing {:?} as new data",
                    self.ops[reader].target,
                );
                self.convert_to_new(reader);
                continue;
            }

            let slot = self.alloc_slot(overlap.clone());

            if let OperationKind::Move { stashed, .. } = &mut self.ops[reader].kind {
                stashed.push(StashRef {
                    slot,
                    blocks: overlap,
                });
            }
        }

        self.emit(index);

        Ok(())
    }

    fn run(mut self) -> Result<Schedule> {
        while !self.pending.is_empty() {
            let mut topo = TopologicalSort::<usize>::new();

            for &index in &self.pending {
                topo.insert(index);

                for &reader in &self.readers[index] {
                    if self.pending.contains(&reader) {
                        topo.add_dependency(reader, index);
                    }
                }
            }

            loop {
                let mut batch = topo.pop_all();
                if batch.is_empty() {
                    break;
                }

                batch.sort_unstable();

                for index in batch {
                    self.emit(index);
                }
            }

            // Everything left is part of or blocked by a cycle. Break it at
            // the member that needs the least stash space.
            let index = self
                .cycle_members()
                .into_iter()
                .min_by_key(|&i| (self.stash_cost(i), i))
                .or_else(|| self.pending.first().copied());

            if let Some(index) = index {
                debug!("Breaking dependency cycle at operation #{index}");
                self.force(index)?;
            }
        }

        Ok(Schedule {
            steps: self.steps,
            stash_slots: self.stash_slots,
            max_stashed_blocks: self.max_stashed_blocks,
        })
    }
}

/// Order `ops` for in-place replay under `policy`. The operations must write
/// disjoint blocks and are expected in their canonical order, which is kept
/// wherever dependencies allow.
pub fn schedule(ops: Vec<Operation>, policy: &SchedulePolicy) -> Result<Schedule> {
    validate(&ops)?;

    let ops = split(ops, policy);
    let schedule = Scheduler::new(ops, *policy).run()?;

    debug!(
        "Scheduled {} steps using {} stash slots and up to {} stashed blocks",
        schedule.steps.len(),
        schedule.stash_slots,
        schedule.max_stashed_blocks,
    );

    Ok(schedule)
}
