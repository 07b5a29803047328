// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{cmp::Ordering, fmt, ops::Range, str::FromStr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Empty range string")]
    Empty,
    #[error("Invalid integer: {0:?}")]
    InvalidInteger(String),
    #[error("Expected {expected} values after the count, but have {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("Value count must be even: {0}")]
    OddCount(usize),
    #[error("Range is empty or reversed: {start}..{end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Range {start}..{end} overlaps or touches the previous range ending at {prev_end}")]
    Unsorted { prev_end: u64, start: u64, end: u64 },
}

/// Half-open range of block indices.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    /// Starting block (inclusive).
    pub start: u64,
    /// Ending block (exclusive).
    pub end: u64,
}

impl fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for BlockRange {
    type Item = u64;

    type IntoIter = Range<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl From<Range<u64>> for BlockRange {
    fn from(range: Range<u64>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length in blocks. Empty or reversed ranges have length 0.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

/// A normalized set of block indices. Ranges are kept sorted by their start
/// block and no two ranges overlap or touch.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BlockRangeSet {
    ranges: Vec<BlockRange>,
}

impl fmt::Debug for BlockRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(&self.ranges).finish()
    }
}

/// Raw transfer list form: `<value count>,<start>,<end>,...`.
impl fmt::Display for BlockRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ranges.len() * 2)?;

        for range in &self.ranges {
            write!(f, ",{},{}", range.start, range.end)?;
        }

        Ok(())
    }
}

impl FromStr for BlockRangeSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }

        let values = s
            .split(',')
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| Error::InvalidInteger(v.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (count, pairs) = values.split_first().ok_or(Error::Empty)?;
        let count = *count as usize;

        if count != pairs.len() {
            return Err(Error::CountMismatch {
                expected: count,
                actual: pairs.len(),
            });
        } else if count % 2 != 0 {
            return Err(Error::OddCount(count));
        }

        let mut ranges = Vec::<BlockRange>::with_capacity(count / 2);

        for pair in pairs.chunks_exact(2) {
            let range = BlockRange::new(pair[0], pair[1]);
            if !range.is_valid() {
                return Err(Error::InvalidRange {
                    start: range.start,
                    end: range.end,
                });
            }

            if let Some(prev) = ranges.last()
                && prev.end >= range.start
            {
                return Err(Error::Unsorted {
                    prev_end: prev.end,
                    start: range.start,
                    end: range.end,
                });
            }

            ranges.push(range);
        }

        Ok(Self { ranges })
    }
}

impl From<BlockRange> for BlockRangeSet {
    fn from(range: BlockRange) -> Self {
        let mut result = Self::new();
        result.insert(range);
        result
    }
}

impl From<Range<u64>> for BlockRangeSet {
    fn from(range: Range<u64>) -> Self {
        BlockRange::from(range).into()
    }
}

impl FromIterator<BlockRange> for BlockRangeSet {
    fn from_iter<I: IntoIterator<Item = BlockRange>>(iter: I) -> Self {
        let mut result = Self::new();
        for range in iter {
            result.insert(range);
        }
        result
    }
}

impl<'a> IntoIterator for &'a BlockRangeSet {
    type Item = &'a BlockRange;

    type IntoIter = std::slice::Iter<'a, BlockRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl BlockRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from ranges that are already sorted, disjoint, and
    /// non-adjacent. Callers that cannot guarantee this must use
    /// [`Self::insert`] instead.
    fn from_sorted(ranges: Vec<BlockRange>) -> Self {
        debug_assert!(ranges.iter().all(BlockRange::is_valid));
        debug_assert!(ranges.windows(2).all(|w| w[0].end < w[1].start));

        Self { ranges }
    }

    /// Add a range to the set, merging it with every range that it overlaps or
    /// touches. Empty ranges are ignored.
    pub fn insert(&mut self, range: impl Into<BlockRange>) {
        let range = range.into();
        if !range.is_valid() {
            return;
        }

        // First range that could merge: its end reaches the new start.
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // One past the last range that could merge: its start is within reach
        // of the new end.
        let last = first + self.ranges[first..].partition_point(|r| r.start <= range.end);

        let merged = if first == last {
            range
        } else {
            BlockRange::new(
                range.start.min(self.ranges[first].start),
                range.end.max(self.ranges[last - 1].end),
            )
        };

        self.ranges.drain(first..last);
        self.ranges.insert(first, merged);
    }

    /// Return a copy of this set with `range` added.
    pub fn with(&self, range: impl Into<BlockRange>) -> Self {
        let mut result = self.clone();
        result.insert(range);
        result
    }

    /// All blocks in either set.
    pub fn union(&self, other: &Self) -> Self {
        let mut ranges: Vec<BlockRange> =
            Vec::with_capacity(self.ranges.len() + other.ranges.len());
        let mut a = self.ranges.iter().peekable();
        let mut b = other.ranges.iter().peekable();

        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(x), Some(y)) => {
                    if x.start <= y.start {
                        a.next()
                    } else {
                        b.next()
                    }
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            let Some(&next) = next else {
                break;
            };

            match ranges.last_mut() {
                Some(last) if next.start <= last.end => last.end = last.end.max(next.end),
                _ => ranges.push(next),
            }
        }

        Self::from_sorted(ranges)
    }

    /// Blocks in both sets.
    pub fn intersect(&self, other: &Self) -> Self {
        let mut ranges = vec![];
        let (mut i, mut j) = (0, 0);

        while i < self.ranges.len() && j < other.ranges.len() {
            let x = self.ranges[i];
            let y = other.ranges[j];
            let start = x.start.max(y.start);
            let end = x.end.min(y.end);

            if start < end {
                ranges.push(BlockRange::new(start, end));
            }

            match x.end.cmp(&y.end) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }

        // Pieces of disjoint non-adjacent inputs can't touch each other.
        Self::from_sorted(ranges)
    }

    /// Blocks in this set, but not in `other`. A range may be split in two.
    pub fn subtract(&self, other: &Self) -> Self {
        let mut ranges = vec![];
        let mut j = 0;

        for &range in &self.ranges {
            let mut start = range.start;

            // Skip ranges of `other` that end before this range begins.
            while j < other.ranges.len() && other.ranges[j].end <= start {
                j += 1;
            }

            let mut k = j;
            while k < other.ranges.len() && other.ranges[k].start < range.end {
                let hole = other.ranges[k];
                if hole.start > start {
                    ranges.push(BlockRange::new(start, hole.start));
                }
                start = start.max(hole.end);
                k += 1;
            }

            if start < range.end {
                ranges.push(BlockRange::new(start, range.end));
            }
        }

        Self::from_sorted(ranges)
    }

    /// Whether any block is in both sets.
    pub fn overlaps(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);

        while i < self.ranges.len() && j < other.ranges.len() {
            let x = self.ranges[i];
            let y = other.ranges[j];

            if x.start.max(y.start) < x.end.min(y.end) {
                return true;
            } else if x.end <= y.end {
                i += 1;
            } else {
                j += 1;
            }
        }

        false
    }

    /// Whether `block` is in the set.
    pub fn contains(&self, block: u64) -> bool {
        let index = self.ranges.partition_point(|r| r.end <= block);
        self.ranges.get(index).is_some_and(|r| r.start <= block)
    }

    /// The subset made of the lowest `n` blocks.
    pub fn first(&self, mut n: u64) -> Self {
        let mut ranges = vec![];

        for range in &self.ranges {
            if n == 0 {
                break;
            }

            let len = range.len().min(n);
            ranges.push(BlockRange::new(range.start, range.start + len));
            n -= len;
        }

        Self::from_sorted(ranges)
    }

    /// For a `subset` of this set, compute where its blocks are positioned
    /// when this set's blocks are laid out back to back in ascending order.
    /// This is how a reader locates stashed blocks within the buffer holding
    /// all of an operation's source blocks.
    ///
    /// Returns [`None`] if `subset` is not contained in this set.
    pub fn map_within(&self, subset: &Self) -> Option<Self> {
        let mut result = Self::new();
        let mut offset = 0;
        let mut i = 0;

        for range in &subset.ranges {
            while i < self.ranges.len() && self.ranges[i].end <= range.start {
                offset += self.ranges[i].len();
                i += 1;
            }

            let outer = self.ranges.get(i)?;
            if outer.start > range.start || outer.end < range.end {
                return None;
            }

            let start = offset + (range.start - outer.start);
            result.insert(BlockRange::new(start, start + range.len()));
        }

        Some(result)
    }

    /// Total number of blocks.
    pub fn total_blocks(&self) -> u64 {
        self.ranges.iter().map(BlockRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockRange> {
        self.ranges.iter()
    }

    pub fn to_ranges(&self) -> Vec<BlockRange> {
        self.ranges.clone()
    }

    /// Iterate through every individual block in ascending order.
    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.start..r.end)
    }

    /// Lowest block in the set.
    pub fn min_block(&self) -> Option<u64> {
        self.ranges.first().map(|r| r.start)
    }
}
