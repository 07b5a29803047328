// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Replaying a transfer list onto a block device, the way an updater would.
//! This is used to verify conversions.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::{self, Read},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    format::{
        rangeset::BlockRangeSet,
        transfer::{Command, MoveSource, Sha1Hash, StashId, TransferList},
    },
    image,
    stream::{self, ReadWriteAt},
    util::{self, NumBytes},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Command #{index}: Stash {id} is not present")]
    MissingStash { index: usize, id: StashId },
    #[error("Command #{index}: Stashing {needed} bytes would exceed the {limit} byte limit")]
    StashOverflow { index: usize, needed: u64, limit: u64 },
    #[error("Command #{index}: Expected SHA-1 {expected}, but data has {actual}")]
    HashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("Command #{index}: {blocks} blocks do not fit in memory")]
    TooLarge { index: usize, blocks: u64 },
    #[error("Command #{index}: Offset of block {block} overflows")]
    OffsetOverflow { index: usize, block: u64 },
    #[error("Command #{index}: Reads up to block {end}, but the device has {device_blocks} blocks")]
    OutsideDevice {
        index: usize,
        end: u64,
        device_blocks: u64,
    },
    #[error("Command #{index}: Move buffer of {num_blocks} blocks is not fully covered")]
    IncompleteBuffer { index: usize, num_blocks: u64 },
    #[error("Header declares {expected} written blocks, but commands wrote {actual}")]
    TotalMismatch { expected: u64, actual: u64 },
    #[error("New data has {0:?} of unused trailing data")]
    TrailingNewData(NumBytes<u64>),
    #[error("Failed to read new data")]
    NewDataRead(#[source] io::Error),
    #[error("Command #{index}: Failed to read device blocks")]
    DeviceRead {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("Command #{index}: Failed to write device blocks")]
    DeviceWrite {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("Failed to flush device")]
    Flush(#[source] io::Error),
    #[error("Replay was interrupted")]
    Interrupted,
}

type Result<T> = std::result::Result<T, Error>;

/// Blocks of new data that are read and written at a time.
const NEW_DATA_CHUNK_BLOCKS: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    pub block_size: u32,
    /// Maximum number of bytes held in stash entries at any point.
    pub stash_limit: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub blocks_written: u64,
    pub new_blocks: u64,
    pub max_stash_bytes: u64,
}

struct StashEntry {
    refs: u32,
    data: Vec<u8>,
}

struct Replayer<'a> {
    device: &'a dyn ReadWriteAt,
    new_data: &'a mut dyn Read,
    options: ApplyOptions,
    version: u32,
    stash: HashMap<StashId, StashEntry>,
    stash_bytes: u64,
    stats: ApplyStats,
}

impl Replayer<'_> {
    fn block_size(&self) -> u64 {
        u64::from(self.options.block_size)
    }

    /// Size in bytes of `blocks` blocks, if a buffer of that size can exist.
    fn byte_len(&self, index: usize, blocks: u64) -> Result<usize> {
        blocks
            .checked_mul(self.block_size())
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(Error::TooLarge { index, blocks })
    }

    fn offset(&self, index: usize, block: u64) -> Result<u64> {
        block
            .checked_mul(self.block_size())
            .ok_or(Error::OffsetOverflow { index, block })
    }

    /// Reject reads past the end of the device before allocating for them.
    fn check_readable(&self, index: usize, ranges: &BlockRangeSet) -> Result<()> {
        let end = ranges.iter().last().map_or(0, |r| r.end);
        let device_blocks = self
            .device
            .file_len()
            .map_err(|e| Error::DeviceRead { index, source: e })?
            / self.block_size();

        if end > device_blocks {
            return Err(Error::OutsideDevice {
                index,
                end,
                device_blocks,
            });
        }

        Ok(())
    }

    fn read_ranges(&self, index: usize, ranges: &BlockRangeSet) -> Result<Vec<u8>> {
        self.check_readable(index, ranges)?;

        let mut data = vec![0u8; self.byte_len(index, ranges.total_blocks())?];
        let mut offset = 0;

        for range in ranges {
            let size = self.byte_len(index, range.len())?;

            self.device
                .read_exact_at(&mut data[offset..offset + size], self.offset(index, range.start)?)
                .map_err(|e| Error::DeviceRead { index, source: e })?;

            offset += size;
        }

        Ok(data)
    }

    fn write_ranges(&mut self, index: usize, ranges: &BlockRangeSet, data: &[u8]) -> Result<()> {
        if self.byte_len(index, ranges.total_blocks())? != data.len() {
            return Err(Error::IncompleteBuffer {
                index,
                num_blocks: ranges.total_blocks(),
            });
        }

        let mut offset = 0;

        for range in ranges {
            let size = self.byte_len(index, range.len())?;

            self.device
                .write_all_at(&data[offset..offset + size], self.offset(index, range.start)?)
                .map_err(|e| Error::DeviceWrite { index, source: e })?;

            offset += size;
        }

        self.stats.blocks_written += ranges.total_blocks();

        Ok(())
    }

    fn write_zeros(&mut self, index: usize, ranges: &BlockRangeSet) -> Result<()> {
        let block_size = self.byte_len(index, 1)?;

        for block in ranges.blocks() {
            let mut offset = self.offset(index, block)?;
            let mut remain = block_size;

            while remain > 0 {
                let n = remain.min(util::ZEROS.len());

                self.device
                    .write_all_at(&util::ZEROS[..n], offset)
                    .map_err(|e| Error::DeviceWrite { index, source: e })?;

                offset += n as u64;
                remain -= n;
            }
        }

        self.stats.blocks_written += ranges.total_blocks();

        Ok(())
    }

    /// Copy the next blocks of new data onto `ranges`, a bounded number of
    /// blocks at a time.
    fn write_new_data(&mut self, index: usize, ranges: &BlockRangeSet) -> Result<()> {
        let total = ranges.total_blocks();
        let mut buf = vec![0u8; self.byte_len(index, total.min(NEW_DATA_CHUNK_BLOCKS))?];

        for range in ranges {
            let mut block = range.start;

            while block < range.end {
                let n = (range.end - block).min(NEW_DATA_CHUNK_BLOCKS);
                let size = self.byte_len(index, n)?;
                let offset = self.offset(index, block)?;

                self.new_data
                    .read_exact(&mut buf[..size])
                    .map_err(Error::NewDataRead)?;
                self.device
                    .write_all_at(&buf[..size], offset)
                    .map_err(|e| Error::DeviceWrite { index, source: e })?;

                block += n;
            }
        }

        self.stats.blocks_written += total;
        self.stats.new_blocks += total;

        Ok(())
    }

    fn verify(&self, index: usize, expected: &Sha1Hash, data: &[u8]) -> Result<()> {
        let actual = image::sha1(data);

        if &actual != expected {
            return Err(Error::HashMismatch {
                index,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }

    fn stash(&mut self, index: usize, id: StashId, ranges: &BlockRangeSet) -> Result<()> {
        if let Some(entry) = self.stash.get_mut(&id) {
            entry.refs += 1;
            return Ok(());
        }

        let size = self.byte_len(index, ranges.total_blocks())? as u64;
        let needed = self.stash_bytes.saturating_add(size);
        if needed > self.options.stash_limit {
            return Err(Error::StashOverflow {
                index,
                needed,
                limit: self.options.stash_limit,
            });
        }

        let data = self.read_ranges(index, ranges)?;
        if let StashId::Hash(hash) = &id {
            self.verify(index, hash, &data)?;
        }

        trace!("Stashing {ranges:?} as {id}");

        self.stash.insert(id, StashEntry { refs: 1, data });
        self.stash_bytes = needed;
        self.stats.max_stash_bytes = self.stats.max_stash_bytes.max(needed);

        Ok(())
    }

    fn free(&mut self, index: usize, id: &StashId) -> Result<()> {
        let entry = self
            .stash
            .get_mut(id)
            .ok_or(Error::MissingStash { index, id: *id })?;

        entry.refs -= 1;
        if entry.refs == 0
            && let Some(entry) = self.stash.remove(id)
        {
            self.stash_bytes -= entry.data.len() as u64;
        }

        Ok(())
    }

    /// Assemble a move's source buffer from device blocks and stash entries.
    fn load_source(&self, index: usize, source: &MoveSource) -> Result<Vec<u8>> {
        let incomplete = || Error::IncompleteBuffer {
            index,
            num_blocks: source.num_blocks,
        };

        // Each piece is a buffer map and the data that goes there.
        let mut pieces: Vec<(Cow<'_, BlockRangeSet>, Cow<'_, [u8]>)> = vec![];

        if let Some(ranges) = &source.ranges {
            let map = match &source.buffer_map {
                Some(m) => Cow::Borrowed(m),
                None => Cow::Owned(BlockRangeSet::from(0..ranges.total_blocks())),
            };

            pieces.push((map, Cow::Owned(self.read_ranges(index, ranges)?)));
        }

        for stashed in &source.stashes {
            let entry = self.stash.get(&stashed.id).ok_or(Error::MissingStash {
                index,
                id: stashed.id,
            })?;

            pieces.push((Cow::Borrowed(&stashed.buffer), Cow::Borrowed(&entry.data)));
        }

        // The pieces must cover the buffer, which bounds its size.
        let available = pieces.iter().map(|(_, data)| data.len() as u64).sum::<u64>();
        let buffer_len = self.byte_len(index, source.num_blocks)?;
        if buffer_len as u64 > available {
            return Err(incomplete());
        }

        let buffer_range = BlockRangeSet::from(0..source.num_blocks);
        let mut buf = vec![0u8; buffer_len];
        let mut filled = BlockRangeSet::new();

        for (map, data) in &pieces {
            if !map.subtract(&buffer_range).is_empty()
                || self.byte_len(index, map.total_blocks())? != data.len()
            {
                return Err(incomplete());
            }

            let mut offset = 0;

            for range in map.iter() {
                let start = self.byte_len(index, range.start)?;
                let size = self.byte_len(index, range.len())?;

                buf[start..start + size].copy_from_slice(&data[offset..offset + size]);
                offset += size;
            }

            filled = filled.union(map);
        }

        if filled != buffer_range {
            return Err(incomplete());
        }

        Ok(buf)
    }

    fn run_command(&mut self, index: usize, command: &Command) -> Result<()> {
        match command {
            Command::Erase(ranges) | Command::Zero(ranges) => self.write_zeros(index, ranges),
            Command::New(ranges) => self.write_new_data(index, ranges),
            Command::Stash { id, ranges } => self.stash(index, *id, ranges),
            Command::Free { id } => self.free(index, id),
            Command::Move {
                hash,
                target,
                source,
            } => {
                let data = self.load_source(index, source)?;
                if let Some(hash) = hash {
                    self.verify(index, hash, &data)?;
                }

                self.write_ranges(index, target, &data)
            }
        }
    }
}

/// Replay `list` onto `device`. The device must already contain the source
/// image for incremental lists. `new_data` is consumed in order and must not
/// have any data left over afterwards.
pub fn apply(
    list: &TransferList,
    device: &dyn ReadWriteAt,
    new_data: &mut dyn Read,
    options: &ApplyOptions,
    cancel_signal: &AtomicBool,
) -> Result<ApplyStats> {
    let mut replayer = Replayer {
        device,
        new_data,
        options: *options,
        version: list.version,
        stash: HashMap::new(),
        stash_bytes: 0,
        stats: ApplyStats::default(),
    };

    for (index, command) in list.commands.iter().enumerate() {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Interrupted)?;

        replayer.run_command(index, command)?;
    }

    if replayer.stats.blocks_written != list.total_blocks {
        return Err(Error::TotalMismatch {
            expected: list.total_blocks,
            actual: replayer.stats.blocks_written,
        });
    }

    let trailing =
        io::copy(&mut replayer.new_data, &mut io::sink()).map_err(Error::NewDataRead)?;
    if trailing != 0 {
        return Err(Error::TrailingNewData(NumBytes(trailing)));
    }

    device.file_flush().map_err(Error::Flush)?;

    debug!(
        "Replayed version {} list: {:?}",
        replayer.version, replayer.stats,
    );

    Ok(replayer.stats)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::stream::MutexFile;

    use super::*;

    const OPTIONS: ApplyOptions = ApplyOptions {
        block_size: 4,
        stash_limit: 16,
    };

    fn run(list: &str, device: &[u8], new_data: &[u8]) -> Result<Vec<u8>> {
        let list = list.parse::<TransferList>().unwrap();
        let device = MutexFile::new(Cursor::new(device.to_vec()));
        let mut reader = Cursor::new(new_data);

        apply(&list, &device, &mut reader, &OPTIONS, &AtomicBool::new(false))?;

        Ok(device.into_inner().into_inner())
    }

    #[test]
    fn full_list() {
        let device = run(
            "4\n4\n0\n0\nnew 2,0,1\nzero 2,1,2\nnew 2,2,4\n",
            b"",
            b"aaaabbbbcccc",
        )
        .unwrap();

        assert_eq!(&device, b"aaaa\0\0\0\0bbbbcccc");
    }

    #[test]
    fn erase_writes_zeros() {
        let device = run("1\n1\nerase 2,1,2\n", b"aaaabbbb", b"").unwrap();

        assert_eq!(&device, b"aaaa\0\0\0\0");
    }

    #[test]
    fn v1_move() {
        let device = run("1\n2\nmove 2,0,2 2,2,4\n", b"aaaabbbbccccdddd", b"").unwrap();

        assert_eq!(&device, b"aaaabbbbaaaabbbb");
    }

    #[test]
    fn v2_swap_with_stash() {
        let list = "2\n2\n1\n1\n\
            stash 0 2,0,1\n\
            move 2,0,1 1 2,1,2\n\
            move 2,1,2 1 - 0:2,0,1\n\
            free 0\n";
        let device = run(list, b"aaaabbbb", b"").unwrap();

        assert_eq!(&device, b"bbbbaaaa");
    }

    #[test]
    fn v2_buffer_map() {
        // Buffer block 0 comes from the device and block 1 from the stash.
        let list = "2\n2\n1\n1\n\
            stash 0 2,1,2\n\
            move 2,1,3 2 2,0,1 2,0,1 0:2,1,2\n\
            free 0\n";
        let device = run(list, b"aaaabbbb\0\0\0\0", b"").unwrap();

        assert_eq!(&device, b"aaaaaaaabbbb");
    }

    #[test]
    fn v4_hashes_verified() {
        let a = hex::encode(image::sha1(b"aaaa"));
        let b = hex::encode(image::sha1(b"bbbb"));
        let list = format!(
            "4\n2\n1\n1\n\
            stash {a} 2,0,1\n\
            move {b} 2,0,1 1 2,1,2\n\
            move {a} 2,1,2 1 - {a}:2,0,1\n\
            free {a}\n"
        );
        let device = run(&list, b"aaaabbbb", b"").unwrap();
        assert_eq!(&device, b"bbbbaaaa");

        assert_matches!(
            run(&list, b"aaaacccc", b""),
            Err(Error::HashMismatch { index: 1, .. })
        );
    }

    #[test]
    fn stash_limit() {
        let list = "2\n0\n2\n5\nstash 0 2,0,4\nstash 1 2,4,5\nfree 0\nfree 1\n";

        assert_matches!(
            run(list, &[0u8; 20], b""),
            Err(Error::StashOverflow {
                index: 1,
                needed: 20,
                limit: 16,
            })
        );
    }

    #[test]
    fn invalid_replays() {
        assert_matches!(
            run("2\n1\n0\n0\nmove 2,0,1 1 - 3:2,0,1\n", b"aaaa", b""),
            Err(Error::MissingStash { index: 0, .. })
        );
        assert_matches!(
            run("1\n2\nnew 2,0,1\n", b"", b"aaaa"),
            Err(Error::TotalMismatch {
                expected: 2,
                actual: 1,
            })
        );
        assert_matches!(
            run("1\n1\nnew 2,0,1\n", b"", b"aaaabb"),
            Err(Error::TrailingNewData(_))
        );
        assert_matches!(
            run("1\n1\nnew 2,0,1\n", b"", b"aa"),
            Err(Error::NewDataRead(_))
        );
    }

    #[test]
    fn oversized_ranges_rejected() {
        // Move source far past the end of the device.
        assert_matches!(
            run(
                "2\n1000000000000\n0\n0\n\
                move 2,0,1000000000000 1000000000000 2,0,1000000000000\n",
                b"aaaabbbb",
                b"",
            ),
            Err(Error::OutsideDevice {
                index: 0,
                end: 1000000000000,
                device_blocks: 2,
            })
        );

        // Move buffer larger than everything that could fill it.
        assert_matches!(
            run(
                "2\n1000000000000\n1\n1\n\
                stash 0 2,0,1\n\
                move 2,0,1000000000000 1000000000000 - 0:2,0,1000000000000\n",
                b"aaaa",
                b"",
            ),
            Err(Error::IncompleteBuffer {
                index: 1,
                num_blocks: 1000000000000,
            })
        );

        // Stash size overflows.
        assert_matches!(
            run("2\n0\n1\n1\nstash 0 2,0,9223372036854775808\n", b"", b""),
            Err(Error::TooLarge {
                index: 0,
                blocks: 9223372036854775808,
            })
        );

        // Block offset overflows.
        assert_matches!(
            run(
                "1\n1\nzero 2,9223372036854775807,9223372036854775808\n",
                b"",
                b"",
            ),
            Err(Error::OffsetOverflow {
                index: 0,
                block: 9223372036854775807,
            })
        );

        // New data is streamed, so a huge range fails on the short input
        // instead of allocating up front.
        assert_matches!(
            run("1\n1000000000000\nnew 2,0,1000000000000\n", b"", b"aaaa"),
            Err(Error::NewDataRead(_))
        );
    }

    #[test]
    fn cancelled() {
        let list = "1\n1\nzero 2,0,1\n".parse::<TransferList>().unwrap();
        let device = MutexFile::new(Cursor::new(vec![]));

        assert_matches!(
            apply(
                &list,
                &device,
                &mut io::empty(),
                &OPTIONS,
                &AtomicBool::new(true),
            ),
            Err(Error::Interrupted)
        );
    }
}
