// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion of images into a transfer list and its data files.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use rayon::prelude::*;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    diff::{
        OperationKind, StashRef, plan,
        schedule::{self, Schedule, Step},
    },
    format::{
        rangeset::BlockRangeSet,
        transfer::{self, Command, MoveSource, StashId, StashedSource, TransferList},
    },
    image::{self, BlockImage, EmptyImage, SparseImage},
    stream, util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open image: {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: image::Error,
    },
    #[error("Failed to read block data")]
    Data(#[source] image::Error),
    #[error("Failed to compute operations")]
    Plan(#[source] plan::Error),
    #[error("Failed to order operations")]
    Schedule(#[from] schedule::Error),
    #[error("Failed to build transfer list")]
    Transfer(#[from] transfer::Error),
    #[error("Move source does not contain its stashed blocks: {0:?}")]
    InvalidStash(BlockRangeSet),
    #[error("Stash slot {0} is used before it is filled")]
    UnknownSlot(u32),
    #[error("I/O error: {path:?}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Conversion was interrupted")]
    Interrupted,
}

impl From<image::Error> for Error {
    fn from(e: image::Error) -> Self {
        if e.is_interrupted() {
            Self::Interrupted
        } else {
            Self::Data(e)
        }
    }
}

impl From<plan::Error> for Error {
    fn from(e: plan::Error) -> Self {
        match e {
            plan::Error::Interrupted => Self::Interrupted,
            plan::Error::Image(e) if e.is_interrupted() => Self::Interrupted,
            e => Self::Plan(e),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Maps schedule slots to transfer list stash IDs. Versions 3 and newer name
/// stashes by content, so two live slots may share an ID. The ID is only
/// stashed and freed once.
struct StashIds {
    version: u32,
    slots: HashMap<u32, StashId>,
    refs: HashMap<StashId, u32>,
}

impl StashIds {
    fn new(version: u32) -> Self {
        Self {
            version,
            slots: HashMap::new(),
            refs: HashMap::new(),
        }
    }

    /// Returns the ID and whether a stash command must be emitted for it.
    fn stash(
        &mut self,
        slot: u32,
        blocks: &BlockRangeSet,
        source: &dyn BlockImage,
    ) -> Result<(StashId, bool)> {
        let id = if self.version >= 3 {
            StashId::Hash(source.hash_blocks(blocks)?)
        } else {
            StashId::Slot(slot)
        };

        let refs = self.refs.entry(id).or_default();
        *refs += 1;
        self.slots.insert(slot, id);

        Ok((id, *refs == 1))
    }

    fn get(&self, slot: u32) -> Result<StashId> {
        self.slots.get(&slot).copied().ok_or(Error::UnknownSlot(slot))
    }

    /// Returns the ID if this was its last reference.
    fn free(&mut self, slot: u32) -> Result<Option<StashId>> {
        let id = self.slots.remove(&slot).ok_or(Error::UnknownSlot(slot))?;
        let Some(refs) = self.refs.get_mut(&id) else {
            return Ok(None);
        };

        *refs -= 1;
        if *refs > 0 {
            return Ok(None);
        }

        self.refs.remove(&id);
        Ok(Some(id))
    }
}

/// Describe where a move's source buffer comes from. Blocks that were stashed
/// earlier are taken from their stash entries and the rest is read from the
/// device.
fn move_source(
    source: &BlockRangeSet,
    stashed: &[StashRef],
    ids: &StashIds,
) -> Result<MoveSource> {
    if stashed.is_empty() {
        return Ok(MoveSource::direct(source.clone()));
    }

    let stashed_blocks = stashed
        .iter()
        .fold(BlockRangeSet::new(), |acc, s| acc.union(&s.blocks));
    let direct = source.subtract(&stashed_blocks);

    let stashes = stashed
        .iter()
        .map(|s| {
            Ok(StashedSource {
                id: ids.get(s.slot)?,
                buffer: source
                    .map_within(&s.blocks)
                    .ok_or_else(|| Error::InvalidStash(s.blocks.clone()))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let (ranges, buffer_map) = if direct.is_empty() {
        (None, None)
    } else {
        let buffer_map = source
            .map_within(&direct)
            .ok_or_else(|| Error::InvalidStash(direct.clone()))?;
        (Some(direct), Some(buffer_map))
    };

    Ok(MoveSource {
        num_blocks: source.total_blocks(),
        ranges,
        buffer_map,
        stashes,
    })
}

/// Turn a schedule into a transfer list. The contents of `new` operations are
/// written to `new_data` in command order.
pub fn encode(
    target: &dyn BlockImage,
    source: &dyn BlockImage,
    schedule: &Schedule,
    version: u32,
    new_data: &mut dyn Write,
    cancel_signal: &AtomicBool,
) -> Result<TransferList> {
    let mut ids = StashIds::new(version);
    let mut commands = Vec::with_capacity(schedule.steps.len());

    for step in &schedule.steps {
        stream::check_cancel(cancel_signal).map_err(|_| Error::Interrupted)?;

        match step {
            Step::Stash { slot, blocks } => {
                let (id, first) = ids.stash(*slot, blocks, source)?;
                if first {
                    commands.push(Command::Stash {
                        id,
                        ranges: blocks.clone(),
                    });
                }
            }
            Step::Free { slot } => {
                if let Some(id) = ids.free(*slot)? {
                    commands.push(Command::Free { id });
                }
            }
            Step::Op(op) => {
                let command = match &op.kind {
                    OperationKind::New => {
                        target.read_blocks(&op.target, new_data, cancel_signal)?;
                        Command::New(op.target.clone())
                    }
                    OperationKind::Zero => Command::Zero(op.target.clone()),
                    OperationKind::Erase => Command::Erase(op.target.clone()),
                    OperationKind::Move {
                        source: move_from,
                        stashed,
                    } => {
                        let hash = if version >= 3 {
                            Some(target.hash_blocks(&op.target)?)
                        } else {
                            None
                        };

                        Command::Move {
                            hash,
                            target: op.target.clone(),
                            source: move_source(move_from, stashed, &ids)?,
                        }
                    }
                };

                commands.push(command);
            }
        }
    }

    Ok(TransferList::new(version, commands)?)
}

/// A single image to convert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub input: PathBuf,
    /// Image currently on the device. Without one, a full transfer list is
    /// produced.
    pub source: Option<PathBuf>,
    pub prefix: String,
}

/// Output file paths for a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub new_data: PathBuf,
    pub transfer_list: PathBuf,
    /// Only written for version 3 and newer.
    pub patch_data: Option<PathBuf>,
}

impl OutputPaths {
    pub fn new(dir: &Path, prefix: &str, version: u32) -> Self {
        Self {
            new_data: dir.join(format!("{prefix}.new.dat")),
            transfer_list: dir.join(format!("{prefix}.transfer.list")),
            patch_data: (version >= 3).then(|| dir.join(format!("{prefix}.patch.dat"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub input: PathBuf,
    pub outputs: OutputPaths,
    pub version: u32,
    pub total_blocks: u64,
    pub new_blocks: u64,
    pub num_commands: usize,
    pub stash_slots: u64,
    pub max_stashed_blocks: u64,
}

fn open_image(
    path: &Path,
    config: &Config,
    cancel_signal: &AtomicBool,
) -> Result<SparseImage<File>> {
    let file = File::open(path).map_err(|e| Error::File {
        path: path.to_owned(),
        source: e,
    })?;

    SparseImage::open(file, config.block_size, config.crc_mode(), cancel_signal).map_err(|e| {
        if e.is_interrupted() {
            Error::Interrupted
        } else {
            Error::Open {
                path: path.to_owned(),
                source: e,
            }
        }
    })
}

fn create_temp(path: &Path) -> Result<NamedTempFile> {
    util::create_temp_beside(path).map_err(|e| Error::File {
        path: path.to_owned(),
        source: e,
    })
}

fn persist(temp: NamedTempFile, path: &Path) -> Result<()> {
    util::persist_temp(temp, path).map_err(|e| Error::File {
        path: path.to_owned(),
        source: e,
    })
}

/// Move finished outputs into place in the given order. If a move fails, the
/// outputs that were already moved are removed again.
fn persist_all(files: Vec<(NamedTempFile, &Path)>) -> Result<()> {
    let mut persisted = Vec::with_capacity(files.len());

    for (temp, path) in files {
        if let Err(e) = persist(temp, path) {
            for path in persisted {
                if let Err(remove_error) = fs::remove_file(path) {
                    warn!("Failed to remove partial output: {path:?}: {remove_error}");
                }
            }

            return Err(e);
        }

        persisted.push(path);
    }

    Ok(())
}

/// Plan and encode `target` against `source` and write the outputs. Outputs
/// are written to temporary files next to their final location and only
/// moved into place once all of them are complete.
fn write_outputs(
    target: &dyn BlockImage,
    source: &dyn BlockImage,
    outputs: &OutputPaths,
    config: &Config,
    cancel_signal: &AtomicBool,
) -> Result<TransferList> {
    let ops = plan::plan(target, source, cancel_signal)?;
    let schedule = schedule::schedule(ops, &config.schedule_policy(target.block_size()))?;

    fs::create_dir_all(&config.output_dir).map_err(|e| Error::File {
        path: config.output_dir.clone(),
        source: e,
    })?;

    let mut new_data = create_temp(&outputs.new_data)?;
    let list = {
        let mut writer = BufWriter::new(new_data.as_file_mut());
        let list = encode(
            target,
            source,
            &schedule,
            config.version,
            &mut writer,
            cancel_signal,
        )?;
        writer.flush().map_err(|e| Error::File {
            path: outputs.new_data.clone(),
            source: e,
        })?;
        list
    };

    let mut transfer_list = create_temp(&outputs.transfer_list)?;
    transfer_list
        .write_all(list.to_string().as_bytes())
        .map_err(|e| Error::File {
            path: outputs.transfer_list.clone(),
            source: e,
        })?;

    let mut files = vec![(transfer_list, outputs.transfer_list.as_path())];

    // No diff-based commands are ever emitted, but updaters expect the file.
    if let Some(path) = &outputs.patch_data {
        files.push((create_temp(path)?, path.as_path()));
    }

    files.push((new_data, outputs.new_data.as_path()));

    stream::check_cancel(cancel_signal).map_err(|_| Error::Interrupted)?;

    persist_all(files)?;

    Ok(list)
}

/// Convert one image.
pub fn convert(job: &Job, config: &Config, cancel_signal: &AtomicBool) -> Result<Summary> {
    info!("Converting {:?}", job.input);

    let target = open_image(&job.input, config, cancel_signal)?;
    let source: Box<dyn BlockImage> = match &job.source {
        Some(path) => {
            info!("Using source image {path:?}");
            Box::new(open_image(path, config, cancel_signal)?)
        }
        None => Box::new(EmptyImage::new(target.block_size())),
    };

    let outputs = OutputPaths::new(&config.output_dir, &job.prefix, config.version);
    let list = write_outputs(&target, source.as_ref(), &outputs, config, cancel_signal)?;

    let summary = Summary {
        input: job.input.clone(),
        version: list.version,
        total_blocks: list.total_blocks,
        new_blocks: list.new_ranges().map(BlockRangeSet::total_blocks).sum(),
        num_commands: list.commands.len(),
        stash_slots: list.stash_slots,
        max_stashed_blocks: list.max_stashed_blocks,
        outputs,
    };

    debug!("Conversion summary: {summary:?}");

    Ok(summary)
}

/// Convert several images in parallel. Results are returned in job order.
pub fn convert_all(
    jobs: &[Job],
    config: &Config,
    cancel_signal: &AtomicBool,
) -> Vec<Result<Summary>> {
    jobs.par_iter()
        .map(|job| convert(job, config, cancel_signal))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsString,
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use assert_matches::assert_matches;

    use crate::{
        diff::Operation,
        format::sparse::{Chunk, CrcMode},
        image::SparseImage,
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

    fn rs(r: std::ops::Range<u64>) -> BlockRangeSet {
        r.into()
    }

    static CANCEL: AtomicBool = AtomicBool::new(false);

    const A: &[u8; 8] = b"aaaabbbb";
    const B: &[u8; 8] = b"bbbbcccc";
    const Z: &[u8; 8] = &[0; 8];

    #[test]
    fn full_image() {
        let target = raw(&[A, Z, B]);
        let source = EmptyImage::new(8);
        let schedule = Schedule {
            steps: vec![
                Step::Op(Operation::new(OperationKind::New, 0..1u64)),
                Step::Op(Operation::new(OperationKind::Zero, 1..2u64)),
                Step::Op(Operation::new(OperationKind::New, 2..3u64)),
            ],
            ..Default::default()
        };

        let mut new_data = vec![];
        let list = encode(&target, &source, &schedule, 4, &mut new_data, &CANCEL).unwrap();

        assert_eq!(new_data, [&A[..], &B[..]].concat());
        assert_eq!(
            list.to_string(),
            "4\n3\n0\n0\nnew 2,0,1\nzero 2,1,2\nnew 2,2,3\n",
        );
    }

    #[test]
    fn stashed_move_v4() {
        let target = raw(&[B, A]);
        let source = raw(&[A, B]);
        let schedule = Schedule {
            steps: vec![
                Step::Stash {
                    slot: 0,
                    blocks: rs(0..1),
                },
                Step::Op(Operation::new_move(0..1u64, 1..2u64)),
                Step::Op(Operation::new(
                    OperationKind::Move {
                        source: rs(0..1),
                        stashed: vec![StashRef {
                            slot: 0,
                            blocks: rs(0..1),
                        }],
                    },
                    1..2u64,
                )),
                Step::Free { slot: 0 },
            ],
            stash_slots: 1,
            max_stashed_blocks: 1,
        };

        let mut new_data = vec![];
        let list = encode(&target, &source, &schedule, 4, &mut new_data, &CANCEL).unwrap();
        let a = hex::encode(image::sha1(A));
        let b = hex::encode(image::sha1(B));

        assert!(new_data.is_empty());
        assert_eq!(list.stash_slots, 1);
        assert_eq!(list.max_stashed_blocks, 1);
        assert_eq!(
            list.commands.iter().map(|c| transfer::format_command(c, 4)).collect::<Vec<_>>(),
            vec![
                format!("stash {a} 2,0,1"),
                format!("move {b} 2,0,1 1 2,1,2"),
                format!("move {a} 2,1,2 1 - {a}:2,0,1"),
                format!("free {a}"),
            ],
        );
    }

    #[test]
    fn partially_stashed_move_v2() {
        let target = raw(&[A, B, A]);
        let source = raw(&[A, B, Z]);
        let schedule = Schedule {
            steps: vec![
                Step::Stash {
                    slot: 0,
                    blocks: rs(1..2),
                },
                Step::Op(Operation::new(
                    OperationKind::Move {
                        source: rs(0..2),
                        stashed: vec![StashRef {
                            slot: 0,
                            blocks: rs(1..2),
                        }],
                    },
                    1..3u64,
                )),
                Step::Free { slot: 0 },
            ],
            stash_slots: 1,
            max_stashed_blocks: 1,
        };

        let mut new_data = vec![];
        let list = encode(&target, &source, &schedule, 2, &mut new_data, &CANCEL).unwrap();

        assert_eq!(
            list.to_string(),
            "2\n2\n1\n1\nstash 0 2,1,2\nmove 2,1,3 2 2,0,1 2,0,1 0:2,1,2\nfree 0\n",
        );
    }

    #[test]
    fn duplicate_hash_stashed_once() {
        let target = raw(&[A, A, Z, Z]);
        let source = raw(&[A, A, Z, Z]);
        let schedule = Schedule {
            steps: vec![
                Step::Stash {
                    slot: 0,
                    blocks: rs(0..1),
                },
                Step::Stash {
                    slot: 1,
                    blocks: rs(1..2),
                },
                Step::Free { slot: 0 },
                Step::Free { slot: 1 },
            ],
            stash_slots: 2,
            max_stashed_blocks: 2,
        };

        let mut new_data = vec![];
        let list = encode(&target, &source, &schedule, 3, &mut new_data, &CANCEL).unwrap();

        assert_eq!(list.stash_slots, 1);
        assert_eq!(
            list.commands.iter().map(Command::name).collect::<Vec<_>>(),
            vec!["stash", "free"],
        );
    }

    #[test]
    fn unknown_slot() {
        let target = raw(&[A]);
        let schedule = Schedule {
            steps: vec![Step::Free { slot: 3 }],
            ..Default::default()
        };

        assert_matches!(
            encode(
                &target,
                &EmptyImage::new(8),
                &schedule,
                4,
                &mut io::sink(),
                &AtomicBool::new(false),
            ),
            Err(Error::UnknownSlot(3))
        );
    }

    #[test]
    fn output_paths() {
        let paths = OutputPaths::new(Path::new("out"), "vendor", 3);
        assert_eq!(paths.new_data, Path::new("out/vendor.new.dat"));
        assert_eq!(paths.transfer_list, Path::new("out/vendor.transfer.list"));
        assert_eq!(paths.patch_data.as_deref(), Some(Path::new("out/vendor.patch.dat")));

        assert_eq!(OutputPaths::new(Path::new("."), "system", 2).patch_data, None);
    }

    #[test]
    fn convert_files() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("system.img");
        fs::write(&input, [&A[..], &Z[..], &B[..]].concat()).unwrap();

        let config = Config {
            output_dir: dir.path().join("out"),
            block_size: 8,
            ..Default::default()
        };
        let job = Job {
            input,
            source: None,
            prefix: "system".to_owned(),
        };

        let summary = convert(&job, &config, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.total_blocks, 3);
        assert_eq!(summary.new_blocks, 2);

        let new_data = fs::read(&summary.outputs.new_data).unwrap();
        assert_eq!(new_data, [&A[..], &B[..]].concat());

        let list = fs::read_to_string(&summary.outputs.transfer_list).unwrap();
        assert_eq!(list, "4\n3\n0\n0\nnew 2,0,1\nzero 2,1,2\nnew 2,2,3\n");

        let patch_data = summary.outputs.patch_data.unwrap();
        assert_eq!(fs::metadata(patch_data).unwrap().len(), 0);
    }

    #[test]
    fn convert_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("system.img");
        fs::write(&input, A).unwrap();

        let config = Config {
            output_dir: dir.path().to_owned(),
            block_size: 8,
            ..Default::default()
        };
        let job = Job {
            input,
            source: None,
            prefix: "system".to_owned(),
        };

        assert_matches!(
            convert(&job, &config, &AtomicBool::new(true)),
            Err(Error::Interrupted)
        );
        assert!(!dir.path().join("system.transfer.list").exists());
    }

    fn dir_entries(dir: &Path) -> Vec<OsString> {
        let mut names = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Raises the cancel signal as soon as the first block of new data has
    /// been streamed out, and records what the output directory held then.
    struct CancelAfterFirstBlock<'a> {
        inner: MemImage,
        cancel_signal: &'a AtomicBool,
        output_dir: &'a Path,
        files_at_cancel: AtomicUsize,
    }

    impl BlockImage for CancelAfterFirstBlock<'_> {
        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn total_blocks(&self) -> u64 {
            self.inner.total_blocks()
        }

        fn care_map(&self) -> &BlockRangeSet {
            self.inner.care_map()
        }

        fn zero_blocks(&self) -> &BlockRangeSet {
            self.inner.zero_blocks()
        }

        fn extents(&self) -> &[Chunk] {
            self.inner.extents()
        }

        fn read_block(&self, block: u64, buf: &mut [u8]) -> std::result::Result<(), image::Error> {
            self.inner.read_block(block, buf)
        }

        fn read_blocks(
            &self,
            ranges: &BlockRangeSet,
            writer: &mut dyn Write,
            cancel_signal: &AtomicBool,
        ) -> std::result::Result<(), image::Error> {
            let mut buf = vec![0u8; self.block_size() as usize];

            for block in ranges.blocks() {
                stream::check_cancel(cancel_signal)
                    .map_err(|e| image::Error::DataRead("blocks", e))?;

                self.inner.read_block(block, &mut buf)?;
                writer.write_all(&buf).unwrap();

                if !self.cancel_signal.swap(true, Ordering::SeqCst) {
                    self.files_at_cancel
                        .store(dir_entries(self.output_dir).len(), Ordering::SeqCst);
                }
            }

            Ok(())
        }
    }

    #[test]
    fn cancelled_while_writing_new_data() {
        let dir = tempfile::tempdir().unwrap();
        let cancel_signal = AtomicBool::new(false);
        let config = Config {
            output_dir: dir.path().to_owned(),
            block_size: 8,
            ..Default::default()
        };
        let outputs = OutputPaths::new(dir.path(), "system", config.version);
        let target = CancelAfterFirstBlock {
            inner: raw(&[A, B, A, B]),
            cancel_signal: &cancel_signal,
            output_dir: dir.path(),
            files_at_cancel: AtomicUsize::new(0),
        };

        assert_matches!(
            write_outputs(
                &target,
                &EmptyImage::new(8),
                &outputs,
                &config,
                &cancel_signal,
            ),
            Err(Error::Interrupted)
        );

        // The new data temp file existed when the signal was raised.
        assert!(cancel_signal.load(Ordering::SeqCst));
        assert_eq!(target.files_at_cancel.load(Ordering::SeqCst), 1);

        // No outputs or temp files are left behind.
        assert_eq!(dir_entries(dir.path()), Vec::<OsString>::new());
    }

    #[test]
    fn failed_persist_removes_moved_outputs() {
        for blocked in ["system.transfer.list", "system.new.dat"] {
            let dir = tempfile::tempdir().unwrap();
            let blocked_path = dir.path().join(blocked);

            // Renaming a file over a non-empty directory fails.
            fs::create_dir(&blocked_path).unwrap();
            fs::write(blocked_path.join("keep"), b"").unwrap();

            let config = Config {
                output_dir: dir.path().to_owned(),
                block_size: 8,
                ..Default::default()
            };
            let outputs = OutputPaths::new(dir.path(), "system", config.version);

            assert_matches!(
                write_outputs(
                    &raw(&[A, Z, B]),
                    &EmptyImage::new(8),
                    &outputs,
                    &config,
                    &AtomicBool::new(false),
                ),
                Err(Error::File { path, .. }) if path == blocked_path
            );
            assert_eq!(dir_entries(dir.path()), vec![OsString::from(blocked)]);
        }
    }
}
