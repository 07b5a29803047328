// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Block-addressable views of partition images.
//!
//! Sparse images are scanned once up front to learn which blocks have defined
//! content and where each block's data lives in the file. Block data is read
//! lazily afterwards, so the whole image is never held in memory.

use std::{
    fmt,
    io::{self, BufReader, Read, Write},
    sync::atomic::AtomicBool,
};

use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY};
use thiserror::Error;
use tracing::debug;

use crate::{
    format::{
        rangeset::{BlockRange, BlockRangeSet},
        sparse::{self, Chunk, ChunkBounds, ChunkData, ChunkList, CrcMode, SparseReader, SparseWriter},
        transfer::Sha1Hash,
    },
    stream::{self, CountingReader, ReadAt, UserPosFile},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid sparse image")]
    Sparse(#[from] sparse::Error),
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(u32),
    #[error("Raw image size {size} is not a multiple of the block size {block_size}")]
    RawImageSize { size: u64, block_size: u32 },
    #[error("Image has too many blocks: {0}")]
    TooManyBlocks(u64),
    #[error("Block {block} is outside the image's {total} blocks")]
    BlockOutOfRange { block: u64, total: u64 },
    #[error("Failed to read image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write image data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

impl Error {
    /// Whether the error was caused by the cancel signal.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::DataRead(_, e) | Self::DataWrite(_, e) => e.kind() == io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A read-only image addressed by block index.
pub trait BlockImage: Sync {
    fn block_size(&self) -> u32;

    fn total_blocks(&self) -> u64;

    /// Blocks with defined content. Everything else is don't-care.
    fn care_map(&self) -> &BlockRangeSet;

    /// Subset of [`Self::care_map`] whose content is all zeros.
    fn zero_blocks(&self) -> &BlockRangeSet;

    /// Allocated chunks in ascending order. Data blocks whose 32-bit words are
    /// all identical are reported as fill chunks.
    fn extents(&self) -> &[Chunk];

    /// Read one block into `buf`, which must be exactly one block long.
    /// Don't-care blocks read as zeros.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write the contents of `ranges` to `writer` in ascending block order.
    fn read_blocks(
        &self,
        ranges: &BlockRangeSet,
        writer: &mut dyn Write,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.block_size() as usize];

        for block in ranges.blocks() {
            stream::check_cancel(cancel_signal).map_err(|e| Error::DataRead("blocks", e))?;

            self.read_block(block, &mut buf)?;
            writer
                .write_all(&buf)
                .map_err(|e| Error::DataWrite("blocks", e))?;
        }

        Ok(())
    }

    /// SHA-1 of the contents of `ranges` in ascending block order.
    fn hash_blocks(&self, ranges: &BlockRangeSet) -> Result<Sha1Hash> {
        let mut context = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
        let mut buf = vec![0u8; self.block_size() as usize];

        for block in ranges.blocks() {
            self.read_block(block, &mut buf)?;
            context.update(&buf);
        }

        Ok(digest_to_hash(context))
    }
}

pub(crate) fn digest_to_hash(context: Context) -> Sha1Hash {
    let mut hash = Sha1Hash::default();
    hash.copy_from_slice(context.finish().as_ref());
    hash
}

/// SHA-1 of a single buffer.
pub fn sha1(data: &[u8]) -> Sha1Hash {
    let mut context = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
    context.update(data);
    digest_to_hash(context)
}

/// An image with no blocks. This is the source for full (non-incremental)
/// transfer lists.
#[derive(Clone, Debug)]
pub struct EmptyImage {
    block_size: u32,
    empty: BlockRangeSet,
}

impl EmptyImage {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            empty: BlockRangeSet::new(),
        }
    }
}

impl BlockImage for EmptyImage {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        0
    }

    fn care_map(&self) -> &BlockRangeSet {
        &self.empty
    }

    fn zero_blocks(&self) -> &BlockRangeSet {
        &self.empty
    }

    fn extents(&self) -> &[Chunk] {
        &[]
    }

    fn read_block(&self, block: u64, _buf: &mut [u8]) -> Result<()> {
        Err(Error::BlockOutOfRange { block, total: 0 })
    }
}

/// Location of a run of raw data blocks within the image file.
#[derive(Clone, Copy, Debug)]
struct DataRun {
    blocks: BlockRange,
    offset: u64,
}

/// A raw or sparse image file.
pub struct SparseImage<R> {
    inner: R,
    header: Option<sparse::Header>,
    block_size: u32,
    total_blocks: u64,
    chunks: Vec<Chunk>,
    runs: Vec<DataRun>,
    care_map: BlockRangeSet,
    zero_blocks: BlockRangeSet,
}

impl<R> fmt::Debug for SparseImage<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseImage")
            .field("header", &self.header)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("care_map", &self.care_map)
            .field("zero_blocks", &self.zero_blocks)
            .finish_non_exhaustive()
    }
}

/// Append one scanned block, reporting it as a fill chunk when every 32-bit
/// word is the same.
fn classify_block(list: &mut ChunkList, block: u32, buf: &[u8]) -> Result<()> {
    let data = match util::fill_word(buf) {
        Some(value) => ChunkData::Fill(value),
        None => ChunkData::Data,
    };

    list.push(Chunk {
        bounds: ChunkBounds {
            start: block,
            end: block + 1,
        },
        data,
    })?;

    Ok(())
}

impl<R: ReadAt> SparseImage<R> {
    /// Open an image. Sparse images are detected by their magic. Anything else
    /// is treated as a raw image made of `raw_block_size` blocks.
    pub fn open(
        inner: R,
        raw_block_size: u32,
        crc_mode: CrcMode,
        cancel_signal: &AtomicBool,
    ) -> Result<Self> {
        let mut magic = [0u8; 4];

        let is_sparse = match inner.read_exact_at(&mut magic, 0) {
            Ok(()) => u32::from_le_bytes(magic) == sparse::HEADER_MAGIC,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(Error::DataRead("magic", e)),
        };

        if is_sparse {
            Self::open_sparse(inner, crc_mode, cancel_signal)
        } else {
            Self::open_raw(inner, raw_block_size, cancel_signal)
        }
    }

    fn open_sparse(inner: R, crc_mode: CrcMode, cancel_signal: &AtomicBool) -> Result<Self> {
        let raw_reader = CountingReader::new(BufReader::new(UserPosFile::new(&inner)));
        let mut reader = SparseReader::new(raw_reader, crc_mode)?;
        let header = reader.header();

        debug!("Sparse header: {header:?}");

        let mut list = ChunkList::new();
        let mut runs = vec![];
        let mut buf = vec![0u8; header.block_size as usize];

        while let Some(chunk) = reader.next_chunk()? {
            match chunk.data {
                ChunkData::Data => {
                    runs.push(DataRun {
                        blocks: BlockRange::new(chunk.bounds.start.into(), chunk.bounds.end.into()),
                        offset: reader.get_ref().offset(),
                    });

                    for block in chunk.bounds {
                        stream::check_cancel(cancel_signal)
                            .map_err(|e| Error::DataRead("sparse_data", e))?;

                        reader.read_payload(&mut buf)?;
                        classify_block(&mut list, block, &buf)?;
                    }
                }
                ChunkData::Fill(_) | ChunkData::Hole | ChunkData::Crc32(_) => list.push(chunk)?,
            }
        }

        reader.finish()?;
        list.set_len(header.num_blocks);

        Ok(Self::from_parts(
            inner,
            Some(header),
            header.block_size,
            list,
            runs,
        ))
    }

    /// Open a raw image without checking for the sparse magic.
    pub fn open_raw(inner: R, block_size: u32, cancel_signal: &AtomicBool) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        let size = inner
            .file_len()
            .map_err(|e| Error::DataRead("raw_size", e))?;
        if size % u64::from(block_size) != 0 {
            return Err(Error::RawImageSize { size, block_size });
        }

        let num_blocks = size / u64::from(block_size);
        let num_blocks = u32::try_from(num_blocks).map_err(|_| Error::TooManyBlocks(num_blocks))?;

        let mut reader = BufReader::new(UserPosFile::new(&inner));
        let mut list = ChunkList::new();
        let mut buf = vec![0u8; block_size as usize];

        for block in 0..num_blocks {
            stream::check_cancel(cancel_signal).map_err(|e| Error::DataRead("raw_data", e))?;

            reader
                .read_exact(&mut buf)
                .map_err(|e| Error::DataRead("raw_data", e))?;
            classify_block(&mut list, block, &buf)?;
        }

        drop(reader);
        list.set_len(num_blocks);

        let runs = if num_blocks > 0 {
            vec![DataRun {
                blocks: BlockRange::new(0, num_blocks.into()),
                offset: 0,
            }]
        } else {
            vec![]
        };

        Ok(Self::from_parts(inner, None, block_size, list, runs))
    }

    fn from_parts(
        inner: R,
        header: Option<sparse::Header>,
        block_size: u32,
        list: ChunkList,
        runs: Vec<DataRun>,
    ) -> Self {
        let total_blocks = list.len();
        let chunks = list.into_allocated();
        let mut care_map = BlockRangeSet::new();
        let mut zero_blocks = BlockRangeSet::new();

        for chunk in &chunks {
            let range = u64::from(chunk.bounds.start)..u64::from(chunk.bounds.end);

            if chunk.data == ChunkData::Fill(0) {
                zero_blocks.insert(range.clone());
            }
            care_map.insert(range);
        }

        debug!(
            "Scanned {} blocks: {} with content, {} zero",
            total_blocks,
            care_map.total_blocks(),
            zero_blocks.total_blocks(),
        );

        Self {
            inner,
            header,
            block_size,
            total_blocks: total_blocks.into(),
            chunks,
            runs,
            care_map,
            zero_blocks,
        }
    }

    /// The sparse header, if the file is a sparse image.
    pub fn sparse_header(&self) -> Option<&sparse::Header> {
        self.header.as_ref()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn chunk_at(&self, block: u64) -> Option<&Chunk> {
        let index = self
            .chunks
            .partition_point(|c| u64::from(c.bounds.end) <= block);

        self.chunks
            .get(index)
            .filter(|c| u64::from(c.bounds.start) <= block)
    }

    fn data_offset(&self, block: u64) -> Option<u64> {
        let index = self.runs.partition_point(|r| r.blocks.end <= block);

        self.runs
            .get(index)
            .filter(|r| r.blocks.start <= block)
            .map(|r| r.offset + (block - r.blocks.start) * u64::from(self.block_size))
    }
}

impl<R: ReadAt + Sync> BlockImage for SparseImage<R> {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn care_map(&self) -> &BlockRangeSet {
        &self.care_map
    }

    fn zero_blocks(&self) -> &BlockRangeSet {
        &self.zero_blocks
    }

    fn extents(&self) -> &[Chunk] {
        &self.chunks
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);

        if block >= self.total_blocks {
            return Err(Error::BlockOutOfRange {
                block,
                total: self.total_blocks,
            });
        }

        match self.chunk_at(block).map(|c| c.data) {
            Some(ChunkData::Fill(value)) => {
                let word = value.to_le_bytes();
                for c in buf.chunks_exact_mut(4) {
                    c.copy_from_slice(&word);
                }
            }
            Some(ChunkData::Data) => {
                let offset = self.data_offset(block).ok_or(Error::BlockOutOfRange {
                    block,
                    total: self.total_blocks,
                })?;

                self.inner
                    .read_exact_at(buf, offset)
                    .map_err(|e| Error::DataRead("block", e))?;
            }
            _ => buf.fill(0),
        }

        Ok(())
    }
}

/// Write the blocks of `image` covered by `care` as a sparse image. Blocks
/// outside of `care` become don't-care chunks. Returns the header that was
/// written.
pub fn write_sparse(
    image: &dyn BlockImage,
    care: &BlockRangeSet,
    writer: &mut dyn Write,
    cancel_signal: &AtomicBool,
) -> Result<sparse::Header> {
    let total = image.total_blocks();
    let num_blocks = u32::try_from(total).map_err(|_| Error::TooManyBlocks(total))?;
    let mut list = ChunkList::new();

    for extent in image.extents() {
        let range = BlockRangeSet::from(u64::from(extent.bounds.start)..u64::from(extent.bounds.end));

        // Subranges of a chunk always fit in a u32.
        for r in range.intersect(care).iter() {
            list.push(Chunk {
                bounds: ChunkBounds {
                    start: r.start as u32,
                    end: r.end as u32,
                },
                data: extent.data,
            })?;
        }
    }

    list.set_len(num_blocks);
    let chunks = list.to_chunks();

    let header = sparse::Header {
        major_version: sparse::MAJOR_VERSION,
        minor_version: sparse::MINOR_VERSION,
        block_size: image.block_size(),
        num_blocks,
        num_chunks: chunks.len() as u32,
        crc32: 0,
    };
    let mut sparse_writer = SparseWriter::new(writer, header)?;
    let mut buf = vec![0u8; image.block_size() as usize];

    for chunk in chunks {
        sparse_writer.start_chunk(chunk)?;

        if chunk.data == ChunkData::Data {
            for block in chunk.bounds {
                stream::check_cancel(cancel_signal)
                    .map_err(|e| Error::DataWrite("sparse_data", e))?;

                image.read_block(block.into(), &mut buf)?;
                sparse_writer
                    .write_all(&buf)
                    .map_err(|e| Error::DataWrite("sparse_data", e))?;
            }
        }
    }

    sparse_writer.finish()?;

    debug!(
        "Wrote sparse image: {} blocks in {} chunks",
        header.num_blocks, header.num_chunks,
    );

    Ok(header)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::{
        format::sparse::{Header, MAJOR_VERSION, MINOR_VERSION},
        stream::MutexFile,
    };

    use super::*;

    type MemImage = SparseImage<MutexFile<Cursor<Vec<u8>>>>;

    fn open(data: Vec<u8>, raw_block_size: u32) -> Result<MemImage> {
        SparseImage::open(
            MutexFile::new(Cursor::new(data)),
            raw_block_size,
            CrcMode::Validate,
            &AtomicBool::new(false),
        )
    }

    fn sparse_image(block_size: u32, chunks: &[(ChunkBounds, ChunkData, Vec<u8>)]) -> Vec<u8> {
        let header = Header {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            block_size,
            num_blocks: chunks.last().map_or(0, |c| c.0.end),
            num_chunks: chunks.len() as u32,
            crc32: 0,
        };
        let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header).unwrap();

        for (bounds, data, payload) in chunks {
            writer
                .start_chunk(Chunk {
                    bounds: *bounds,
                    data: *data,
                })
                .unwrap();
            writer.write_all(payload).unwrap();
        }

        writer.finish().unwrap().into_inner()
    }

    fn bounds(start: u32, end: u32) -> ChunkBounds {
        ChunkBounds { start, end }
    }

    #[test]
    fn two_raw_blocks() {
        let payload = (0..8192u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let data = sparse_image(4096, &[(bounds(0, 2), ChunkData::Data, payload.clone())]);

        let image = open(data, 4096).unwrap();
        assert!(image.sparse_header().is_some());
        assert_eq!(image.total_blocks(), 2);
        assert_eq!(image.care_map(), &BlockRangeSet::from(0..2u64));
        assert!(image.zero_blocks().is_empty());

        let mut output = vec![];
        image
            .read_blocks(image.care_map(), &mut output, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(output, payload);
    }

    #[test]
    fn mixed_chunks() {
        let mut payload = vec![0xaau8; 8];
        payload.extend(b"12345678");
        payload.extend([0u8; 8]);

        let data = sparse_image(
            8,
            &[
                (bounds(0, 3), ChunkData::Data, payload),
                (bounds(3, 5), ChunkData::Hole, vec![]),
                (bounds(5, 7), ChunkData::Fill(0x01020304), vec![]),
                (bounds(7, 8), ChunkData::Fill(0), vec![]),
            ],
        );

        let image = open(data, 4096).unwrap();
        assert_eq!(image.block_size(), 8);
        assert_eq!(image.total_blocks(), 8);
        assert_eq!(image.care_map().to_string(), "4,0,3,5,8");
        assert_eq!(image.zero_blocks().to_string(), "4,2,3,7,8");
        assert_eq!(
            image.extents().iter().map(|c| c.data).collect::<Vec<_>>(),
            vec![
                ChunkData::Fill(0xaaaaaaaa),
                ChunkData::Data,
                ChunkData::Fill(0),
                ChunkData::Fill(0x01020304),
                ChunkData::Fill(0),
            ],
        );

        let mut buf = [0u8; 8];
        image.read_block(1, &mut buf).unwrap();
        assert_eq!(&buf, b"12345678");
        image.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [0xaa; 8]);
        image.read_block(6, &mut buf).unwrap();
        assert_eq!(&buf, b"\x04\x03\x02\x01\x04\x03\x02\x01");
        image.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
        assert_matches!(
            image.read_block(8, &mut buf),
            Err(Error::BlockOutOfRange { block: 8, total: 8 })
        );
    }

    #[test]
    fn raw_image() {
        let mut data = vec![0u8; 16];
        data.extend(b"abcdefghijklmnop");

        let image = open(data, 16).unwrap();
        assert!(image.sparse_header().is_none());
        assert_eq!(image.total_blocks(), 2);
        assert_eq!(image.care_map(), &BlockRangeSet::from(0..2u64));
        assert_eq!(image.zero_blocks(), &BlockRangeSet::from(0..1u64));

        let mut buf = [0u8; 16];
        image.read_block(1, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefghijklmnop");

        assert_eq!(
            image.hash_blocks(&BlockRangeSet::from(1..2u64)).unwrap(),
            sha1(b"abcdefghijklmnop"),
        );
    }

    #[test]
    fn raw_image_errors() {
        assert_matches!(
            open(vec![0u8; 10], 8),
            Err(Error::RawImageSize {
                size: 10,
                block_size: 8,
            })
        );
        assert_matches!(open(vec![], 6), Err(Error::InvalidBlockSize(6)));

        let image = open(vec![], 4096).unwrap();
        assert_eq!(image.total_blocks(), 0);
        assert!(image.care_map().is_empty());
    }

    #[test]
    fn bad_sparse_image() {
        let mut data = sparse_image(8, &[(bounds(0, 1), ChunkData::Data, b"abcdefgh".to_vec())]);
        data.truncate(data.len() - 1);

        assert_matches!(
            open(data, 4096),
            Err(Error::Sparse(sparse::Error::TruncatedChunk { index: 0 }))
        );
    }

    #[test]
    fn write_sparse_keeps_only_care_blocks() {
        let mut data = vec![0u8; 8];
        data.extend(b"abcdefgh");
        data.extend([0x11u8; 8]);
        data.extend(b"ijklmnop");
        data.extend(b"qrstuvwx");

        let image = open(data, 8).unwrap();
        let care = BlockRangeSet::from(0..2u64).with(3..4u64);

        let mut output = Cursor::new(Vec::new());
        let header =
            write_sparse(&image, &care, &mut output, &AtomicBool::new(false)).unwrap();
        assert_eq!(header.num_blocks, 5);
        assert_eq!(header.num_chunks, 5);

        let written = open(output.into_inner(), 4096).unwrap();
        assert_eq!(written.sparse_header(), Some(&header));
        assert_eq!(written.total_blocks(), 5);
        assert_eq!(written.care_map(), &care);
        assert_eq!(written.zero_blocks(), &BlockRangeSet::from(0..1u64));

        let mut buf = [0u8; 8];
        written.read_block(1, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        written.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
        written.read_block(3, &mut buf).unwrap();
        assert_eq!(&buf, b"ijklmnop");
        written.read_block(4, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn write_sparse_cancelled() {
        let image = open(b"abcdefgh".to_vec(), 8).unwrap();

        let result = write_sparse(
            &image,
            image.care_map(),
            &mut io::sink(),
            &AtomicBool::new(true),
        );
        assert_matches!(result, Err(e) if e.is_interrupted());
    }

    #[test]
    fn cancelled_scan() {
        let result = SparseImage::open(
            MutexFile::new(Cursor::new(vec![1u8; 64])),
            16,
            CrcMode::Ignore,
            &AtomicBool::new(true),
        );

        assert_matches!(result, Err(e) if e.is_interrupted());
    }

    #[test]
    fn empty_image() {
        let image = EmptyImage::new(4096);

        assert_eq!(image.total_blocks(), 0);
        assert!(image.care_map().is_empty());
        assert_eq!(
            image.hash_blocks(&BlockRangeSet::new()).unwrap(),
            sha1(b""),
        );
    }
}
