// SPDX-FileCopyrightText: 2026 img2sdat contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Android sparse image container.
//!
//! A sparse image is a 28-byte file header followed by a sequence of chunks.
//! Every chunk starts with a 12-byte chunk header describing how many output
//! blocks it covers and how many bytes of payload follow it. Raw chunks carry
//! literal block data, fill chunks carry a single 32-bit word that is repeated
//! over every block, don't-care chunks carry nothing, and CRC32 chunks carry a
//! checkpoint of the checksum of all output data so far.

use std::{
    fmt,
    io::{self, Read, Write},
    ops::Range,
};

use crc32fast::Hasher;
use thiserror::Error;
use zerocopy::{
    FromBytes, IntoBytes,
    byteorder::little_endian::{U16, U32},
};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::ReadDiscardExt;

/// Magic value at the start of every sparse image.
pub const HEADER_MAGIC: u32 = 0xed26ff3a;

/// Supported major version.
pub const MAJOR_VERSION: u16 = 1;
/// The only minor version that is written. Newer minor versions may add
/// trailing header fields, which are skipped when reading.
pub const MINOR_VERSION: u16 = 0;

/// Size of the on-disk file header.
pub const FILE_HEADER_SIZE: u16 = 28;
/// Size of the on-disk chunk header.
pub const CHUNK_HEADER_SIZE: u16 = 12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported major version: {0}")]
    UnsupportedMajorVersion(u16),
    #[error("Only minor version {MINOR_VERSION} can be written: {0}")]
    UnsupportedMinorVersion(u16),
    #[error("{what} header size {size} is smaller than {min}")]
    HeaderTooSmall {
        what: &'static str,
        size: u16,
        min: u16,
    },
    #[error("Invalid block size (must be a non-zero multiple of 4): {0}")]
    InvalidBlockSize(u32),
    #[error("Chunk #{index}: Unknown chunk type: {tag:#06x}")]
    UnknownChunkType { index: u32, tag: u16 },
    #[error("Chunk #{index}: Blocks {start}..{end} extend past the image's {total} blocks")]
    ChunkPastEnd {
        index: u32,
        start: u32,
        end: u64,
        total: u32,
    },
    #[error("Chunk #{index}: CRC32 chunk covers {num_blocks} blocks")]
    NonEmptyCrc32Chunk { index: u32, num_blocks: u32 },
    #[error("Chunk #{index}: Declared size is {actual} bytes, but expected {expected}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u64,
        actual: u32,
    },
    #[error("Chunk #{index}: Payload of {size} bytes does not fit in a chunk")]
    ChunkTooLarge { index: u32, size: u64 },
    #[error("Chunk #{index}: Input ends before the end of the chunk")]
    TruncatedChunk { index: u32 },
    #[error("Chunk #{index}: {remain} payload bytes were not transferred")]
    PendingPayload { index: u32, remain: u64 },
    #[error("Chunk #{index}: Starts at block {start}, but the previous chunk ended at {expected}")]
    ChunkNotContiguous {
        index: u32,
        start: u32,
        expected: u32,
    },
    #[error("Chunk at block {start} overlaps the previous chunk ending at {prev_end}")]
    OverlappingChunk { start: u32, prev_end: u32 },
    #[error("Header declares {expected} chunks, but found {actual}")]
    ChunkCountMismatch { expected: u32, actual: u32 },
    #[error("Chunks cover {actual} blocks, but header declares {expected}")]
    BlockCountMismatch { expected: u32, actual: u32 },
    #[error("Expected checkpoint CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Checkpoint { expected: u32, actual: u32 },
    #[error("Expected final CRC32 {expected:08x}, but have {actual:08x}")]
    MismatchedCrc32Final { expected: u32, actual: u32 },
    #[error("Failed to read sparse data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write sparse data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Map running out of input inside chunk `index` to [`Error::TruncatedChunk`].
fn read_error(index: u32, what: &'static str, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::TruncatedChunk { index }
    } else {
        Error::DataRead(what, e)
    }
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    magic: U32,
    major_version: U16,
    minor_version: U16,
    /// Readers skip anything past [`FILE_HEADER_SIZE`].
    file_hdr_sz: U16,
    /// Readers skip anything past [`CHUNK_HEADER_SIZE`] in every chunk.
    chunk_hdr_sz: U16,
    blk_sz: U32,
    total_blks: U32,
    total_chunks: U32,
    image_checksum: U32,
}

impl RawHeader {
    fn check(&self) -> Result<()> {
        let magic = self.magic.get();
        if magic != HEADER_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let major_version = self.major_version.get();
        if major_version != MAJOR_VERSION {
            return Err(Error::UnsupportedMajorVersion(major_version));
        }

        for (what, size, min) in [
            ("File", self.file_hdr_sz.get(), FILE_HEADER_SIZE),
            ("Chunk", self.chunk_hdr_sz.get(), CHUNK_HEADER_SIZE),
        ] {
            if size < min {
                return Err(Error::HeaderTooSmall { what, size, min });
            }
        }

        let block_size = self.blk_sz.get();
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        Ok(())
    }

    fn to_header(self) -> Header {
        Header {
            major_version: self.major_version.get(),
            minor_version: self.minor_version.get(),
            block_size: self.blk_sz.get(),
            num_blocks: self.total_blks.get(),
            num_chunks: self.total_chunks.get(),
            crc32: self.image_checksum.get(),
        }
    }
}

impl From<Header> for RawHeader {
    fn from(header: Header) -> Self {
        Self {
            magic: HEADER_MAGIC.into(),
            major_version: header.major_version.into(),
            minor_version: header.minor_version.into(),
            file_hdr_sz: FILE_HEADER_SIZE.into(),
            chunk_hdr_sz: CHUNK_HEADER_SIZE.into(),
            blk_sz: header.block_size.into(),
            total_blks: header.num_blocks.into(),
            total_chunks: header.num_chunks.into(),
            image_checksum: header.crc32.into(),
        }
    }
}

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawChunk {
    chunk_type: U16,
    reserved: U16,
    /// Output blocks covered by the chunk.
    chunk_sz: U32,
    /// Chunk header plus payload, in bytes.
    total_sz: U32,
}

/// On-disk chunk type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkKind {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkKind {
    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0xcac1 => Some(Self::Raw),
            0xcac2 => Some(Self::Fill),
            0xcac3 => Some(Self::DontCare),
            0xcac4 => Some(Self::Crc32),
            _ => None,
        }
    }

    fn tag(self) -> u16 {
        match self {
            Self::Raw => 0xcac1,
            Self::Fill => 0xcac2,
            Self::DontCare => 0xcac3,
            Self::Crc32 => 0xcac4,
        }
    }

    /// Number of bytes that follow the chunk header.
    fn payload_size(self, num_blocks: u32, block_size: u32) -> u64 {
        match self {
            Self::Raw => u64::from(num_blocks) * u64::from(block_size),
            Self::Fill | Self::Crc32 => 4,
            Self::DontCare => 0,
        }
    }
}

impl From<ChunkData> for ChunkKind {
    fn from(data: ChunkData) -> Self {
        match data {
            ChunkData::Data => Self::Raw,
            ChunkData::Fill(_) => Self::Fill,
            ChunkData::Hole => Self::DontCare,
            ChunkData::Crc32(_) => Self::Crc32,
        }
    }
}

/// Sparse file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub major_version: u16,
    pub minor_version: u16,
    /// Block size in bytes. Must be a multiple of 4.
    pub block_size: u32,
    /// Number of blocks when unsparsed.
    pub num_blocks: u32,
    pub num_chunks: u32,
    /// CRC32 checksum of the unsparsed data or 0 if unknown.
    pub crc32: u32,
}

/// Half-open range indicating the block range that a chunk covers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChunkBounds {
    /// Starting block (inclusive).
    pub start: u32,
    /// Ending block (exclusive).
    pub end: u32,
}

impl fmt::Debug for ChunkBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl IntoIterator for ChunkBounds {
    type Item = u32;

    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

impl ChunkBounds {
    /// Length in blocks.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }
}

/// What the blocks of a chunk contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChunkData {
    /// Literal block data stored in the payload.
    Data,
    /// Every 32-bit little-endian word of every block is this value.
    Fill(u32),
    /// Don't-care blocks. These read back as zeros.
    Hole,
    /// Checkpoint of the CRC32 of all preceding output. Covers no blocks.
    Crc32(u32),
}

impl fmt::Debug for ChunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "Data"),
            Self::Fill(value) => write!(f, "Fill({value:#010x})"),
            Self::Hole => write!(f, "Hole"),
            Self::Crc32(checksum) => write!(f, "Crc32({checksum:#010x})"),
        }
    }
}

/// A contiguous list of blocks and the type of data they contain.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub bounds: ChunkBounds,
    pub data: ChunkData,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.bounds, self.data)
    }
}

/// Allocated chunks of an image in ascending block order. Appending a chunk
/// that continues the previous one with the same data extends it. Holes are
/// never stored.
#[derive(Clone, Debug, Default)]
pub struct ChunkList {
    chunks: Vec<Chunk>,
    len: u32,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. It must not start before the end of the list.
    pub fn push(&mut self, chunk: Chunk) -> Result<()> {
        if chunk.bounds.start < self.len {
            return Err(Error::OverlappingChunk {
                start: chunk.bounds.start,
                prev_end: self.len,
            });
        }

        self.len = self.len.max(chunk.bounds.end);

        if matches!(chunk.data, ChunkData::Hole | ChunkData::Crc32(_)) || chunk.bounds.len() == 0 {
            return Ok(());
        }

        match self.chunks.last_mut() {
            Some(last) if last.bounds.end == chunk.bounds.start && last.data == chunk.data => {
                last.bounds.end = chunk.bounds.end;
            }
            _ => self.chunks.push(chunk),
        }

        Ok(())
    }

    /// Length in blocks, including trailing holes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Grow the list with a trailing hole or cut off everything past `len`.
    pub fn set_len(&mut self, len: u32) {
        self.chunks.retain(|c| c.bounds.start < len);
        if let Some(last) = self.chunks.last_mut() {
            last.bounds.end = last.bounds.end.min(len);
        }

        self.len = len;
    }

    pub fn allocated(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn into_allocated(self) -> Vec<Chunk> {
        self.chunks
    }

    /// Every chunk, with the gaps filled in by holes, so that the result
    /// covers `0..self.len()` exactly. This is the chunk sequence to write.
    pub fn to_chunks(&self) -> Vec<Chunk> {
        let hole = |start, end| Chunk {
            bounds: ChunkBounds { start, end },
            data: ChunkData::Hole,
        };
        let mut result = Vec::with_capacity(self.chunks.len() * 2 + 1);
        let mut next = 0;

        for chunk in &self.chunks {
            if chunk.bounds.start > next {
                result.push(hole(next, chunk.bounds.start));
            }
            result.push(*chunk);
            next = chunk.bounds.end;
        }

        if self.len > next {
            result.push(hole(next, self.len));
        }

        result
    }
}

/// Whether to validate CRC32 checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    Validate,
    Ignore,
}

/// Progress through the chunk sequence. Both [`SparseReader`] and
/// [`SparseWriter`] drive one of these, so they enforce the same layout.
struct ChunkCursor {
    header: RawHeader,
    /// Index of the next chunk.
    index: u32,
    /// First block of the next chunk.
    block: u32,
    /// Payload bytes not yet transferred for the current raw chunk.
    remain: u64,
    hasher: Option<Hasher>,
}

impl ChunkCursor {
    fn new(header: RawHeader, crc_mode: CrcMode) -> Self {
        Self {
            header,
            index: 0,
            block: 0,
            remain: 0,
            hasher: (crc_mode == CrcMode::Validate).then(Hasher::new),
        }
    }

    fn all_chunks_seen(&self) -> bool {
        self.index == self.header.total_chunks.get()
    }

    fn ensure_payload_done(&self) -> Result<()> {
        if self.remain != 0 {
            return Err(Error::PendingPayload {
                index: self.index.saturating_sub(1),
                remain: self.remain,
            });
        }

        Ok(())
    }

    /// Check the next chunk against the header and step past its blocks.
    fn advance(&mut self, kind: ChunkKind, num_blocks: u32, total_size: u32) -> Result<ChunkBounds> {
        let index = self.index;
        let total = self.header.total_blks.get();

        if kind == ChunkKind::Crc32 && num_blocks != 0 {
            return Err(Error::NonEmptyCrc32Chunk { index, num_blocks });
        }

        let end = u64::from(self.block) + u64::from(num_blocks);
        if end > u64::from(total) {
            return Err(Error::ChunkPastEnd {
                index,
                start: self.block,
                end,
                total,
            });
        }

        let payload = kind.payload_size(num_blocks, self.header.blk_sz.get());
        let expected = payload + u64::from(self.header.chunk_hdr_sz.get());
        if expected != u64::from(total_size) {
            return Err(Error::ChunkSizeMismatch {
                index,
                expected,
                actual: total_size,
            });
        }

        let bounds = ChunkBounds {
            start: self.block,
            end: self.block + num_blocks,
        };

        self.index += 1;
        self.block = bounds.end;
        if kind == ChunkKind::Raw {
            self.remain = payload;
        }

        Ok(bounds)
    }

    /// Largest payload transfer allowed for a buffer of `len` bytes.
    fn payload_limit(&self, len: usize) -> usize {
        usize::try_from(self.remain).map_or(len, |r| r.min(len))
    }

    fn consume(&mut self, data: &[u8]) {
        if let Some(hasher) = &mut self.hasher {
            hasher.update(data);
        }
        self.remain -= data.len() as u64;
    }

    /// Checksum what `num_blocks` blocks of `value` look like unsparsed.
    fn consume_fill(&mut self, value: u32, num_blocks: u32) {
        let Some(hasher) = &mut self.hasher else {
            return;
        };

        let mut pattern = [0u8; 4096];
        for word in pattern.chunks_exact_mut(4) {
            word.copy_from_slice(&value.to_le_bytes());
        }

        let mut remain = u64::from(num_blocks) * u64::from(self.header.blk_sz.get());
        while remain > 0 {
            let n = usize::try_from(remain).map_or(pattern.len(), |r| r.min(pattern.len()));
            hasher.update(&pattern[..n]);
            remain -= n as u64;
        }
    }

    fn checkpoint(&self, expected: u32) -> Result<()> {
        if let Some(hasher) = &self.hasher {
            let actual = hasher.clone().finalize();
            if actual != expected {
                return Err(Error::MismatchedCrc32Checkpoint { expected, actual });
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.ensure_payload_done()?;

        let expected = self.header.total_chunks.get();
        if self.index != expected {
            return Err(Error::ChunkCountMismatch {
                expected,
                actual: self.index,
            });
        }

        let expected = self.header.total_blks.get();
        if self.block != expected {
            return Err(Error::BlockCountMismatch {
                expected,
                actual: self.block,
            });
        }

        let expected = self.header.image_checksum.get();
        if let Some(hasher) = self.hasher
            && expected != 0
        {
            let actual = hasher.finalize();
            if actual != expected {
                return Err(Error::MismatchedCrc32Final { expected, actual });
            }
        }

        Ok(())
    }
}

/// Streaming reader for sparse images. After [`Self::next_chunk`] returns a
/// [`ChunkData::Data`] chunk, its payload must be fully read, either through
/// [`Self::read_payload`] or the [`Read`] implementation, before the next
/// chunk can be read.
pub struct SparseReader<R> {
    inner: R,
    cursor: ChunkCursor,
}

impl<R> fmt::Debug for SparseReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseReader")
            .field("header", &self.cursor.header.to_header())
            .field("next_chunk", &self.cursor.index)
            .field("next_block", &self.cursor.block)
            .finish_non_exhaustive()
    }
}

impl<R: Read> SparseReader<R> {
    pub fn new(mut inner: R, crc_mode: CrcMode) -> Result<Self> {
        let header =
            RawHeader::read_from_io(&mut inner).map_err(|e| Error::DataRead("header", e))?;
        header.check()?;

        inner
            .read_discard_exact(u64::from(header.file_hdr_sz.get() - FILE_HEADER_SIZE))
            .map_err(|e| Error::DataRead("header_excess", e))?;

        Ok(Self {
            inner,
            cursor: ChunkCursor::new(header, crc_mode),
        })
    }

    pub fn header(&self) -> Header {
        self.cursor.header.to_header()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    fn read_word(&mut self, what: &'static str) -> Result<u32> {
        let index = self.cursor.index - 1;

        U32::read_from_io(&mut self.inner)
            .map(|w| w.get())
            .map_err(|e| read_error(index, what, e))
    }

    /// Read the next chunk header. Returns [`None`] once the number of chunks
    /// declared by the header have been read. CRC32 checkpoints are verified
    /// here when validation is enabled.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.cursor.ensure_payload_done()?;

        if self.cursor.all_chunks_seen() {
            return Ok(None);
        }

        let index = self.cursor.index;
        let raw = RawChunk::read_from_io(&mut self.inner)
            .map_err(|e| read_error(index, "chunk_header", e))?;
        let tag = raw.chunk_type.get();
        let kind = ChunkKind::from_tag(tag).ok_or(Error::UnknownChunkType { index, tag })?;

        let bounds = self
            .cursor
            .advance(kind, raw.chunk_sz.get(), raw.total_sz.get())?;

        let excess = self.cursor.header.chunk_hdr_sz.get() - CHUNK_HEADER_SIZE;
        self.inner
            .read_discard_exact(u64::from(excess))
            .map_err(|e| read_error(index, "chunk_header_excess", e))?;

        let data = match kind {
            ChunkKind::Raw => ChunkData::Data,
            ChunkKind::Fill => {
                let value = self.read_word("fill_value")?;
                self.cursor.consume_fill(value, bounds.len());
                ChunkData::Fill(value)
            }
            ChunkKind::DontCare => {
                self.cursor.consume_fill(0, bounds.len());
                ChunkData::Hole
            }
            ChunkKind::Crc32 => {
                let checksum = self.read_word("crc32")?;
                self.cursor.checkpoint(checksum)?;
                ChunkData::Crc32(checksum)
            }
        };

        Ok(Some(Chunk { bounds, data }))
    }

    /// Fill `buf` from the current raw chunk's payload. Input that ends early
    /// is reported as [`Error::TruncatedChunk`].
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        let index = self.cursor.index.saturating_sub(1);

        self.read_exact(buf)
            .map_err(|e| read_error(index, "chunk_payload", e))
    }

    /// Check that every declared chunk and block was present and that the
    /// final checksum matches, then return the underlying reader.
    pub fn finish(self) -> Result<R> {
        self.cursor.finish()?;
        Ok(self.inner)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.cursor.payload_limit(buf.len());
        let n = self.inner.read(&mut buf[..limit])?;
        self.cursor.consume(&buf[..n]);
        Ok(n)
    }
}

/// Streaming writer for sparse images. The output does not need to be
/// seekable, so the full [`Header`] must be known up front.
pub struct SparseWriter<W> {
    inner: W,
    cursor: ChunkCursor,
}

impl<W> fmt::Debug for SparseWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseWriter")
            .field("header", &self.cursor.header.to_header())
            .field("next_chunk", &self.cursor.index)
            .field("next_block", &self.cursor.block)
            .finish_non_exhaustive()
    }
}

impl<W: Write> SparseWriter<W> {
    pub fn new(mut inner: W, header: Header) -> Result<Self> {
        if header.minor_version != MINOR_VERSION {
            return Err(Error::UnsupportedMinorVersion(header.minor_version));
        }

        let header = RawHeader::from(header);
        header.check()?;
        header
            .write_to_io(&mut inner)
            .map_err(|e| Error::DataWrite("header", e))?;

        Ok(Self {
            inner,
            cursor: ChunkCursor::new(header, CrcMode::Validate),
        })
    }

    fn write_word(&mut self, value: u32, what: &'static str) -> Result<()> {
        self.inner
            .write_all(&value.to_le_bytes())
            .map_err(|e| Error::DataWrite(what, e))
    }

    /// Write the next chunk header, along with the fill value or checksum for
    /// chunks that have one. For [`ChunkData::Data`] chunks, the payload is
    /// written afterwards through the [`Write`] implementation.
    pub fn start_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.cursor.ensure_payload_done()?;

        let index = self.cursor.index;
        if self.cursor.all_chunks_seen() {
            return Err(Error::ChunkCountMismatch {
                expected: self.cursor.header.total_chunks.get(),
                actual: index + 1,
            });
        }

        if chunk.bounds.start != self.cursor.block || chunk.bounds.end < chunk.bounds.start {
            return Err(Error::ChunkNotContiguous {
                index,
                start: chunk.bounds.start,
                expected: self.cursor.block,
            });
        }

        let kind = ChunkKind::from(chunk.data);
        let num_blocks = chunk.bounds.len();
        let size = kind.payload_size(num_blocks, self.cursor.header.blk_sz.get());
        let total_size = u32::try_from(size + u64::from(CHUNK_HEADER_SIZE))
            .map_err(|_| Error::ChunkTooLarge { index, size })?;

        self.cursor.advance(kind, num_blocks, total_size)?;

        RawChunk {
            chunk_type: kind.tag().into(),
            reserved: 0.into(),
            chunk_sz: num_blocks.into(),
            total_sz: total_size.into(),
        }
        .write_to_io(&mut self.inner)
        .map_err(|e| Error::DataWrite("chunk_header", e))?;

        match chunk.data {
            ChunkData::Data => {}
            ChunkData::Fill(value) => {
                self.write_word(value, "fill_value")?;
                self.cursor.consume_fill(value, num_blocks);
            }
            ChunkData::Hole => self.cursor.consume_fill(0, num_blocks),
            ChunkData::Crc32(checksum) => {
                self.write_word(checksum, "crc32")?;
                self.cursor.checkpoint(checksum)?;
            }
        }

        Ok(())
    }

    /// Check that every declared chunk and block was written and that the
    /// final checksum matches, then return the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.cursor.finish()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for SparseWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.cursor.payload_limit(buf.len());
        let n = self.inner.write(&buf[..limit])?;
        self.cursor.consume(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, mem};

    use assert_matches::assert_matches;

    use super::*;

    fn chunk(start: u32, end: u32, data: ChunkData) -> Chunk {
        Chunk {
            bounds: ChunkBounds { start, end },
            data,
        }
    }

    fn data(start: u32, end: u32) -> Chunk {
        chunk(start, end, ChunkData::Data)
    }

    fn fill(start: u32, end: u32, value: u32) -> Chunk {
        chunk(start, end, ChunkData::Fill(value))
    }

    fn hole(start: u32, end: u32) -> Chunk {
        chunk(start, end, ChunkData::Hole)
    }

    fn header(block_size: u32, num_blocks: u32, num_chunks: u32) -> Header {
        Header {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            block_size,
            num_blocks,
            num_chunks,
            crc32: 0,
        }
    }

    fn build(block_size: u32, chunks: &[(Chunk, &[u8])]) -> Vec<u8> {
        let num_blocks = chunks.iter().map(|(c, _)| c.bounds.len()).sum();
        let header = header(block_size, num_blocks, chunks.len() as u32);
        let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header).unwrap();

        for (chunk, payload) in chunks {
            writer.start_chunk(*chunk).unwrap();
            writer.write_all(payload).unwrap();
        }

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn header_struct_sizes() {
        assert_eq!(mem::size_of::<RawHeader>(), usize::from(FILE_HEADER_SIZE));
        assert_eq!(mem::size_of::<RawChunk>(), usize::from(CHUNK_HEADER_SIZE));
    }

    #[test]
    fn chunk_list_merges_appended_blocks() {
        let mut list = ChunkList::new();

        // Per-block appends, like an image scan.
        for block in 0..4 {
            list.push(data(block, block + 1)).unwrap();
        }
        list.push(fill(4, 5, 0)).unwrap();
        list.push(fill(5, 6, 0)).unwrap();
        list.push(hole(6, 7)).unwrap();
        list.push(data(7, 8)).unwrap();
        list.set_len(10);

        assert_eq!(list.allocated(), &[data(0, 4), fill(4, 6, 0), data(7, 8)]);
        assert_eq!(
            list.to_chunks(),
            vec![data(0, 4), fill(4, 6, 0), hole(6, 7), data(7, 8), hole(8, 10)],
        );
    }

    #[test]
    fn chunk_list_rejects_overlap() {
        let mut list = ChunkList::new();
        list.push(fill(0, 3, 0xaaaaaaaa)).unwrap();

        assert_matches!(
            list.push(data(2, 4)),
            Err(Error::OverlappingChunk {
                start: 2,
                prev_end: 3,
            })
        );
        assert_eq!(list.allocated(), &[fill(0, 3, 0xaaaaaaaa)]);
    }

    #[test]
    fn chunk_list_set_len() {
        let mut list = ChunkList::new();
        list.push(fill(0, 3, 0xaaaaaaaa)).unwrap();
        list.push(data(3, 4)).unwrap();

        list.set_len(2);
        assert_eq!(list.to_chunks(), vec![fill(0, 2, 0xaaaaaaaa)]);

        list.set_len(3);
        assert_eq!(list.to_chunks(), vec![fill(0, 2, 0xaaaaaaaa), hole(2, 3)]);

        list.set_len(0);
        assert_eq!(list.to_chunks(), vec![]);
    }

    #[test]
    fn reader_rejects_bad_header() {
        let mut image = build(4, &[(data(0, 1), b"abcd")]);

        image[0] = 0;
        assert_matches!(
            SparseReader::new(Cursor::new(&image), CrcMode::Ignore),
            Err(Error::InvalidMagic(_))
        );

        image[0] = 0x3a;
        image[4] = 2;
        assert_matches!(
            SparseReader::new(Cursor::new(&image), CrcMode::Ignore),
            Err(Error::UnsupportedMajorVersion(2))
        );

        image[4] = 1;
        image[8] = 20;
        assert_matches!(
            SparseReader::new(Cursor::new(&image), CrcMode::Ignore),
            Err(Error::HeaderTooSmall {
                what: "File",
                size: 20,
                min: 28,
            })
        );

        image[8] = 28;
        image[10] = 8;
        assert_matches!(
            SparseReader::new(Cursor::new(&image), CrcMode::Ignore),
            Err(Error::HeaderTooSmall {
                what: "Chunk",
                size: 8,
                min: 12,
            })
        );

        image[10] = 12;
        image[12] = 6;
        assert_matches!(
            SparseReader::new(Cursor::new(&image), CrcMode::Ignore),
            Err(Error::InvalidBlockSize(6))
        );
    }

    #[test]
    fn reader_reports_truncated_payload() {
        let image = build(4, &[(data(0, 2), b"abcdefgh")]);
        let truncated = &image[..image.len() - 3];

        let mut reader = SparseReader::new(Cursor::new(truncated), CrcMode::Ignore).unwrap();
        assert_eq!(reader.next_chunk().unwrap(), Some(data(0, 2)));

        let mut buf = [0u8; 4];
        reader.read_payload(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_matches!(
            reader.read_payload(&mut buf),
            Err(Error::TruncatedChunk { index: 0 })
        );
    }

    #[test]
    fn reader_reports_truncated_chunk_header() {
        let image = build(4, &[(data(0, 1), b"abcd"), (fill(1, 2, 7), b"")]);

        // Cut inside the second chunk's header.
        let truncated = &image[..28 + 12 + 4 + 6];
        let mut reader = SparseReader::new(Cursor::new(truncated), CrcMode::Ignore).unwrap();
        reader.next_chunk().unwrap();
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_matches!(reader.next_chunk(), Err(Error::TruncatedChunk { index: 1 }));

        // Cut inside the fill value.
        let truncated = &image[..image.len() - 2];
        let mut reader = SparseReader::new(Cursor::new(truncated), CrcMode::Ignore).unwrap();
        reader.next_chunk().unwrap();
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_matches!(reader.next_chunk(), Err(Error::TruncatedChunk { index: 1 }));
    }

    #[test]
    fn reader_requires_payload_consumed() {
        let image = build(4, &[(data(0, 2), b"abcdefgh")]);

        let mut reader = SparseReader::new(Cursor::new(&image), CrcMode::Ignore).unwrap();
        reader.next_chunk().unwrap();

        let mut buf = [0u8; 3];
        reader.read_payload(&mut buf).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::PendingPayload {
                index: 0,
                remain: 5,
            })
        );
    }

    #[test]
    fn reader_rejects_missing_blocks() {
        let mut image = build(4, &[(data(0, 1), b"abcd")]);
        // Bump total_blks from 1 to 2.
        image[16] = 2;

        let mut reader = SparseReader::new(Cursor::new(&image), CrcMode::Ignore).unwrap();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            if chunk.data == ChunkData::Data {
                io::copy(&mut reader, &mut io::sink()).unwrap();
            }
        }

        assert_matches!(
            reader.finish(),
            Err(Error::BlockCountMismatch {
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn reader_rejects_bad_chunk_headers() {
        let image = build(4, &[(data(0, 1), b"abcd")]);

        let mut bad_type = image.clone();
        bad_type[28] = 0xc5;
        let mut reader = SparseReader::new(Cursor::new(&bad_type), CrcMode::Ignore).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::UnknownChunkType {
                index: 0,
                tag: 0xcac5,
            })
        );

        let mut bad_size = image.clone();
        bad_size[28 + 8] = 15;
        let mut reader = SparseReader::new(Cursor::new(&bad_size), CrcMode::Ignore).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::ChunkSizeMismatch {
                index: 0,
                expected: 16,
                actual: 15,
            })
        );

        let mut past_end = image;
        past_end[28 + 4] = 2;
        let mut reader = SparseReader::new(Cursor::new(&past_end), CrcMode::Ignore).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::ChunkPastEnd {
                index: 0,
                end: 2,
                total: 1,
                ..
            })
        );
    }

    #[test]
    fn reader_validates_crc_checkpoint() {
        let mut hasher = Hasher::new();
        hasher.update(b"abcd");
        let good = hasher.finalize();

        let mut image = build(
            4,
            &[
                (data(0, 1), b"abcd"),
                (chunk(1, 1, ChunkData::Crc32(good)), b""),
            ],
        );

        // Corrupt the payload.
        image[28 + 12] = b'x';

        let mut reader = SparseReader::new(Cursor::new(&image), CrcMode::Validate).unwrap();
        reader.next_chunk().unwrap();
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_matches!(
            reader.next_chunk(),
            Err(Error::MismatchedCrc32Checkpoint { .. })
        );

        let mut reader = SparseReader::new(Cursor::new(&image), CrcMode::Ignore).unwrap();
        reader.next_chunk().unwrap();
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_eq!(
            reader.next_chunk().unwrap().map(|c| c.data),
            Some(ChunkData::Crc32(good)),
        );
    }

    #[test]
    fn writer_enforces_layout() {
        let mut writer = SparseWriter::new(Cursor::new(Vec::new()), header(4, 2, 2)).unwrap();
        assert_matches!(
            writer.start_chunk(data(1, 2)),
            Err(Error::ChunkNotContiguous {
                index: 0,
                start: 1,
                expected: 0,
            })
        );
        assert_matches!(
            writer.start_chunk(chunk(0, 1, ChunkData::Crc32(0))),
            Err(Error::NonEmptyCrc32Chunk {
                index: 0,
                num_blocks: 1,
            })
        );

        writer.start_chunk(data(0, 1)).unwrap();
        writer.write_all(b"ab").unwrap();
        assert_matches!(
            writer.start_chunk(hole(1, 2)),
            Err(Error::PendingPayload {
                index: 0,
                remain: 2,
            })
        );

        // Payload writes stop at the end of the chunk.
        assert_eq!(writer.write(b"cdef").unwrap(), 2);
        writer.start_chunk(hole(1, 2)).unwrap();
        assert_matches!(
            writer.start_chunk(hole(2, 2)),
            Err(Error::ChunkCountMismatch {
                expected: 2,
                actual: 3,
            })
        );

        writer.finish().unwrap();

        let writer = SparseWriter::new(Cursor::new(Vec::new()), header(4, 2, 1)).unwrap();
        assert_matches!(
            writer.finish(),
            Err(Error::ChunkCountMismatch {
                expected: 1,
                actual: 0,
            })
        );

        let mut newer = header(4, 0, 0);
        newer.minor_version = 1;
        assert_matches!(
            SparseWriter::new(Cursor::new(Vec::new()), newer),
            Err(Error::UnsupportedMinorVersion(1))
        );
    }
}
