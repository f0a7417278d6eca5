// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming compressors and decompressors that push their output into a
//! caller-provided sink.
//!
//! Both directions follow the same lifecycle: [`Compressor::prepare`] (or
//! [`Decompressor::prepare`]) installs the sink, any number of
//! `compress`/`decompress` calls feed data, and `finalize` flushes everything
//! and returns the instance to the unprepared state so it can be reused.

use std::{
    fmt, mem,
    io::{self, Write},
    str::FromStr,
};

use lz4_flex::frame::FrameEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh32::{Xxh32, xxh32};

use crate::format::ErrorKind;

/// Magic value at the start of every LZ4 frame.
const LZ4_FRAME_MAGIC: u32 = 0x184d2204;
/// Magic values for skippable frames occupy `0x184d2a50..=0x184d2a5f`.
const LZ4_SKIPPABLE_MAGIC: u32 = 0x184d2a50;
const LZ4_SKIPPABLE_MASK: u32 = 0xfffffff0;
/// The only frame format version defined for LZ4 frames.
const LZ4_FRAME_VERSION: u8 = 1;
/// Linked blocks may reference up to this many bytes of prior output.
const LZ4_WINDOW_SIZE: usize = 64 * 1024;
/// Block size field bit indicating that the block is stored uncompressed.
const LZ4_BLOCK_UNCOMPRESSED: u32 = 0x8000_0000;

/// Default size of the decompressor's scratch buffer.
pub const DEFAULT_SCRATCH_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    // State errors.
    #[error("Already prepared")]
    AlreadyPrepared,
    #[error("Not prepared")]
    NotPrepared,
    #[error("Received more data after the end of the LZ4 frame")]
    AlreadyFinished,
    // Framing errors.
    #[error("Input ended before the end of the LZ4 frame")]
    TruncatedFrame,
    #[error("Invalid LZ4 frame magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported LZ4 frame version: {0}")]
    UnsupportedVersion(u8),
    #[error("Reserved bits set in LZ4 frame descriptor: FLG={flg:#04x}, BD={bd:#04x}")]
    ReservedBits { flg: u8, bd: u8 },
    #[error("Unsupported LZ4 maximum block size ID: {0}")]
    UnsupportedBlockSize(u8),
    #[error("LZ4 frames with dictionaries are not supported")]
    DictionaryNotSupported,
    #[error("Expected LZ4 header checksum {expected:#04x}, but have {actual:#04x}")]
    HeaderChecksum { expected: u8, actual: u8 },
    #[error("LZ4 block size {size} exceeds frame maximum {max}")]
    BlockTooLarge { size: u32, max: usize },
    #[error("Expected LZ4 block checksum {expected:#010x}, but have {actual:#010x}")]
    BlockChecksum { expected: u32, actual: u32 },
    #[error("Expected LZ4 content checksum {expected:#010x}, but have {actual:#010x}")]
    ContentChecksum { expected: u32, actual: u32 },
    #[error("Expected LZ4 content size {expected}, but have {actual}")]
    ContentSize { expected: u64, actual: u64 },
    #[error("Failed to decompress LZ4 block")]
    Block(#[source] lz4_flex::block::DecompressError),
    #[error("Failed to finish LZ4 frame")]
    Encoder(#[source] lz4_flex::frame::Error),
    // Errors returned by the sink are passed through as is.
    #[error(transparent)]
    Sink(io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyPrepared | Self::NotPrepared | Self::AlreadyFinished => {
                ErrorKind::StateError
            }
            _ => ErrorKind::CompressionError,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Destination for produced bytes. Errors are propagated to the caller of the
/// [`Compressor`] or [`Decompressor`] method that triggered the call.
pub type Sink<'a> = Box<dyn FnMut(&[u8]) -> io::Result<()> + 'a>;

/// Result of feeding compressed data to a [`Decompressor`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecompressResult {
    /// The end of the compressed stream was reached. No further input should
    /// be supplied.
    pub finished: bool,
}

pub trait Compressor<'a> {
    /// Install the sink. Fails if already prepared and not finalized.
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()>;

    /// Compress `data`. The sink may be invoked any number of times.
    fn compress(&mut self, data: &[u8]) -> Result<()>;

    /// Flush all remaining output to the sink and release it.
    fn finalize(&mut self) -> Result<()>;
}

pub trait Decompressor<'a> {
    /// Install the sink. Fails if already prepared and not finalized.
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()>;

    /// Decompress `data`. The sink may be invoked any number of times.
    fn decompress(&mut self, data: &[u8]) -> Result<DecompressResult>;

    /// Release the sink. Fails if the compressed stream was not complete.
    fn finalize(&mut self) -> Result<()>;
}

/// Adapter for handing a [`Sink`] to APIs that expect [`Write`].
struct SinkWriter<'a>(Sink<'a>);

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.0)(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Compressor that emits a single LZ4 frame per prepare/finalize cycle.
#[derive(Default)]
pub struct Lz4Compressor<'a> {
    encoder: Option<FrameEncoder<SinkWriter<'a>>>,
}

impl Lz4Compressor<'_> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> Compressor<'a> for Lz4Compressor<'a> {
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()> {
        if self.encoder.is_some() {
            return Err(Error::AlreadyPrepared);
        }

        self.encoder = Some(FrameEncoder::new(SinkWriter(sink)));

        Ok(())
    }

    fn compress(&mut self, data: &[u8]) -> Result<()> {
        let encoder = self.encoder.as_mut().ok_or(Error::NotPrepared)?;

        // The encoder only fails when the underlying writer does.
        encoder.write_all(data).map_err(Error::Sink)
    }

    fn finalize(&mut self) -> Result<()> {
        let encoder = self.encoder.take().ok_or(Error::NotPrepared)?;

        encoder.finish().map_err(|e| match e {
            lz4_flex::frame::Error::IoError(e) => Error::Sink(e),
            e => Error::Encoder(e),
        })?;

        Ok(())
    }
}

/// Compressor that hands data to the sink unchanged.
#[derive(Default)]
pub struct NoopCompressor<'a> {
    sink: Option<Sink<'a>>,
}

impl NoopCompressor<'_> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> Compressor<'a> for NoopCompressor<'a> {
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()> {
        if self.sink.is_some() {
            return Err(Error::AlreadyPrepared);
        }

        self.sink = Some(sink);

        Ok(())
    }

    fn compress(&mut self, data: &[u8]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(Error::NotPrepared)?;
        sink(data).map_err(Error::Sink)
    }

    fn finalize(&mut self) -> Result<()> {
        self.sink.take().ok_or(Error::NotPrepared)?;
        Ok(())
    }
}

/// Decompressor that hands data to the sink unchanged. Since there is no
/// framing, it never reports the stream as finished.
#[derive(Default)]
pub struct NoopDecompressor<'a> {
    sink: Option<Sink<'a>>,
}

impl NoopDecompressor<'_> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> Decompressor<'a> for NoopDecompressor<'a> {
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()> {
        if self.sink.is_some() {
            return Err(Error::AlreadyPrepared);
        }

        self.sink = Some(sink);

        Ok(())
    }

    fn decompress(&mut self, data: &[u8]) -> Result<DecompressResult> {
        let sink = self.sink.as_mut().ok_or(Error::NotPrepared)?;
        sink(data).map_err(Error::Sink)?;

        Ok(DecompressResult::default())
    }

    fn finalize(&mut self) -> Result<()> {
        self.sink.take().ok_or(Error::NotPrepared)?;
        Ok(())
    }
}

/// Position within the LZ4 frame format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Magic,
    SkippableSize,
    Skip(u64),
    Descriptor,
    BlockHeader,
    Block { size: usize, uncompressed: bool },
    ContentChecksum,
    Finished,
}

/// Parameters from the frame descriptor plus running totals for the frame.
struct Frame {
    block_max: usize,
    linked: bool,
    block_checksums: bool,
    content_checksum: bool,
    content_size: Option<u64>,
    hasher: Xxh32,
    produced: u64,
    /// Most recent output, used as the dictionary for linked blocks.
    window: Vec<u8>,
}

impl Frame {
    fn emit(&mut self, sink: &mut Sink<'_>, data: &[u8]) -> Result<()> {
        if self.content_checksum {
            self.hasher.update(data);
        }

        if self.linked {
            self.window.extend_from_slice(data);

            if self.window.len() > LZ4_WINDOW_SIZE {
                let excess = self.window.len() - LZ4_WINDOW_SIZE;
                self.window.drain(..excess);
            }
        }

        self.produced += data.len() as u64;

        sink(data).map_err(Error::Sink)
    }

    fn finish(&self) -> Result<()> {
        if let Some(expected) = self.content_size {
            if expected != self.produced {
                return Err(Error::ContentSize {
                    expected,
                    actual: self.produced,
                });
            }
        }

        Ok(())
    }
}

/// Push-driven LZ4 frame decompressor.
///
/// Input can be supplied in arbitrarily sized pieces. Only the compressed data
/// for a single block is ever buffered. Decoding stops at the end of the first
/// non-skippable frame.
pub struct Lz4Decompressor<'a> {
    sink: Option<Sink<'a>>,
    state: State,
    frame: Option<Frame>,
    /// Input that has not formed a complete unit yet.
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl fmt::Debug for Lz4Decompressor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lz4Decompressor")
            .field("prepared", &self.sink.is_some())
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("scratch", &self.scratch.len())
            .finish_non_exhaustive()
    }
}

impl Default for Lz4Decompressor<'_> {
    fn default() -> Self {
        Self::with_size_hint(DEFAULT_SCRATCH_SIZE)
    }
}

impl Lz4Decompressor<'_> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decompressor whose scratch buffer is initially `size_hint`
    /// bytes. The buffer still grows if a frame declares a larger maximum block
    /// size.
    pub fn with_size_hint(size_hint: usize) -> Self {
        Self {
            sink: None,
            state: State::Magic,
            frame: None,
            pending: Vec::new(),
            scratch: vec![0u8; size_hint],
        }
    }

    /// Consume one unit from the start of `input`. Returns the number of bytes
    /// consumed or [`None`] if more input is needed.
    fn step(&mut self, input: &[u8]) -> Result<Option<usize>> {
        let Self {
            sink,
            state,
            frame,
            scratch,
            ..
        } = self;
        let sink = sink.as_mut().ok_or(Error::NotPrepared)?;

        match *state {
            State::Magic => {
                let Some(magic) = read_u32(input, 0) else {
                    return Ok(None);
                };

                if magic == LZ4_FRAME_MAGIC {
                    *state = State::Descriptor;
                } else if magic & LZ4_SKIPPABLE_MASK == LZ4_SKIPPABLE_MAGIC {
                    *state = State::SkippableSize;
                } else {
                    return Err(Error::InvalidMagic(magic));
                }

                Ok(Some(4))
            }
            State::SkippableSize => {
                let Some(size) = read_u32(input, 0) else {
                    return Ok(None);
                };

                *state = State::Skip(size.into());

                Ok(Some(4))
            }
            State::Skip(remain) => {
                if remain == 0 {
                    *state = State::Magic;
                    return Ok(Some(0));
                } else if input.is_empty() {
                    return Ok(None);
                }

                let n = remain.min(input.len() as u64);
                *state = State::Skip(remain - n);

                Ok(Some(n as usize))
            }
            State::Descriptor => {
                let (Some(&flg), Some(&bd)) = (input.first(), input.get(1)) else {
                    return Ok(None);
                };

                let version = flg >> 6;
                if version != LZ4_FRAME_VERSION {
                    return Err(Error::UnsupportedVersion(version));
                } else if flg & 0x02 != 0 || bd & 0x8f != 0 {
                    return Err(Error::ReservedBits { flg, bd });
                }

                let has_content_size = flg & 0x08 != 0;
                let has_dict_id = flg & 0x01 != 0;
                let size = 2 + if has_content_size { 8 } else { 0 } + if has_dict_id { 4 } else { 0 };

                let Some(&expected) = input.get(size) else {
                    return Ok(None);
                };

                let actual = (xxh32(&input[..size], 0) >> 8) as u8;
                if expected != actual {
                    return Err(Error::HeaderChecksum { expected, actual });
                } else if has_dict_id {
                    return Err(Error::DictionaryNotSupported);
                }

                let block_max = match (bd >> 4) & 0x7 {
                    4 => 64 * 1024,
                    5 => 256 * 1024,
                    6 => 1024 * 1024,
                    7 => 4 * 1024 * 1024,
                    id => return Err(Error::UnsupportedBlockSize(id)),
                };

                if scratch.len() < block_max {
                    scratch.resize(block_max, 0);
                }

                *frame = Some(Frame {
                    block_max,
                    linked: flg & 0x20 == 0,
                    block_checksums: flg & 0x10 != 0,
                    content_checksum: flg & 0x04 != 0,
                    content_size: has_content_size.then(|| read_u64(input, 2)).flatten(),
                    hasher: Xxh32::new(0),
                    produced: 0,
                    window: Vec::new(),
                });
                *state = State::BlockHeader;

                Ok(Some(size + 1))
            }
            State::BlockHeader => {
                let Some(raw) = read_u32(input, 0) else {
                    return Ok(None);
                };
                let frame = frame.as_ref().ok_or(Error::TruncatedFrame)?;

                if raw == 0 {
                    if frame.content_checksum {
                        *state = State::ContentChecksum;
                    } else {
                        frame.finish()?;
                        *state = State::Finished;
                    }
                } else {
                    let size = raw & !LZ4_BLOCK_UNCOMPRESSED;
                    if size as usize > frame.block_max {
                        return Err(Error::BlockTooLarge {
                            size,
                            max: frame.block_max,
                        });
                    }

                    *state = State::Block {
                        size: size as usize,
                        uncompressed: raw & LZ4_BLOCK_UNCOMPRESSED != 0,
                    };
                }

                Ok(Some(4))
            }
            State::Block { size, uncompressed } => {
                let frame = frame.as_mut().ok_or(Error::TruncatedFrame)?;
                let total = size + if frame.block_checksums { 4 } else { 0 };

                if input.len() < total {
                    return Ok(None);
                }

                let data = &input[..size];

                if let Some(expected) = read_u32(&input[size..total], 0) {
                    let actual = xxh32(data, 0);
                    if expected != actual {
                        return Err(Error::BlockChecksum { expected, actual });
                    }
                }

                if uncompressed {
                    frame.emit(sink, data)?;
                } else {
                    let output = &mut scratch[..frame.block_max];
                    let n = if frame.linked {
                        lz4_flex::block::decompress_into_with_dict(data, output, &frame.window)
                    } else {
                        lz4_flex::block::decompress_into(data, output)
                    }
                    .map_err(Error::Block)?;

                    frame.emit(sink, &output[..n])?;
                }

                *state = State::BlockHeader;

                Ok(Some(total))
            }
            State::ContentChecksum => {
                let Some(expected) = read_u32(input, 0) else {
                    return Ok(None);
                };
                let frame = frame.as_ref().ok_or(Error::TruncatedFrame)?;

                let actual = frame.hasher.digest();
                if expected != actual {
                    return Err(Error::ContentChecksum { expected, actual });
                }

                frame.finish()?;
                *state = State::Finished;

                Ok(Some(4))
            }
            State::Finished => Ok(None),
        }
    }
}

impl Lz4Decompressor<'_> {
    /// Process as many complete units of `input` as possible. Returns the
    /// number of bytes consumed.
    fn step_all(&mut self, input: &[u8]) -> (usize, Result<()>) {
        let mut offset = 0;

        loop {
            match self.step(&input[offset..]) {
                Ok(Some(n)) => offset += n,
                Ok(None) => return (offset, Ok(())),
                Err(e) => return (offset, Err(e)),
            }
        }
    }
}

impl<'a> Decompressor<'a> for Lz4Decompressor<'a> {
    fn prepare(&mut self, sink: Sink<'a>) -> Result<()> {
        if self.sink.is_some() {
            return Err(Error::AlreadyPrepared);
        }

        self.sink = Some(sink);
        self.state = State::Magic;
        self.frame = None;
        self.pending.clear();

        Ok(())
    }

    fn decompress(&mut self, data: &[u8]) -> Result<DecompressResult> {
        if self.sink.is_none() {
            return Err(Error::NotPrepared);
        } else if self.state == State::Finished {
            if data.is_empty() {
                return Ok(DecompressResult { finished: true });
            }

            return Err(Error::AlreadyFinished);
        }

        // Anything after the end of the frame is ignored.
        let result = if self.pending.is_empty() {
            let (offset, result) = self.step_all(data);
            if self.state != State::Finished {
                self.pending.extend_from_slice(&data[offset..]);
            }

            result
        } else {
            let mut input = mem::take(&mut self.pending);
            input.extend_from_slice(data);

            let (offset, result) = self.step_all(&input);
            if self.state != State::Finished {
                input.drain(..offset);
                self.pending = input;
            }

            result
        };

        result?;

        Ok(DecompressResult {
            finished: self.state == State::Finished,
        })
    }

    fn finalize(&mut self) -> Result<()> {
        self.sink.take().ok_or(Error::NotPrepared)?;

        let finished = self.state == State::Finished;

        self.state = State::Magic;
        self.frame = None;
        self.pending.clear();

        if !finished {
            return Err(Error::TruncatedFrame);
        }

        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

/// Compression applied to the extent data of a sparse image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionSchema {
    #[default]
    None,
    Lz4,
}

impl CompressionSchema {
    pub fn compressor<'a>(self) -> Box<dyn Compressor<'a> + 'a> {
        match self {
            Self::None => Box::new(NoopCompressor::new()),
            Self::Lz4 => Box::new(Lz4Compressor::new()),
        }
    }

    pub fn decompressor<'a>(self) -> Box<dyn Decompressor<'a> + 'a> {
        match self {
            Self::None => Box::new(NoopDecompressor::new()),
            Self::Lz4 => Box::new(Lz4Decompressor::new()),
        }
    }
}

impl fmt::Display for CompressionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
        })
    }
}

impl FromStr for CompressionSchema {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            s => Err(format!("Unknown compression schema: {s:?}")),
        }
    }
}
