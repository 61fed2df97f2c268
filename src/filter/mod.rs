// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The tile filter pipeline: an ordered chain of per-chunk transforms applied
//! on write and reversed on read (`spec.md` §4.1). Each concrete filter is a
//! variant of [`Filter`], dispatched through the [`FilterOp`] trait via
//! `enum_dispatch` rather than a `Box<dyn Filter>` — the same trait-object-free
//! polymorphism the teacher uses for its guard types (`src/iter_guard.rs`'s
//! `IterGuard`/`IterGuardImpl`).

mod bit_width_reduction;
mod checksum;
mod compression;
mod double_delta;
mod positive_delta;
mod shuffle;
mod webp;

pub use bit_width_reduction::BitWidthReductionFilter;
pub use checksum::{ChecksumMd5Filter, ChecksumSha256Filter};
pub use compression::{Bzip2Filter, GzipFilter, Lz4Filter, RleFilter, ZstdFilter};
pub use compression::{BloscAlgo, BloscFilter};
pub use double_delta::DoubleDeltaFilter;
pub use positive_delta::PositiveDeltaFilter;
pub use shuffle::{BitShuffleFilter, ByteShuffleFilter};
pub use webp::{WebpFilter, WebpInputFormat};

use crate::buffer::{Buffer, ConstBuffer};
use crate::checksum::Checksum;
use crate::coding::{read_bytes, write_bytes, Decode, DecodeError, Encode, EncodeError};
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::slice::Slice;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use std::io::{Read, Write};

/// Default tile-chunk size in bytes, overridable via `Config::tile_chunk_size`.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Per-tile context a filter needs to interpret its chunk as typed values.
#[derive(Copy, Clone, Debug)]
pub struct FilterContext {
    pub datatype: Datatype,
}

impl FilterContext {
    #[must_use]
    pub fn new(datatype: Datatype) -> Self {
        Self { datatype }
    }

    /// Fixed byte width of one cell, or an error for filters that require one
    /// (most of the numeric filters are undefined over `StringAscii`).
    fn cell_width(&self) -> Result<usize> {
        self.datatype
            .byte_width()
            .ok_or_else(|| Error::Codec("filter requires a fixed-width datatype".into()))
    }
}

/// A single forward/reverse transform applied to one tile chunk.
///
/// `forward` returns `(metadata, payload)`: `payload` feeds the next filter
/// in the pipeline (or becomes the stored bytes for the last filter), while
/// `metadata` is opaque filter-private state the matching `reverse` call
/// needs (e.g. a digest, or a packed-delta header).
///
/// `reverse` is given the `metadata` produced by the matching `forward` call
/// and the current payload, and must reconstruct exactly `original_size`
/// bytes of the filter's input.
#[enum_dispatch]
pub trait FilterOp {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)>;

    fn reverse(
        &self,
        metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>>;

    /// Stable tag used to persist the filter list alongside the schema.
    fn kind_tag(&self) -> u8;
}

/// One configured filter. Constructed once per schema attribute/dimension
/// filter list and reused across every tile write/read.
#[enum_dispatch(FilterOp)]
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    DoubleDelta(DoubleDeltaFilter),
    Gzip(GzipFilter),
    Zstd(ZstdFilter),
    Lz4(Lz4Filter),
    Bzip2(Bzip2Filter),
    Rle(RleFilter),
    Blosc(BloscFilter),
    Webp(WebpFilter),
    BitWidthReduction(BitWidthReductionFilter),
    PositiveDelta(PositiveDeltaFilter),
    BitShuffle(BitShuffleFilter),
    ByteShuffle(ByteShuffleFilter),
    ChecksumMd5(ChecksumMd5Filter),
    ChecksumSha256(ChecksumSha256Filter),
}

impl Encode for Filter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(self.kind_tag())?;
        match self {
            Self::DoubleDelta(f) => f.encode_into(writer),
            Self::Gzip(f) => f.encode_into(writer),
            Self::Zstd(f) => f.encode_into(writer),
            Self::Lz4(f) => f.encode_into(writer),
            Self::Bzip2(f) => f.encode_into(writer),
            Self::Rle(f) => f.encode_into(writer),
            Self::Blosc(f) => f.encode_into(writer),
            Self::Webp(f) => f.encode_into(writer),
            Self::BitWidthReduction(f) => f.encode_into(writer),
            Self::PositiveDelta(f) => f.encode_into(writer),
            Self::BitShuffle(f) => f.encode_into(writer),
            Self::ByteShuffle(f) => f.encode_into(writer),
            Self::ChecksumMd5(f) => f.encode_into(writer),
            Self::ChecksumSha256(f) => f.encode_into(writer),
        }
    }
}

impl Decode for Filter {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::DoubleDelta(DoubleDeltaFilter::decode_from(reader)?),
            1 => Self::Gzip(GzipFilter::decode_from(reader)?),
            2 => Self::Zstd(ZstdFilter::decode_from(reader)?),
            3 => Self::Lz4(Lz4Filter::decode_from(reader)?),
            4 => Self::Bzip2(Bzip2Filter::decode_from(reader)?),
            5 => Self::Rle(RleFilter::decode_from(reader)?),
            6 => Self::Blosc(BloscFilter::decode_from(reader)?),
            7 => Self::Webp(WebpFilter::decode_from(reader)?),
            8 => Self::BitWidthReduction(BitWidthReductionFilter::decode_from(reader)?),
            9 => Self::PositiveDelta(PositiveDeltaFilter::decode_from(reader)?),
            10 => Self::BitShuffle(BitShuffleFilter::decode_from(reader)?),
            11 => Self::ByteShuffle(ByteShuffleFilter::decode_from(reader)?),
            12 => Self::ChecksumMd5(ChecksumMd5Filter::decode_from(reader)?),
            13 => Self::ChecksumSha256(ChecksumSha256Filter::decode_from(reader)?),
            tag => return Err(DecodeError::InvalidTag(("Filter", tag))),
        })
    }
}

/// An ordered filter list, applied forward on write and reversed on read.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterPipeline {
    filters: Vec<Filter>,
}

impl FilterPipeline {
    #[must_use]
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Splits `tile` into fixed-size chunks, runs the filter list forward on
    /// each, and lays out the result as `[num_chunks][ per chunk:
    /// original_size, filtered_size, metadata_size, checksum, metadata,
    /// filtered_bytes ]`. The checksum is an xxh3-64 of `metadata ++
    /// filtered_bytes`, verified on [`Self::reverse_tile`].
    pub fn forward_tile(
        &self,
        tile: &[u8],
        chunk_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        let chunk_size = chunk_size.max(1);
        let mut out = Buffer::new();

        let chunks: Vec<&[u8]> = if tile.is_empty() {
            Vec::new()
        } else {
            tile.chunks(chunk_size).collect()
        };

        out.write_u32::<LittleEndian>(chunks.len() as u32)?;
        for chunk in chunks {
            let (metadata, payload) = self.forward_chunk(chunk, ctx)?;
            let mut digest_input = Vec::with_capacity(metadata.len() + payload.len());
            digest_input.extend_from_slice(&metadata);
            digest_input.extend_from_slice(&payload);
            let checksum = Checksum::from_bytes(&digest_input);

            out.write_u32::<LittleEndian>(chunk.len() as u32)?;
            out.write_u32::<LittleEndian>(payload.len() as u32)?;
            out.write_u32::<LittleEndian>(metadata.len() as u32)?;
            checksum.write_into(&mut out)?;
            out.append(&metadata);
            out.append(&payload);
        }
        Ok(out.into_vec())
    }

    /// Inverse of [`Self::forward_tile`]: fails the whole tile read if any
    /// chunk's checksum doesn't match its bytes, or if any chunk's reverse
    /// pass fails.
    pub fn reverse_tile(&self, filtered: &[u8], ctx: &FilterContext) -> Result<Vec<u8>> {
        let mut cur = ConstBuffer::new(Slice::from(filtered));
        let num_chunks = cur.read_u32::<LittleEndian>()?;
        let mut out = Buffer::new();

        for _ in 0..num_chunks {
            let original_size = cur.read_u32::<LittleEndian>()? as usize;
            let filtered_size = cur.read_u32::<LittleEndian>()? as usize;
            let metadata_size = cur.read_u32::<LittleEndian>()? as usize;
            let expected = Checksum::read_from(&mut cur)?;
            let metadata = cur.take(metadata_size)?.to_vec();
            let payload = cur.take(filtered_size)?.to_vec();

            let mut digest_input = Vec::with_capacity(metadata.len() + payload.len());
            digest_input.extend_from_slice(&metadata);
            digest_input.extend_from_slice(&payload);
            let got = Checksum::from_bytes(&digest_input);
            if got != expected {
                return Err(Error::InvalidChecksum { got, expected });
            }

            let chunk = self.reverse_chunk(&metadata, &payload, original_size, ctx)?;
            out.append(&chunk);
        }
        Ok(out.into_vec())
    }

    /// Runs every filter forward in order. The pipeline's own metadata frame
    /// records, for each filter, the payload length *before* that filter ran
    /// (so reverse knows each stage's reconstruction target) alongside the
    /// filter's own opaque metadata.
    fn forward_chunk(&self, chunk: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut frame = Buffer::new();
        let mut payload = chunk.to_vec();

        for filter in &self.filters {
            let size_before = payload.len() as u32;
            let (meta, next) = filter.forward(&payload, ctx)?;
            frame.write_u32::<LittleEndian>(size_before)?;
            write_bytes(&mut frame, &meta)?;
            payload = next;
        }

        Ok((frame.into_vec(), payload))
    }

    fn reverse_chunk(
        &self,
        metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        let mut frame = ConstBuffer::new(Slice::from(metadata));
        let mut stages = Vec::with_capacity(self.filters.len());
        for _ in &self.filters {
            let size_before = frame.read_u32::<LittleEndian>()? as usize;
            let meta = read_bytes(&mut frame, "filter chunk metadata")?;
            stages.push((size_before, meta));
        }

        let mut cur = payload.to_vec();
        for (filter, (size_before, meta)) in self.filters.iter().zip(stages.iter()).rev() {
            cur = filter.reverse(meta, &cur, *size_before, ctx)?;
        }

        if cur.len() != original_size {
            return Err(Error::Codec(format!(
                "filter pipeline reverse produced {} bytes, expected {original_size}",
                cur.len()
            )));
        }
        Ok(cur)
    }
}

impl Encode for FilterPipeline {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.filters.len() as u32)?;
        for filter in &self.filters {
            filter.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for FilterPipeline {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let n = reader.read_u32::<LittleEndian>()?;
        let mut filters = Vec::with_capacity(n as usize);
        for _ in 0..n {
            filters.push(Filter::decode_from(reader)?);
        }
        Ok(Self { filters })
    }
}
