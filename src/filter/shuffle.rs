// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `BitShuffle`/`ByteShuffle` filters (`spec.md` §4.1): transpose the
//! bit-planes or byte-planes of a chunk's fixed-width elements, the general
//! shuffle technique HDF5 and Blosc both use to expose byte-level
//! redundancy to a following compressor.

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteShuffleFilter;

impl FilterOp for ByteShuffleFilter {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        let width = ctx.cell_width()?;
        if input.len() % width != 0 {
            return Err(Error::Codec(
                "ByteShuffle input is not a whole number of cells".into(),
            ));
        }
        let count = input.len() / width;
        let mut out = vec![0u8; input.len()];
        for (i, cell) in input.chunks_exact(width).enumerate() {
            for (plane, byte) in cell.iter().enumerate() {
                out[plane * count + i] = *byte;
            }
        }
        Ok((Vec::new(), out))
    }

    fn reverse(
        &self,
        _metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        let width = ctx.cell_width()?;
        if payload.len() != original_size || payload.len() % width != 0 {
            return Err(Error::Codec(
                "ByteShuffle payload does not match the expected chunk size".into(),
            ));
        }
        let count = payload.len() / width;
        let mut out = vec![0u8; payload.len()];
        for plane in 0..width {
            for i in 0..count {
                out[i * width + plane] = payload[plane * count + i];
            }
        }
        Ok(out)
    }

    fn kind_tag(&self) -> u8 {
        11
    }
}

impl Encode for ByteShuffleFilter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for ByteShuffleFilter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitShuffleFilter;

impl FilterOp for BitShuffleFilter {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        let width = ctx.cell_width()?;
        if input.len() % width != 0 {
            return Err(Error::Codec(
                "BitShuffle input is not a whole number of cells".into(),
            ));
        }
        let count = input.len() / width;
        let total_bits = count * width * 8;
        let mut out = vec![0u8; input.len()];

        for bit in 0..total_bits {
            let elem = bit / (width * 8);
            let bit_in_elem = bit % (width * 8);
            let src_byte = elem * width + bit_in_elem / 8;
            let src_bit = bit_in_elem % 8;
            let value = (input[src_byte] >> src_bit) & 1;

            let dst_byte = bit / 8;
            let dst_bit = bit % 8;
            if value == 1 {
                out[dst_byte] |= 1 << dst_bit;
            }
        }
        Ok((Vec::new(), out))
    }

    fn reverse(
        &self,
        _metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        let width = ctx.cell_width()?;
        if payload.len() != original_size || payload.len() % width != 0 {
            return Err(Error::Codec(
                "BitShuffle payload does not match the expected chunk size".into(),
            ));
        }
        let count = payload.len() / width;
        let total_bits = count * width * 8;
        let mut out = vec![0u8; payload.len()];

        for bit in 0..total_bits {
            let src_byte = bit / 8;
            let src_bit = bit % 8;
            let value = (payload[src_byte] >> src_bit) & 1;

            let elem = bit / (width * 8);
            let bit_in_elem = bit % (width * 8);
            let dst_byte = elem * width + bit_in_elem / 8;
            let dst_bit = bit_in_elem % 8;
            if value == 1 {
                out[dst_byte] |= 1 << dst_bit;
            }
        }
        Ok(out)
    }

    fn kind_tag(&self) -> u8 {
        10
    }
}

impl Encode for BitShuffleFilter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for BitShuffleFilter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}
