// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `BitWidthReduction` filter (`spec.md` §4.1's "implementation-standard
//! meanings" row): narrows a chunk of fixed-width integers to the smallest
//! byte width that covers its observed `[min, max]` range, storing each cell
//! as an unsigned offset from the chunk minimum. Because the whole chunk is
//! available up front (unlike a streaming window), the narrowed width always
//! covers every value exactly and no escape/overflow encoding is needed.

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitWidthReductionFilter;

const CANDIDATE_WIDTHS: [usize; 4] = [1, 2, 4, 8];

impl FilterOp for BitWidthReductionFilter {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        if !ctx.datatype.is_integer() {
            return Err(Error::Codec(
                "BitWidthReduction requires an integer datatype".into(),
            ));
        }
        let width = ctx.cell_width()?;
        if input.len() % width != 0 {
            return Err(Error::Codec(
                "BitWidthReduction input is not a whole number of cells".into(),
            ));
        }
        let num = input.len() / width;
        let signed = ctx.datatype.is_signed();

        let mut payload = Vec::with_capacity(2 + width);
        payload.push(width as u8);

        if num == 0 {
            payload.push(width as u8);
            payload.extend(std::iter::repeat(0u8).take(width));
            return Ok((Vec::new(), payload));
        }

        let values: Vec<i128> = (0..num)
            .map(|i| read_value(&input[i * width..(i + 1) * width], signed))
            .collect();
        let min = *values.iter().min().expect("non-empty");
        let max = *values.iter().max().expect("non-empty");
        let range = (max - min) as u128;

        let narrowed_width = CANDIDATE_WIDTHS
            .into_iter()
            .filter(|w| *w <= width)
            .find(|w| range < (1u128 << (8 * *w as u32)))
            .unwrap_or(width);

        payload.push(narrowed_width as u8);
        payload.extend_from_slice(&write_value(min, width));
        for v in &values {
            let offset = (*v - min) as u128;
            payload.extend_from_slice(&offset.to_le_bytes()[..narrowed_width]);
        }

        Ok((Vec::new(), payload))
    }

    fn reverse(
        &self,
        _metadata: &[u8],
        payload: &[u8],
        _original_size: usize,
        ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        let width = ctx.cell_width()?;
        if payload.len() < 2 + width {
            return Err(Error::Codec(
                "BitWidthReduction chunk header truncated".into(),
            ));
        }
        let orig_width = payload[0] as usize;
        let narrowed_width = payload[1] as usize;
        if orig_width != width {
            return Err(Error::Codec(
                "BitWidthReduction chunk width does not match the attribute's datatype".into(),
            ));
        }
        let signed = ctx.datatype.is_signed();
        let min = read_value(&payload[2..2 + width], signed);
        let body = &payload[2 + width..];

        if narrowed_width == 0 || body.len() % narrowed_width != 0 {
            return Err(Error::Codec(
                "BitWidthReduction payload is not a whole number of narrowed cells".into(),
            ));
        }

        let mut out = Vec::with_capacity((body.len() / narrowed_width) * width);
        for chunk in body.chunks_exact(narrowed_width) {
            let mut buf = [0u8; 16];
            buf[..narrowed_width].copy_from_slice(chunk);
            let offset = u128::from_le_bytes(buf);
            let value = min + offset as i128;
            out.extend_from_slice(&write_value(value, width));
        }
        Ok(out)
    }

    fn kind_tag(&self) -> u8 {
        8
    }
}

impl Encode for BitWidthReductionFilter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for BitWidthReductionFilter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}

fn read_value(bytes: &[u8], signed: bool) -> i128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    let raw = i128::from_le_bytes(buf);
    if signed {
        let shift = 128 - bytes.len() * 8;
        (raw << shift) >> shift
    } else {
        raw
    }
}

fn write_value(value: i128, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width].to_vec()
}
