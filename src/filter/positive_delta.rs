// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `PositiveDelta` filter (`spec.md` §4.1): emits `v_i - v_{i-1}` as unsigned
//! deltas when the chunk is non-decreasing, otherwise copies the chunk
//! through unchanged. A one-byte flag in the payload records which case
//! applies so reverse never has to guess.

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use std::io::{Read, Write};

const FLAG_RAW: u8 = 0;
const FLAG_DELTA: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PositiveDeltaFilter;

impl FilterOp for PositiveDeltaFilter {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        if !ctx.datatype.is_integer() {
            return Err(Error::Codec(
                "PositiveDelta requires an integer datatype".into(),
            ));
        }
        let width = ctx.cell_width()?;
        if input.len() % width != 0 {
            return Err(Error::Codec(
                "PositiveDelta input is not a whole number of cells".into(),
            ));
        }
        let num = input.len() / width;
        let signed = ctx.datatype.is_signed();

        if num < 2 {
            let mut payload = vec![FLAG_RAW];
            payload.extend_from_slice(input);
            return Ok((Vec::new(), payload));
        }

        let values: Vec<i128> = (0..num)
            .map(|i| read_value(&input[i * width..(i + 1) * width], signed))
            .collect();
        let monotonic = values.windows(2).all(|w| w[1] >= w[0]);

        if !monotonic {
            let mut payload = vec![FLAG_RAW];
            payload.extend_from_slice(input);
            return Ok((Vec::new(), payload));
        }

        let mut payload = Vec::with_capacity(1 + input.len());
        payload.push(FLAG_DELTA);
        payload.extend_from_slice(&write_value(values[0], width));
        for pair in values.windows(2) {
            let delta = pair[1] - pair[0];
            payload.extend_from_slice(&write_value(delta, width));
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
        if payload.is_empty() {
            return Err(Error::Codec("PositiveDelta chunk is empty".into()));
        }
        let flag = payload[0];
        let body = &payload[1..];

        match flag {
            FLAG_RAW => Ok(body.to_vec()),
            FLAG_DELTA => {
                if body.len() % width != 0 || body.is_empty() {
                    return Err(Error::Codec(
                        "PositiveDelta payload is not a whole number of cells".into(),
                    ));
                }
                let signed = ctx.datatype.is_signed();
                let num = body.len() / width;
                let mut values = Vec::with_capacity(num);
                values.push(read_value(&body[0..width], signed));
                for i in 1..num {
                    let delta = read_value(&body[i * width..(i + 1) * width], false);
                    values.push(values[i - 1] + delta);
                }
                let mut out = Vec::with_capacity(num * width);
                for v in &values {
                    out.extend_from_slice(&write_value(*v, width));
                }
                Ok(out)
            }
            other => Err(Error::Codec(format!(
                "PositiveDelta chunk has an unknown flag byte {other}"
            ))),
        }
    }

    fn kind_tag(&self) -> u8 {
        9
    }
}

impl Encode for PositiveDeltaFilter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for PositiveDeltaFilter {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use test_log::test;

    fn roundtrip(datatype: Datatype, values: &[i64]) {
        let width = datatype.byte_width().unwrap();
        let mut input = Vec::with_capacity(values.len() * width);
        for v in values {
            input.extend_from_slice(&v.to_le_bytes()[..width]);
        }
        let ctx = FilterContext::new(datatype);
        let filter = PositiveDeltaFilter;
        let (metadata, payload) = filter.forward(&input, &ctx).unwrap();
        let restored = filter
            .reverse(&metadata, &payload, input.len(), &ctx)
            .unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn monotonic_input_delta_encodes() {
        roundtrip(Datatype::Int32, &[1, 1, 2, 5, 5, 9, 100]);
    }

    #[test]
    fn non_monotonic_input_copies_through() {
        roundtrip(Datatype::Int32, &[5, 3, 9, 1]);
    }

    #[test]
    fn handles_small_counts() {
        roundtrip(Datatype::Int64, &[]);
        roundtrip(Datatype::Int64, &[7]);
    }
}
