// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Double-delta filter, grounded on
//! `examples/original_source/core/src/compressors/dd_compressor.cc`: a
//! per-chunk header of `(bitsize, count, first, second)` followed by packed
//! sign+magnitude double-deltas. Bit-packs MSB-first into 64-bit words the
//! same way the original does, though the in-memory word layout here is an
//! implementation detail private to this filter (nothing outside it ever
//! reads the packed bits directly).

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DoubleDeltaFilter;

impl FilterOp for DoubleDeltaFilter {
    fn forward(&self, input: &[u8], ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        if !ctx.datatype.is_integer() {
            return Err(Error::Codec(
                "DoubleDelta requires an integer datatype".into(),
            ));
        }
        let width = ctx.cell_width()?;
        if input.len() % width != 0 {
            return Err(Error::Codec(
                "DoubleDelta input is not a whole number of cells".into(),
            ));
        }
        let num = input.len() / width;
        let signed = ctx.datatype.is_signed();
        let values: Vec<i128> = (0..num)
            .map(|i| read_value(&input[i * width..(i + 1) * width], signed))
            .collect();

        let wordbits = (width * 8) as u32;
        let bitsize = if num < 2 {
            0
        } else {
            calculate_bitsize(&values)?
        };

        let mut payload = Vec::with_capacity(9 + input.len());
        payload.push(bitsize.min(255) as u8);
        payload.extend_from_slice(&(num as u64).to_le_bytes());

        if num == 0 {
            return Ok((Vec::new(), payload));
        }

        if bitsize >= wordbits.saturating_sub(1) {
            payload.extend_from_slice(input);
            return Ok((Vec::new(), payload));
        }

        payload.extend_from_slice(&write_value(values[0], width));
        if num == 1 {
            return Ok((Vec::new(), payload));
        }
        payload.extend_from_slice(&write_value(values[1], width));
        if num == 2 {
            return Ok((Vec::new(), payload));
        }

        let mut writer = BitWriter::new(&mut payload);
        let mut prev_delta = values[1] - values[0];
        for i in 2..num {
            let cur_delta = values[i] - values[i - 1];
            let dd = cur_delta - prev_delta;
            if dd.unsigned_abs() >> bitsize != 0 {
                return Err(Error::Codec(
                    "double-delta magnitude exceeds its 63-bit packed range".into(),
                ));
            }
            writer.write_bit(dd < 0);
            writer.write_bits(dd.unsigned_abs() as u64, bitsize);
            prev_delta = cur_delta;
        }
        writer.finish();

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
        if payload.len() < 9 {
            return Err(Error::Codec("double-delta chunk header truncated".into()));
        }
        let bitsize = payload[0] as u32;
        let num = u64::from_le_bytes(payload[1..9].try_into().expect("8 bytes")) as usize;
        let mut pos = 9;
        let signed = ctx.datatype.is_signed();
        let wordbits = (width * 8) as u32;

        if num == 0 {
            return Ok(Vec::new());
        }

        if bitsize >= wordbits.saturating_sub(1) {
            let raw = payload
                .get(pos..pos + num * width)
                .ok_or_else(|| Error::Codec("double-delta payload truncated".into()))?;
            return Ok(raw.to_vec());
        }

        let take = |pos: &mut usize| -> Result<i128> {
            let bytes = payload
                .get(*pos..*pos + width)
                .ok_or_else(|| Error::Codec("double-delta payload truncated".into()))?;
            *pos += width;
            Ok(read_value(bytes, signed))
        };

        let mut values = Vec::with_capacity(num);
        values.push(take(&mut pos)?);
        if num == 1 {
            return Ok(write_value(values[0], width));
        }
        values.push(take(&mut pos)?);
        if num == 2 {
            let mut out = write_value(values[0], width);
            out.extend_from_slice(&write_value(values[1], width));
            return Ok(out);
        }

        let mut reader = BitReader::new(&payload[pos..]);
        for _ in 2..num {
            let negative = reader.read_bit()?;
            let magnitude = reader.read_bits(bitsize)? as i128;
            let dd = if negative { -magnitude } else { magnitude };
            let n = values.len();
            let cur = dd + 2 * values[n - 1] - values[n - 2];
            values.push(cur);
        }

        let mut out = Vec::with_capacity(num * width);
        for v in &values {
            out.extend_from_slice(&write_value(*v, width));
        }
        Ok(out)
    }

    fn kind_tag(&self) -> u8 {
        0
    }
}

impl Encode for DoubleDeltaFilter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for DoubleDeltaFilter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}

/// Sign-extends a little-endian integer of `bytes.len()` bytes into an `i128`.
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

/// Maximum absolute double-delta across `values[2..]`, as a bit count. Mirrors
/// `DoubleDelta::calculate_bitsize`, including its check for a double-delta
/// whose sign flips out of the range a single sign bit can represent.
fn calculate_bitsize(values: &[i128]) -> Result<u32> {
    let mut max: i128 = 0;
    let mut prev_delta = values[1] - values[0];
    for i in 2..values.len() {
        let cur_delta = values[i] - values[i - 1];
        let dd = cur_delta - prev_delta;
        if (cur_delta < 0 && prev_delta > 0 && dd > 0) || (cur_delta > 0 && prev_delta < 0 && dd < 0)
        {
            return Err(Error::Codec(
                "DoubleDelta: a negative double-delta is out of bounds".into(),
            ));
        }
        max = max.max(dd.unsigned_abs() as i128);
        prev_delta = cur_delta;
    }
    let mut bitsize = 0u32;
    let mut m = max;
    loop {
        bitsize += 1;
        m >>= 1;
        if m == 0 {
            break;
        }
    }
    Ok(bitsize)
}

struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    chunk: u64,
    bit_in_chunk: i32,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut Vec<u8>) -> Self {
        Self {
            out,
            chunk: 0,
            bit_in_chunk: 63,
        }
    }

    fn write_bit(&mut self, bit: bool) {
        if bit {
            self.chunk |= 1u64 << self.bit_in_chunk;
        }
        self.bit_in_chunk -= 1;
        if self.bit_in_chunk < 0 {
            self.out.extend_from_slice(&self.chunk.to_le_bytes());
            self.chunk = 0;
            self.bit_in_chunk = 63;
        }
    }

    fn write_bits(&mut self, value: u64, nbits: u32) {
        for i in (0..nbits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn finish(self) {
        if self.bit_in_chunk < 63 {
            self.out.extend_from_slice(&self.chunk.to_le_bytes());
        }
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    chunk: u64,
    bit_in_chunk: i32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            chunk: 0,
            bit_in_chunk: -1,
        }
    }

    fn read_bit(&mut self) -> Result<bool> {
        if self.bit_in_chunk < 0 {
            let bytes = self
                .data
                .get(self.pos..self.pos + 8)
                .ok_or_else(|| Error::Codec("double-delta bitstream truncated".into()))?;
            self.chunk = u64::from_le_bytes(bytes.try_into().expect("8 bytes"));
            self.pos += 8;
            self.bit_in_chunk = 63;
        }
        let bit = (self.chunk >> self.bit_in_chunk) & 1 == 1;
        self.bit_in_chunk -= 1;
        Ok(bit)
    }

    fn read_bits(&mut self, nbits: u32) -> Result<u64> {
        let mut v = 0u64;
        for _ in 0..nbits {
            v = (v << 1) | u64::from(self.read_bit()?);
        }
        Ok(v)
    }
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
        let filter = DoubleDeltaFilter;
        let (metadata, payload) = filter.forward(&input, &ctx).unwrap();
        let restored = filter
            .reverse(&metadata, &payload, input.len(), &ctx)
            .unwrap();
        assert_eq!(restored, input, "roundtrip mismatch for {datatype:?}");
    }

    #[test]
    fn roundtrips_strictly_increasing() {
        let values: Vec<i64> = (0..1000).collect();
        for dt in [Datatype::Int32, Datatype::Int64, Datatype::UInt32] {
            roundtrip(dt, &values);
        }
    }

    #[test]
    fn roundtrips_all_equal() {
        let values = vec![42i64; 1000];
        roundtrip(Datatype::Int16, &values);
    }

    #[test]
    fn roundtrips_pseudo_random() {
        let mut state: u64 = 0x9E3779B97F4A7C15;
        let values: Vec<i64> = (0..1000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state % 1000) as i64 - 500
            })
            .collect();
        roundtrip(Datatype::Int64, &values);
    }

    #[test]
    fn handles_small_counts() {
        roundtrip(Datatype::Int32, &[]);
        roundtrip(Datatype::Int32, &[7]);
        roundtrip(Datatype::Int32, &[7, -3]);
    }

    #[test]
    fn rejects_var_length_datatype() {
        let ctx = FilterContext::new(Datatype::StringAscii);
        assert!(DoubleDeltaFilter.forward(b"abc", &ctx).is_err());
    }
}
