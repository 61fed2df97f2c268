// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `DoubleDeltaFilter` round-trips every integer datatype across a few
//! representative input shapes (`spec.md` §8 scenario 3): strictly
//! increasing (the filter's best case), a deterministic pseudo-random
//! sequence (its worst case, where the packed encoding commonly falls back
//! to storing values verbatim), and an all-equal run (every double-delta is
//! zero).
//!
//! Patterns are generated as `i64` over a fixed, deliberately narrow range
//! and then cast down (wrapping, for the narrower types) to each target
//! width — the filter round-trips whatever bit pattern it's handed, so the
//! numeric range doesn't need to span each type's own `MIN..MAX`.

use arrayon::{Datatype, Filter, FilterContext, FilterPipeline};

const LEN: usize = 1000;
const RANGE: i64 = 10_000;

/// Small xorshift generator so this doesn't depend on `rand`'s RNG algorithm
/// staying stable across versions — only that the round-trip is bit-exact
/// for whatever values come out.
fn xorshift_u64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn round_trip(datatype: Datatype, values: &[u8]) {
    let pipeline = FilterPipeline::new(vec![Filter::DoubleDelta(Default::default())]);
    let ctx = FilterContext::new(datatype);
    let forward = pipeline.forward_tile(values, 64 * 1024, &ctx).unwrap();
    let back = pipeline.reverse_tile(&forward, &ctx).unwrap();
    assert_eq!(back, values, "{datatype:?} round-trip mismatch");
}

fn patterns(seed: u64) -> Vec<(&'static str, Vec<i64>)> {
    let step = (2 * RANGE / LEN as i64).max(1);
    let increasing: Vec<i64> = (0..LEN as i64).map(|i| (-RANGE + i * step).min(RANGE)).collect();

    let mut state = 0x9E3779B97F4A7C15u64 ^ seed;
    let random: Vec<i64> = (0..LEN)
        .map(|_| {
            let r = xorshift_u64(&mut state);
            -RANGE + (r % (2 * RANGE as u64 + 1)) as i64
        })
        .collect();

    let constant = vec![-RANGE; LEN];

    vec![("increasing", increasing), ("random", random), ("constant", constant)]
}

macro_rules! int_case {
    ($name:ident, $datatype:expr, $ty:ty, $seed:expr) => {
        #[test]
        fn $name() {
            for (label, values) in patterns($seed) {
                let bytes: Vec<u8> = values.iter().flat_map(|v| (*v as $ty).to_le_bytes()).collect();
                round_trip($datatype, &bytes);
                let _ = label;
            }
        }
    };
}

int_case!(double_delta_round_trips_int8, Datatype::Int8, i8, 1);
int_case!(double_delta_round_trips_int16, Datatype::Int16, i16, 2);
int_case!(double_delta_round_trips_int32, Datatype::Int32, i32, 3);
int_case!(double_delta_round_trips_int64, Datatype::Int64, i64, 4);
int_case!(double_delta_round_trips_uint8, Datatype::UInt8, u8, 5);
int_case!(double_delta_round_trips_uint16, Datatype::UInt16, u16, 6);
int_case!(double_delta_round_trips_uint32, Datatype::UInt32, u32, 7);
int_case!(double_delta_round_trips_uint64, Datatype::UInt64, u64, 8);
