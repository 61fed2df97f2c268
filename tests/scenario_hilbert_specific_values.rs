// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Hilbert curve specific values, 2D bits=4 (`spec.md` §8 scenario 4).
//! Already covered as a unit test inside `hilbert.rs`; kept here too as a
//! black-box check against the public API surface.

use arrayon::HilbertCurve;

#[test]
fn specific_2d_values_match() {
    let curve = HilbertCurve::new(4, 2).unwrap();
    assert_eq!(curve.coords_to_hilbert(&[1, 1]), 2);
    assert_eq!(curve.hilbert_to_coords(9), vec![2, 3]);
}
