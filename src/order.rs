// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Coordinate ordering shared by the writer, sparse reader and consolidator
//! (`spec.md` §3's "Global order" glossary entry: "the total order induced
//! by `tile_order ∘ cell_order`"). A coordinate is one raw-byte tuple per
//! dimension, in dimension order.
//!
//! Tiling by `tile_extent` only applies to dimensions that declare one;
//! sparse domains commonly leave it unset (tiling is driven by `capacity`
//! instead), in which case global order collapses to a plain `cell_order`
//! comparison with no tile-index prefix. This is a deliberate simplification
//! over the legacy engine's separate per-dimension tile/cell math, recorded
//! in `DESIGN.md`.

use crate::domain::Domain;
use crate::hilbert::HilbertCurve;
use crate::schema::CellOrder;
use std::cmp::Ordering;

/// One coordinate tuple: one raw-byte value per dimension, in domain order.
pub type Coords<'a> = [&'a [u8]];

/// Compares two coordinate tuples under `cell_order`, honoring per-dimension
/// tile extents when computing `GlobalOrder` (tile index first, then
/// within-tile `RowMajor` order).
///
/// # Panics
///
/// Panics if `cell_order` is [`CellOrder::Unordered`] (not a valid sort key:
/// unordered queries never call this) or if `cell_order` is
/// [`CellOrder::Hilbert`] (use [`compare_hilbert`] instead, which needs the
/// curve's bit width).
#[must_use]
pub fn compare(domain: &Domain, cell_order: CellOrder, a: &Coords<'_>, b: &Coords<'_>) -> Ordering {
    match cell_order {
        CellOrder::RowMajor => compare_major(domain, a, b, false),
        CellOrder::ColMajor => compare_major(domain, a, b, true),
        CellOrder::GlobalOrder => compare_global(domain, a, b),
        CellOrder::Unordered => panic!("Unordered is a query layout, not a sort key"),
        CellOrder::Hilbert => panic!("Hilbert coordinates need a HilbertCurve; use compare_hilbert"),
    }
}

fn compare_major(domain: &Domain, a: &Coords<'_>, b: &Coords<'_>, reverse_dims: bool) -> Ordering {
    let dims = domain.dimensions();
    let indices: Box<dyn Iterator<Item = usize>> = if reverse_dims {
        Box::new((0..dims.len()).rev())
    } else {
        Box::new(0..dims.len())
    };
    for i in indices {
        let ord = dims[i].datatype().compare(a[i], b[i]);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_global(domain: &Domain, a: &Coords<'_>, b: &Coords<'_>) -> Ordering {
    let dims = domain.dimensions();
    for (i, dim) in dims.iter().enumerate() {
        let Some(extent) = dim.tile_extent_bytes() else {
            continue;
        };
        let tile_a = tile_index(dim.datatype(), extent, a[i]);
        let tile_b = tile_index(dim.datatype(), extent, b[i]);
        if let (Some(tile_a), Some(tile_b)) = (tile_a, tile_b) {
            let ord = tile_a.cmp(&tile_b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
    }
    compare_major(domain, a, b, false)
}

/// Tile index of a coordinate along one dimension, given its domain lo and
/// tile extent (both raw little-endian bytes of the dimension's datatype).
/// Returns `None` for non-integer datatypes (floats/strings don't tile the
/// same way; they fall back to within-tile order only).
fn tile_index(datatype: crate::datatype::Datatype, extent: &[u8], value: &[u8]) -> Option<u64> {
    if !datatype.is_integer() {
        return None;
    }
    let width = datatype.byte_width()?;
    let as_i64 = |bytes: &[u8]| -> i64 {
        match width {
            1 => i8::from_le_bytes([bytes[0]]) as i64,
            2 => i16::from_le_bytes(bytes.try_into().unwrap()) as i64,
            4 => i32::from_le_bytes(bytes.try_into().unwrap()) as i64,
            8 => i64::from_le_bytes(bytes.try_into().unwrap()),
            _ => 0,
        }
    };
    let extent = as_i64(extent).max(1) as u64;
    let value = as_i64(value) as u64;
    Some(value / extent)
}

/// The schema carries no explicit Hilbert bit-width knob, so the writer picks
/// the widest precision that still fits `HilbertCurve`'s `bits * ndim <= 63`
/// contract (`spec.md` §4.2 leaves the curve's precision unspecified for a
/// schema-level `Hilbert` cell order). Capped at 16 bits/dimension, which is
/// already far finer than any domain this engine targets needs.
#[must_use]
pub fn default_hilbert_bits(ndim: usize) -> u32 {
    (63 / ndim.max(1)).min(16) as u32
}

/// Compares two coordinate tuples by their Hilbert ordinal. Every dimension
/// must be a fixed-width integer type; `curve` must have `dims() ==
/// domain.ndim()`.
#[must_use]
pub fn compare_hilbert(domain: &Domain, curve: &HilbertCurve, a: &Coords<'_>, b: &Coords<'_>) -> Ordering {
    hilbert_ordinal(domain, curve, a).cmp(&hilbert_ordinal(domain, curve, b))
}

/// Scales a coordinate tuple into `[0, 2^bits)` per dimension and returns its
/// Hilbert ordinal.
#[must_use]
pub fn hilbert_ordinal(domain: &Domain, curve: &HilbertCurve, coords: &Coords<'_>) -> u64 {
    let scaled: Vec<u64> = domain
        .dimensions()
        .iter()
        .zip(coords.iter())
        .map(|(dim, value)| scale_to_curve(dim, curve.bits(), value))
        .collect();
    curve.coords_to_hilbert(&scaled)
}

fn scale_to_curve(dim: &crate::domain::Dimension, bits: u32, value: &[u8]) -> u64 {
    let Some((lo, hi)) = dim.domain_bytes() else {
        return 0;
    };
    let datatype = dim.datatype();
    let to_f64 = |bytes: &[u8]| -> f64 {
        match datatype.byte_width() {
            Some(1) => i8::from_le_bytes([bytes[0]]) as f64,
            Some(2) => i16::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Some(4) if datatype.is_float() => f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Some(4) => i32::from_le_bytes(bytes.try_into().unwrap()) as f64,
            Some(8) if datatype.is_float() => f64::from_le_bytes(bytes.try_into().unwrap()),
            Some(8) => i64::from_le_bytes(bytes.try_into().unwrap()) as f64,
            _ => 0.0,
        }
    };
    let lo = to_f64(lo);
    let hi = to_f64(hi);
    let v = to_f64(value);
    let span = (hi - lo).max(1.0);
    let max_ordinal = (1u64 << bits) - 1;
    let fraction = ((v - lo) / span).clamp(0.0, 1.0);
    (fraction * max_ordinal as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::domain::Dimension;
    use test_log::test;

    fn domain_2d() -> Domain {
        let mut domain = Domain::new();
        domain
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 99i32, Some(10i32)).unwrap())
            .unwrap();
        domain
            .add_dimension(Dimension::new_numeric("y", Datatype::Int32, 0i32, 99i32, Some(10i32)).unwrap())
            .unwrap();
        domain
    }

    #[test]
    fn row_major_orders_by_first_dim_first() {
        let domain = domain_2d();
        let a = [5i32.to_le_bytes(), 0i32.to_le_bytes()];
        let b = [5i32.to_le_bytes(), 1i32.to_le_bytes()];
        let a_refs: Vec<&[u8]> = a.iter().map(|v| v.as_slice()).collect();
        let b_refs: Vec<&[u8]> = b.iter().map(|v| v.as_slice()).collect();
        assert_eq!(compare(&domain, CellOrder::RowMajor, &a_refs, &b_refs), Ordering::Less);
    }

    #[test]
    fn col_major_orders_by_last_dim_first() {
        let domain = domain_2d();
        let a = [0i32.to_le_bytes(), 5i32.to_le_bytes()];
        let b = [1i32.to_le_bytes(), 5i32.to_le_bytes()];
        let a_refs: Vec<&[u8]> = a.iter().map(|v| v.as_slice()).collect();
        let b_refs: Vec<&[u8]> = b.iter().map(|v| v.as_slice()).collect();
        assert_eq!(compare(&domain, CellOrder::ColMajor, &a_refs, &b_refs), Ordering::Less);
        // Tied on the last dimension: falls through to the first.
        let c = [0i32.to_le_bytes(), 5i32.to_le_bytes()];
        let d = [1i32.to_le_bytes(), 5i32.to_le_bytes()];
        let c_refs: Vec<&[u8]> = c.iter().map(|v| v.as_slice()).collect();
        let d_refs: Vec<&[u8]> = d.iter().map(|v| v.as_slice()).collect();
        assert_eq!(compare(&domain, CellOrder::ColMajor, &c_refs, &d_refs), Ordering::Less);
    }

    #[test]
    fn default_hilbert_bits_respects_bits_times_ndim_budget() {
        assert_eq!(default_hilbert_bits(1), 16);
        assert_eq!(default_hilbert_bits(2), 16);
        assert_eq!(default_hilbert_bits(5), 12);
        assert!(HilbertCurve::new(default_hilbert_bits(5), 5).is_ok());
    }

    #[test]
    fn hilbert_matches_curve_scenario_from_spec() {
        let mut domain = Domain::new();
        domain
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 15i32, None).unwrap())
            .unwrap();
        domain
            .add_dimension(Dimension::new_numeric("y", Datatype::Int32, 0i32, 15i32, None).unwrap())
            .unwrap();
        let curve = HilbertCurve::new(4, 2).unwrap();

        let a = [1i32.to_le_bytes(), 1i32.to_le_bytes()];
        let a_refs: Vec<&[u8]> = a.iter().map(|v| v.as_slice()).collect();
        assert_eq!(hilbert_ordinal(&domain, &curve, &a_refs), 2);
    }
}
