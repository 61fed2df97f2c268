// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dense cell range iterator (`spec.md` §4.5): given a subarray and a result
//! layout, produces a lazy-looking (materialized up front; see the note on
//! [`DenseCellRangeIter::new`]) sequence of contiguous runs, each confined to
//! one tile and physically contiguous in that tile's on-disk cell order.
//!
//! The spec's constructor signature is `(domain, S, L)`; this implementation
//! takes one extra `storage_row_major` flag, since physical contiguity within
//! a tile is a property of the *schema's* cell order, not of the query's
//! requested output layout `L` (a `GLOBAL_ORDER`-stored array can still be
//! read back `ROW_MAJOR`). Recorded as an open-question resolution in
//! `DESIGN.md`.

use super::Layout;
use crate::datatype::Datatype;
use crate::domain::Domain;
use crate::error::{Error, Result};

/// One contiguous run of cells, confined to a single tile (`spec.md` §4.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellRange {
    /// Per-dimension tile index this run lives in.
    pub tile_index: Vec<u64>,
    /// Position of the run's first cell within the tile, in the tile's
    /// on-disk cell order.
    pub local_start: u64,
    /// One past the run's last cell, in the same order.
    pub local_end: u64,
    /// Global coordinates (raw dimension values) of the run's first cell.
    pub coords_start: Vec<i64>,
    /// Global coordinates of the run's last cell.
    pub coords_end: Vec<i64>,
}

impl CellRange {
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        self.local_end - self.local_start
    }
}

struct DimInfo {
    domain_lo: i64,
    extent: i64,
    lo_v: i64,
    hi_v: i64,
}

/// Lazy-looking finite sequence of [`CellRange`]s covering a subarray in a
/// requested layout (`spec.md` §4.5).
pub struct DenseCellRangeIter {
    ranges: std::vec::IntoIter<CellRange>,
}

impl DenseCellRangeIter {
    /// Builds the iterator over `subarray` (one `[lo, hi]` per dimension, in
    /// domain order; trailing dimensions default to their full domain range)
    /// in `layout`'s order.
    ///
    /// `storage_row_major` is the schema's on-disk cell order for this array
    /// (`true` for `ROW_MAJOR` or `GLOBAL_ORDER`, `false` for `COL_MAJOR`);
    /// it governs which within-tile positions count as physically
    /// contiguous, independent of `layout`.
    ///
    /// This implementation materializes the whole coordinate sequence up
    /// front rather than generating it cell-by-cell on `next()`, trading
    /// memory for a much simpler contiguous-run merge; fine at the domain
    /// sizes this engine targets, recorded in `DESIGN.md`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Query` if `layout` is [`Layout::Unordered`], if
    /// `subarray` has more ranges than the domain has dimensions, if any
    /// dimension is not a fixed-width integer type or lacks a domain/tile
    /// extent, or if a range falls outside the dimension's domain.
    pub fn new(
        domain: &Domain,
        subarray: &[(Vec<u8>, Vec<u8>)],
        layout: Layout,
        storage_row_major: bool,
    ) -> Result<Self> {
        if layout == Layout::Unordered {
            return Err(Error::Query(
                "dense cell range iteration requires an ordered layout".into(),
            ));
        }
        let ndim = domain.ndim();
        if subarray.len() > ndim {
            return Err(Error::Query(
                "subarray has more ranges than the domain has dimensions".into(),
            ));
        }

        let mut dims = Vec::with_capacity(ndim);
        for (i, dim) in domain.dimensions().iter().enumerate() {
            let datatype = dim.datatype();
            if !datatype.is_integer() {
                return Err(Error::Query(format!(
                    "dimension '{}' is not an integer type; dense iteration requires integer dimensions",
                    dim.name()
                )));
            }
            let (lo_bytes, hi_bytes) = dim
                .domain_bytes()
                .ok_or_else(|| Error::Query(format!("dimension '{}' has no domain bounds", dim.name())))?;
            let extent_bytes = dim
                .tile_extent_bytes()
                .ok_or_else(|| Error::Query(format!("dimension '{}' has no tile extent", dim.name())))?;

            let domain_lo = dim_value_as_i64(datatype, lo_bytes)?;
            let domain_hi = dim_value_as_i64(datatype, hi_bytes)?;
            let extent = dim_value_as_i64(datatype, extent_bytes)?;

            let (lo_v, hi_v) = if i < subarray.len() {
                (
                    dim_value_as_i64(datatype, &subarray[i].0)?,
                    dim_value_as_i64(datatype, &subarray[i].1)?,
                )
            } else {
                (domain_lo, domain_hi)
            };
            if lo_v > hi_v || lo_v < domain_lo || hi_v > domain_hi {
                return Err(Error::Query(format!(
                    "dimension '{}' range [{lo_v}, {hi_v}] is out of domain bounds [{domain_lo}, {domain_hi}]",
                    dim.name()
                )));
            }

            dims.push(DimInfo {
                domain_lo,
                extent,
                lo_v,
                hi_v,
            });
        }

        let tuples = match layout {
            Layout::RowMajor => enumerate_major(&dims, true),
            Layout::ColMajor => enumerate_major(&dims, false),
            Layout::GlobalOrder => enumerate_global_order(&dims, storage_row_major),
            Layout::Unordered => unreachable!("checked above"),
        };

        let tile_extents: Vec<u64> = dims.iter().map(|d| d.extent as u64).collect();
        let mut ranges: Vec<CellRange> = Vec::new();
        for coords in tuples {
            let tile_index: Vec<u64> = coords
                .iter()
                .zip(&dims)
                .map(|(&v, d)| ((v - d.domain_lo) / d.extent) as u64)
                .collect();
            let local: Vec<u64> = coords
                .iter()
                .zip(&dims)
                .map(|(&v, d)| ((v - d.domain_lo) % d.extent) as u64)
                .collect();
            let pos = linear_index(&local, &tile_extents, storage_row_major);

            let extends_last = ranges
                .last()
                .is_some_and(|last| last.tile_index == tile_index && pos == last.local_end);
            if extends_last {
                let last = ranges.last_mut().expect("just checked Some");
                last.local_end = pos + 1;
                last.coords_end = coords;
            } else {
                ranges.push(CellRange {
                    tile_index,
                    local_start: pos,
                    local_end: pos + 1,
                    coords_start: coords.clone(),
                    coords_end: coords,
                });
            }
        }

        Ok(Self {
            ranges: ranges.into_iter(),
        })
    }
}

impl Iterator for DenseCellRangeIter {
    type Item = CellRange;

    fn next(&mut self) -> Option<CellRange> {
        self.ranges.next()
    }
}

/// Enumerates coordinate tuples over `dims`' `[lo_v, hi_v]` ranges, row-major
/// (last dimension fastest) or column-major (first dimension fastest).
fn enumerate_major(dims: &[DimInfo], row_major: bool) -> Vec<Vec<i64>> {
    let extents: Vec<u64> = dims.iter().map(|d| (d.hi_v - d.lo_v + 1) as u64).collect();
    odometer_row_major_or_col(&extents, row_major)
        .into_iter()
        .map(|idx| idx.iter().zip(dims).map(|(&i, d)| d.lo_v + i as i64).collect())
        .collect()
}

/// Global order: tiles in row-major tile order, cells within each tile in
/// the schema's on-disk order (`spec.md` §4.5: "one iteration step within a
/// tile corresponds to one contiguous physical run").
fn enumerate_global_order(dims: &[DimInfo], storage_row_major: bool) -> Vec<Vec<i64>> {
    let tile_lo: Vec<u64> = dims.iter().map(|d| ((d.lo_v - d.domain_lo) / d.extent) as u64).collect();
    let tile_hi: Vec<u64> = dims.iter().map(|d| ((d.hi_v - d.domain_lo) / d.extent) as u64).collect();
    let tile_counts: Vec<u64> = tile_lo.iter().zip(&tile_hi).map(|(&lo, &hi)| hi - lo + 1).collect();

    let mut out = Vec::new();
    for tile_offsets in odometer_row_major_or_col(&tile_counts, true) {
        let tile_idx: Vec<u64> = tile_offsets.iter().zip(&tile_lo).map(|(&o, &lo)| lo + o).collect();
        let local_dims: Vec<DimInfo> = dims
            .iter()
            .zip(&tile_idx)
            .map(|(d, &t)| {
                let tile_start = d.domain_lo + t as i64 * d.extent;
                let tile_end = tile_start + d.extent - 1;
                DimInfo {
                    domain_lo: d.domain_lo,
                    extent: d.extent,
                    lo_v: tile_start.max(d.lo_v),
                    hi_v: tile_end.min(d.hi_v),
                }
            })
            .collect();
        out.extend(enumerate_major(&local_dims, storage_row_major));
    }
    out
}

/// Enumerates every index vector in `0..extents[i]` for each axis, row-major
/// (last axis fastest) or column-major (first axis fastest). Mirrors
/// `fragment::writer`'s odometer; duplicated locally since readers and
/// writers don't otherwise share a module.
fn odometer_row_major_or_col(extents: &[u64], row_major: bool) -> Vec<Vec<u64>> {
    if extents.iter().any(|&e| e == 0) {
        return Vec::new();
    }
    let total: u64 = extents.iter().product();
    let mut out = Vec::with_capacity(total as usize);
    let mut counters = vec![0u64; extents.len()];
    loop {
        out.push(counters.clone());
        let axes: Box<dyn Iterator<Item = usize>> = if row_major {
            Box::new((0..extents.len()).rev())
        } else {
            Box::new(0..extents.len())
        };
        let mut carry = true;
        for axis in axes {
            if !carry {
                break;
            }
            counters[axis] += 1;
            if counters[axis] >= extents[axis] {
                counters[axis] = 0;
            } else {
                carry = false;
            }
        }
        if carry {
            break;
        }
    }
    out
}

/// Linearizes a multi-dimensional local position under row-major or
/// column-major convention.
fn linear_index(multi: &[u64], spans: &[u64], row_major: bool) -> u64 {
    let mut idx = 0u64;
    if row_major {
        for i in 0..multi.len() {
            idx = idx * spans[i] + multi[i];
        }
    } else {
        for i in (0..multi.len()).rev() {
            idx = idx * spans[i] + multi[i];
        }
    }
    idx
}

fn dim_value_as_i64(datatype: Datatype, bytes: &[u8]) -> Result<i64> {
    let width = datatype
        .byte_width()
        .ok_or_else(|| Error::Query("dense dimensions must be fixed-width".into()))?;
    Ok(match width {
        1 => i8::from_le_bytes([bytes[0]]) as i64,
        2 => i16::from_le_bytes(bytes.try_into().map_err(|_| Error::Query("bad dimension value".into()))?) as i64,
        4 => i32::from_le_bytes(bytes.try_into().map_err(|_| Error::Query("bad dimension value".into()))?) as i64,
        8 => i64::from_le_bytes(bytes.try_into().map_err(|_| Error::Query("bad dimension value".into()))?),
        _ => return Err(Error::Query("unsupported dimension width".into())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimension;
    use test_log::test;

    fn domain_2x2_tiles() -> Domain {
        let mut domain = Domain::new();
        domain
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 9i32, Some(5i32)).unwrap())
            .unwrap();
        domain
            .add_dimension(Dimension::new_numeric("y", Datatype::Int32, 0i32, 9i32, Some(5i32)).unwrap())
            .unwrap();
        domain
    }

    fn bytes(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn rejects_unordered_layout() {
        let domain = domain_2x2_tiles();
        let err = DenseCellRangeIter::new(&domain, &[], Layout::Unordered, true);
        assert!(err.is_err());
    }

    #[test]
    fn single_tile_row_major_is_one_contiguous_range() {
        let domain = domain_2x2_tiles();
        let subarray = vec![(bytes(0), bytes(4)), (bytes(0), bytes(4))];
        let ranges: Vec<CellRange> = DenseCellRangeIter::new(&domain, &subarray, Layout::RowMajor, true)
            .unwrap()
            .collect();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].tile_index, vec![0, 0]);
        assert_eq!(ranges[0].cell_count(), 25);
        assert_eq!(ranges[0].local_start, 0);
        assert_eq!(ranges[0].local_end, 25);
    }

    #[test]
    fn row_major_subarray_spanning_tiles_splits_per_tile() {
        let domain = domain_2x2_tiles();
        // x in [3, 6] crosses the tile boundary at x=5; y fixed to one row,
        // so successive x steps are never adjacent in y-fastest storage
        // order: every cell is its own run, split across two x-tiles.
        let subarray = vec![(bytes(3), bytes(6)), (bytes(0), bytes(0))];
        let ranges: Vec<CellRange> = DenseCellRangeIter::new(&domain, &subarray, Layout::RowMajor, true)
            .unwrap()
            .collect();
        assert_eq!(ranges.iter().map(CellRange::cell_count).sum::<u64>(), 4);
        assert_eq!(ranges.iter().filter(|r| r.tile_index == vec![0, 0]).count(), 2);
        assert_eq!(ranges.iter().filter(|r| r.tile_index == vec![1, 0]).count(), 2);
    }

    #[test]
    fn row_major_merges_contiguous_cells_along_the_fastest_axis() {
        let domain = domain_2x2_tiles();
        // x fixed; y in [3, 6] crosses the tile boundary at y=5. y is the
        // row-major fastest axis, so each pair of same-tile steps is
        // physically adjacent and merges into one run.
        let subarray = vec![(bytes(0), bytes(0)), (bytes(3), bytes(6))];
        let ranges: Vec<CellRange> = DenseCellRangeIter::new(&domain, &subarray, Layout::RowMajor, true)
            .unwrap()
            .collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].tile_index, vec![0, 0]);
        assert_eq!(ranges[0].cell_count(), 2);
        assert_eq!(ranges[1].tile_index, vec![0, 1]);
        assert_eq!(ranges[1].cell_count(), 2);
    }

    #[test]
    fn global_order_emits_whole_tiles_as_single_runs() {
        let domain = domain_2x2_tiles();
        let subarray = vec![(bytes(0), bytes(9)), (bytes(0), bytes(9))];
        let ranges: Vec<CellRange> = DenseCellRangeIter::new(&domain, &subarray, Layout::GlobalOrder, true)
            .unwrap()
            .collect();
        // Four whole 5x5 tiles, each one contiguous physical run.
        assert_eq!(ranges.len(), 4);
        for r in &ranges {
            assert_eq!(r.cell_count(), 25);
        }
    }

    #[test]
    fn rejects_range_outside_domain() {
        let domain = domain_2x2_tiles();
        let subarray = vec![(bytes(0), bytes(20)), (bytes(0), bytes(4))];
        assert!(DenseCellRangeIter::new(&domain, &subarray, Layout::RowMajor, true).is_err());
    }
}
