// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Dense read path (`spec.md` §4.7): walk `DenseCellRangeIter`'s contiguous
//! runs, resolve each run's tile across the snapshot, fill cells no
//! fragment ever wrote with the attribute's fill value, push the condition
//! mask in by fill-replacing (not dropping) failing cells, and materialize
//! into caller buffers.
//!
//! Overwrite resolution is whole-tile, not cell-by-cell: `FragmentWriter`
//! only ever accepts a tile-aligned dense subarray, so a fragment that
//! touches a tile at all writes every cell in it. Later fragments are
//! applied after earlier ones (`Array::fragments()` is ascending by
//! timestamp), so a tile's last writer simply overwrites the slots a
//! previous writer left there.
//!
//! A dense fragment's bookkeeping has no `tile_starts`/`tiles_per_dim`
//! fields of its own (unlike a sparse fragment's per-tile MBRs); both are
//! re-derived here from `non_empty_domain`, mirroring the computation
//! `FragmentWriter::write_dense` did at write time.

use super::condition::QueryCondition;
use super::dense_range_iter::{CellRange, DenseCellRangeIter};
use super::sparse_reader::{attr_fixed_width, decode_tile_cells, split_validity};
use super::{AttributeBuffer, Layout, Status};
use crate::array::Array;
use crate::datatype::Datatype;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::filter::FilterContext;
use crate::fragment::Fragment;
use crate::schema::{Attribute, CellOrder};
use crate::stop_signal::StopSignal;
use crate::vfs::Vfs;
use std::collections::HashMap;

#[allow(clippy::too_many_arguments)]
pub(super) fn run<V: Vfs>(
    array: &Array<V>,
    subarray: &[(Vec<u8>, Vec<u8>)],
    names: &[String],
    condition: Option<&QueryCondition>,
    layout: Layout,
    buffers: &mut HashMap<String, AttributeBuffer>,
    already_emitted: usize,
    cancel: &StopSignal,
) -> Result<(usize, Status)> {
    let schema = array.schema();
    let domain = schema.domain();

    let mut decode_names: Vec<String> = names.to_vec();
    if let Some(condition) = condition {
        let mut referenced = Vec::new();
        condition.referenced_attributes(&mut referenced);
        for attr in referenced {
            if !decode_names.contains(&attr) {
                decode_names.push(attr);
            }
        }
    }
    if let Some(condition) = condition {
        condition.compile(schema)?;
    }

    let storage_row_major = schema.cell_order() != CellOrder::ColMajor;
    let ranges: Vec<CellRange> = DenseCellRangeIter::new(domain, subarray, layout, storage_row_major)?.collect();

    let mut range_base = Vec::with_capacity(ranges.len());
    let mut total_cells = 0usize;
    for range in &ranges {
        range_base.push(total_cells);
        total_cells += range.cell_count() as usize;
    }

    let mut cells: Vec<HashMap<String, (Vec<u8>, Option<bool>)>> = vec![HashMap::new(); total_cells];

    for name in &decode_names {
        let attr = schema.attribute(name).expect("attribute names validated by submit()");
        fill_attribute(array, domain, attr, &ranges, &range_base, cancel, &mut cells, array.fragments())?;
        if cancel.is_stopped() {
            return Ok((0, Status::Cancelled));
        }
    }

    for name in &decode_names {
        let attr = schema.attribute(name).expect("attribute names validated by submit()");
        let fill = attr.fill_value().to_vec();
        let validity = attr.is_nullable().then_some(false);
        for cell in &mut cells {
            cell.entry(name.clone()).or_insert_with(|| (fill.clone(), validity));
        }
    }

    if let Some(condition) = condition {
        for cell in &mut cells {
            let matches = condition.eval(
                &|name| schema.attribute(name).expect("validated by compile() above").datatype(),
                &|name| cell.get(name).map_or((None, None), |(bytes, valid)| (Some(bytes.as_slice()), *valid)),
            );
            if !matches {
                for name in names {
                    let attr = schema.attribute(name).expect("attribute names validated by submit()");
                    cell.insert(name.clone(), (attr.fill_value().to_vec(), attr.is_nullable().then_some(false)));
                }
            }
        }
    }

    materialize(names, &cells, buffers, already_emitted)
}

/// A dense fragment's own local tile grid, re-derived from its
/// `non_empty_domain` the same way `FragmentWriter::write_dense` derived it
/// at write time.
struct FragGeometry {
    /// Per dimension, the global tile index this fragment's local tile 0
    /// starts at.
    tile_lo: Vec<i64>,
    tiles_per_dim: Vec<u64>,
}

fn fragment_geometry(domain: &Domain, fragment: &Fragment) -> Result<FragGeometry> {
    let mbr = &fragment.bookkeeping().non_empty_domain;
    let mut tile_lo = Vec::with_capacity(domain.ndim());
    let mut tiles_per_dim = Vec::with_capacity(domain.ndim());
    for (dim, (lo, hi)) in domain.dimensions().iter().zip(mbr) {
        let (domain_lo_bytes, _) = dim
            .domain_bytes()
            .ok_or_else(|| Error::Bookkeeping(format!("dimension '{}' has no domain bounds", dim.name())))?;
        let extent_bytes = dim
            .tile_extent_bytes()
            .ok_or_else(|| Error::Bookkeeping(format!("dense dimension '{}' has no tile extent", dim.name())))?;
        let domain_lo = dim_value_as_i64(dim.datatype(), domain_lo_bytes)?;
        let extent = dim_value_as_i64(dim.datatype(), extent_bytes)?.max(1);
        let lo_v = dim_value_as_i64(dim.datatype(), lo)?;
        let hi_v = dim_value_as_i64(dim.datatype(), hi)?;
        tile_lo.push((lo_v - domain_lo) / extent);
        tiles_per_dim.push(((hi_v - lo_v + 1) / extent) as u64);
    }
    Ok(FragGeometry { tile_lo, tiles_per_dim })
}

/// Translates a global per-dimension tile index into `geom`'s local tile
/// grid, or `None` if this fragment never wrote that tile.
fn local_tile_index(global_tile_index: &[u64], geom: &FragGeometry) -> Option<Vec<u64>> {
    let mut local = Vec::with_capacity(global_tile_index.len());
    for (&g, (&lo, &count)) in global_tile_index.iter().zip(geom.tile_lo.iter().zip(&geom.tiles_per_dim)) {
        let l = g as i64 - lo;
        if l < 0 || l as u64 >= count {
            return None;
        }
        local.push(l as u64);
    }
    Some(local)
}

/// Row-major linearization, matching `FragmentWriter::write_dense`'s
/// `odometer` (always row-major over a fragment's own local tile grid,
/// independent of the writer's requested output layout).
fn linear_index(multi: &[u64], spans: &[u64]) -> u64 {
    let mut idx = 0u64;
    for i in 0..multi.len() {
        idx = idx * spans[i] + multi[i];
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

/// Fills `out`'s slots for `attr` from `fragments`, in ascending order so a
/// tile's latest writer overwrites whatever an earlier one left there.
///
/// Takes the fragment list explicitly (rather than always reading
/// `array.fragments()`) so consolidation can resolve a fragment group's
/// merged tiles the same way a query resolves a whole snapshot's.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fill_attribute<V: Vfs>(
    array: &Array<V>,
    domain: &Domain,
    attr: &Attribute,
    ranges: &[CellRange],
    range_base: &[usize],
    cancel: &StopSignal,
    out: &mut [HashMap<String, (Vec<u8>, Option<bool>)>],
    fragments: &[Fragment],
) -> Result<()> {
    let is_var = attr.cell_val_num().is_var();
    let fixed_width = attr_fixed_width(attr).unwrap_or(0);

    for fragment in fragments {
        if cancel.is_stopped() {
            return Ok(());
        }
        let bookkeeping = fragment.bookkeeping();
        let Some(attr_bk) = bookkeeping.attribute(attr.name()) else {
            continue;
        };
        let geom = fragment_geometry(domain, fragment)?;

        let touched: Vec<(usize, u64)> = ranges
            .iter()
            .enumerate()
            .filter_map(|(r, range)| local_tile_index(&range.tile_index, &geom).map(|local| (r, linear_index(&local, &geom.tiles_per_dim))))
            .collect();
        if touched.is_empty() {
            continue;
        }

        let file = array.read_file(&fragment.attribute_file_name(attr.name()))?;
        let offsets_file = is_var.then(|| array.read_file(&fragment.var_offsets_file_name(attr.name()))).transpose()?;
        let ctx = FilterContext::new(attr.datatype());

        let mut decoded_tiles: HashMap<u64, Vec<Vec<u8>>> = HashMap::new();
        for (r, local_tile) in touched {
            if !decoded_tiles.contains_key(&local_tile) {
                let decoded_cells = decode_tile_cells(
                    &file,
                    attr_bk,
                    local_tile as usize,
                    attr.filters(),
                    &ctx,
                    is_var,
                    offsets_file.as_deref(),
                    fixed_width,
                )?;
                decoded_tiles.insert(local_tile, decoded_cells);
            }
            let decoded = decoded_tiles.get(&local_tile).expect("inserted above");
            let range = &ranges[r];
            let base = range_base[r];
            for local in range.local_start..range.local_end {
                let stored = decoded
                    .get(local as usize)
                    .ok_or_else(|| Error::Bookkeeping("dense tile has fewer cells than its declared range".into()))?;
                let (valid, value) = split_validity(attr, stored);
                let out_idx = base + (local - range.local_start) as usize;
                out[out_idx].insert(attr.name().to_string(), (value.to_vec(), valid));
            }
        }
    }
    Ok(())
}

fn has_room(buf: &AttributeBuffer, value_len: usize) -> bool {
    let data_fits = buf.data.len() + value_len <= buf.data.capacity();
    let offsets_fit = buf.offsets.as_ref().map_or(true, |o| o.len() < o.capacity());
    let validity_fits = buf.validity.as_ref().map_or(true, |v| v.len() < v.capacity());
    data_fits && offsets_fit && validity_fits
}

fn push_cell(buf: &mut AttributeBuffer, value: &[u8], validity: Option<bool>) {
    if let Some(offsets) = buf.offsets.as_mut() {
        offsets.push(buf.data.len() as u64);
    }
    buf.data.extend_from_slice(value);
    if let Some(v) = buf.validity.as_mut() {
        v.push(u8::from(validity.unwrap_or(true)));
    }
}

fn materialize(
    names: &[String],
    cells: &[HashMap<String, (Vec<u8>, Option<bool>)>],
    buffers: &mut HashMap<String, AttributeBuffer>,
    already_emitted: usize,
) -> Result<(usize, Status)> {
    let mut emitted = 0usize;
    for cell in cells.iter().skip(already_emitted) {
        let fits = names.iter().all(|name| {
            let value_len = cell.get(name).map_or(0, |(value, _)| value.len());
            buffers.get(name).is_some_and(|buf| has_room(buf, value_len))
        });
        if !fits {
            if emitted == 0 {
                return Err(Error::Query("buffer is too small to hold even one cell".into()));
            }
            return Ok((emitted, Status::Incomplete));
        }
        for name in names {
            let (value, validity) = cell.get(name).cloned().unwrap_or_default();
            let buf = buffers.get_mut(name).expect("checked by `fits` above");
            push_cell(buf, &value, validity);
        }
        emitted += 1;
    }
    Ok((emitted, Status::Complete))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datatype::{CellValNum, Datatype};
    use crate::domain::Dimension;
    use crate::fragment::{FragmentWriter, WriteInput};
    use crate::query::{AttributeBuffer as Buf, Layout as L};
    use crate::schema::{ArrayType, Attribute, Schema};
    use crate::vfs::LocalVfs;
    use test_log::test;

    fn schema() -> Schema {
        let mut schema = Schema::new(ArrayType::Dense);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 9i32, Some(5i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
            .unwrap();
        schema.finalize().unwrap()
    }

    fn write_subarray<V: Vfs>(array: &mut Array<V>, schema: &Schema, timestamp: u64, lo: i32, hi: i32, values: &[i32]) {
        let writer = FragmentWriter::new(schema, L::RowMajor, timestamp);
        let mut attributes = HashMap::new();
        attributes.insert(
            "a".to_string(),
            Buf {
                data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
                offsets: None,
                validity: None,
            },
        );
        let subarray = vec![(lo.to_le_bytes().to_vec(), hi.to_le_bytes().to_vec())];
        let prepared = writer.write(WriteInput::Dense { subarray, attributes }).unwrap();
        array.commit_fragment(&prepared).unwrap();
    }

    fn read_a(array: &Array<LocalVfs>, lo: i32, hi: i32) -> Vec<i32> {
        let mut query = super::super::Query::new(array, L::RowMajor).add_range(lo.to_le_bytes().to_vec(), hi.to_le_bytes().to_vec());
        let mut buffers = HashMap::new();
        buffers.insert(
            "a".to_string(),
            Buf {
                data: Vec::with_capacity(4096),
                offsets: None,
                validity: None,
            },
        );
        let status = query.submit(&mut buffers).unwrap();
        assert_eq!(status, Status::Complete);
        buffers["a"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    #[test]
    fn unwritten_cells_read_as_fill_value() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();
        let mut array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Write, context.clone(), None).unwrap();
        write_subarray(&mut array, &schema, 1, 0, 4, &[1, 2, 3, 4, 5]);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Read, context, None).unwrap();
        let values = read_a(&array, 0, 9);
        assert_eq!(values[0..5], [1, 2, 3, 4, 5]);
        assert_eq!(values[5..10], [i32::MAX; 5]);
    }

    #[test]
    fn later_fragment_overwrites_whole_tile() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();
        let mut array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Write, context.clone(), None).unwrap();
        write_subarray(&mut array, &schema, 1, 0, 9, &(0..10).collect::<Vec<_>>());
        write_subarray(&mut array, &schema, 2, 5, 9, &[100, 101, 102, 103, 104]);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Read, context, None).unwrap();
        let values = read_a(&array, 0, 9);
        assert_eq!(values, vec![0, 1, 2, 3, 4, 100, 101, 102, 103, 104]);
    }

    #[test]
    fn condition_fill_replaces_failing_cells_without_shrinking_output() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();
        let mut array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Write, context.clone(), None).unwrap();
        write_subarray(&mut array, &schema, 1, 0, 9, &(0..10).collect::<Vec<_>>());
        array.close();

        let array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Read, context, None).unwrap();
        let mut query = super::super::Query::new(&array, L::RowMajor)
            .add_range(0i32.to_le_bytes().to_vec(), 9i32.to_le_bytes().to_vec())
            .condition(QueryCondition::predicate("a", crate::query::CompareOp::Ge, 5i32.to_le_bytes().to_vec()));
        let mut buffers = HashMap::new();
        buffers.insert(
            "a".to_string(),
            Buf {
                data: Vec::with_capacity(4096),
                offsets: None,
                validity: None,
            },
        );
        let status = query.submit(&mut buffers).unwrap();
        assert_eq!(status, Status::Complete);
        let values: Vec<i32> = buffers["a"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values.len(), 10);
        assert_eq!(values[0..5], [i32::MAX; 5]);
        assert_eq!(values[5..10], [5, 6, 7, 8, 9]);
    }

    #[test]
    fn incomplete_status_on_too_small_buffer_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();
        let mut array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Write, context.clone(), None).unwrap();
        write_subarray(&mut array, &schema, 1, 0, 9, &(0..10).collect::<Vec<_>>());
        array.close();

        let array = Array::open(LocalVfs, dir.path(), crate::array::ArrayMode::Read, context, None).unwrap();
        let mut query = super::super::Query::new(&array, L::RowMajor).add_range(0i32.to_le_bytes().to_vec(), 9i32.to_le_bytes().to_vec());
        let mut buffers = HashMap::new();
        buffers.insert(
            "a".to_string(),
            Buf {
                data: Vec::with_capacity(24),
                offsets: None,
                validity: None,
            },
        );
        let status = query.submit(&mut buffers).unwrap();
        assert_eq!(status, Status::Incomplete);
        assert_eq!(buffers["a"].data.len(), 24);

        buffers.get_mut("a").unwrap().data.clear();
        let status = query.submit(&mut buffers).unwrap();
        assert_eq!(status, Status::Complete);
        let values: Vec<i32> = buffers["a"].data.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(values, vec![6, 7, 8, 9]);
    }
}
