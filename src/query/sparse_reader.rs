// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Sparse read path (`spec.md` §4.6): prune fragments/tiles by MBR overlap,
//! decode coordinate and attribute tiles, filter to the subarray and
//! condition, resolve duplicate coordinates to their latest write, order the
//! survivors and materialize them into caller buffers.
//!
//! Caller buffers follow a capacity-reservation convention: `run` extends
//! each [`AttributeBuffer`]'s `data`/`offsets`/`validity` up to whatever
//! capacity the caller reserved via `Vec::with_capacity`, never past it, and
//! the buffer's final `len()` reports how much was actually written — this
//! crate's expression of `spec.md` §6.4's "sizes are updated in place".

use super::condition::QueryCondition;
use super::{AttributeBuffer, Layout, Status};
use crate::array::Array;
use crate::datatype::{CellValNum, Datatype};
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::filter::{FilterContext, FilterPipeline};
use crate::fragment::{decode_coord_tuple, AttributeBookkeeping, Fragment, Mbr, COORDS_FILE_NAME};
use crate::hilbert::HilbertCurve;
use crate::order;
use crate::schema::{Attribute, CellOrder, Schema};
use crate::stop_signal::StopSignal;
use crate::vfs::Vfs;
use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::collections::HashMap;

/// One surviving cell: its coordinates, the fragment it came from (for
/// recency comparisons), and its decoded attribute values.
struct Candidate {
    coords: Vec<Vec<u8>>,
    fragment_rank: usize,
    /// Keyed by attribute name, value is `(stored_value_bytes, validity)`.
    values: HashMap<String, (Vec<u8>, Option<bool>)>,
}

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

    let mut candidates = Vec::new();
    for (fragment_rank, fragment) in array.fragments().iter().enumerate() {
        if cancel.is_stopped() {
            return Ok((0, Status::Cancelled));
        }
        collect_fragment_candidates(array, fragment, fragment_rank, domain, subarray, &decode_names, cancel, &mut candidates)?;
    }
    if cancel.is_stopped() {
        return Ok((0, Status::Cancelled));
    }

    if !schema.allows_dups() {
        dedup_keep_latest(&mut candidates);
    }

    let mut candidates: Vec<Candidate> = match condition {
        Some(condition) => candidates
            .into_iter()
            .filter(|c| {
                condition.eval(
                    &|name| schema.attribute(name).expect("validated by compile() above").datatype(),
                    &|name| c.values.get(name).map_or((None, None), |(bytes, valid)| (Some(bytes.as_slice()), *valid)),
                )
            })
            .collect(),
        None => candidates,
    };

    sort_candidates(domain, schema, layout, &mut candidates)?;

    materialize(names, &candidates, buffers, already_emitted)
}

fn collect_fragment_candidates<V: Vfs>(
    array: &Array<V>,
    fragment: &Fragment,
    fragment_rank: usize,
    domain: &Domain,
    subarray: &[(Vec<u8>, Vec<u8>)],
    decode_names: &[String],
    cancel: &StopSignal,
    out: &mut Vec<Candidate>,
) -> Result<()> {
    let schema = array.schema();
    let bookkeeping = fragment.bookkeeping();
    let coords_bk = bookkeeping
        .attribute(COORDS_FILE_NAME)
        .ok_or_else(|| Error::Bookkeeping("sparse fragment has no coordinate bookkeeping".into()))?;
    let coords_var = crate::fragment::coords_is_var(domain);
    let coords_file = array.read_file(&fragment.attribute_file_name(COORDS_FILE_NAME))?;
    let coords_offsets_file = coords_var
        .then(|| array.read_file(&fragment.var_offsets_file_name(COORDS_FILE_NAME)))
        .transpose()?;
    let coords_width = domain.coords_size().unwrap_or(0);
    let empty_pipeline = FilterPipeline::default();
    let coord_ctx = FilterContext::new(Datatype::UInt8);

    struct AttrColumn<'a> {
        attr: &'a Attribute,
        bookkeeping: &'a AttributeBookkeeping,
        file: Vec<u8>,
        offsets_file: Option<Vec<u8>>,
        is_var: bool,
        fixed_width: usize,
    }
    let mut attr_columns = Vec::with_capacity(decode_names.len());
    for name in decode_names {
        let attr = schema.attribute(name).expect("attribute names validated by submit()");
        let attr_bk = bookkeeping
            .attribute(name)
            .ok_or_else(|| Error::Bookkeeping(format!("fragment is missing bookkeeping for attribute '{name}'")))?;
        let is_var = attr.cell_val_num().is_var();
        let file = array.read_file(&fragment.attribute_file_name(name))?;
        let offsets_file = is_var.then(|| array.read_file(&fragment.var_offsets_file_name(name))).transpose()?;
        let fixed_width = attr_fixed_width(attr).unwrap_or(0);
        attr_columns.push(AttrColumn {
            attr,
            bookkeeping: attr_bk,
            file,
            offsets_file,
            is_var,
            fixed_width,
        });
    }

    for (tile_idx, mbr) in bookkeeping.mbrs.iter().enumerate() {
        if cancel.is_stopped() {
            return Ok(());
        }
        if !mbr_overlaps(domain, mbr, subarray) {
            continue;
        }

        let coords_cells = decode_tile_cells(
            &coords_file,
            coords_bk,
            tile_idx,
            &empty_pipeline,
            &coord_ctx,
            coords_var,
            coords_offsets_file.as_deref(),
            coords_width,
        )?;

        let mut attr_cells: Vec<Vec<Vec<u8>>> = Vec::with_capacity(attr_columns.len());
        for col in &attr_columns {
            let ctx = FilterContext::new(col.attr.datatype());
            let cells = decode_tile_cells(
                &col.file,
                col.bookkeeping,
                tile_idx,
                col.attr.filters(),
                &ctx,
                col.is_var,
                col.offsets_file.as_deref(),
                col.fixed_width,
            )?;
            attr_cells.push(cells);
        }

        for (local, coord_bytes) in coords_cells.iter().enumerate() {
            let coords = decode_coord_tuple(domain, coord_bytes)?;
            if !coords_in_subarray(domain, subarray, &coords) {
                continue;
            }
            let mut values = HashMap::with_capacity(attr_columns.len());
            for (col, cells) in attr_columns.iter().zip(&attr_cells) {
                let stored = cells
                    .get(local)
                    .ok_or_else(|| Error::Bookkeeping("attribute tile has fewer cells than the coordinate tile".into()))?;
                let (valid, value) = split_validity(col.attr, stored);
                values.insert(col.attr.name().to_string(), (value.to_vec(), valid));
            }
            out.push(Candidate {
                coords,
                fragment_rank,
                values,
            });
        }
    }
    Ok(())
}

/// Decodes one tile of a column (coordinate or attribute) into its per-cell
/// raw byte values, reversing the filter pipeline and, for `VAR` columns,
/// slicing `decoded` at the tile's recorded offsets.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_tile_cells(
    column_file: &[u8],
    bookkeeping: &AttributeBookkeeping,
    tile_idx: usize,
    filters: &FilterPipeline,
    ctx: &FilterContext,
    is_var: bool,
    offsets_file: Option<&[u8]>,
    fixed_width: usize,
) -> Result<Vec<Vec<u8>>> {
    let tile_bytes = slice_bookkept(column_file, &bookkeeping.tile_offsets, &bookkeeping.tile_sizes, tile_idx)?;
    let decoded = filters.reverse_tile(tile_bytes, ctx)?;

    if is_var {
        let offsets_file = offsets_file.ok_or_else(|| Error::Bookkeeping("variable-length column is missing its offsets file".into()))?;
        let offsets_bytes = slice_bookkept(offsets_file, &bookkeeping.var_offsets, &bookkeeping.var_sizes, tile_idx)?;
        let mut starts = Vec::with_capacity(offsets_bytes.len() / 8);
        let mut cursor = std::io::Cursor::new(offsets_bytes);
        while let Ok(v) = cursor.read_u64::<LittleEndian>() {
            starts.push(v as usize);
        }
        let mut cells = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(decoded.len());
            let end = end.min(decoded.len()).max(start);
            cells.push(decoded[start..end].to_vec());
        }
        Ok(cells)
    } else {
        if fixed_width == 0 || decoded.len() % fixed_width != 0 {
            return Err(Error::Bookkeeping("fixed-width tile length is not a multiple of the cell width".into()));
        }
        Ok(decoded.chunks(fixed_width).map(<[u8]>::to_vec).collect())
    }
}

fn slice_bookkept<'a>(file_bytes: &'a [u8], offsets: &[u64], sizes: &[u64], tile_idx: usize) -> Result<&'a [u8]> {
    let offset = *offsets
        .get(tile_idx)
        .ok_or_else(|| Error::Bookkeeping("tile index out of range in bookkeeping".into()))? as usize;
    let size = *sizes
        .get(tile_idx)
        .ok_or_else(|| Error::Bookkeeping("tile index out of range in bookkeeping".into()))? as usize;
    file_bytes
        .get(offset..offset + size)
        .ok_or_else(|| Error::Bookkeeping("tile bytes are truncated relative to bookkeeping".into()))
}

pub(crate) fn attr_fixed_width(attr: &Attribute) -> Option<usize> {
    match attr.cell_val_num() {
        CellValNum::Var => None,
        CellValNum::Fixed(n) => {
            let base = attr.datatype().byte_width()? * n as usize;
            Some(if attr.is_nullable() { base + 1 } else { base })
        }
    }
}

/// Splits a stored cell's leading validity byte (present only for nullable
/// attributes) from its value bytes, mirroring `FragmentWriter`'s
/// `stored_cell_bytes`.
pub(crate) fn split_validity<'a>(attr: &Attribute, stored: &'a [u8]) -> (Option<bool>, &'a [u8]) {
    if attr.is_nullable() && !stored.is_empty() {
        (Some(stored[0] != 0), &stored[1..])
    } else {
        (None, stored)
    }
}

fn mbr_overlaps(domain: &Domain, mbr: &Mbr, subarray: &[(Vec<u8>, Vec<u8>)]) -> bool {
    domain.dimensions().iter().zip(mbr).enumerate().all(|(i, (dim, (mbr_lo, mbr_hi)))| match subarray.get(i) {
        Some((lo, hi)) => dim.datatype().compare(mbr_lo, hi) != Ordering::Greater && dim.datatype().compare(mbr_hi, lo) != Ordering::Less,
        None => true,
    })
}

fn coords_in_subarray(domain: &Domain, subarray: &[(Vec<u8>, Vec<u8>)], coords: &[Vec<u8>]) -> bool {
    domain.dimensions().iter().zip(coords).enumerate().all(|(i, (dim, value))| match subarray.get(i) {
        Some((lo, hi)) => dim.datatype().compare(value, lo) != Ordering::Less && dim.datatype().compare(value, hi) != Ordering::Greater,
        None => true,
    })
}

/// Keeps only the latest write (by fragment recency) per distinct
/// coordinate tuple. Fragments are visited in ascending write order, so a
/// later `fragment_rank` always wins (`spec.md` §8: "for `allows_dups =
/// false`, no coordinate appears twice in the result of any read").
fn dedup_keep_latest(candidates: &mut Vec<Candidate>) {
    let mut index_of: HashMap<Vec<u8>, usize> = HashMap::with_capacity(candidates.len());
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates.drain(..) {
        let key = candidate.coords.concat();
        match index_of.get(&key) {
            Some(&idx) if kept[idx].fragment_rank >= candidate.fragment_rank => {}
            Some(&idx) => kept[idx] = candidate,
            None => {
                index_of.insert(key, kept.len());
                kept.push(candidate);
            }
        }
    }
    *candidates = kept;
}

fn sort_candidates(domain: &Domain, schema: &Schema, layout: Layout, candidates: &mut [Candidate]) -> Result<()> {
    let cell_order = match layout {
        Layout::Unordered => return Ok(()),
        Layout::RowMajor => CellOrder::RowMajor,
        Layout::ColMajor => CellOrder::ColMajor,
        Layout::GlobalOrder => schema.cell_order(),
    };

    if cell_order == CellOrder::Hilbert {
        let curve = HilbertCurve::new(order::default_hilbert_bits(domain.ndim()), domain.ndim())?;
        candidates.sort_by(|a, b| {
            let ar: Vec<&[u8]> = a.coords.iter().map(Vec::as_slice).collect();
            let br: Vec<&[u8]> = b.coords.iter().map(Vec::as_slice).collect();
            order::compare_hilbert(domain, &curve, &ar, &br)
        });
    } else {
        candidates.sort_by(|a, b| {
            let ar: Vec<&[u8]> = a.coords.iter().map(Vec::as_slice).collect();
            let br: Vec<&[u8]> = b.coords.iter().map(Vec::as_slice).collect();
            order::compare(domain, cell_order, &ar, &br)
        });
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
    candidates: &[Candidate],
    buffers: &mut HashMap<String, AttributeBuffer>,
    already_emitted: usize,
) -> Result<(usize, Status)> {
    let mut emitted = 0usize;
    for candidate in candidates.iter().skip(already_emitted) {
        let fits = names.iter().all(|name| {
            let value_len = candidate.values.get(name).map_or(0, |(value, _)| value.len());
            buffers.get(name).is_some_and(|buf| has_room(buf, value_len))
        });
        if !fits {
            if emitted == 0 {
                return Err(Error::Query("buffer is too small to hold even one cell".into()));
            }
            return Ok((emitted, Status::Incomplete));
        }
        for name in names {
            let (value, validity) = candidate.values.get(name).cloned().unwrap_or_default();
            let buf = buffers.get_mut(name).expect("checked by `fits` above");
            push_cell(buf, &value, validity);
        }
        emitted += 1;
    }
    Ok((emitted, Status::Complete))
}
