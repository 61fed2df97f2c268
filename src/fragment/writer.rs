// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! One fragment's write path (`spec.md` §4.4): validate the caller's
//! buffers against the schema, order and deduplicate sparse cells, tile
//! both array types, run each tile through its attribute's filter pipeline,
//! and hand the result to [`PreparedFragment::commit`] to publish it.
//!
//! Nullable attributes store one validity byte immediately before each
//! cell's value bytes (`spec.md` §6.4's validity lane, folded into the tile
//! payload rather than kept in a side file, since [`super::AttributeBookkeeping`]
//! has no validity-specific fields). A width-sensitive filter
//! (`DoubleDeltaFilter`, `BitWidthReductionFilter`, the shuffle filters)
//! placed on a nullable attribute's pipeline will see this interleaved
//! layout; schemas that need both should avoid combining them.
//!
//! Dense writes (`spec.md` §4.4's "tile dense cells... honoring
//! `tile_extent`") require the subarray to be tile-aligned in every
//! dimension. This sidesteps merging a partially-covered tile with
//! already-written cells at write time; the dense reader is responsible for
//! filling a tile untouched by any fragment with the attribute's fill
//! value, not the writer for a tile partially touched by one.

use super::{
    coords_is_var, encode_coord_tuple, AttributeBookkeeping, Bookkeeping, Fragment, FragmentId, Mbr,
    COORDS_FILE_NAME,
};
use crate::datatype::{CellValNum, Datatype};
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::filter::{FilterContext, DEFAULT_CHUNK_SIZE};
use crate::hilbert::HilbertCurve;
use crate::order;
use crate::query::{AttributeBuffer, Layout};
use crate::schema::{ArrayType, Attribute, CellOrder, Schema};
use crate::vfs::Vfs;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

/// Cells for one write, in the shape the array type requires.
pub enum WriteInput {
    /// One buffer per dimension (domain order) plus one per written
    /// attribute.
    Sparse {
        coords: Vec<AttributeBuffer>,
        attributes: HashMap<String, AttributeBuffer>,
    },
    /// Attribute buffers covering `subarray` in the writer's `layout`
    /// (`RowMajor` or `ColMajor`) order.
    Dense {
        subarray: Vec<(Vec<u8>, Vec<u8>)>,
        attributes: HashMap<String, AttributeBuffer>,
    },
}

/// Builds one fragment from a single batch of cells.
pub struct FragmentWriter<'a> {
    schema: &'a Schema,
    layout: Layout,
    timestamp: u64,
    chunk_size: usize,
}

impl<'a> FragmentWriter<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema, layout: Layout, timestamp: u64) -> Self {
        Self {
            schema,
            layout,
            timestamp,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    /// Validates, orders, tiles and filters `input` into a fragment ready to
    /// be committed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Query` if `input` doesn't match the schema's array
    /// type, a buffer is missing or mis-sized, cells given as `GlobalOrder`
    /// are not actually ordered, a duplicate coordinate is written to a
    /// schema that disallows duplicates, or a dense subarray is not
    /// tile-aligned. Returns `Error::Codec` if a filter pipeline fails.
    pub fn write(&self, input: WriteInput) -> Result<PreparedFragment> {
        match (self.schema.array_type(), input) {
            (ArrayType::Sparse, WriteInput::Sparse { coords, attributes }) => {
                self.write_sparse(coords, &attributes)
            }
            (ArrayType::Dense, WriteInput::Dense { subarray, attributes }) => {
                self.write_dense(&subarray, &attributes)
            }
            _ => Err(Error::Query(
                "write input shape does not match the schema's array type".into(),
            )),
        }
    }

    fn write_sparse(&self, coords: Vec<AttributeBuffer>, attributes: &HashMap<String, AttributeBuffer>) -> Result<PreparedFragment> {
        let domain = self.schema.domain();
        if coords.len() != domain.ndim() {
            return Err(Error::Query(format!(
                "expected {} coordinate buffers, got {}",
                domain.ndim(),
                coords.len()
            )));
        }
        if !matches!(self.layout, Layout::Unordered | Layout::GlobalOrder) {
            return Err(Error::Query(
                "sparse writes must use Unordered or GlobalOrder layout".into(),
            ));
        }

        let dim_kinds: Vec<ColumnKind> = domain.dimensions().iter().map(column_kind_of_dim).collect();
        let cell_count = column_cell_count(dim_kinds[0], &coords[0])?;
        for ((dim, kind), buf) in domain.dimensions().iter().zip(&dim_kinds).zip(&coords) {
            let n = column_cell_count(*kind, buf)?;
            if n != cell_count {
                return Err(Error::Query(format!(
                    "dimension '{}' has {n} cells, expected {cell_count}",
                    dim.name()
                )));
            }
        }
        if cell_count == 0 {
            return Err(Error::Query("a write must contain at least one cell".into()));
        }

        let attr_kinds: Vec<(&Attribute, ColumnKind, &AttributeBuffer)> = self
            .schema
            .attributes()
            .iter()
            .map(|attr| {
                let buf = attributes
                    .get(attr.name())
                    .ok_or_else(|| Error::Query(format!("missing buffer for attribute '{}'", attr.name())))?;
                let kind = column_kind_of_attr(attr);
                let n = column_cell_count(kind, buf)?;
                if n != cell_count {
                    return Err(Error::Query(format!(
                        "attribute '{}' has {n} cells, expected {cell_count}",
                        attr.name()
                    )));
                }
                Ok((attr, kind, buf))
            })
            .collect::<Result<_>>()?;

        let coord_at = |i: usize| -> Vec<&[u8]> {
            domain
                .dimensions()
                .iter()
                .zip(&dim_kinds)
                .zip(&coords)
                .map(|((_, kind), buf)| column_cell(*kind, buf, i))
                .collect()
        };

        let hilbert_curve = if self.schema.cell_order() == CellOrder::Hilbert {
            Some(HilbertCurve::new(order::default_hilbert_bits(domain.ndim()), domain.ndim())?)
        } else {
            None
        };
        let cmp = |a: usize, b: usize| -> Ordering {
            let ca = coord_at(a);
            let cb = coord_at(b);
            match &hilbert_curve {
                Some(curve) => order::compare_hilbert(domain, curve, &ca, &cb),
                None => order::compare(domain, self.schema.cell_order(), &ca, &cb),
            }
        };

        let mut order_idx: Vec<usize> = (0..cell_count).collect();
        match self.layout {
            Layout::Unordered => order_idx.sort_by(|&a, &b| cmp(a, b)),
            Layout::GlobalOrder => {
                for w in order_idx.windows(2) {
                    if cmp(w[0], w[1]) == Ordering::Greater {
                        return Err(Error::Query(
                            "cells written as GlobalOrder are not in the schema's global order".into(),
                        ));
                    }
                }
            }
            _ => unreachable!("checked above"),
        }
        if !self.schema.allows_dups() {
            for w in order_idx.windows(2) {
                if cmp(w[0], w[1]) == Ordering::Equal {
                    return Err(Error::Query(
                        "duplicate coordinate written to a schema that does not allow duplicates".into(),
                    ));
                }
            }
        }

        let capacity = self.schema.capacity().max(1) as usize;
        let mut non_empty_domain: Option<Mbr> = None;
        let mut mbrs: Vec<Mbr> = Vec::new();
        let mut attribute_out: HashMap<String, TileStream> = self
            .schema
            .attributes()
            .iter()
            .map(|a| (a.name().to_string(), TileStream::default()))
            .collect();
        let mut coords_out = TileStream::default();
        let coords_var = coords_is_var(domain);
        let empty_pipeline = crate::filter::FilterPipeline::default();

        for tile in order_idx.chunks(capacity) {
            let tile_mbr: Mbr = domain
                .dimensions()
                .iter()
                .enumerate()
                .map(|(d, dim)| {
                    let mut lo = coord_at(tile[0])[d].to_vec();
                    let mut hi = lo.clone();
                    for &i in &tile[1..] {
                        let v = coord_at(i)[d];
                        if dim.datatype().compare(v, &lo) == Ordering::Less {
                            lo = v.to_vec();
                        }
                        if dim.datatype().compare(v, &hi) == Ordering::Greater {
                            hi = v.to_vec();
                        }
                    }
                    (lo, hi)
                })
                .collect();
            merge_mbr(domain, &mut non_empty_domain, &tile_mbr);
            mbrs.push(tile_mbr);

            let coords_tile = build_column_tile(tile.len(), coords_var, |local| {
                let idx = tile[local];
                encode_coord_tuple(domain, &coord_at(idx))
            });
            coords_out.push_tile(&coords_tile, &empty_pipeline, &FilterContext::new(Datatype::UInt8), self.chunk_size)?;

            for (attr, kind, buf) in &attr_kinds {
                let column_var = matches!(kind, ColumnKind::Var);
                let attr_tile = build_column_tile(tile.len(), column_var, |local| {
                    stored_cell_bytes(attr, buf, *kind, tile[local])
                });
                let stream = attribute_out.get_mut(attr.name()).expect("seeded above");
                stream.push_tile(&attr_tile, attr.filters(), &FilterContext::new(attr.datatype()), self.chunk_size)?;
            }
        }

        let mut bookkeeping_attrs: Vec<(String, AttributeBookkeeping)> = Vec::with_capacity(attr_kinds.len() + 1);
        let mut attribute_bytes = HashMap::new();
        let mut offsets_bytes = HashMap::new();
        for (attr, kind, _) in &attr_kinds {
            let stream = attribute_out.remove(attr.name()).expect("seeded above");
            if matches!(kind, ColumnKind::Var) {
                offsets_bytes.insert(attr.name().to_string(), stream.offsets);
            }
            attribute_bytes.insert(attr.name().to_string(), stream.values);
            bookkeeping_attrs.push((attr.name().to_string(), stream.bookkeeping));
        }
        bookkeeping_attrs.push((COORDS_FILE_NAME.to_string(), coords_out.bookkeeping));

        let bookkeeping = Bookkeeping {
            sparse: true,
            timestamp_lo: self.timestamp,
            timestamp_hi: self.timestamp,
            tile_count: mbrs.len() as u64,
            non_empty_domain: non_empty_domain.unwrap_or_default(),
            mbrs,
            attributes: bookkeeping_attrs,
        };

        Ok(PreparedFragment {
            id: FragmentId::new(self.timestamp),
            coords_bytes: Some(coords_out.values),
            coords_offsets: coords_var.then_some(coords_out.offsets),
            bookkeeping,
            attribute_bytes,
            offsets_bytes,
        })
    }

    fn write_dense(&self, subarray: &[(Vec<u8>, Vec<u8>)], attributes: &HashMap<String, AttributeBuffer>) -> Result<PreparedFragment> {
        let domain = self.schema.domain();
        if subarray.len() != domain.ndim() {
            return Err(Error::Query(format!(
                "expected {} subarray ranges, got {}",
                domain.ndim(),
                subarray.len()
            )));
        }
        if !matches!(self.layout, Layout::RowMajor | Layout::ColMajor) {
            return Err(Error::Query(
                "dense writes must use RowMajor or ColMajor layout".into(),
            ));
        }
        let row_major = self.layout == Layout::RowMajor;

        let mut spans = Vec::with_capacity(domain.ndim());
        let mut tile_extents = Vec::with_capacity(domain.ndim());
        let mut tiles_per_dim = Vec::with_capacity(domain.ndim());
        let mut tile_starts_cells = Vec::with_capacity(domain.ndim());

        for (dim, (lo, hi)) in domain.dimensions().iter().zip(subarray.iter()) {
            if !dim.datatype().is_integer() {
                return Err(Error::Query(format!(
                    "dense writes require integer dimensions, '{}' is not one",
                    dim.name()
                )));
            }
            let (domain_lo, _) = dim
                .domain_bytes()
                .ok_or_else(|| Error::Query(format!("dimension '{}' has no domain bounds", dim.name())))?;
            let extent_bytes = dim
                .tile_extent_bytes()
                .ok_or_else(|| Error::Query(format!("dense dimension '{}' has no tile extent", dim.name())))?;

            let domain_lo = dim_value_as_i64(dim.datatype(), domain_lo)?;
            let extent = dim_value_as_i64(dim.datatype(), extent_bytes)?.max(1);
            let lo_v = dim_value_as_i64(dim.datatype(), lo)?;
            let hi_v = dim_value_as_i64(dim.datatype(), hi)?;
            if lo_v > hi_v {
                return Err(Error::Query(format!("dimension '{}' has lo > hi in the write subarray", dim.name())));
            }
            let span = (hi_v - lo_v + 1) as u64;
            if (lo_v - domain_lo) % extent != 0 || span as i64 % extent != 0 {
                return Err(Error::Query(format!(
                    "dense write subarray on '{}' is not tile-aligned (extent {extent})",
                    dim.name()
                )));
            }

            spans.push(span);
            tile_extents.push(extent as u64);
            tiles_per_dim.push(span / extent as u64);
            tile_starts_cells.push((lo_v - domain_lo) / extent);
        }

        let total_cells: u64 = spans.iter().product();
        let attr_kinds: Vec<(&Attribute, ColumnKind, &AttributeBuffer)> = self
            .schema
            .attributes()
            .iter()
            .map(|attr| {
                let buf = attributes
                    .get(attr.name())
                    .ok_or_else(|| Error::Query(format!("missing buffer for attribute '{}'", attr.name())))?;
                let kind = column_kind_of_attr(attr);
                let n = column_cell_count(kind, buf)? as u64;
                if n != total_cells {
                    return Err(Error::Query(format!(
                        "attribute '{}' has {n} cells, expected {total_cells} to cover the subarray",
                        attr.name()
                    )));
                }
                Ok((attr, kind, buf))
            })
            .collect::<Result<_>>()?;

        let within_tile_row_major = !matches!(self.schema.cell_order(), CellOrder::ColMajor);

        let mut attribute_out: HashMap<String, TileStream> = self
            .schema
            .attributes()
            .iter()
            .map(|a| (a.name().to_string(), TileStream::default()))
            .collect();

        let local_cells = odometer_row_major_or_col(&tile_extents, within_tile_row_major);
        let mut tile_count = 0u64;
        for tile_idx in odometer(&tiles_per_dim) {
            tile_count += 1;
            let tile_start: Vec<u64> = tile_idx
                .iter()
                .zip(&tile_extents)
                .zip(&tile_starts_cells)
                .map(|((&t, &extent), &base)| (base as u64 + t) * extent)
                .collect();

            for (attr, kind, buf) in &attr_kinds {
                let column_var = matches!(kind, ColumnKind::Var);
                let attr_tile = build_column_tile(local_cells.len(), column_var, |local| {
                    let local_idx = &local_cells[local];
                    let global: Vec<u64> = local_idx.iter().zip(&tile_start).map(|(l, s)| l + s).collect();
                    let pos = linear_index(&global, &spans, row_major) as usize;
                    stored_cell_bytes(attr, buf, *kind, pos)
                });
                let stream = attribute_out.get_mut(attr.name()).expect("seeded above");
                stream.push_tile(&attr_tile, attr.filters(), &FilterContext::new(attr.datatype()), self.chunk_size)?;
            }
        }

        let bookkeeping_attrs: Vec<(String, AttributeBookkeeping)> = self
            .schema
            .attributes()
            .iter()
            .map(|a| (a.name().to_string(), attribute_out.get_mut(a.name()).unwrap().bookkeeping.clone()))
            .collect();

        let bookkeeping = Bookkeeping {
            sparse: false,
            timestamp_lo: self.timestamp,
            timestamp_hi: self.timestamp,
            tile_count,
            non_empty_domain: subarray.to_vec(),
            mbrs: Vec::new(),
            attributes: bookkeeping_attrs,
        };

        let mut attribute_bytes = HashMap::new();
        let mut offsets_bytes = HashMap::new();
        for (attr, kind, _) in &attr_kinds {
            let stream = attribute_out.remove(attr.name()).expect("seeded above");
            if matches!(kind, ColumnKind::Var) {
                offsets_bytes.insert(attr.name().to_string(), stream.offsets);
            }
            attribute_bytes.insert(attr.name().to_string(), stream.values);
        }

        Ok(PreparedFragment {
            id: FragmentId::new(self.timestamp),
            bookkeeping,
            coords_bytes: None,
            coords_offsets: None,
            attribute_bytes,
            offsets_bytes,
        })
    }
}

/// A tiled, filtered attribute (or coordinate) column accumulated across a
/// fragment's tiles: the bookkeeping offsets plus the actual bytes they
/// point into.
#[derive(Default)]
struct TileStream {
    bookkeeping: AttributeBookkeeping,
    values: Vec<u8>,
    offsets: Vec<u8>,
}

impl TileStream {
    fn push_tile(
        &mut self,
        tile: &ColumnTile,
        filters: &crate::filter::FilterPipeline,
        ctx: &FilterContext,
        chunk_size: usize,
    ) -> Result<()> {
        let filtered = filters.forward_tile(&tile.values, chunk_size, ctx)?;
        self.bookkeeping.tile_offsets.push(self.values.len() as u64);
        self.bookkeeping.tile_sizes.push(filtered.len() as u64);
        self.values.extend_from_slice(&filtered);

        if let Some(raw_offsets) = &tile.offsets {
            self.bookkeeping.var_offsets.push(self.offsets.len() as u64);
            self.bookkeeping.var_sizes.push(raw_offsets.len() as u64);
            self.offsets.extend_from_slice(raw_offsets);
        }
        Ok(())
    }
}

/// One tile's unfiltered bytes, ready to run through a [`crate::filter::FilterPipeline`].
struct ColumnTile {
    values: Vec<u8>,
    /// `u64`-little-endian per-cell start offsets into `values`, present
    /// only for variable-length columns.
    offsets: Option<Vec<u8>>,
}

fn build_column_tile(cell_count: usize, is_var: bool, mut cell_bytes: impl FnMut(usize) -> Vec<u8>) -> ColumnTile {
    let mut values = Vec::new();
    let mut offsets = is_var.then(Vec::new);
    for local in 0..cell_count {
        if let Some(offsets) = offsets.as_mut() {
            use byteorder::{LittleEndian, WriteBytesExt};
            offsets.write_u64::<LittleEndian>(values.len() as u64).expect("write to Vec");
        }
        values.extend_from_slice(&cell_bytes(local));
    }
    ColumnTile { values, offsets }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ColumnKind {
    Fixed(usize),
    Var,
}

fn column_kind_of_dim(dim: &crate::domain::Dimension) -> ColumnKind {
    if dim.is_string() {
        ColumnKind::Var
    } else {
        ColumnKind::Fixed(dim.datatype().byte_width().expect("non-string dimensions are fixed-width"))
    }
}

fn column_kind_of_attr(attr: &Attribute) -> ColumnKind {
    match attr.cell_val_num() {
        CellValNum::Var => ColumnKind::Var,
        CellValNum::Fixed(n) => {
            ColumnKind::Fixed(attr.datatype().byte_width().expect("fixed cell val num implies fixed width") * n as usize)
        }
    }
}

fn column_cell_count(kind: ColumnKind, buf: &AttributeBuffer) -> Result<usize> {
    match kind {
        ColumnKind::Fixed(width) => {
            if width == 0 || buf.data.len() % width != 0 {
                return Err(Error::Query("buffer length is not a multiple of the cell width".into()));
            }
            Ok(buf.data.len() / width)
        }
        ColumnKind::Var => {
            let offsets = buf
                .offsets
                .as_ref()
                .ok_or_else(|| Error::Query("variable-length column is missing its offsets buffer".into()))?;
            Ok(offsets.len())
        }
    }
}

fn column_cell(kind: ColumnKind, buf: &AttributeBuffer, i: usize) -> &[u8] {
    match kind {
        ColumnKind::Fixed(width) => &buf.data[i * width..(i + 1) * width],
        ColumnKind::Var => {
            let offsets = buf.offsets.as_ref().expect("checked by column_cell_count");
            let start = offsets[i] as usize;
            let end = offsets.get(i + 1).map_or(buf.data.len(), |&o| o as usize);
            &buf.data[start..end]
        }
    }
}

/// The bytes stored for one cell: a leading validity byte for nullable
/// attributes, then the cell's value bytes.
fn stored_cell_bytes(attr: &Attribute, buf: &AttributeBuffer, kind: ColumnKind, i: usize) -> Vec<u8> {
    let value = column_cell(kind, buf, i);
    if !attr.is_nullable() {
        return value.to_vec();
    }
    let valid = buf.validity.as_ref().and_then(|v| v.get(i)).copied().unwrap_or(1);
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(valid);
    out.extend_from_slice(value);
    out
}

/// Widens `acc` to also cover `tile_mbr`, per-dimension. Shared with
/// consolidation's dense merge, which unions a whole group's
/// `non_empty_domain`s the same way a writer unions its tiles'.
pub(crate) fn merge_mbr(domain: &Domain, acc: &mut Option<Mbr>, tile_mbr: &Mbr) {
    match acc {
        None => *acc = Some(tile_mbr.clone()),
        Some(acc) => {
            for (i, (dim, (lo, hi))) in domain.dimensions().iter().zip(tile_mbr.iter()).enumerate() {
                if dim.datatype().compare(lo, &acc[i].0) == Ordering::Less {
                    acc[i].0 = lo.clone();
                }
                if dim.datatype().compare(hi, &acc[i].1) == Ordering::Greater {
                    acc[i].1 = hi.clone();
                }
            }
        }
    }
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

/// Enumerates every index vector in `0..extents[i]` for each axis, row-major
/// (last axis fastest).
fn odometer(extents: &[u64]) -> Vec<Vec<u64>> {
    odometer_row_major_or_col(extents, true)
}

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

/// A fragment's tiled, filtered bytes, staged in memory and not yet visible
/// to readers until [`Self::commit`] writes the marker file last.
pub struct PreparedFragment {
    id: FragmentId,
    bookkeeping: Bookkeeping,
    coords_bytes: Option<Vec<u8>>,
    coords_offsets: Option<Vec<u8>>,
    attribute_bytes: HashMap<String, Vec<u8>>,
    offsets_bytes: HashMap<String, Vec<u8>>,
}

impl PreparedFragment {
    #[must_use]
    pub fn id(&self) -> FragmentId {
        self.id
    }

    #[must_use]
    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    /// Overrides the prepared fragment's id, keeping its tiled bytes and
    /// bookkeeping as-is. Consolidation writes its merged fragment through
    /// the ordinary sparse write path and then retimes the result to the
    /// union timestamp range of the fragments it replaced (`spec.md` §4.9).
    #[must_use]
    pub(crate) fn with_id(mut self, id: FragmentId) -> Self {
        self.id = id;
        self
    }

    /// Writes the fragment's files to `array_dir` under `vfs`, publishing it
    /// last by writing the commit marker file only once everything else
    /// has landed (`spec.md` §4.4's commit ordering).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if any underlying write fails.
    pub fn commit<V: Vfs>(&self, vfs: &V, array_dir: &Path) -> Result<Fragment> {
        let fragment = Fragment::new(self.id, self.bookkeeping.clone());

        if let Some(bytes) = &self.coords_bytes {
            vfs.write_append(&array_dir.join(fragment.attribute_file_name(COORDS_FILE_NAME)), bytes)?;
        }
        if let Some(bytes) = &self.coords_offsets {
            vfs.write_append(&array_dir.join(fragment.var_offsets_file_name(COORDS_FILE_NAME)), bytes)?;
        }
        for (name, bytes) in &self.attribute_bytes {
            vfs.write_append(&array_dir.join(fragment.attribute_file_name(name)), bytes)?;
        }
        for (name, bytes) in &self.offsets_bytes {
            vfs.write_append(&array_dir.join(fragment.var_offsets_file_name(name)), bytes)?;
        }
        vfs.write_append(
            &array_dir.join(fragment.bookkeeping_file_name()),
            &self.bookkeeping.serialize(),
        )?;
        vfs.write_append(&array_dir.join(fragment.commit_marker_file_name()), &[])?;

        Ok(fragment)
    }
}
