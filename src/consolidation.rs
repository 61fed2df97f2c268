// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Consolidation (`spec.md` §4.9): merge a contiguous-timestamp, size-ratio
//! eligible group of a sparse array's fragments into one fragment, via a
//! streaming k-way merge keyed by global cell order, then publish a vacuum
//! marker naming the replaced fragments for a later [`vacuum`] pass to
//! delete.
//!
//! The merge step is grounded on the teacher's own k-way merge (`src/merge.rs`'s
//! `Merger`/`HeapItem` over an `interval_heap::IntervalHeap`), re-keyed here
//! by coordinate tuple under [`order::compare`]/[`order::compare_hilbert`]
//! instead of the teacher's absolute `InternalKey` ordering. Per-fragment
//! decoding reuses the sparse reader's tile-decode helpers
//! (`super::query::sparse_reader`) rather than a third copy of the same
//! filter-reversal logic.
//!
//! Dense arrays take a different merge path: there is no coordinate stream
//! to k-way merge, so a group's tiles are instead resolved the same way the
//! dense reader resolves a whole snapshot (`super::query::dense_reader`'s
//! `fill_attribute`, reused here over just the group's fragments rather than
//! `array.fragments()`), then rewritten as one dense fragment spanning the
//! bounding box of the group's tiles. Because that bounding box fills every
//! untouched cell with the attribute fill value, and the merged fragment's
//! timestamp range places it after every fragment it absorbs, a bounding
//! box that reaches into an *older*, not-yet-consolidated fragment's
//! territory would mask that fragment's real cells once the merge lands.
//! [`Consolidator::select_group`] guards against this by rejecting any
//! dense candidate window whose bounding box overlaps a fragment that
//! sorts before it. Fragments that sort after the window are newer and
//! safely win over the merge wherever they overlap it, so they're not
//! rejected.

use crate::array::{Array, ArrayMode};
use crate::datatype::Datatype;
use crate::domain::Domain;
use crate::error::{Error, Result};
use crate::filter::{FilterContext, FilterPipeline};
use crate::fragment::{
    decode_coord_tuple, merge_mbr, AttributeBookkeeping, Bookkeeping, Fragment, FragmentId, FragmentWriter, Mbr,
    WriteInput, COORDS_FILE_NAME,
};
use crate::hilbert::HilbertCurve;
use crate::order;
use crate::query::dense_reader::fill_attribute;
use crate::query::sparse_reader::{attr_fixed_width, decode_tile_cells, split_validity};
use crate::query::{AttributeBuffer, CellRange, DenseCellRangeIter, Layout};
use crate::schema::{ArrayType, Attribute, CellOrder};
use crate::stop_signal::StopSignal;
use crate::vfs::Vfs;
use interval_heap::IntervalHeap as Heap;
use std::collections::HashMap;

/// Directory holding pending vacuum markers (`spec.md` §6.1).
const VACUUM_DIR_NAME: &str = "__vacuum";

/// Consolidation eligibility and fan-in knobs (`spec.md` §4.9).
#[derive(Clone, Debug)]
pub struct ConsolidationConfig {
    max_fragments: usize,
    size_ratio: f64,
    timestamps: Option<(u64, u64)>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_fragments: 16,
            size_ratio: 3.0,
            timestamps: None,
        }
    }
}

impl ConsolidationConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how many fragments are merged together in a single step.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn max_fragments(mut self, n: usize) -> Self {
        assert!(n >= 2, "consolidation needs at least 2 fragments to merge");
        self.max_fragments = n;
        self
    }

    /// A candidate window of fragments is eligible only when its largest
    /// fragment's size is at most `ratio` times its smallest fragment's
    /// size, so consolidation doesn't spend a full rewrite absorbing one
    /// tiny fragment into one huge one.
    ///
    /// # Panics
    ///
    /// Panics if `ratio` is not positive.
    #[must_use]
    pub fn size_ratio(mut self, ratio: f64) -> Self {
        assert!(ratio > 0.0, "size ratio must be positive");
        self.size_ratio = ratio;
        self
    }

    /// Restricts eligible fragments to those whose entire timestamp range
    /// falls within `[lo, hi]`.
    #[must_use]
    pub fn timestamp_range(mut self, lo: u64, hi: u64) -> Self {
        self.timestamps = Some((lo, hi));
        self
    }
}

/// Drives consolidation over one array handle (`spec.md` §4.9). The handle
/// must be opened in [`ArrayMode::Consolidate`], whose exclusive filelock is
/// what keeps consolidation from racing a writer or another consolidator
/// over the same fragment set; readers still coexist freely.
pub struct Consolidator<'a, V: Vfs> {
    array: &'a mut Array<V>,
    config: ConsolidationConfig,
}

impl<'a, V: Vfs> Consolidator<'a, V> {
    #[must_use]
    pub fn new(array: &'a mut Array<V>, config: ConsolidationConfig) -> Self {
        Self { array, config }
    }

    /// Selects and merges one eligible fragment group, committing the
    /// result and publishing a vacuum marker for the fragments it replaced.
    /// Returns `false` (with no effect) if no eligible group exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` if the array was not opened in
    /// `ArrayMode::Consolidate`. Otherwise whatever the decode, write or
    /// commit path returns.
    pub fn step(&mut self) -> Result<bool> {
        if self.array.mode() != ArrayMode::Consolidate {
            return Err(Error::Concurrency(
                "array must be opened in ArrayMode::Consolidate to run a consolidation step".into(),
            ));
        }

        let Some(group) = self.select_group() else {
            log::trace!("No eligible fragment group found, nothing to consolidate");
            return Ok(false);
        };

        let timestamp_lo = group.iter().map(|f| f.id().timestamp_lo()).min().expect("group is non-empty");
        let timestamp_hi = group.iter().map(|f| f.id().timestamp_hi()).max().expect("group is non-empty");
        log::debug!("Consolidating {} fragments into timestamp range {timestamp_lo}..={timestamp_hi}", group.len());

        let prepared = if self.array.schema().array_type() == ArrayType::Sparse {
            let merged = merge_group(self.array, &group)?;
            let writer = FragmentWriter::new(self.array.schema(), Layout::GlobalOrder, timestamp_lo);
            writer
                .write(WriteInput::Sparse {
                    coords: merged.coords,
                    attributes: merged.attributes,
                })?
                .with_id(FragmentId::new_range(timestamp_lo, timestamp_hi))
        } else {
            let (subarray, attributes) = merge_group_dense(self.array, &group)?;
            let writer = FragmentWriter::new(self.array.schema(), Layout::RowMajor, timestamp_lo);
            writer
                .write(WriteInput::Dense { subarray, attributes })?
                .with_id(FragmentId::new_range(timestamp_lo, timestamp_hi))
        };

        self.array.commit_fragment(&prepared)?;
        log::debug!("Committed consolidated fragment {:?}", prepared.id());
        let superseded: std::collections::HashSet<FragmentId> = group.iter().map(Fragment::id).collect();
        self.array.retain_fragments(&superseded);
        publish_vacuum_marker(self.array, &group)?;
        Ok(true)
    }

    /// Runs [`Self::step`] repeatedly until no eligible group remains,
    /// returning how many merges were performed.
    ///
    /// # Errors
    ///
    /// See [`Self::step`].
    pub fn run(&mut self) -> Result<usize> {
        log::info!("Starting consolidation run");
        let mut rounds = 0;
        while self.step()? {
            rounds += 1;
        }
        log::info!("Consolidation run finished after {rounds} rounds");
        Ok(rounds)
    }

    /// Finds the first (oldest, widest) eligible contiguous-timestamp
    /// window among the array's current fragments, scanning window sizes
    /// from `max_fragments` down to 2 so a run prefers absorbing as many
    /// fragments as it can in one step.
    ///
    /// For a dense array, a window is additionally rejected if its
    /// fragments' bounding box would overlap a fragment that sorts *before*
    /// the window: the merged fragment fills every untouched cell in its
    /// bounding box with the attribute fill value, and since it is newer
    /// than everything it absorbs, overlapping an older fragment it doesn't
    /// absorb would mask that fragment's real cells. A fragment after the
    /// window is newer than the merge and safely wins over it wherever they
    /// overlap, so it's not a rejection case.
    fn select_group(&self) -> Option<Vec<Fragment>> {
        let fragments: Vec<&Fragment> = self
            .array
            .fragments()
            .iter()
            .filter(|f| match self.config.timestamps {
                Some((lo, hi)) => f.id().timestamp_lo() >= lo && f.id().timestamp_hi() <= hi,
                None => true,
            })
            .collect();
        if fragments.len() < 2 {
            return None;
        }

        let dense = self.array.schema().array_type() == ArrayType::Dense;
        let domain = self.array.schema().domain();
        let sizes: Vec<u64> = fragments.iter().map(|f| fragment_size(f.bookkeeping())).collect();
        let max_window = self.config.max_fragments.min(fragments.len());

        for window in (2..=max_window).rev() {
            for start in 0..=(fragments.len() - window) {
                let slice = &sizes[start..start + window];
                let max_size = *slice.iter().max().expect("window is non-empty") as f64;
                let min_size = (*slice.iter().min().expect("window is non-empty")).max(1) as f64;
                if max_size / min_size <= self.config.size_ratio
                    && (!dense || !window_overlaps_outsiders(domain, &fragments, start, window))
                {
                    return Some(fragments[start..start + window].iter().map(|f| (*f).clone()).collect());
                }
            }
        }
        None
    }
}

/// True if the bounding box of `fragments[start..start+window]` would
/// overlap the `non_empty_domain` of any fragment outside that range.
fn window_overlaps_outsiders(domain: &Domain, fragments: &[&Fragment], start: usize, window: usize) -> bool {
    let mut bbox: Option<Mbr> = None;
    for fragment in &fragments[start..start + window] {
        merge_mbr(domain, &mut bbox, &fragment.bookkeeping().non_empty_domain);
    }
    let Some(bbox) = bbox else { return false };

    // `fragments` is sorted ascending by timestamp and the merged fragment's
    // own timestamp range spans exactly the window's, so only fragments
    // *before* the window are older than the merge and at risk of being
    // masked. Fragments after the window are newer and will correctly win
    // over the merged fragment wherever they overlap it.
    fragments[..start].iter().any(|f| mbr_intersects(domain, &bbox, &f.bookkeeping().non_empty_domain))
}

/// Per-dimension range overlap test between two minimum bounding rectangles.
fn mbr_intersects(domain: &Domain, a: &Mbr, b: &Mbr) -> bool {
    domain.dimensions().iter().zip(a.iter()).zip(b.iter()).all(|((dim, (a_lo, a_hi)), (b_lo, b_hi))| {
        dim.datatype().compare(a_lo, b_hi) != std::cmp::Ordering::Greater
            && dim.datatype().compare(b_lo, a_hi) != std::cmp::Ordering::Greater
    })
}

/// Approximates a fragment's on-disk footprint as the sum of its tiles'
/// filtered byte lengths, the same numbers [`crate::fragment::FragmentWriter`]
/// recorded in its bookkeeping at write time.
fn fragment_size(bookkeeping: &Bookkeeping) -> u64 {
    bookkeeping
        .attributes
        .iter()
        .map(|(_, bk)| bk.tile_sizes.iter().sum::<u64>() + bk.var_sizes.iter().sum::<u64>())
        .sum()
}

/// One decoded cell, pending k-way merge: its coordinate tuple and its
/// decoded attribute values (`spec.md` §4.6's `(stored_value_bytes,
/// validity)` shape, reused verbatim from the sparse reader).
#[derive(Clone)]
struct MergeCell {
    coords: Vec<Vec<u8>>,
    values: HashMap<String, (Vec<u8>, Option<bool>)>,
}

struct MergedCells {
    coords: Vec<AttributeBuffer>,
    attributes: HashMap<String, AttributeBuffer>,
}

/// Decodes every fragment in `group` into its own cell stream (already in
/// the schema's cell order, since a fragment's tiles are laid out in that
/// order at write time), then k-way merges the streams into one, resolving
/// duplicate coordinates to the latest-timestamp fragment when the schema
/// doesn't allow duplicates (`spec.md` §4.6 duplicate policy).
fn merge_group<V: Vfs>(array: &Array<V>, group: &[Fragment]) -> Result<MergedCells> {
    let schema = array.schema();
    let domain = schema.domain();
    let names: Vec<String> = schema.attributes().iter().map(|a| a.name().to_string()).collect();

    let streams: Vec<Vec<MergeCell>> = group
        .iter()
        .map(|fragment| decode_fragment_cells(array, fragment, domain, &names))
        .collect::<Result<_>>()?;

    let hilbert_curve = if schema.cell_order() == CellOrder::Hilbert {
        Some(HilbertCurve::new(order::default_hilbert_bits(domain.ndim()), domain.ndim())?)
    } else {
        None
    };

    let mut cursors = vec![0usize; streams.len()];
    let mut heap: Heap<HeapItem<'_>> = Heap::with_capacity(streams.len());
    for (idx, stream) in streams.iter().enumerate() {
        if let Some(cell) = stream.first() {
            heap.push(HeapItem::new(idx, cell, domain, schema.cell_order(), hilbert_curve.as_ref()));
        }
    }

    // (coords, values, source fragment index); `source` doubles as the
    // recency rank since `group` is already ascending by timestamp.
    let mut merged: Vec<(Vec<Vec<u8>>, HashMap<String, (Vec<u8>, Option<bool>)>, usize)> = Vec::new();
    let allows_dups = schema.allows_dups();

    while let Some(item) = heap.pop_min() {
        let idx = item.fragment_idx;
        let pos = cursors[idx];
        let cell = streams[idx][pos].clone();
        cursors[idx] += 1;
        if let Some(next_cell) = streams[idx].get(cursors[idx]) {
            heap.push(HeapItem::new(idx, next_cell, domain, schema.cell_order(), hilbert_curve.as_ref()));
        }

        match merged.last_mut() {
            Some((last_coords, last_values, last_rank)) if !allows_dups && *last_coords == cell.coords => {
                if idx >= *last_rank {
                    *last_values = cell.values;
                    *last_rank = idx;
                }
            }
            _ => merged.push((cell.coords, cell.values, idx)),
        }
    }

    let mut coord_bufs: Vec<AttributeBuffer> = domain.dimensions().iter().map(column_buffer_for_dim).collect();
    let mut attr_bufs: HashMap<String, AttributeBuffer> = schema
        .attributes()
        .iter()
        .map(|a| (a.name().to_string(), column_buffer_for_attr(a)))
        .collect();

    for (coords, values, _) in &merged {
        for (buf, value) in coord_bufs.iter_mut().zip(coords) {
            push_column_cell(buf, value);
        }
        for name in &names {
            let (value, validity) = values.get(name).cloned().unwrap_or_default();
            let buf = attr_bufs.get_mut(name).expect("seeded from schema attributes above");
            push_column_cell(buf, &value);
            if let Some(v) = buf.validity.as_mut() {
                v.push(u8::from(validity.unwrap_or(true)));
            }
        }
    }

    Ok(MergedCells {
        coords: coord_bufs,
        attributes: attr_bufs,
    })
}

/// Unions the group's fragments' `non_empty_domain`s, then widens that box
/// out to the enclosing tile boundary on every dimension, since
/// `FragmentWriter`'s dense path rejects a subarray that isn't tile-aligned.
/// A fragment outside the group is never touched, so this must not reach
/// past the tiles the group itself covers.
fn group_bounding_box(domain: &Domain, group: &[Fragment]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut bbox: Option<Mbr> = None;
    for fragment in group {
        merge_mbr(domain, &mut bbox, &fragment.bookkeeping().non_empty_domain);
    }
    let bbox = bbox.ok_or_else(|| Error::Schema("consolidation group has no fragments".into()))?;

    domain
        .dimensions()
        .iter()
        .zip(bbox.iter())
        .map(|(dim, (lo, hi))| {
            let (domain_lo, domain_hi) = dim
                .domain_bytes()
                .ok_or_else(|| Error::Schema(format!("dimension '{}' has no domain bounds", dim.name())))?;
            let extent_bytes = dim
                .tile_extent_bytes()
                .ok_or_else(|| Error::Schema(format!("dense dimension '{}' has no tile extent", dim.name())))?;

            let domain_lo_v = dim_value_as_i64(dim.datatype(), domain_lo)?;
            let domain_hi_v = dim_value_as_i64(dim.datatype(), domain_hi)?;
            let extent = dim_value_as_i64(dim.datatype(), extent_bytes)?.max(1);
            let lo_v = dim_value_as_i64(dim.datatype(), lo)?;
            let hi_v = dim_value_as_i64(dim.datatype(), hi)?;

            let tile_lo = domain_lo_v + (lo_v - domain_lo_v) / extent * extent;
            let tile_hi = (domain_lo_v + ((hi_v - domain_lo_v) / extent + 1) * extent - 1).min(domain_hi_v);

            Ok((i64_to_dim_bytes(dim.datatype(), tile_lo), i64_to_dim_bytes(dim.datatype(), tile_hi)))
        })
        .collect()
}

fn dim_value_as_i64(datatype: Datatype, bytes: &[u8]) -> Result<i64> {
    let width = datatype
        .byte_width()
        .ok_or_else(|| Error::Schema("dense dimensions must be fixed-width".into()))?;
    Ok(match width {
        1 => i8::from_le_bytes([bytes[0]]) as i64,
        2 => i16::from_le_bytes(bytes.try_into().map_err(|_| Error::Schema("bad dimension value".into()))?) as i64,
        4 => i32::from_le_bytes(bytes.try_into().map_err(|_| Error::Schema("bad dimension value".into()))?) as i64,
        8 => i64::from_le_bytes(bytes.try_into().map_err(|_| Error::Schema("bad dimension value".into()))?),
        _ => return Err(Error::Schema("unsupported dimension width".into())),
    })
}

fn i64_to_dim_bytes(datatype: Datatype, value: i64) -> Vec<u8> {
    match datatype.byte_width() {
        Some(1) => (value as i8).to_le_bytes().to_vec(),
        Some(2) => (value as i16).to_le_bytes().to_vec(),
        Some(4) => (value as i32).to_le_bytes().to_vec(),
        _ => value.to_le_bytes().to_vec(),
    }
}

/// Rewrites a dense array's fragment group as one fragment spanning the
/// group's tile-aligned bounding box, resolving each tile to whichever of
/// the group's fragments last wrote it (the same whole-tile overwrite rule
/// the dense reader applies to a full snapshot, here scoped to just `group`).
///
/// Cells the group never touched (but its bounding box's tiles do cover) are
/// filled with each attribute's fill value rather than left out of the
/// write, since `FragmentWriter` requires a dense write to cover its whole
/// subarray; a later fragment outside the
/// group still correctly overrides those cells at read time, since the
/// merged fragment's `timestamp_hi` never exceeds the group's own maximum.
fn merge_group_dense<V: Vfs>(array: &Array<V>, group: &[Fragment]) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, HashMap<String, AttributeBuffer>)> {
    let schema = array.schema();
    let domain = schema.domain();

    let subarray = group_bounding_box(domain, group)?;

    let storage_row_major = schema.cell_order() != CellOrder::ColMajor;
    let ranges: Vec<CellRange> = DenseCellRangeIter::new(domain, &subarray, Layout::RowMajor, storage_row_major)?.collect();
    let mut range_base = Vec::with_capacity(ranges.len());
    let mut total_cells = 0usize;
    for range in &ranges {
        range_base.push(total_cells);
        total_cells += range.cell_count() as usize;
    }

    let mut cells: Vec<HashMap<String, (Vec<u8>, Option<bool>)>> = vec![HashMap::new(); total_cells];
    let cancel = StopSignal::default();
    for attr in schema.attributes() {
        fill_attribute(array, domain, attr, &ranges, &range_base, &cancel, &mut cells, group)?;
    }
    for attr in schema.attributes() {
        let fill = attr.fill_value().to_vec();
        let validity = attr.is_nullable().then_some(false);
        for cell in &mut cells {
            cell.entry(attr.name().to_string()).or_insert_with(|| (fill.clone(), validity));
        }
    }

    let mut attributes: HashMap<String, AttributeBuffer> =
        schema.attributes().iter().map(|a| (a.name().to_string(), column_buffer_for_attr(a))).collect();
    for cell in &cells {
        for attr in schema.attributes() {
            let (value, validity) = cell.get(attr.name()).cloned().unwrap_or_default();
            let buf = attributes.get_mut(attr.name()).expect("seeded from schema attributes above");
            push_column_cell(buf, &value);
            if let Some(v) = buf.validity.as_mut() {
                v.push(u8::from(validity.unwrap_or(true)));
            }
        }
    }

    Ok((subarray, attributes))
}

fn column_buffer_for_dim(dim: &crate::domain::Dimension) -> AttributeBuffer {
    AttributeBuffer {
        data: Vec::new(),
        offsets: dim.is_string().then(Vec::new),
        validity: None,
    }
}

fn column_buffer_for_attr(attr: &Attribute) -> AttributeBuffer {
    AttributeBuffer {
        data: Vec::new(),
        offsets: attr.cell_val_num().is_var().then(Vec::new),
        validity: attr.is_nullable().then(Vec::new),
    }
}

fn push_column_cell(buf: &mut AttributeBuffer, value: &[u8]) {
    if let Some(offsets) = buf.offsets.as_mut() {
        offsets.push(buf.data.len() as u64);
    }
    buf.data.extend_from_slice(value);
}

/// Decodes every tile of every attribute (plus coordinates) in `fragment`
/// into one flat cell list, in on-disk tile order. A fragment's tiles are
/// written in the schema's cell order (`FragmentWriter::write_sparse`), so
/// this list is already fully sorted; no independent re-sort is needed
/// before merging it against its siblings.
fn decode_fragment_cells<V: Vfs>(
    array: &Array<V>,
    fragment: &Fragment,
    domain: &Domain,
    names: &[String],
) -> Result<Vec<MergeCell>> {
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
    let mut attr_columns = Vec::with_capacity(names.len());
    for name in names {
        let attr = schema.attribute(name).expect("schema attribute list is authoritative");
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

    let mut cells = Vec::new();
    for tile_idx in 0..bookkeeping.mbrs.len() {
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
            let decoded = decode_tile_cells(
                &col.file,
                col.bookkeeping,
                tile_idx,
                col.attr.filters(),
                &ctx,
                col.is_var,
                col.offsets_file.as_deref(),
                col.fixed_width,
            )?;
            attr_cells.push(decoded);
        }

        for (local, coord_bytes) in coords_cells.iter().enumerate() {
            let coords = decode_coord_tuple(domain, coord_bytes)?;
            let mut values = HashMap::with_capacity(attr_columns.len());
            for (col, cells_col) in attr_columns.iter().zip(&attr_cells) {
                let stored = cells_col
                    .get(local)
                    .ok_or_else(|| Error::Bookkeeping("attribute tile has fewer cells than the coordinate tile".into()))?;
                let (valid, value) = split_validity(col.attr, stored);
                values.insert(col.attr.name().to_string(), (value.to_vec(), valid));
            }
            cells.push(MergeCell { coords, values });
        }
    }
    Ok(cells)
}

/// One stream's next pending cell, ordered by coordinate under the
/// schema's cell order (or Hilbert ordinal). Mirrors the teacher's
/// `HeapItem(usize, InternalValue)`, with the comparison context (domain,
/// cell order, optional curve) carried alongside instead of baked into a
/// standalone key type.
struct HeapItem<'a> {
    fragment_idx: usize,
    coords: Vec<Vec<u8>>,
    domain: &'a Domain,
    cell_order: CellOrder,
    curve: Option<&'a HilbertCurve>,
}

impl<'a> HeapItem<'a> {
    fn new(fragment_idx: usize, cell: &MergeCell, domain: &'a Domain, cell_order: CellOrder, curve: Option<&'a HilbertCurve>) -> Self {
        Self {
            fragment_idx,
            coords: cell.coords.clone(),
            domain,
            cell_order,
            curve,
        }
    }

    fn coord_refs(&self) -> Vec<&[u8]> {
        self.coords.iter().map(Vec::as_slice).collect()
    }
}

impl PartialEq for HeapItem<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapItem<'_> {}

impl PartialOrd for HeapItem<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a = self.coord_refs();
        let b = other.coord_refs();
        match self.curve {
            Some(curve) => order::compare_hilbert(self.domain, curve, &a, &b),
            None => order::compare(self.domain, self.cell_order, &a, &b),
        }
    }
}

/// Writes a vacuum marker listing the fragment directories `group` made
/// redundant (`spec.md` §4.9's "Publish" step); [`vacuum`] deletes them
/// later.
fn publish_vacuum_marker<V: Vfs>(array: &Array<V>, group: &[Fragment]) -> Result<()> {
    let mut body = Vec::new();
    for fragment in group {
        body.extend_from_slice(fragment.id().directory_name().as_bytes());
        body.push(b'\n');
    }
    let marker_path = format!("{VACUUM_DIR_NAME}/{}.vac", crate::time::unix_timestamp().as_micros());
    array.write_file(&marker_path, &body)
}

/// Deletes every fragment directory named by a pending vacuum marker, then
/// removes the marker itself.
///
/// Callers are responsible for ensuring no reader still holds a snapshot
/// that could dereference a listed fragment; `spec.md` §4.9 leaves the
/// exact safety window to the caller rather than mandating a reference
/// count on open handles.
///
/// # Errors
///
/// Returns `Error::Concurrency` if `array` was not opened in
/// `ArrayMode::Consolidate`. Returns `Error::Io` on any VFS failure.
pub fn vacuum<V: Vfs>(array: &Array<V>) -> Result<usize> {
    if array.mode() != ArrayMode::Consolidate {
        return Err(Error::Concurrency(
            "vacuum requires the array to be opened in ArrayMode::Consolidate".into(),
        ));
    }

    let vfs = array.vfs();
    let vacuum_dir = array.uri().join(VACUUM_DIR_NAME);
    if !vfs.exists(&vacuum_dir)? {
        log::trace!("No vacuum markers at {}", vacuum_dir.display());
        return Ok(0);
    }

    let mut removed = 0;
    for entry in vfs.ls(&vacuum_dir)? {
        if entry.is_dir {
            continue;
        }
        let len = vfs.file_size(&entry.path)?;
        let mut body = vec![0u8; len as usize];
        vfs.read(&entry.path, 0, &mut body)?;

        for line in body.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(line);
            let fragment_dir = array.uri().join(name.as_ref());
            if vfs.exists(&fragment_dir)? {
                vfs.remove_dir_all(&fragment_dir)?;
                removed += 1;
            }
        }
        vfs.remove(&entry.path)?;
    }
    log::info!("Vacuumed {removed} superseded fragments from {}", array.uri().display());
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datatype::CellValNum;
    use crate::domain::Dimension;
    use crate::query::{Layout as L, Query, Status};
    use crate::schema::{ArrayType, Attribute, Schema};
    use crate::vfs::LocalVfs;
    use test_log::test;

    fn schema() -> Schema {
        let mut schema = Schema::new(ArrayType::Sparse);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 99i32, Some(10i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
            .unwrap();
        schema.set_capacity(4).unwrap();
        schema.finalize().unwrap()
    }

    fn write_points<V: Vfs>(array: &mut Array<V>, schema: &Schema, timestamp: u64, xs: &[i32], values: &[i32]) {
        let writer = FragmentWriter::new(schema, L::Unordered, timestamp);
        let mut attributes = HashMap::new();
        attributes.insert(
            "a".to_string(),
            AttributeBuffer {
                data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
                offsets: None,
                validity: None,
            },
        );
        let coords = vec![AttributeBuffer {
            data: xs.iter().flat_map(|v| v.to_le_bytes()).collect(),
            offsets: None,
            validity: None,
        }];
        let prepared = writer.write(WriteInput::Sparse { coords, attributes }).unwrap();
        array.commit_fragment(&prepared).unwrap();
    }

    fn read_all(array: &Array<LocalVfs>) -> Vec<i32> {
        let mut query = Query::new(array, L::RowMajor).add_range(0i32.to_le_bytes().to_vec(), 99i32.to_le_bytes().to_vec());
        let mut buffers = HashMap::new();
        buffers.insert(
            "a".to_string(),
            AttributeBuffer {
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
    fn merges_two_fragments_into_one_and_preserves_cells() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
        write_points(&mut array, &schema, 1, &[5, 1], &[500, 100]);
        write_points(&mut array, &schema, 2, &[50, 9], &[5000, 900]);
        array.close();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context.clone(), None).unwrap();
        let mut consolidator = Consolidator::new(&mut array, ConsolidationConfig::new());
        assert!(consolidator.step().unwrap());
        assert_eq!(array.fragments().len(), 1);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
        let mut values = read_all(&array);
        values.sort_unstable();
        assert_eq!(values, vec![100, 500, 900, 5000]);
    }

    #[test]
    fn later_fragment_wins_on_duplicate_coordinate() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
        write_points(&mut array, &schema, 1, &[5], &[111]);
        write_points(&mut array, &schema, 2, &[5], &[222]);
        array.close();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context.clone(), None).unwrap();
        Consolidator::new(&mut array, ConsolidationConfig::new()).step().unwrap();
        array.close();

        let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
        assert_eq!(read_all(&array), vec![222]);
    }

    #[test]
    fn size_ratio_blocks_ineligible_groups() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
        write_points(&mut array, &schema, 1, &[1], &[10]);
        write_points(&mut array, &schema, 2, &[2, 3, 4, 5, 6, 7, 8, 9], &[20, 30, 40, 50, 60, 70, 80, 90]);
        array.close();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context, None).unwrap();
        let config = ConsolidationConfig::new().size_ratio(1.01);
        let mut consolidator = Consolidator::new(&mut array, config);
        assert!(!consolidator.step().unwrap());
        assert_eq!(array.fragments().len(), 2);
    }

    #[test]
    fn vacuum_deletes_fragments_named_in_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        let schema = schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
        write_points(&mut array, &schema, 1, &[5], &[500]);
        write_points(&mut array, &schema, 2, &[6], &[600]);
        array.close();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context.clone(), None).unwrap();
        Consolidator::new(&mut array, ConsolidationConfig::new()).step().unwrap();
        let removed = vacuum(&array).unwrap();
        assert_eq!(removed, 2);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
        assert_eq!(array.fragments().len(), 1);
        assert_eq!(read_all(&array), vec![500, 600].into_iter().collect::<Vec<_>>());
    }

    fn dense_schema() -> Schema {
        let mut schema = Schema::new(ArrayType::Dense);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 1i32, 4i32, Some(1i32)).unwrap())
            .unwrap();
        schema
            .add_dimension(Dimension::new_numeric("y", Datatype::Int32, 1i32, 4i32, Some(1i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
            .unwrap();
        schema.finalize().unwrap()
    }

    fn write_dense_box<V: Vfs>(array: &mut Array<V>, schema: &Schema, timestamp: u64, x: (i32, i32), y: (i32, i32), values: &[i32]) {
        let writer = FragmentWriter::new(schema, L::RowMajor, timestamp);
        let mut attributes = HashMap::new();
        attributes.insert(
            "a".to_string(),
            AttributeBuffer {
                data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
                offsets: None,
                validity: None,
            },
        );
        let subarray = vec![
            (x.0.to_le_bytes().to_vec(), x.1.to_le_bytes().to_vec()),
            (y.0.to_le_bytes().to_vec(), y.1.to_le_bytes().to_vec()),
        ];
        let prepared = writer.write(WriteInput::Dense { subarray, attributes }).unwrap();
        array.commit_fragment(&prepared).unwrap();
    }

    fn read_all_dense(array: &Array<LocalVfs>) -> Vec<i32> {
        let mut query = Query::new(array, L::RowMajor)
            .add_range(1i32.to_le_bytes().to_vec(), 4i32.to_le_bytes().to_vec())
            .add_range(1i32.to_le_bytes().to_vec(), 4i32.to_le_bytes().to_vec());
        let mut buffers = HashMap::new();
        buffers.insert(
            "a".to_string(),
            AttributeBuffer {
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
    fn consolidating_a_dense_array_preserves_every_cell() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dense_schema();
        Array::create(&LocalVfs, dir.path(), &schema).unwrap();
        let context = Config::new().build().unwrap().shared();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Write, context.clone(), None).unwrap();
        write_dense_box(&mut array, &schema, 1, (1, 2), (1, 4), &[1, 2, 3, 4, 5, 6, 7, 8]);
        write_dense_box(&mut array, &schema, 2, (2, 3), (2, 3), &[90, 91, 92, 93]);
        write_dense_box(&mut array, &schema, 3, (1, 1), (1, 1), &[1000]);
        write_dense_box(&mut array, &schema, 4, (3, 3), (4, 4), &[2000]);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context.clone(), None).unwrap();
        let before = read_all_dense(&array);
        array.close();

        let mut array = Array::open(LocalVfs, dir.path(), ArrayMode::Consolidate, context.clone(), None).unwrap();
        let rounds = Consolidator::new(&mut array, ConsolidationConfig::new()).run().unwrap();
        assert!(rounds > 0);
        assert!(array.fragments().len() < 4);
        array.close();

        let array = Array::open(LocalVfs, dir.path(), ArrayMode::Read, context, None).unwrap();
        let after = read_all_dense(&array);
        assert_eq!(before, after);
    }
}
