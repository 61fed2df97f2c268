// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query execution: condition evaluation (`spec.md` §4.8), the dense cell
//! range iterator (§4.5), and the sparse/dense readers (§4.6, §4.7) that sit
//! on top of them. [`Query`] is the ephemeral handle a caller drives to
//! completion or incompleteness, mirroring the teacher's own short-lived
//! iterator/scanner types (`src/segment/scanner.rs`) rather than a
//! long-lived cursor.

mod condition;
mod dense_range_iter;
pub(crate) mod dense_reader;
pub(crate) mod sparse_reader;

pub use condition::{CompareOp, QueryCondition};
pub use dense_range_iter::{CellRange, DenseCellRangeIter};

use crate::array::Array;
use crate::error::{Error, Result};
use crate::vfs::Vfs;
use std::collections::HashMap;

/// Result layout a query is asked to fill buffers in, or a writer is asked
/// to accept cells in (`spec.md` §3 "Query", §4.4-§4.7).
///
/// Distinct from [`crate::schema::CellOrder`]: a schema's cell order is a
/// persistent property of the array, while a `Layout` is a per-operation
/// choice (e.g. a GLOBAL_ORDER-ordered schema can still be read back in
/// ROW_MAJOR).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
    GlobalOrder,
    /// Sparse reads/writes only; dense queries must request an ordered
    /// layout (`spec.md` §4.5's "Rejects `L = UNORDERED`").
    Unordered,
}

/// Terminal state of one `submit()` call (`spec.md` §6.5; `OK`/`ERR` are
/// folded into this crate's `Result` rather than carried as a status, since
/// they are not a distinct non-error terminal state the way `INCOMPLETE` and
/// `CANCELLED` are).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Every qualifying cell was emitted.
    Complete,
    /// Caller buffers filled before all qualifying cells were emitted; call
    /// `submit()` again with the same buffers (or larger ones) to resume.
    Incomplete,
    /// The query's cancel flag was observed set; the array is unchanged.
    Cancelled,
}

/// One attribute's caller-owned output (or input, for writes) buffers
/// (`spec.md` §6.4).
#[derive(Debug, Default)]
pub struct AttributeBuffer {
    pub data: Vec<u8>,
    /// Present for `VAR` attributes: `offsets[i]` is the byte offset of cell
    /// `i` in `data`.
    pub offsets: Option<Vec<u64>>,
    /// Present for nullable attributes: one byte per cell, 0 = null.
    pub validity: Option<Vec<u8>>,
}

/// A read query against one [`Array`] handle.
pub struct Query<'a, V: Vfs> {
    array: &'a Array<V>,
    layout: Layout,
    subarray: Vec<(Vec<u8>, Vec<u8>)>,
    attributes: Vec<String>,
    condition: Option<QueryCondition>,
    cancel: crate::stop_signal::StopSignal,
    resume: Option<ResumeState>,
}

/// Cursor persisted across `INCOMPLETE` continuations so a completed query
/// plus its continuations emits each qualifying cell exactly once
/// (`spec.md` §4.6 invariant).
#[derive(Clone, Debug, Default)]
struct ResumeState {
    cells_emitted: usize,
}

impl<'a, V: Vfs> Query<'a, V> {
    /// Opens a read query over `array`'s current snapshot.
    #[must_use]
    pub fn new(array: &'a Array<V>, layout: Layout) -> Self {
        Self {
            array,
            layout,
            subarray: Vec::new(),
            attributes: Vec::new(),
            condition: None,
            cancel: crate::stop_signal::StopSignal::default(),
            resume: None,
        }
    }

    /// Restricts the query to `[lo, hi]` (inclusive, raw bytes of the
    /// dimension's datatype) on the next unconstrained dimension, in domain
    /// order.
    #[must_use]
    pub fn add_range(mut self, lo: Vec<u8>, hi: Vec<u8>) -> Self {
        self.subarray.push((lo, hi));
        self
    }

    #[must_use]
    pub fn select_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: QueryCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// A clone of the cooperative cancel flag; calling `send()` on it
    /// cancels this query at the next tile boundary (`spec.md` §5
    /// "Cancellation").
    #[must_use]
    pub fn cancel_handle(&self) -> crate::stop_signal::StopSignal {
        self.cancel.clone()
    }

    /// Executes (or resumes) the query, filling `buffers` in `self.layout`
    /// order up to their capacity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if an attribute name doesn't exist on the
    /// array, `Error::Query` if the subarray has more ranges than
    /// dimensions or a buffer is too small to hold even one cell.
    pub fn submit(&mut self, buffers: &mut HashMap<String, AttributeBuffer>) -> Result<Status> {
        if self.cancel.is_stopped() {
            return Ok(Status::Cancelled);
        }

        let schema = self.array.schema();
        if self.subarray.len() > schema.domain().ndim() {
            return Err(Error::Query(
                "subarray has more ranges than the domain has dimensions".into(),
            ));
        }

        let names: Vec<String> = if self.attributes.is_empty() {
            schema.attributes().iter().map(|a| a.name().to_string()).collect()
        } else {
            self.attributes.clone()
        };
        for name in &names {
            if schema.attribute(name).is_none() {
                return Err(Error::Schema(format!("no such attribute '{name}'")));
            }
        }

        let already_emitted = self.resume.as_ref().map_or(0, |r| r.cells_emitted);

        let (emitted, status) = if schema.array_type() == crate::schema::ArrayType::Sparse {
            sparse_reader::run(
                self.array,
                &self.subarray,
                &names,
                self.condition.as_ref(),
                self.layout,
                buffers,
                already_emitted,
                &self.cancel,
            )?
        } else {
            if self.layout == Layout::Unordered {
                return Err(Error::Query("dense queries must request an ordered layout".into()));
            }
            dense_reader::run(
                self.array,
                &self.subarray,
                &names,
                self.condition.as_ref(),
                self.layout,
                buffers,
                already_emitted,
                &self.cancel,
            )?
        };

        match status {
            Status::Incomplete => {
                self.resume = Some(ResumeState {
                    cells_emitted: already_emitted + emitted,
                });
            }
            Status::Complete | Status::Cancelled => {
                self.resume = None;
            }
        }

        Ok(status)
    }
}
