// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! `arrayon` is a storage engine for multi-dimensional dense and sparse
//! arrays: a library that persists typed N-dimensional arrays on a
//! file-like backend and answers range queries over them with predicate
//! pushdown and user-defined tile compression.
//!
//! An [`Array`](crate::array::Array) is a directory holding a [`Schema`] and
//! a set of append-only [`Fragment`](crate::fragment::Fragment)s. Cells are
//! written through a [`FragmentWriter`](crate::fragment::FragmentWriter) and
//! read back through the sparse or dense reader in [`query`], with an
//! optional [`QueryCondition`](crate::query::QueryCondition) pushed down to
//! cell granularity. [`Consolidator`](crate::consolidation::Consolidator)
//! merges a snapshot's fragments down to one in global order.

#![doc(html_logo_url = "")]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod array;
mod buffer;
mod checksum;
mod coding;
mod config;
mod consolidation;
mod datatype;
mod domain;
mod error;
mod filter;
mod fragment;
mod hilbert;
mod order;
mod path;
mod query;
mod schema;
mod slice;
mod stop_signal;
mod time;
mod vfs;

pub use array::{Array, ArrayMode};
pub use buffer::{Buffer, ConstBuffer};
pub use checksum::Checksum;
pub use coding::{Decode, DecodeError, Encode, EncodeError};
pub use config::Config;
pub use consolidation::{vacuum, ConsolidationConfig, Consolidator};
pub use datatype::{CellValNum, Datatype, TimeUnit, Value};
pub use domain::{Dimension, Domain};
pub use error::{Error, Result};
pub use filter::{
    BitShuffleFilter, BitWidthReductionFilter, BloscAlgo, BloscFilter, Bzip2Filter,
    ChecksumMd5Filter, ChecksumSha256Filter, ByteShuffleFilter, DoubleDeltaFilter, Filter,
    FilterContext, FilterOp, FilterPipeline, GzipFilter, Lz4Filter, PositiveDeltaFilter,
    RleFilter, WebpFilter, WebpInputFormat, ZstdFilter, DEFAULT_CHUNK_SIZE,
};
pub use fragment::{Fragment, FragmentId, FragmentWriter, PreparedFragment, WriteInput};
pub use hilbert::HilbertCurve;
pub use query::{AttributeBuffer, CellRange, CompareOp, DenseCellRangeIter, Layout, Query, QueryCondition, Status};
pub use schema::{ArrayType, Attribute, CellOrder, Enumeration, Schema, TileOrder};
pub use slice::Slice;
pub use vfs::{LocalVfs, Vfs};
