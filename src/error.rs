// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::checksum::Checksum;
use crate::coding::{DecodeError, EncodeError};

/// Represents the error kinds that can occur in the array storage engine.
///
/// Every variant here corresponds to one of the error kinds named in the
/// design: schema, I/O, codec, bookkeeping, query, concurrency, OOM.
/// Cancellation is a distinct, non-error terminal status and is therefore
/// not a variant of this enum (see [`crate::query::Status`]).
#[derive(Debug)]
pub enum Error {
    /// I/O error bubbled up verbatim from the VFS.
    Io(std::io::Error),

    /// Schema is malformed, has incompatible options, or a query/condition
    /// referenced an attribute or dimension that does not exist.
    Schema(String),

    /// A filter pipeline step failed on write or read (includes checksum
    /// mismatch and double-delta range overflow).
    Codec(String),

    /// Bookkeeping (fragment metadata) is corrupt, truncated, or has an
    /// unsupported format version.
    Bookkeeping(String),

    /// Subarray out of bounds, buffer too small for even one cell,
    /// unordered cells written in GLOBAL_ORDER, or a duplicate coordinate
    /// in a schema with `allows_dups = false`.
    Query(String),

    /// Filelock unavailable, or array opened in the wrong mode for the
    /// requested operation.
    Concurrency(String),

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),

    /// Checksum recorded for a tile chunk did not match the bytes read back.
    InvalidChecksum {
        /// Checksum computed from the bytes read off disk.
        got: Checksum,
        /// Checksum recorded in the chunk header at write time.
        expected: Checksum,
    },

    /// Allocation failure. Always reported, never silently degraded.
    Oom,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Schema(msg) => write!(f, "schema error: {msg}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::Bookkeeping(msg) => write!(f, "bookkeeping error: {msg}"),
            Self::Query(msg) => write!(f, "query error: {msg}"),
            Self::Concurrency(msg) => write!(f, "concurrency error: {msg}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::InvalidChecksum { got, expected } => {
                write!(f, "checksum mismatch: got {got:?}, expected {expected:?}")
            }
            Self::Oom => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Array storage engine result.
pub type Result<T> = std::result::Result<T, Error>;
