// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-chunk integrity check, independent of the user-selectable
//! `Checksum-MD5`/`Checksum-SHA256` filters (see [`crate::filter::checksum`]).
//! Every tile chunk's header carries one of these so a reverse filter pass
//! can detect bit rot or truncation before it reaches user buffers.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// An xxh3-64 checksum of a filtered chunk's bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Checksum(u64);

impl Checksum {
    /// Computes the checksum of `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(bytes))
    }

    /// Reads a checksum from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self(reader.read_u64::<LittleEndian>()?))
    }

    /// Writes the checksum to a writer.
    pub fn write_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self.0)
    }
}
