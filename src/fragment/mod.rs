// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fragment identity and bookkeeping (`spec.md` §3 "Fragment", §4.4).
//!
//! A fragment is one write operation's immutable, append-only output: a
//! directory named `__<timestamp_lo>_<timestamp_hi>_<uuid>_<format_version>`
//! holding one file per attribute plus a `__coords` file (sparse only), a
//! bookkeeping file, and a `__fragment.tdb` marker written last to publish
//! the fragment atomically. Grounded on the teacher's `GlobalSegmentId`
//! (`src/segment/id.rs`) for the identity half and `ParsedMeta`
//! (`src/segment/meta.rs`) for the bookkeeping half, re-expressed through
//! this crate's own `Encode`/`Decode` wire format rather than the teacher's
//! block-keyed metadata store.

mod writer;

pub(crate) use writer::merge_mbr;
pub use writer::{FragmentWriter, PreparedFragment, WriteInput};

use crate::coding::{read_bytes, write_bytes, Decode, DecodeError, Encode, EncodeError};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const BOOKKEEPING_MAGIC: u32 = 0x5444_4246; // "TDBF"
const BOOKKEEPING_FORMAT_VERSION: u32 = 1;

/// Current on-disk fragment format version, embedded in [`FragmentId`] and
/// the bookkeeping header.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the marker file written last to publish a fragment. Its presence
/// is the sole criterion for a fragment being visible to readers.
pub const COMMIT_MARKER_NAME: &str = "__fragment.tdb";

/// Name of the bookkeeping file within a fragment directory.
pub const BOOKKEEPING_FILE_NAME: &str = "__bookkeeping.tdb";

/// Name of the coordinates file within a sparse fragment directory.
pub const COORDS_FILE_NAME: &str = "__coords";

/// A fragment's unique identity: its timestamp range, a random disambiguator
/// and the format version it was written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentId {
    timestamp_lo: u64,
    timestamp_hi: u64,
    uuid: uuid::Uuid,
    format_version: u32,
}

impl FragmentId {
    /// Creates a fresh id for a single-timestamp write (the common case: one
    /// fragment commits at one moment in time).
    #[must_use]
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp_lo: timestamp,
            timestamp_hi: timestamp,
            uuid: uuid::Uuid::new_v4(),
            format_version: FORMAT_VERSION,
        }
    }

    /// Creates an id spanning a timestamp range, as produced by
    /// consolidation merging several input fragments (`spec.md` §4.9).
    ///
    /// # Panics
    ///
    /// Panics if `timestamp_lo > timestamp_hi`.
    #[must_use]
    pub fn new_range(timestamp_lo: u64, timestamp_hi: u64) -> Self {
        assert!(timestamp_lo <= timestamp_hi);
        Self {
            timestamp_lo,
            timestamp_hi,
            uuid: uuid::Uuid::new_v4(),
            format_version: FORMAT_VERSION,
        }
    }

    #[must_use]
    pub fn timestamp_lo(&self) -> u64 {
        self.timestamp_lo
    }

    #[must_use]
    pub fn timestamp_hi(&self) -> u64 {
        self.timestamp_hi
    }

    /// Whether this fragment is visible in a snapshot taken at `timestamp`:
    /// its entire timestamp range must not exceed it.
    #[must_use]
    pub fn visible_at(&self, timestamp: u64) -> bool {
        self.timestamp_hi <= timestamp
    }

    /// The fragment's directory name, `__<lo>_<hi>_<uuid>_<version>`.
    #[must_use]
    pub fn directory_name(&self) -> String {
        format!(
            "__{}_{}_{}_{}",
            self.timestamp_lo, self.timestamp_hi, self.uuid, self.format_version
        )
    }

    /// Parses a directory name produced by [`Self::directory_name`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Bookkeeping` if `name` is not in the expected shape.
    pub fn parse(name: &str) -> crate::error::Result<Self> {
        let rest = name
            .strip_prefix("__")
            .ok_or_else(|| bad_name(name))?;
        let mut parts = rest.splitn(4, '_');
        let timestamp_lo: u64 = parts.next().ok_or_else(|| bad_name(name))?.parse().map_err(|_| bad_name(name))?;
        let timestamp_hi: u64 = parts.next().ok_or_else(|| bad_name(name))?.parse().map_err(|_| bad_name(name))?;
        let uuid_str = parts.next().ok_or_else(|| bad_name(name))?;
        let uuid = uuid::Uuid::parse_str(uuid_str).map_err(|_| bad_name(name))?;
        let format_version: u32 = parts.next().ok_or_else(|| bad_name(name))?.parse().map_err(|_| bad_name(name))?;
        Ok(Self {
            timestamp_lo,
            timestamp_hi,
            uuid,
            format_version,
        })
    }
}

fn bad_name(name: &str) -> crate::error::Error {
    crate::error::Error::Bookkeeping(format!("'{name}' is not a fragment directory name"))
}

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directory_name())
    }
}

/// Tight bounding rectangle of the cells in one coordinate tile (sparse
/// fragments only): `(lo, hi)` raw bytes per dimension.
pub type Mbr = Vec<(Vec<u8>, Vec<u8>)>;

/// Per-attribute tile bookkeeping: where each tile's filtered bytes live in
/// the attribute's file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeBookkeeping {
    /// Byte offset of tile `k` within `<attr>.tdb`.
    pub tile_offsets: Vec<u64>,
    /// Byte length of tile `k` within `<attr>.tdb`.
    pub tile_sizes: Vec<u64>,
    /// For `VAR` attributes only: offset/size of tile `k` within
    /// `<attr>_offsets.tdb`.
    pub var_offsets: Vec<u64>,
    pub var_sizes: Vec<u64>,
}

impl AttributeBookkeeping {
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.tile_offsets.len()
    }
}

impl Encode for AttributeBookkeeping {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_u64_vec(writer, &self.tile_offsets)?;
        write_u64_vec(writer, &self.tile_sizes)?;
        write_u64_vec(writer, &self.var_offsets)?;
        write_u64_vec(writer, &self.var_sizes)?;
        Ok(())
    }
}

impl Decode for AttributeBookkeeping {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            tile_offsets: read_u64_vec(reader)?,
            tile_sizes: read_u64_vec(reader)?,
            var_offsets: read_u64_vec(reader)?,
            var_sizes: read_u64_vec(reader)?,
        })
    }
}

fn write_u64_vec<W: Write>(writer: &mut W, values: &[u64]) -> std::result::Result<(), EncodeError> {
    writer.write_u32::<LittleEndian>(values.len() as u32)?;
    for v in values {
        writer.write_u64::<LittleEndian>(*v)?;
    }
    Ok(())
}

fn read_u64_vec<R: Read>(reader: &mut R) -> std::result::Result<Vec<u64>, DecodeError> {
    let count = reader.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(out)
}

fn write_mbr<W: Write>(writer: &mut W, mbr: &Mbr) -> std::result::Result<(), EncodeError> {
    writer.write_u32::<LittleEndian>(mbr.len() as u32)?;
    for (lo, hi) in mbr {
        write_bytes(writer, lo)?;
        write_bytes(writer, hi)?;
    }
    Ok(())
}

fn read_mbr<R: Read>(reader: &mut R) -> std::result::Result<Mbr, DecodeError> {
    let ndim = reader.read_u32::<LittleEndian>()?;
    let mut out = Vec::with_capacity(ndim as usize);
    for _ in 0..ndim {
        let lo = read_bytes(reader, "Mbr.lo")?;
        let hi = read_bytes(reader, "Mbr.hi")?;
        out.push((lo, hi));
    }
    Ok(out)
}

/// A fragment's full bookkeeping: everything a reader needs to prune and
/// fetch tiles without touching the attribute files themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bookkeeping {
    pub sparse: bool,
    pub timestamp_lo: u64,
    pub timestamp_hi: u64,
    pub tile_count: u64,
    /// Non-empty domain: per-dimension `(lo, hi)` actually covered by this
    /// fragment's cells.
    pub non_empty_domain: Mbr,
    /// Per coord tile, the tight bounding rectangle (sparse only; empty for
    /// dense fragments, whose tiles are implied by the subarray instead).
    pub mbrs: Vec<Mbr>,
    /// Per-attribute-name bookkeeping, insertion order matches the schema's
    /// attribute order with `__coords` (sparse) appended last.
    pub attributes: Vec<(String, AttributeBookkeeping)>,
}

impl Bookkeeping {
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeBookkeeping> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    /// Serializes with an explicit magic/version header, mirroring
    /// [`crate::Schema::serialize`].
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(BOOKKEEPING_MAGIC).expect("write to Vec");
        out.write_u32::<LittleEndian>(BOOKKEEPING_FORMAT_VERSION)
            .expect("write to Vec");
        out.write_u8(u8::from(self.sparse)).expect("write to Vec");
        out.write_u64::<LittleEndian>(self.timestamp_lo).expect("write to Vec");
        out.write_u64::<LittleEndian>(self.timestamp_hi).expect("write to Vec");
        out.write_u64::<LittleEndian>(self.tile_count).expect("write to Vec");

        write_mbr(&mut out, &self.non_empty_domain).expect("write to Vec");

        out.write_u32::<LittleEndian>(self.mbrs.len() as u32)
            .expect("write to Vec");
        for mbr in &self.mbrs {
            write_mbr(&mut out, mbr).expect("write to Vec");
        }

        out.write_u32::<LittleEndian>(self.attributes.len() as u32)
            .expect("write to Vec");
        for (name, bk) in &self.attributes {
            crate::coding::write_string(&mut out, name).expect("write to Vec");
            bk.encode_into(&mut out).expect("write to Vec");
        }

        out
    }

    /// Inverse of [`Self::serialize`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Bookkeeping` if the header is missing or
    /// unrecognized, `Error::Decode` on any other malformed field.
    pub fn deserialize(bytes: &[u8]) -> crate::error::Result<Self> {
        let mut reader = std::io::Cursor::new(bytes);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != BOOKKEEPING_MAGIC {
            return Err(crate::error::Error::Bookkeeping(
                "bookkeeping file has an invalid magic".into(),
            ));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != BOOKKEEPING_FORMAT_VERSION {
            return Err(crate::error::Error::Bookkeeping(format!(
                "bookkeeping format version {version} is not supported"
            )));
        }

        let sparse = reader.read_u8()? != 0;
        let timestamp_lo = reader.read_u64::<LittleEndian>()?;
        let timestamp_hi = reader.read_u64::<LittleEndian>()?;
        let tile_count = reader.read_u64::<LittleEndian>()?;
        let non_empty_domain = read_mbr(&mut reader)?;

        let mbr_count = reader.read_u32::<LittleEndian>()?;
        let mut mbrs = Vec::with_capacity(mbr_count as usize);
        for _ in 0..mbr_count {
            mbrs.push(read_mbr(&mut reader)?);
        }

        let attr_count = reader.read_u32::<LittleEndian>()?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            let name = read_string(&mut reader, "Bookkeeping.attribute.name")?;
            let bk = AttributeBookkeeping::decode_from(&mut reader)?;
            attributes.push((name, bk));
        }

        Ok(Self {
            sparse,
            timestamp_lo,
            timestamp_hi,
            tile_count,
            non_empty_domain,
            mbrs,
            attributes,
        })
    }
}

fn read_string<R: Read>(reader: &mut R, field: &'static str) -> std::result::Result<String, DecodeError> {
    crate::coding::read_string(reader, field)
}

/// Whether the coordinate tuple pseudo-attribute (`spec.md` §3's `__coords`)
/// is variable-length: true iff any dimension is a string dimension.
#[must_use]
pub fn coords_is_var(domain: &crate::domain::Domain) -> bool {
    domain.dimensions().iter().any(crate::domain::Dimension::is_string)
}

/// Packs one coordinate tuple (one raw-byte value per dimension, in domain
/// order) into the `__coords` pseudo-attribute's cell layout: fixed
/// dimensions are concatenated as-is, string dimensions are
/// length-prefixed so a tuple with a string dimension still has a
/// self-describing byte length.
#[must_use]
pub fn encode_coord_tuple(domain: &crate::domain::Domain, coords: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for (dim, value) in domain.dimensions().iter().zip(coords.iter()) {
        if dim.is_string() {
            out.write_u32::<LittleEndian>(value.len() as u32).expect("write to Vec");
        }
        out.extend_from_slice(value);
    }
    out
}

/// Inverse of [`encode_coord_tuple`]: splits a packed tuple back into its
/// per-dimension raw-byte values.
///
/// # Errors
///
/// Returns `Error::Bookkeeping` if `bytes` is shorter than the dimensions
/// require (a fixed dimension's declared width, or a string dimension's
/// length prefix plus payload).
pub fn decode_coord_tuple(domain: &crate::domain::Domain, bytes: &[u8]) -> crate::error::Result<Vec<Vec<u8>>> {
    let mut cursor = std::io::Cursor::new(bytes);
    let mut out = Vec::with_capacity(domain.ndim());
    for dim in domain.dimensions() {
        let value = if dim.is_string() {
            let len = cursor.read_u32::<LittleEndian>().map_err(|_| {
                crate::error::Error::Bookkeeping("coordinate tuple truncated before a string length prefix".into())
            })? as usize;
            let mut buf = vec![0u8; len];
            std::io::Read::read_exact(&mut cursor, &mut buf)
                .map_err(|_| crate::error::Error::Bookkeeping("coordinate tuple truncated before a string value".into()))?;
            buf
        } else {
            let width = dim
                .datatype()
                .byte_width()
                .expect("non-string dimensions are always fixed-width");
            let mut buf = vec![0u8; width];
            std::io::Read::read_exact(&mut cursor, &mut buf)
                .map_err(|_| crate::error::Error::Bookkeeping("coordinate tuple truncated before a fixed-width value".into()))?;
            buf
        };
        out.push(value);
    }
    Ok(out)
}

/// A fully addressable fragment: its identity and its loaded bookkeeping.
/// Attribute/coordinate bytes are fetched on demand through the VFS by the
/// readers; a `Fragment` itself holds no open file handles.
#[derive(Clone, Debug)]
pub struct Fragment {
    id: FragmentId,
    bookkeeping: Bookkeeping,
}

impl Fragment {
    #[must_use]
    pub fn new(id: FragmentId, bookkeeping: Bookkeeping) -> Self {
        Self { id, bookkeeping }
    }

    #[must_use]
    pub fn id(&self) -> FragmentId {
        self.id
    }

    #[must_use]
    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.bookkeeping.sparse
    }

    /// Path, relative to the array directory, of the named attribute's tile
    /// file (`__coords` for the coordinate tiles of a sparse fragment).
    #[must_use]
    pub fn attribute_file_name(&self, attr_name: &str) -> String {
        format!("{}/{attr_name}.tdb", self.id.directory_name())
    }

    #[must_use]
    pub fn var_offsets_file_name(&self, attr_name: &str) -> String {
        format!("{}/{attr_name}_offsets.tdb", self.id.directory_name())
    }

    #[must_use]
    pub fn bookkeeping_file_name(&self) -> String {
        format!("{}/{BOOKKEEPING_FILE_NAME}", self.id.directory_name())
    }

    #[must_use]
    pub fn commit_marker_file_name(&self) -> String {
        format!("{}/{COMMIT_MARKER_NAME}", self.id.directory_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn directory_name_roundtrip() {
        let id = FragmentId::new_range(10, 20);
        let name = id.directory_name();
        let parsed = FragmentId::parse(&name).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn visible_at_uses_upper_bound() {
        let id = FragmentId::new_range(10, 20);
        assert!(!id.visible_at(15));
        assert!(id.visible_at(20));
        assert!(id.visible_at(25));
    }

    #[test]
    fn bookkeeping_serialize_roundtrip() {
        let mut attr_bk = AttributeBookkeeping::default();
        attr_bk.tile_offsets = vec![0, 100];
        attr_bk.tile_sizes = vec![100, 50];

        let bookkeeping = Bookkeeping {
            sparse: true,
            timestamp_lo: 1,
            timestamp_hi: 1,
            tile_count: 2,
            non_empty_domain: vec![(vec![0], vec![9])],
            mbrs: vec![vec![(vec![0], vec![4])], vec![(vec![5], vec![9])]],
            attributes: vec![("a".to_string(), attr_bk)],
        };

        let bytes = bookkeeping.serialize();
        let decoded = Bookkeeping::deserialize(&bytes).unwrap();
        assert_eq!(bookkeeping, decoded);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(FragmentId::parse("not_a_fragment").is_err());
    }

    #[test]
    fn coord_tuple_roundtrip_with_string_dimension() {
        use crate::datatype::Datatype;
        use crate::domain::Dimension;

        let mut domain = crate::domain::Domain::new();
        domain
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 99i32, Some(10i32)).unwrap())
            .unwrap();
        domain.add_dimension(Dimension::new_string("id")).unwrap();

        let x = 5i32.to_le_bytes();
        let id = b"row-five".as_slice();
        let packed = encode_coord_tuple(&domain, &[&x, id]);
        let unpacked = decode_coord_tuple(&domain, &packed).unwrap();
        assert_eq!(unpacked[0], x.to_vec());
        assert_eq!(unpacked[1], id.to_vec());
    }
}
