// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Array schema (`spec.md` §4.3): binds a [`Domain`] and a list of
//! [`Attribute`]s under an [`ArrayType`], a global cell/tile order and a
//! sparse `capacity`. `finalize()` freezes the builder into an immutable,
//! serializable value per the wire layout in `spec.md` §6.2.

use crate::coding::{read_bytes, read_string, write_bytes, write_string, Decode, DecodeError, Encode, EncodeError};
use crate::datatype::{CellValNum, Datatype};
use crate::domain::{Dimension, Domain};
use crate::error::{Error, Result};
use crate::filter::FilterPipeline;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const SCHEMA_MAGIC: u32 = 0x5444_4253; // "TDBS"
const SCHEMA_FORMAT_VERSION: u32 = 1;

/// Whether an array's cells form a dense rectangular grid or a sparse set of
/// explicitly-coordinated cells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrayType {
    Dense,
    Sparse,
}

impl ArrayType {
    fn tag(self) -> u8 {
        match self {
            Self::Dense => 0,
            Self::Sparse => 1,
        }
    }

    fn from_tag(tag: u8) -> std::result::Result<Self, DecodeError> {
        Ok(match tag {
            0 => Self::Dense,
            1 => Self::Sparse,
            tag => return Err(DecodeError::InvalidTag(("ArrayType", tag))),
        })
    }
}

/// The order cells within a tile, or tiles within the domain, are laid out.
/// `Unordered` is a query-only layout (`spec.md` §3's `Schema` invariants);
/// `Hilbert` is a sparse-only cell order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellOrder {
    RowMajor,
    ColMajor,
    GlobalOrder,
    Unordered,
    Hilbert,
}

impl CellOrder {
    fn tag(self) -> u8 {
        match self {
            Self::RowMajor => 0,
            Self::ColMajor => 1,
            Self::GlobalOrder => 2,
            Self::Unordered => 3,
            Self::Hilbert => 4,
        }
    }

    fn from_tag(tag: u8) -> std::result::Result<Self, DecodeError> {
        Ok(match tag {
            0 => Self::RowMajor,
            1 => Self::ColMajor,
            2 => Self::GlobalOrder,
            3 => Self::Unordered,
            4 => Self::Hilbert,
            tag => return Err(DecodeError::InvalidTag(("CellOrder", tag))),
        })
    }
}

/// The order tiles within the domain are laid out. Never `Unordered` or
/// `Hilbert` — those are cell orders only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TileOrder {
    RowMajor,
    ColMajor,
}

impl TileOrder {
    fn tag(self) -> u8 {
        match self {
            Self::RowMajor => 0,
            Self::ColMajor => 1,
        }
    }

    fn from_tag(tag: u8) -> std::result::Result<Self, DecodeError> {
        Ok(match tag {
            0 => Self::RowMajor,
            1 => Self::ColMajor,
            tag => return Err(DecodeError::InvalidTag(("TileOrder", tag))),
        })
    }
}

/// An ordered list of same-typed variants an attribute's stored integer index
/// resolves against. Referenced by name from [`Attribute`] rather than by
/// back-pointer, resolved at schema-open time (`spec.md` §9's "Cyclic
/// references" note).
#[derive(Clone, Debug, PartialEq)]
pub struct Enumeration {
    name: String,
    datatype: Datatype,
    variants: Vec<Vec<u8>>,
}

impl Enumeration {
    #[must_use]
    pub fn new(name: impl Into<String>, datatype: Datatype, variants: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            datatype,
            variants,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    #[must_use]
    pub fn variants(&self) -> &[Vec<u8>] {
        &self.variants
    }
}

impl Encode for Enumeration {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_string(writer, &self.name)?;
        self.datatype.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(self.variants.len() as u32)?;
        for variant in &self.variants {
            write_bytes(writer, variant)?;
        }
        Ok(())
    }
}

impl Decode for Enumeration {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let name = read_string(reader, "Enumeration::name")?;
        let datatype = Datatype::decode_from(reader)?;
        let count = reader.read_u32::<LittleEndian>()?;
        let mut variants = Vec::with_capacity(count as usize);
        for _ in 0..count {
            variants.push(read_bytes(reader, "Enumeration::variant")?);
        }
        Ok(Self {
            name,
            datatype,
            variants,
        })
    }
}

/// A named per-cell value bound to the domain. `cell_val_num = Var` means
/// variable-length (stored as offsets + values). Names starting with `__`
/// are reserved for internal pseudo-attributes (`__coords`, `__key`, ...).
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    name: String,
    datatype: Datatype,
    cell_val_num: CellValNum,
    nullable: bool,
    fill_value: Vec<u8>,
    filters: FilterPipeline,
    enumeration: Option<String>,
}

impl Attribute {
    /// Creates an attribute with the type's default fill value
    /// (`Datatype::fill_value`).
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if `name` starts with the reserved `__`
    /// prefix.
    pub fn new(
        name: impl Into<String>,
        datatype: Datatype,
        cell_val_num: CellValNum,
        nullable: bool,
    ) -> Result<Self> {
        let name = name.into();
        if name.starts_with("__") {
            return Err(Error::Schema(format!(
                "attribute name '{name}' is reserved (starts with '__')"
            )));
        }
        let fill_value = datatype.fill_value();
        Ok(Self {
            name,
            datatype,
            cell_val_num,
            nullable,
            fill_value,
            filters: FilterPipeline::default(),
            enumeration: None,
        })
    }

    /// Overrides the default fill value used for unwritten dense cells.
    #[must_use]
    pub fn with_fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.fill_value = fill_value;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    /// References an [`Enumeration`] by name; resolved against the schema's
    /// enumeration table at `finalize()`/open time.
    #[must_use]
    pub fn with_enumeration(mut self, name: impl Into<String>) -> Self {
        self.enumeration = Some(name.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    #[must_use]
    pub fn cell_val_num(&self) -> CellValNum {
        self.cell_val_num
    }

    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    #[must_use]
    pub fn fill_value(&self) -> &[u8] {
        &self.fill_value
    }

    #[must_use]
    pub fn filters(&self) -> &FilterPipeline {
        &self.filters
    }

    #[must_use]
    pub fn enumeration(&self) -> Option<&str> {
        self.enumeration.as_deref()
    }
}

impl Encode for Attribute {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_string(writer, &self.name)?;
        self.datatype.encode_into(writer)?;
        self.cell_val_num.encode_into(writer)?;
        writer.write_u8(u8::from(self.nullable))?;
        write_bytes(writer, &self.fill_value)?;
        writer.write_u8(self.enumeration.is_some() as u8)?;
        if let Some(name) = &self.enumeration {
            write_string(writer, name)?;
        }
        self.filters.encode_into(writer)?;
        Ok(())
    }
}

impl Decode for Attribute {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let name = read_string(reader, "Attribute::name")?;
        let datatype = Datatype::decode_from(reader)?;
        let cell_val_num = CellValNum::decode_from(reader)?;
        let nullable = reader.read_u8()? != 0;
        let fill_value = read_bytes(reader, "Attribute::fill_value")?;
        let has_enum = reader.read_u8()? != 0;
        let enumeration = if has_enum {
            Some(read_string(reader, "Attribute::enumeration")?)
        } else {
            None
        };
        let filters = FilterPipeline::decode_from(reader)?;
        Ok(Self {
            name,
            datatype,
            cell_val_num,
            nullable,
            fill_value,
            filters,
            enumeration,
        })
    }
}

/// Binds attributes to a domain. Built incrementally via `add_*`/`set_*`,
/// then frozen with [`Schema::finalize`].
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    array_type: ArrayType,
    domain: Domain,
    cell_order: CellOrder,
    tile_order: TileOrder,
    capacity: u64,
    allows_dups: bool,
    attributes: Vec<Attribute>,
    enumerations: Vec<Enumeration>,
    finalized: bool,
}

impl Schema {
    #[must_use]
    pub fn new(array_type: ArrayType) -> Self {
        let (cell_order, allows_dups) = match array_type {
            ArrayType::Dense => (CellOrder::RowMajor, false),
            ArrayType::Sparse => (CellOrder::RowMajor, false),
        };
        Self {
            array_type,
            domain: Domain::new(),
            cell_order,
            tile_order: TileOrder::RowMajor,
            capacity: 10_000,
            allows_dups,
            attributes: Vec::new(),
            enumerations: Vec::new(),
            finalized: false,
        }
    }

    /// Appends a dimension to the domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if a dimension with the same name already
    /// exists, or if the schema is already finalized.
    pub fn add_dimension(&mut self, dim: Dimension) -> Result<()> {
        self.reject_if_finalized()?;
        self.domain.add_dimension(dim)
    }

    /// Appends an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if an attribute (or the `__coords` pseudo-name)
    /// with the same name already exists, or if the schema is finalized.
    pub fn add_attribute(&mut self, attr: Attribute) -> Result<()> {
        self.reject_if_finalized()?;
        if self.attributes.iter().any(|a| a.name() == attr.name()) {
            return Err(Error::Schema(format!(
                "duplicate attribute name '{}'",
                attr.name()
            )));
        }
        self.attributes.push(attr);
        Ok(())
    }

    /// Registers an enumeration's variant table, referenceable by name from
    /// `Attribute::with_enumeration`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` on a duplicate enumeration name or if the
    /// schema is finalized.
    pub fn add_enumeration(&mut self, enumeration: Enumeration) -> Result<()> {
        self.reject_if_finalized()?;
        if self.enumerations.iter().any(|e| e.name() == enumeration.name()) {
            return Err(Error::Schema(format!(
                "duplicate enumeration name '{}'",
                enumeration.name()
            )));
        }
        self.enumerations.push(enumeration);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Error::Schema` if the schema is finalized.
    pub fn set_cell_order(&mut self, cell_order: CellOrder) -> Result<()> {
        self.reject_if_finalized()?;
        self.cell_order = cell_order;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Error::Schema` if the schema is finalized.
    pub fn set_tile_order(&mut self, tile_order: TileOrder) -> Result<()> {
        self.reject_if_finalized()?;
        self.tile_order = tile_order;
        Ok(())
    }

    /// Sets the sparse tile size (number of cells). Has no effect on reads
    /// of a dense array, whose tile shape is implied by dimension extents.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if `capacity` is zero or the schema is
    /// finalized.
    pub fn set_capacity(&mut self, capacity: u64) -> Result<()> {
        self.reject_if_finalized()?;
        if capacity == 0 {
            return Err(Error::Schema("capacity must be nonzero".into()));
        }
        self.capacity = capacity;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Error::Schema` if called on a dense schema (dense arrays
    /// never allow duplicate coordinates) or the schema is finalized.
    pub fn set_allows_dups(&mut self, allows_dups: bool) -> Result<()> {
        self.reject_if_finalized()?;
        if allows_dups && self.array_type == ArrayType::Dense {
            return Err(Error::Schema(
                "allows_dups cannot be set on a dense array".into(),
            ));
        }
        self.allows_dups = allows_dups;
        Ok(())
    }

    /// Validates the accumulated builder state and freezes the schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if: the domain is empty; the array type and
    /// cell order are incompatible (dense arrays cannot use `Unordered` or
    /// `Hilbert`); a dense array has `allows_dups = true`; an attribute
    /// references an enumeration that was never registered, or whose
    /// datatype doesn't match; or an attribute's fixed-size fill value
    /// doesn't match its cell width.
    pub fn finalize(mut self) -> Result<Self> {
        if self.domain.is_empty() {
            return Err(Error::Schema("domain must have at least one dimension".into()));
        }

        if self.array_type == ArrayType::Dense {
            if matches!(self.cell_order, CellOrder::Unordered | CellOrder::Hilbert) {
                return Err(Error::Schema(
                    "dense arrays require cell_order in {RowMajor, ColMajor, GlobalOrder}".into(),
                ));
            }
            if self.allows_dups {
                return Err(Error::Schema("dense arrays cannot allow duplicates".into()));
            }
        }

        if self.cell_order == CellOrder::Hilbert && self.array_type != ArrayType::Sparse {
            return Err(Error::Schema("Hilbert cell order is sparse-only".into()));
        }

        for attr in &self.attributes {
            if let Some(enum_name) = attr.enumeration() {
                let referenced = self
                    .enumerations
                    .iter()
                    .find(|e| e.name() == enum_name)
                    .ok_or_else(|| {
                        Error::Schema(format!(
                            "attribute '{}' references unknown enumeration '{enum_name}'",
                            attr.name()
                        ))
                    })?;
                if referenced.datatype() != attr.datatype() {
                    return Err(Error::Schema(format!(
                        "attribute '{}' has datatype {:?} but its enumeration '{}' has datatype {:?}",
                        attr.name(),
                        attr.datatype(),
                        enum_name,
                        referenced.datatype()
                    )));
                }
            }

            if let Some(width) = attr.datatype().byte_width() {
                if !attr.cell_val_num().is_var() {
                    let CellValNum::Fixed(n) = attr.cell_val_num() else {
                        unreachable!()
                    };
                    let expected = width * n as usize;
                    if attr.fill_value().len() != expected {
                        return Err(Error::Schema(format!(
                            "attribute '{}' fill value is {} bytes, expected {expected}",
                            attr.name(),
                            attr.fill_value().len()
                        )));
                    }
                }
            }
        }

        self.finalized = true;
        Ok(self)
    }

    fn reject_if_finalized(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Schema("schema is already finalized".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn array_type(&self) -> ArrayType {
        self.array_type
    }

    #[must_use]
    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    #[must_use]
    pub fn cell_order(&self) -> CellOrder {
        self.cell_order
    }

    #[must_use]
    pub fn tile_order(&self) -> TileOrder {
        self.tile_order
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn allows_dups(&self) -> bool {
        self.allows_dups
    }

    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name() == name)
    }

    #[must_use]
    pub fn enumerations(&self) -> &[Enumeration] {
        &self.enumerations
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Serializes the schema with an explicit magic/version header so newer
    /// fields remain backwards-readable (`spec.md` §4.3, §6.2).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(SCHEMA_MAGIC).expect("write to Vec");
        out.write_u32::<LittleEndian>(SCHEMA_FORMAT_VERSION)
            .expect("write to Vec");
        out.write_u8(self.array_type.tag()).expect("write to Vec");
        out.write_u8(self.tile_order.tag()).expect("write to Vec");
        out.write_u8(self.cell_order.tag()).expect("write to Vec");
        out.write_u64::<LittleEndian>(self.capacity)
            .expect("write to Vec");
        out.write_u8(u8::from(self.allows_dups)).expect("write to Vec");
        self.domain.encode_into(&mut out).expect("write to Vec");

        out.write_u32::<LittleEndian>(self.attributes.len() as u32)
            .expect("write to Vec");
        for attr in &self.attributes {
            attr.encode_into(&mut out).expect("write to Vec");
        }

        out.write_u32::<LittleEndian>(self.enumerations.len() as u32)
            .expect("write to Vec");
        for enumeration in &self.enumerations {
            enumeration.encode_into(&mut out).expect("write to Vec");
        }

        out
    }

    /// Inverse of [`Self::serialize`]. The result is already finalized.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bookkeeping` if the magic bytes don't match or the
    /// format version isn't supported, `Error::Decode` on any other
    /// malformed field.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(bytes);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != SCHEMA_MAGIC {
            return Err(Error::Bookkeeping("schema file has an invalid magic".into()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != SCHEMA_FORMAT_VERSION {
            return Err(Error::Bookkeeping(format!(
                "schema format version {version} is not supported"
            )));
        }

        let array_type = ArrayType::from_tag(reader.read_u8()?)?;
        let tile_order = TileOrder::from_tag(reader.read_u8()?)?;
        let cell_order = CellOrder::from_tag(reader.read_u8()?)?;
        let capacity = reader.read_u64::<LittleEndian>()?;
        let allows_dups = reader.read_u8()? != 0;
        let domain = Domain::decode_from(&mut reader)?;

        let attr_count = reader.read_u32::<LittleEndian>()?;
        let mut attributes = Vec::with_capacity(attr_count as usize);
        for _ in 0..attr_count {
            attributes.push(Attribute::decode_from(&mut reader)?);
        }

        let enum_count = reader.read_u32::<LittleEndian>()?;
        let mut enumerations = Vec::with_capacity(enum_count as usize);
        for _ in 0..enum_count {
            enumerations.push(Enumeration::decode_from(&mut reader)?);
        }

        Ok(Self {
            array_type,
            domain,
            cell_order,
            tile_order,
            capacity,
            allows_dups,
            attributes,
            enumerations,
            finalized: true,
        }
        .finalize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn dense_schema() -> Schema {
        let mut schema = Schema::new(ArrayType::Dense);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 9i32, Some(10i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
            .unwrap();
        schema
    }

    #[test]
    fn finalize_dense_with_hilbert_fails() {
        let mut schema = dense_schema();
        schema.set_cell_order(CellOrder::Hilbert).unwrap();
        assert!(schema.finalize().is_err());
    }

    #[test]
    fn finalize_empty_domain_fails() {
        let schema = Schema::new(ArrayType::Sparse);
        assert!(schema.finalize().is_err());
    }

    #[test]
    fn rejects_reserved_attribute_name() {
        assert!(Attribute::new("__coords", Datatype::Int32, CellValNum::Fixed(1), false).is_err());
    }

    #[test]
    fn rejects_duplicate_attribute() {
        let mut schema = dense_schema();
        let err = schema.add_attribute(
            Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn serialize_roundtrip() {
        let schema = dense_schema().finalize().unwrap();
        let bytes = schema.serialize();
        let decoded = Schema::deserialize(&bytes).unwrap();
        assert_eq!(schema, decoded);
    }

    #[test]
    fn rejects_unknown_enumeration_reference() {
        let mut schema = Schema::new(ArrayType::Sparse);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 9i32, Some(10i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(
                Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false)
                    .unwrap()
                    .with_enumeration("missing"),
            )
            .unwrap();
        assert!(schema.finalize().is_err());
    }

    #[test]
    fn sparse_allows_hilbert_and_dups() {
        let mut schema = Schema::new(ArrayType::Sparse);
        schema
            .add_dimension(Dimension::new_numeric("x", Datatype::Int32, 0i32, 99i32, Some(10i32)).unwrap())
            .unwrap();
        schema
            .add_attribute(Attribute::new("a", Datatype::Int32, CellValNum::Fixed(1), false).unwrap())
            .unwrap();
        schema.set_cell_order(CellOrder::Hilbert).unwrap();
        schema.set_allows_dups(true).unwrap();
        assert!(schema.finalize().is_ok());
    }
}
