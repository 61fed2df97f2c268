// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Named axes with typed bounds ([`Dimension`]) and their ordered list
//! ([`Domain`]). Grounded on the stricter of the two validation rules TileDB
//! itself carries for tile-extent bounds (see `spec.md` §9's note on the two
//! divergent copies of `Dimension` in the original source): integer extents
//! must not exceed `hi - lo + 1`, float extents must not exceed `hi - lo`.

use crate::coding::{read_bytes, write_bytes, Decode, DecodeError, Encode, EncodeError};
use crate::datatype::Datatype;
use crate::error::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A named, typed axis of the array's coordinate space.
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    name: String,
    datatype: Datatype,
    /// `(lo, hi)` raw bytes, absent for string dimensions.
    domain: Option<(Vec<u8>, Vec<u8>)>,
    /// Raw tile extent bytes, absent for string dimensions or when unset.
    tile_extent: Option<Vec<u8>>,
}

impl Dimension {
    /// Creates a numeric dimension with domain `[lo, hi]` and an optional
    /// tile extent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if `datatype` is `StringAscii`, if `lo > hi`,
    /// or if `tile_extent` exceeds the domain's span (integer: `extent <=
    /// hi - lo + 1`; float: `extent <= hi - lo`).
    pub fn new_numeric<T: DimScalar>(
        name: impl Into<String>,
        datatype: Datatype,
        lo: T,
        hi: T,
        tile_extent: Option<T>,
    ) -> crate::error::Result<Self> {
        if datatype == Datatype::StringAscii {
            return Err(Error::Schema(
                "use Dimension::new_string for string dimensions".into(),
            ));
        }

        let lo_bytes = T::to_bytes(lo);
        let hi_bytes = T::to_bytes(hi);

        if datatype.compare(&lo_bytes, &hi_bytes) == std::cmp::Ordering::Greater {
            return Err(Error::Schema(format!(
                "dimension '{}': lo must be <= hi",
                name.into()
            )));
        }

        let extent_bytes = match tile_extent {
            Some(extent) => {
                let bytes = T::to_bytes(extent);
                validate_extent(datatype, &lo_bytes, &hi_bytes, &bytes)?;
                Some(bytes)
            }
            None => None,
        };

        Ok(Self {
            name: name.into(),
            datatype,
            domain: Some((lo_bytes, hi_bytes)),
            tile_extent: extent_bytes,
        })
    }

    /// Creates a variable-length ASCII string dimension. String dimensions
    /// carry no domain bounds and no tile extent.
    #[must_use]
    pub fn new_string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype: Datatype::StringAscii,
            domain: None,
            tile_extent: None,
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
    pub fn is_string(&self) -> bool {
        self.datatype == Datatype::StringAscii
    }

    #[must_use]
    pub fn domain_bytes(&self) -> Option<(&[u8], &[u8])> {
        self.domain
            .as_ref()
            .map(|(lo, hi)| (lo.as_slice(), hi.as_slice()))
    }

    #[must_use]
    pub fn tile_extent_bytes(&self) -> Option<&[u8]> {
        self.tile_extent.as_deref()
    }

    /// Number of tiles along this dimension, or `None` for a string
    /// dimension or one without a tile extent.
    #[must_use]
    pub fn tile_num(&self) -> Option<u64> {
        let (lo, hi) = self.domain_bytes()?;
        let extent = self.tile_extent_bytes()?;
        let span = domain_span_units(self.datatype, lo, hi)?;
        let extent_units = scalar_as_u64(self.datatype, extent)?;
        Some(span.div_ceil(extent_units.max(1)))
    }
}

/// Computes `hi - lo + 1` in integer units for integer types (the number of
/// distinct coordinate values along the axis). Returns `None` for floats and
/// strings, where "span in units" isn't well defined for tiling purposes.
fn domain_span_units(datatype: Datatype, lo: &[u8], hi: &[u8]) -> Option<u64> {
    if !datatype.is_integer() {
        return None;
    }
    let lo = scalar_as_i64(datatype, lo)?;
    let hi = scalar_as_i64(datatype, hi)?;
    Some((hi - lo + 1) as u64)
}

fn scalar_as_i64(datatype: Datatype, bytes: &[u8]) -> Option<i64> {
    match datatype.byte_width()? {
        1 => Some(i8::from_le_bytes([bytes[0]]) as i64),
        2 => Some(i16::from_le_bytes(bytes.try_into().ok()?) as i64),
        4 => Some(i32::from_le_bytes(bytes.try_into().ok()?) as i64),
        8 => Some(i64::from_le_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

fn scalar_as_u64(datatype: Datatype, bytes: &[u8]) -> Option<u64> {
    scalar_as_i64(datatype, bytes).map(|v| v as u64)
}

fn validate_extent(datatype: Datatype, lo: &[u8], hi: &[u8], extent: &[u8]) -> crate::error::Result<()> {
    if datatype.is_integer() {
        let span = domain_span_units(datatype, lo, hi)
            .ok_or_else(|| Error::Schema("could not compute domain span".into()))?;
        let extent_units =
            scalar_as_u64(datatype, extent).ok_or_else(|| Error::Schema("bad extent".into()))?;
        if extent_units == 0 || extent_units > span {
            return Err(Error::Schema(format!(
                "tile extent {extent_units} exceeds domain span {span} (must be <= hi - lo + 1)"
            )));
        }
    } else if datatype.is_float() {
        let (lo_f, hi_f, extent_f) = match datatype {
            Datatype::Float32 => (
                f64::from(f32::from_le_bytes(lo.try_into().unwrap())),
                f64::from(f32::from_le_bytes(hi.try_into().unwrap())),
                f64::from(f32::from_le_bytes(extent.try_into().unwrap())),
            ),
            Datatype::Float64 => (
                f64::from_le_bytes(lo.try_into().unwrap()),
                f64::from_le_bytes(hi.try_into().unwrap()),
                f64::from_le_bytes(extent.try_into().unwrap()),
            ),
            _ => unreachable!(),
        };
        let span = hi_f - lo_f;
        if !(extent_f > 0.0) || extent_f > span {
            return Err(Error::Schema(format!(
                "tile extent {extent_f} exceeds domain span {span} (must be <= hi - lo)"
            )));
        }
    }
    Ok(())
}

/// Helper trait converting dimension scalar literals (the integer/float
/// types a caller writes in source) into little-endian bytes.
pub trait DimScalar: Copy {
    fn to_bytes(self) -> Vec<u8>;
}

macro_rules! impl_dim_scalar {
    ($($ty:ty),*) => {
        $(
            impl DimScalar for $ty {
                fn to_bytes(self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_dim_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl Encode for Dimension {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        crate::coding::write_string(writer, &self.name)?;
        self.datatype.encode_into(writer)?;

        writer.write_u8(self.domain.is_some() as u8)?;
        if let Some((lo, hi)) = &self.domain {
            write_bytes(writer, lo)?;
            write_bytes(writer, hi)?;
        }

        writer.write_u8(self.tile_extent.is_some() as u8)?;
        if let Some(extent) = &self.tile_extent {
            write_bytes(writer, extent)?;
        }

        Ok(())
    }
}

impl Decode for Dimension {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let name = crate::coding::read_string(reader, "Dimension::name")?;
        let datatype = Datatype::decode_from(reader)?;

        let has_domain = reader.read_u8()? != 0;
        let domain = if has_domain {
            let lo = read_bytes(reader, "Dimension::domain.lo")?;
            let hi = read_bytes(reader, "Dimension::domain.hi")?;
            Some((lo, hi))
        } else {
            None
        };

        let has_extent = reader.read_u8()? != 0;
        let tile_extent = if has_extent {
            Some(read_bytes(reader, "Dimension::tile_extent")?)
        } else {
            None
        };

        Ok(Self {
            name,
            datatype,
            domain,
            tile_extent,
        })
    }
}

/// Ordered list of dimensions defining the array's coordinate space.
#[derive(Clone, Debug, Default)]
pub struct Domain {
    dimensions: Vec<Dimension>,
}

impl Domain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a dimension.
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if a dimension with the same name already
    /// exists.
    pub fn add_dimension(&mut self, dim: Dimension) -> crate::error::Result<()> {
        if self.dimensions.iter().any(|d| d.name() == dim.name()) {
            return Err(Error::Schema(format!(
                "duplicate dimension name '{}'",
                dim.name()
            )));
        }
        self.dimensions.push(dim);
        Ok(())
    }

    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.dimensions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    #[must_use]
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimensions.iter().position(|d| d.name() == name)
    }

    /// Sum of fixed byte widths across all dimensions, for schemas where
    /// every dimension has a fixed-size coordinate (no string dimensions).
    #[must_use]
    pub fn coords_size(&self) -> Option<usize> {
        self.dimensions
            .iter()
            .map(|d| d.datatype().byte_width())
            .sum()
    }

    /// Per-dimension tile counts, or `None` if any dimension lacks a tile
    /// extent (e.g. dense arrays always have one; sparse arrays use
    /// `capacity` instead and may leave this unset).
    #[must_use]
    pub fn tile_num_per_dim(&self) -> Option<Vec<u64>> {
        self.dimensions.iter().map(Dimension::tile_num).collect()
    }
}

impl Encode for Domain {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(self.dimensions.len() as u32)?;
        for dim in &self.dimensions {
            dim.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for Domain {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32::<LittleEndian>()?;
        let mut dimensions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            dimensions.push(Dimension::decode_from(reader)?);
        }
        Ok(Self { dimensions })
    }
}
