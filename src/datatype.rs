// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Closed `Datatype` enumeration and the tagged-bytes `Value` it dispatches
//! on. Operations parameterized by `Datatype` (compare, fill value, byte
//! width) are monomorphic match arms rather than an open trait hierarchy,
//! per the "Variant dispatch" design note.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Resolution of a `DateTime` datatype. Each resolution is stored as a single
/// `i64` count of units, matching the "each one integer" contract in the
/// data model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
    Picosecond,
    Femtosecond,
    Attosecond,
}

impl TimeUnit {
    const ALL: [Self; 13] = [
        Self::Year,
        Self::Month,
        Self::Week,
        Self::Day,
        Self::Hour,
        Self::Minute,
        Self::Second,
        Self::Millisecond,
        Self::Microsecond,
        Self::Nanosecond,
        Self::Picosecond,
        Self::Femtosecond,
        Self::Attosecond,
    ];

    fn tag(self) -> u8 {
        Self::ALL.iter().position(|u| *u == self).unwrap_or(0) as u8
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

/// Closed datatype enumeration. Every dimension and attribute carries
/// exactly one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Char,
    DateTime(TimeUnit),
    /// Variable-length ASCII string. Only valid for dimensions (string
    /// dimensions have no fixed domain/extent) and `VAR` attributes.
    StringAscii,
}

impl Datatype {
    /// Fixed byte width of one scalar value, or `None` for the variable
    /// length `StringAscii` type.
    #[must_use]
    pub fn byte_width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 | Self::Char => Some(1),
            Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::DateTime(_) => Some(8),
            Self::StringAscii => None,
        }
    }

    /// Whether this type has a fixed byte width (everything but
    /// `StringAscii`).
    #[must_use]
    pub fn is_fixed_size(self) -> bool {
        self.byte_width().is_some()
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
                | Self::Char
                | Self::DateTime(_)
        )
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    #[must_use]
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::Char
                | Self::DateTime(_)
                | Self::Float32
                | Self::Float64
        )
    }

    /// The fill value used for unwritten dense cells: the largest
    /// representable value for the type.
    #[must_use]
    pub fn fill_value(self) -> Vec<u8> {
        match self {
            Self::Int8 => vec![i8::MAX as u8],
            Self::UInt8 => vec![u8::MAX],
            Self::Char => vec![i8::MAX as u8],
            Self::Int16 => i16::MAX.to_le_bytes().to_vec(),
            Self::UInt16 => u16::MAX.to_le_bytes().to_vec(),
            Self::Int32 => i32::MAX.to_le_bytes().to_vec(),
            Self::UInt32 => u32::MAX.to_le_bytes().to_vec(),
            Self::Int64 => i64::MAX.to_le_bytes().to_vec(),
            Self::UInt64 => u64::MAX.to_le_bytes().to_vec(),
            Self::DateTime(_) => i64::MAX.to_le_bytes().to_vec(),
            Self::Float32 => f32::MAX.to_le_bytes().to_vec(),
            Self::Float64 => f64::MAX.to_le_bytes().to_vec(),
            Self::StringAscii => Vec::new(),
        }
    }

    /// Total order comparison of two raw value buffers of this type.
    ///
    /// # Panics
    ///
    /// Panics if a fixed-size type's buffers don't match `byte_width()`; this
    /// is a programmer error (callers always supply validated cells), not a
    /// user-reachable condition.
    #[must_use]
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        macro_rules! cmp_int {
            ($ty:ty, $a:expr, $b:expr) => {{
                let a = <$ty>::from_le_bytes($a.try_into().expect("fixed width"));
                let b = <$ty>::from_le_bytes($b.try_into().expect("fixed width"));
                a.cmp(&b)
            }};
        }

        match self {
            Self::Int8 | Self::Char => (a[0] as i8).cmp(&(b[0] as i8)),
            Self::UInt8 => a[0].cmp(&b[0]),
            Self::Int16 => cmp_int!(i16, a, b),
            Self::UInt16 => cmp_int!(u16, a, b),
            Self::Int32 => cmp_int!(i32, a, b),
            Self::UInt32 => cmp_int!(u32, a, b),
            Self::Int64 | Self::DateTime(_) => cmp_int!(i64, a, b),
            Self::UInt64 => cmp_int!(u64, a, b),
            Self::Float32 => {
                let a = f32::from_le_bytes(a.try_into().expect("fixed width"));
                let b = f32::from_le_bytes(b.try_into().expect("fixed width"));
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            Self::Float64 => {
                let a = f64::from_le_bytes(a.try_into().expect("fixed width"));
                let b = f64::from_le_bytes(b.try_into().expect("fixed width"));
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            Self::StringAscii => a.cmp(b),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::UInt8 => 4,
            Self::UInt16 => 5,
            Self::UInt32 => 6,
            Self::UInt64 => 7,
            Self::Float32 => 8,
            Self::Float64 => 9,
            Self::Char => 10,
            Self::StringAscii => 11,
            Self::DateTime(_) => 12,
        }
    }
}

impl Encode for Datatype {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(self.tag())?;
        if let Self::DateTime(unit) = self {
            writer.write_u8(unit.tag())?;
        }
        Ok(())
    }
}

impl Decode for Datatype {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        Ok(match tag {
            0 => Self::Int8,
            1 => Self::Int16,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::UInt8,
            5 => Self::UInt16,
            6 => Self::UInt32,
            7 => Self::UInt64,
            8 => Self::Float32,
            9 => Self::Float64,
            10 => Self::Char,
            11 => Self::StringAscii,
            12 => {
                let unit_tag = reader.read_u8()?;
                let unit = TimeUnit::from_tag(unit_tag)
                    .ok_or(DecodeError::InvalidTag(("TimeUnit", unit_tag)))?;
                Self::DateTime(unit)
            }
            tag => return Err(DecodeError::InvalidTag(("Datatype", tag))),
        })
    }
}

/// A cell-value count for an attribute or dimension. `Fixed(1)` is the
/// common scalar case; `Var` means variable-length (offsets + values).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CellValNum {
    Fixed(u32),
    Var,
}

impl CellValNum {
    #[must_use]
    pub fn is_var(self) -> bool {
        matches!(self, Self::Var)
    }
}

impl Encode for CellValNum {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        use byteorder::LittleEndian;
        match self {
            Self::Fixed(n) => writer.write_u32::<LittleEndian>(*n)?,
            Self::Var => writer.write_u32::<LittleEndian>(u32::MAX)?,
        }
        Ok(())
    }
}

impl Decode for CellValNum {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        use byteorder::LittleEndian;
        let n = reader.read_u32::<LittleEndian>()?;
        Ok(if n == u32::MAX {
            Self::Var
        } else {
            Self::Fixed(n)
        })
    }
}

/// A tagged owned value: the bytes for one scalar of a known `Datatype`.
/// Used for domain bounds, tile extents and fill value overrides, where
/// legacy C++ code would carry an untyped `void*`; here equality, hashing
/// and comparison all dispatch through the `Datatype` tag instead of an
/// open trait object (see the "Owned-pointer containers" design note).
#[derive(Clone, Debug)]
pub struct Value {
    pub datatype: Datatype,
    pub bytes: Vec<u8>,
}

impl Value {
    #[must_use]
    pub fn new(datatype: Datatype, bytes: Vec<u8>) -> Self {
        Self { datatype, bytes }
    }

    #[must_use]
    pub fn from_i64(datatype: Datatype, v: i64) -> Self {
        Self::new(datatype, v.to_le_bytes().to_vec())
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        if self.datatype.is_integer() && self.bytes.len() == 8 {
            Some(i64::from_le_bytes(self.bytes.clone().try_into().ok()?))
        } else if self.datatype.byte_width() == Some(1) {
            Some(i8::from_le_bytes([self.bytes[0]]) as i64)
        } else {
            None
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.datatype == other.datatype && self.bytes == other.bytes
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.datatype != other.datatype {
            return None;
        }
        Some(self.datatype.compare(&self.bytes, &other.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn fill_values_are_max() {
        assert_eq!(Datatype::Int32.fill_value(), i32::MAX.to_le_bytes().to_vec());
        assert_eq!(Datatype::UInt8.fill_value(), vec![u8::MAX]);
    }

    #[test]
    fn datatype_roundtrip() {
        for dt in [
            Datatype::Int8,
            Datatype::UInt64,
            Datatype::Float64,
            Datatype::StringAscii,
            Datatype::DateTime(TimeUnit::Nanosecond),
        ] {
            let bytes = dt.encode_into_vec();
            let mut cursor = std::io::Cursor::new(bytes);
            let decoded = Datatype::decode_from(&mut cursor).unwrap();
            assert_eq!(dt, decoded);
        }
    }

    #[test]
    fn compare_int32() {
        let a = 5i32.to_le_bytes();
        let b = 10i32.to_le_bytes();
        assert_eq!(Datatype::Int32.compare(&a, &b), Ordering::Less);
    }
}
