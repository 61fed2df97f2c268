// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Serialization plumbing shared by the schema, fragment bookkeeping and
//! filter pipeline headers. Every on-disk structure implements [`Encode`] and
//! [`Decode`] directly rather than going through a generic serde format, so
//! new fields can be added without breaking old readers (see `spec.md` §6.2).

use std::io::{Read, Write};

/// Error during serialization.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error.
    Io(std::io::Error),

    /// Bad UTF-8 in a string field.
    Utf8(std::str::Utf8Error),

    /// An enum tag byte did not match any known variant.
    InvalidTag((&'static str, u8)),

    /// The magic bytes at the start of a file did not match.
    InvalidMagic,

    /// A format version byte is not supported by this build.
    UnsupportedVersion(u32),

    /// A length-prefixed field's length did not fit the remaining input.
    InvalidLength(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::Utf8(e) => write!(f, "{e}"),
            Self::InvalidTag((ty, tag)) => write!(f, "invalid tag {tag} for {ty}"),
            Self::InvalidMagic => write!(f, "invalid magic bytes"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Self::InvalidLength(field) => write!(f, "invalid length for field {field}"),
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<std::str::Utf8Error> for DecodeError {
    fn from(value: std::str::Utf8Error) -> Self {
        Self::Utf8(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait for binary-serializable on-disk structures.
pub trait Encode {
    /// Serializes into a writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into a fresh vector.
    #[must_use]
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        #[allow(clippy::expect_used)]
        self.encode_into(&mut v).expect("writing to a Vec cannot fail");
        v
    }
}

/// Trait for binary-deserializable on-disk structures.
pub trait Decode {
    /// Deserializes from a reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}

/// Reads a `u32`-length-prefixed, UTF-8 byte string.
pub fn read_string<R: Read>(reader: &mut R, field: &'static str) -> Result<String, DecodeError> {
    use byteorder::{LittleEndian, ReadBytesExt};

    let len = reader.read_u32::<LittleEndian>()?;
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|_| DecodeError::InvalidLength(field))?;
    Ok(String::from_utf8(buf).map_err(|e| DecodeError::Utf8(e.utf8_error()))?)
}

/// Writes a `u32`-length-prefixed, UTF-8 byte string.
pub fn write_string<W: Write>(writer: &mut W, value: &str) -> Result<(), EncodeError> {
    use byteorder::{LittleEndian, WriteBytesExt};

    writer.write_u32::<LittleEndian>(value.len() as u32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Reads a `u32`-length-prefixed raw byte buffer.
pub fn read_bytes<R: Read>(reader: &mut R, field: &'static str) -> Result<Vec<u8>, DecodeError> {
    use byteorder::{LittleEndian, ReadBytesExt};

    let len = reader.read_u32::<LittleEndian>()?;
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|_| DecodeError::InvalidLength(field))?;
    Ok(buf)
}

/// Writes a `u32`-length-prefixed raw byte buffer.
pub fn write_bytes<W: Write>(writer: &mut W, value: &[u8]) -> Result<(), EncodeError> {
    use byteorder::{LittleEndian, WriteBytesExt};

    writer.write_u32::<LittleEndian>(value.len() as u32)?;
    writer.write_all(value)?;
    Ok(())
}
