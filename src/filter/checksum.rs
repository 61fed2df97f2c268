// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! User-selectable `Checksum-MD5`/`Checksum-SHA256` filters (`spec.md`
//! §4.1). These pass the chunk through unchanged and carry the digest as
//! filter metadata; reverse recomputes and fails the chunk on mismatch. This
//! is distinct from [`crate::checksum::Checksum`], the ambient xxh3-64
//! per-chunk integrity check every tile carries regardless of its filter
//! list (mirroring the teacher's own block trailer checksum).

use super::{FilterContext, FilterOp};
use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::error::{Error, Result};
use md5::{Digest as _, Md5};
use sha2::{Digest as _, Sha256};
use std::io::{Read, Write};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChecksumMd5Filter;

impl FilterOp for ChecksumMd5Filter {
    fn forward(&self, input: &[u8], _ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        let digest = Md5::digest(input);
        Ok((digest.to_vec(), input.to_vec()))
    }

    fn reverse(
        &self,
        metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        _ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        if payload.len() != original_size {
            return Err(Error::Codec(
                "Checksum-MD5 chunk length does not match its recorded size".into(),
            ));
        }
        let digest = Md5::digest(payload);
        if digest.as_slice() != metadata {
            return Err(Error::Codec("Checksum-MD5 mismatch on reverse".into()));
        }
        Ok(payload.to_vec())
    }

    fn kind_tag(&self) -> u8 {
        12
    }
}

impl Encode for ChecksumMd5Filter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for ChecksumMd5Filter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChecksumSha256Filter;

impl FilterOp for ChecksumSha256Filter {
    fn forward(&self, input: &[u8], _ctx: &FilterContext) -> Result<(Vec<u8>, Vec<u8>)> {
        let digest = Sha256::digest(input);
        Ok((digest.to_vec(), input.to_vec()))
    }

    fn reverse(
        &self,
        metadata: &[u8],
        payload: &[u8],
        original_size: usize,
        _ctx: &FilterContext,
    ) -> Result<Vec<u8>> {
        if payload.len() != original_size {
            return Err(Error::Codec(
                "Checksum-SHA256 chunk length does not match its recorded size".into(),
            ));
        }
        let digest = Sha256::digest(payload);
        if digest.as_slice() != metadata {
            return Err(Error::Codec("Checksum-SHA256 mismatch on reverse".into()));
        }
        Ok(payload.to_vec())
    }

    fn kind_tag(&self) -> u8 {
        13
    }
}

impl Encode for ChecksumSha256Filter {
    fn encode_into<W: Write>(&self, _writer: &mut W) -> std::result::Result<(), EncodeError> {
        Ok(())
    }
}

impl Decode for ChecksumSha256Filter {
    fn decode_from<R: Read>(_reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self)
    }
}
