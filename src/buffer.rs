// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Growable byte buffer with a write cursor ([`Buffer`]) and an immutable
//! cursor over a borrowed/owned byte range ([`ConstBuffer`]). Used by the
//! filter pipeline to accumulate chunk output and by the schema serializer
//! as the `Write`/`Read` target for [`crate::coding::Encode`]/[`crate::coding::Decode`].

use crate::slice::Slice;

/// A growable, append-only byte buffer.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn into_slice(self) -> Slice {
        Slice::from(self.data)
    }
}

impl std::io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A read-only cursor over an owned or borrowed byte range, with a running
/// position used by decoders that consume a tile byte-for-byte.
#[derive(Debug, Clone)]
pub struct ConstBuffer {
    data: Slice,
    pos: usize,
}

impl ConstBuffer {
    #[must_use]
    pub fn new(data: Slice) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.as_ref().len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Takes the next `n` bytes without copying, advancing the cursor.
    pub fn take(&mut self, n: usize) -> std::io::Result<&[u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "cursor overflow")
        })?;

        let bytes = self.data.as_ref();
        if end > bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "not enough bytes remaining in buffer",
            ));
        }

        let slice = &bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref()[self.pos..]
    }
}

impl std::io::Read for ConstBuffer {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining());
        let src = self.take(n)?;
        buf[..n].copy_from_slice(src);
        Ok(n)
    }
}
