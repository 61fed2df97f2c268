// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The filesystem abstraction the core reads and writes through (`spec.md`
//! §6.3). Concrete backends (POSIX, HDFS, S3, ...) are out of scope; only the
//! interface and a local-disk implementation live here, grounded on the
//! teacher's own `FileSystem` trait (`src/fs.rs`).

mod local;

pub use local::LocalVfs;

use crate::error::Result;
use std::path::{Path, PathBuf};

/// A held filelock. Dropping it releases the lock (mirrors the teacher's
/// RAII file-handle types rather than exposing an explicit `unlock` call,
/// though the design's `filelock_unlock` contract is still satisfiable by
/// just dropping the handle).
pub trait FileLockGuard: Send {}

/// Directory entry returned by [`Vfs::ls`].
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Pluggable storage backend (`spec.md` §6.3). Errors bubble up verbatim;
/// the core never retries at this layer.
pub trait Vfs: Send + Sync {
    /// Locked filelock handle type; `Box<dyn FileLockGuard>` would work too,
    /// but an associated type lets a backend avoid the allocation.
    type LockGuard: FileLockGuard;

    /// Size of the file at `uri` in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file does not exist or cannot be stat'd.
    fn file_size(&self, uri: &Path) -> Result<u64>;

    /// Reads `buf.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on a short read or any underlying I/O failure.
    fn read(&self, uri: &Path, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Appends `bytes` to the file at `uri`, creating it (and its parent
    /// directory) if necessary.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on any underlying I/O failure.
    fn write_append(&self, uri: &Path, bytes: &[u8]) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Error::Io` on any underlying I/O failure.
    fn remove(&self, uri: &Path) -> Result<()>;

    /// Removes a directory and everything under it (a vacuumed fragment
    /// directory, `spec.md` §4.9's "deletes the marked directories").
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` on any underlying I/O failure.
    fn remove_dir_all(&self, uri: &Path) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Error::Io` on any underlying I/O failure.
    fn rename(&self, old: &Path, new: &Path) -> Result<()>;

    /// # Errors
    ///
    /// Returns `Error::Io` if existence cannot be determined.
    fn exists(&self, uri: &Path) -> Result<bool>;

    /// Lists the immediate children of a directory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if `dir` does not exist or cannot be read.
    fn ls(&self, dir: &Path) -> Result<Vec<DirEntry>>;

    /// Acquires a filelock on `uri`: shared for readers, exclusive for
    /// writers/consolidators.
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` if the lock is unavailable.
    fn filelock_lock(&self, uri: &Path, shared: bool) -> Result<Self::LockGuard>;
}
