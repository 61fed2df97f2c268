// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Local-disk [`Vfs`] backend, grounded on the teacher's `StdFileSystem`
//! (`src/fs.rs`) plus `fs2` for the shared/exclusive filelock this crate's
//! VFS contract adds on top of that trait.

use super::{DirEntry, FileLockGuard, Vfs};
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// `std::fs`-backed [`Vfs`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalVfs;

/// A filelock held via `fs2`. Unlocked on drop.
pub struct LocalFileLock(File);

impl FileLockGuard for LocalFileLock {}

impl Drop for LocalFileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl Vfs for LocalVfs {
    type LockGuard = LocalFileLock;

    fn file_size(&self, uri: &Path) -> Result<u64> {
        Ok(std::fs::metadata(uri)?.len())
    }

    fn read(&self, uri: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = File::open(uri)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_append(&self, uri: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = uri.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(uri)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    fn remove(&self, uri: &Path) -> Result<()> {
        std::fs::remove_file(uri)?;
        Ok(())
    }

    fn remove_dir_all(&self, uri: &Path) -> Result<()> {
        std::fs::remove_dir_all(uri)?;
        Ok(())
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        std::fs::rename(old, new)?;
        Ok(())
    }

    fn exists(&self, uri: &Path) -> Result<bool> {
        Ok(uri.try_exists()?)
    }

    fn ls(&self, dir: &Path) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();
            out.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }
        Ok(out)
    }

    fn filelock_lock(&self, uri: &Path, shared: bool) -> Result<Self::LockGuard> {
        if let Some(parent) = uri.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(uri)?;

        let result = if shared {
            file.try_lock_shared()
        } else {
            file.try_lock_exclusive()
        };
        result.map_err(|e| {
            Error::Concurrency(format!(
                "could not acquire {} filelock on {}: {e}",
                if shared { "shared" } else { "exclusive" },
                uri.display()
            ))
        })?;

        Ok(LocalFileLock(file))
    }
}
