// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Array lifecycle and filelock discipline (`spec.md` §4.10): open a
//! directory, acquire the array filelock, load the schema and the set of
//! committed fragments visible at a snapshot timestamp.

use crate::config::Context;
use crate::error::{Error, Result};
use crate::fragment::{Bookkeeping, Fragment, FragmentId, PreparedFragment, BOOKKEEPING_FILE_NAME, COMMIT_MARKER_NAME};
use crate::schema::Schema;
use crate::vfs::Vfs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the schema file at the array's root.
pub const SCHEMA_FILE_NAME: &str = "__array_schema.tdb";

/// Name of the zero-byte file the array filelock is taken against.
pub const LOCK_FILE_NAME: &str = "__array_lock.tdb";

/// Why an array was opened; governs whether the filelock is shared or
/// exclusive (`spec.md` §4.10).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArrayMode {
    /// Shared filelock; coexists with any number of other readers.
    Read,
    /// Exclusive filelock; excludes other writers and consolidators, but
    /// not readers.
    Write,
    /// Exclusive filelock, same as `Write` (`spec.md` §4.9's invariant that
    /// consolidation never overlaps itself or a writer).
    Consolidate,
}

impl ArrayMode {
    fn is_shared_lock(self) -> bool {
        self == Self::Read
    }
}

/// An open array: its schema, the fragments visible at its snapshot, and
/// the held filelock. Dropping the handle releases the lock.
pub struct Array<V: Vfs> {
    uri: PathBuf,
    vfs: V,
    schema: Schema,
    fragments: Vec<Fragment>,
    mode: ArrayMode,
    timestamp: u64,
    context: Arc<Context>,
    _lock: V::LockGuard,
}

impl<V: Vfs> Array<V> {
    /// Creates a new array directory: writes the finalized schema and
    /// nothing else (no fragments yet).
    ///
    /// # Errors
    ///
    /// Returns `Error::Schema` if `schema` isn't finalized or an array
    /// already exists at `uri`. Returns `Error::Io` on any VFS failure.
    pub fn create(vfs: &V, uri: &Path, schema: &Schema) -> Result<()> {
        if !schema.is_finalized() {
            return Err(Error::Schema("schema must be finalized before creating an array".into()));
        }
        let schema_path = uri.join(SCHEMA_FILE_NAME);
        if vfs.exists(&schema_path)? {
            return Err(Error::Schema(format!("an array already exists at {}", uri.display())));
        }
        vfs.write_append(&schema_path, &schema.serialize())?;
        log::debug!("Created array at {}", uri.display());
        Ok(())
    }

    /// Opens `uri` in `mode`, acquiring the array filelock (shared for
    /// `Read`, exclusive otherwise), loading the schema and snapshotting the
    /// fragments committed at or before `timestamp` (default: now).
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` if the filelock can't be acquired,
    /// `Error::Schema`/`Error::Bookkeeping` if the schema or a fragment's
    /// bookkeeping is malformed, `Error::Io` on any other VFS failure.
    pub fn open(vfs: V, uri: &Path, mode: ArrayMode, context: Arc<Context>, timestamp: Option<u64>) -> Result<Self> {
        log::trace!("Opening array at {} in {mode:?}", uri.display());
        let lock = vfs.filelock_lock(&uri.join(LOCK_FILE_NAME), mode.is_shared_lock())?;
        log::trace!("Acquired array filelock for {}", uri.display());

        let schema = Schema::deserialize(&read_whole_file(&vfs, &uri.join(SCHEMA_FILE_NAME))?)?;

        let timestamp = timestamp.unwrap_or_else(|| crate::time::unix_timestamp().as_micros() as u64);

        let mut fragments = Vec::new();
        for entry in vfs.ls(uri)? {
            if !entry.is_dir {
                continue;
            }
            let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(id) = FragmentId::parse(name) else {
                continue;
            };
            if !id.visible_at(timestamp) {
                continue;
            }
            if !vfs.exists(&entry.path.join(COMMIT_MARKER_NAME))? {
                continue;
            }
            let bookkeeping = Bookkeeping::deserialize(&read_whole_file(&vfs, &entry.path.join(BOOKKEEPING_FILE_NAME))?)?;
            fragments.push(Fragment::new(id, bookkeeping));
        }
        fragments.sort_by_key(|f| (f.id().timestamp_lo(), f.id().timestamp_hi()));
        log::debug!("Opened array at {} with {} visible fragments at timestamp {timestamp}", uri.display(), fragments.len());

        Ok(Self {
            uri: uri.to_path_buf(),
            vfs,
            schema,
            fragments,
            mode,
            timestamp,
            context,
            _lock: lock,
        })
    }

    /// Releases the array filelock. Equivalent to dropping the handle;
    /// spelled out for callers that want an explicit `close()` in their
    /// control flow.
    pub fn close(self) {}

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Fragments visible at this handle's snapshot, sorted by timestamp.
    #[must_use]
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    #[must_use]
    pub fn mode(&self) -> ArrayMode {
        self.mode
    }

    #[must_use]
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Reads an entire file at `rel_path` (relative to the array's root)
    /// into memory. Used by readers to fetch whole attribute/coordinate
    /// tile files before slicing out the bytes a query needs.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be stat'd or read.
    pub(crate) fn read_file(&self, rel_path: &str) -> Result<Vec<u8>> {
        read_whole_file(&self.vfs, &self.uri.join(rel_path))
    }

    /// Writes `bytes` to `rel_path` (relative to the array's root), creating
    /// parent directories as needed. Used by consolidation to publish vacuum
    /// markers outside the fragment commit path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the underlying write fails.
    pub(crate) fn write_file(&self, rel_path: &str, bytes: &[u8]) -> Result<()> {
        self.vfs.write_append(&self.uri.join(rel_path), bytes)
    }

    /// The VFS backend this handle was opened with, for operations (like
    /// vacuum) that need to list or remove files outside a fragment's own
    /// commit path.
    pub(crate) fn vfs(&self) -> &V {
        &self.vfs
    }

    /// Commits a fragment prepared by [`crate::fragment::FragmentWriter`]
    /// and adds it to this handle's visible snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Concurrency` if this handle was opened in
    /// [`ArrayMode::Read`]. Returns whatever [`PreparedFragment::commit`]
    /// returns otherwise.
    pub fn commit_fragment(&mut self, prepared: &PreparedFragment) -> Result<()> {
        if self.mode == ArrayMode::Read {
            return Err(Error::Concurrency("array was opened for reading; cannot commit a fragment".into()));
        }
        let fragment = prepared.commit(&self.vfs, &self.uri)?;
        log::debug!("Committed fragment {:?} to {}", fragment.id(), self.uri.display());
        self.fragments.push(fragment);
        self.fragments.sort_by_key(|f| (f.id().timestamp_lo(), f.id().timestamp_hi()));
        Ok(())
    }

    /// Drops every fragment whose id is in `ids` from this handle's visible
    /// snapshot, without touching anything on disk. Used by consolidation to
    /// retire the fragments a merge just replaced so the handle doesn't keep
    /// reading both the originals and the merged fragment.
    pub(crate) fn retain_fragments(&mut self, ids: &std::collections::HashSet<FragmentId>) {
        self.fragments.retain(|f| !ids.contains(&f.id()));
    }
}

fn read_whole_file<V: Vfs>(vfs: &V, path: &Path) -> Result<Vec<u8>> {
    let len = vfs.file_size(path)?;
    let mut buf = vec![0u8; len as usize];
    vfs.read(path, 0, &mut buf)?;
    Ok(buf)
}
