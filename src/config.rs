// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Engine-wide configuration and the runtime it builds (`spec.md` §5).
//!
//! [`Config`] is a fluent builder, in the same shape as the teacher's own
//! `Config` (`src/config.rs`): cheap, `Clone`, validated with `assert!` at
//! the setter rather than deferred to `finalize`/`open`. [`Context`] is what
//! `Config` actually builds: it owns the compute and I/O thread pools the
//! design calls for, so an [`Array`](crate::array::Array) only ever sees a
//! shared, already-initialized runtime.

use crate::error::Result;
use crate::filter::DEFAULT_CHUNK_SIZE;
use std::sync::Arc;

/// Default number of in-flight tile cache entries retained per array.
const DEFAULT_TILE_CACHE_CAPACITY: usize = 64;

/// Default number of fragments consolidation will merge in a single run
/// (`spec.md` §4.9's eligibility ratio applies on top of this cap).
const DEFAULT_CONSOLIDATION_FANIN: usize = 16;

#[derive(Clone, Debug)]
/// Engine configuration builder.
pub struct Config {
    /// Target size of a tile chunk before filtering (`spec.md` §4.1).
    pub(crate) tile_chunk_size: usize,

    /// Default array capacity hint, used when a [`crate::Schema`] does not
    /// set one explicitly.
    pub(crate) default_capacity: u64,

    /// Number of decoded tiles kept resident per open array.
    pub(crate) tile_cache_capacity: usize,

    /// Worker count for the compute pool (tile encode/decode, condition
    /// evaluation). `None` lets `rayon` pick the default (available
    /// parallelism).
    pub(crate) compute_threads: Option<usize>,

    /// Worker count for the I/O pool (VFS calls, filelock acquisition).
    pub(crate) io_threads: Option<usize>,

    /// Maximum number of fragments consolidated together in one run.
    pub(crate) consolidation_fanin: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_chunk_size: DEFAULT_CHUNK_SIZE,
            default_capacity: 10_000,
            tile_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
            compute_threads: None,
            io_threads: None,
            consolidation_fanin: DEFAULT_CONSOLIDATION_FANIN,
        }
    }
}

impl Config {
    /// Initializes a new config with every knob at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tile chunk size filters operate over.
    ///
    /// Defaults to 64 KiB, the same default the filter pipeline uses on its
    /// own when no config is threaded through.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is 0.
    #[must_use]
    pub fn tile_chunk_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "tile chunk size must be non-zero");
        self.tile_chunk_size = bytes;
        self
    }

    /// Sets the default array capacity used by schemas that don't set one.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn default_capacity(mut self, capacity: u64) -> Self {
        assert!(capacity > 0, "default capacity must be non-zero");
        self.default_capacity = capacity;
        self
    }

    /// Sets the number of decoded tiles kept resident per open array.
    #[must_use]
    pub fn tile_cache_capacity(mut self, capacity: usize) -> Self {
        self.tile_cache_capacity = capacity;
        self
    }

    /// Sets the compute pool's worker count.
    ///
    /// Defaults to `rayon`'s notion of available parallelism.
    #[must_use]
    pub fn compute_threads(mut self, n: usize) -> Self {
        self.compute_threads = Some(n);
        self
    }

    /// Sets the I/O pool's worker count.
    ///
    /// Defaults to `rayon`'s notion of available parallelism.
    #[must_use]
    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = Some(n);
        self
    }

    /// Sets the maximum number of fragments merged together in one
    /// consolidation run.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2 (merging fewer makes no sense).
    #[must_use]
    pub fn consolidation_fanin(mut self, n: usize) -> Self {
        assert!(n >= 2, "consolidation fan-in must allow merging at least 2 fragments");
        self.consolidation_fanin = n;
        self
    }

    /// Builds the thread pools this config describes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if either pool fails to spawn its workers.
    pub fn build(self) -> Result<Context> {
        Context::new(self)
    }
}

/// Owns the compute and I/O thread pools a config builds (`spec.md` §5).
///
/// Cloning an [`Array`](crate::array::Array) handle clones an `Arc<Context>`;
/// the pools themselves are shared across every array opened against the
/// same context.
pub struct Context {
    config: Config,
    compute_pool: rayon::ThreadPool,
    io_pool: rayon::ThreadPool,
}

impl Context {
    /// Builds a new context, spawning both thread pools eagerly.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if either pool fails to spawn its workers.
    pub fn new(config: Config) -> Result<Self> {
        let mut compute_builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("arrayon-compute-{i}"));
        if let Some(n) = config.compute_threads {
            compute_builder = compute_builder.num_threads(n);
        }
        let compute_pool = compute_builder
            .build()
            .map_err(|e| crate::error::Error::Concurrency(format!("compute pool: {e}")))?;

        let mut io_builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("arrayon-io-{i}"));
        if let Some(n) = config.io_threads {
            io_builder = io_builder.num_threads(n);
        }
        let io_pool = io_builder
            .build()
            .map_err(|e| crate::error::Error::Concurrency(format!("I/O pool: {e}")))?;

        Ok(Self {
            config,
            compute_pool,
            io_pool,
        })
    }

    /// Wraps `self` for sharing across multiple open arrays.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` on the compute pool and blocks for its result.
    pub fn on_compute<T: Send>(&self, f: impl FnOnce() -> T + Send) -> T {
        self.compute_pool.install(f)
    }

    /// Runs `f` on the I/O pool and blocks for its result.
    pub fn on_io<T: Send>(&self, f: impl FnOnce() -> T + Send) -> T {
        self.io_pool.install(f)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
