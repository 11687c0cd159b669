//! Builder API for ergonomic tree mirroring.
//!
//! The builder provides a fluent interface over [`clone::tree`] that is
//! often more convenient than constructing [`CloneOptions`] by hand, and it
//! returns operation counts collected while the clone runs.
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```no_run
//! use fsmirror::CloneBuilder;
//!
//! let stats = CloneBuilder::new("src", "dst").run()?;
//! println!("copied {} entries, removed {}", stats.entries_copied, stats.entries_deleted);
//! # Ok::<(), fsmirror::Error>(())
//! ```
//!
//! ## With Options
//!
//! ```no_run
//! use fsmirror::{CloneBuilder, IgnoreFlag};
//!
//! let stats = CloneBuilder::new("src", "dst")
//!     .concurrency(8)
//!     .ignore(IgnoreFlag::UID | IgnoreFlag::GID)
//!     .exclude(".snapshots")
//!     .run()?;
//! # Ok::<(), fsmirror::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::clone::{self, CloneOptions};
use crate::cmp::IgnoreFlag;
use crate::error::Result;
use crate::info::Info;
use crate::observer::Observer;

/// Counts of the operations a clone performed.
///
/// Returned by [`CloneBuilder::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneStats {
    /// Entries visited on the source side during comparison
    pub src_visited: u64,
    /// Entries visited on the destination side during comparison
    pub dst_visited: u64,
    /// Directories created
    pub dirs_created: u64,
    /// Entries copied (files, symlinks, nodes, changed directories)
    pub entries_copied: u64,
    /// Hardlinks established
    pub links_created: u64,
    /// Destination-only entries removed
    pub entries_deleted: u64,
    /// Directory metadata fixups applied
    pub metadata_updates: u64,
    /// Wall-clock duration of the whole clone
    pub duration: std::time::Duration,
}

// Counts every event and forwards it to the caller's observer.
#[derive(Default)]
struct CountingObserver {
    inner: Option<Arc<dyn Observer>>,
    src_visited: AtomicU64,
    dst_visited: AtomicU64,
    dirs_created: AtomicU64,
    entries_copied: AtomicU64,
    links_created: AtomicU64,
    entries_deleted: AtomicU64,
    metadata_updates: AtomicU64,
}

impl Observer for CountingObserver {
    fn visit_src(&self, fi: &Info) {
        self.src_visited.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.visit_src(fi);
        }
    }

    fn visit_dst(&self, fi: &Info) {
        self.dst_visited.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.visit_dst(fi);
        }
    }

    fn difference(&self, d: &crate::cmp::Difference) {
        if let Some(o) = &self.inner {
            o.difference(d);
        }
    }

    fn mkdir(&self, dst: &Path) {
        self.dirs_created.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.mkdir(dst);
        }
    }

    fn copy(&self, dst: &Path, src: &Path) {
        self.entries_copied.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.copy(dst, src);
        }
    }

    fn delete(&self, dst: &Path) {
        self.entries_deleted.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.delete(dst);
        }
    }

    fn link(&self, dst: &Path, src: &Path) {
        self.links_created.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.link(dst, src);
        }
    }

    fn metadata_update(&self, dst: &Path, src: &Path) {
        self.metadata_updates.fetch_add(1, Ordering::Relaxed);
        if let Some(o) = &self.inner {
            o.metadata_update(dst, src);
        }
    }
}

/// A builder for configuring and executing a tree clone.
///
/// # Example
///
/// ```no_run
/// use fsmirror::CloneBuilder;
///
/// let stats = CloneBuilder::new("/data/project", "/backup/project")
///     .concurrency(16)
///     .ignore_missing()
///     .run()?;
/// # Ok::<(), fsmirror::Error>(())
/// ```
#[derive(Clone)]
pub struct CloneBuilder {
    src: PathBuf,
    dst: PathBuf,
    options: CloneOptions,
}

impl CloneBuilder {
    /// Create a builder mirroring `src` into `dst` with default options.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Self {
        Self {
            src: src.as_ref().to_path_buf(),
            dst: dst.as_ref().to_path_buf(),
            options: CloneOptions::default(),
        }
    }

    /// Set the worker count (default: one per logical CPU).
    #[must_use]
    pub fn concurrency(mut self, n: usize) -> Self {
        self.options.walk.concurrency = n;
        self
    }

    /// Ignore the given attributes when deciding whether an entry changed.
    #[must_use]
    pub fn ignore(mut self, fl: IgnoreFlag) -> Self {
        self.options = self.options.with_ignore(fl);
        self
    }

    /// Tolerate source entries vanishing mid-clone (live source trees).
    #[must_use]
    pub fn ignore_missing(mut self) -> Self {
        self.options = self.options.with_ignore_missing();
        self
    }

    /// Stay on the filesystems of the two roots.
    #[must_use]
    pub fn one_fs(mut self) -> Self {
        self.options.walk.one_fs = true;
        self
    }

    /// Add a basename glob pattern to skip on both sides.
    #[must_use]
    pub fn exclude<S: Into<String>>(mut self, pat: S) -> Self {
        self.options.walk.excludes.push(pat.into());
        self
    }

    /// Forward progress events to `o` in addition to counting them.
    #[must_use]
    pub fn observer(mut self, o: Arc<dyn Observer>) -> Self {
        self.options = self.options.with_observer(o);
        self
    }

    /// Run the clone and return the collected operation counts.
    pub fn run(self) -> Result<CloneStats> {
        let start = Instant::now();

        let counter = Arc::new(CountingObserver {
            inner: Some(self.options.observer.clone()),
            ..CountingObserver::default()
        });
        let opt = self.options.clone().with_observer(counter.clone());

        clone::tree(&self.dst, &self.src, &opt)?;

        Ok(CloneStats {
            src_visited: counter.src_visited.load(Ordering::Relaxed),
            dst_visited: counter.dst_visited.load(Ordering::Relaxed),
            dirs_created: counter.dirs_created.load(Ordering::Relaxed),
            entries_copied: counter.entries_copied.load(Ordering::Relaxed),
            links_created: counter.links_created.load(Ordering::Relaxed),
            entries_deleted: counter.entries_deleted.load(Ordering::Relaxed),
            metadata_updates: counter.metadata_updates.load(Ordering::Relaxed),
            duration: start.elapsed(),
        })
    }
}
