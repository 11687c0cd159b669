//! Progress observation for tree comparison and cloning.
//!
//! An [`Observer`] receives events from the differencer (entries visited on
//! either side, the computed difference) and from the cloner (every
//! mutation it performs). Events arrive on arbitrary worker threads, so
//! implementations must be concurrency-safe. All methods default to no-ops;
//! [`NopObserver`] is the ready-made empty implementation.

use std::path::Path;

use crate::cmp::Difference;
use crate::info::Info;

/// Event sink for differencer and cloner progress.
pub trait Observer: Send + Sync {
    /// A source tree entry was visited during comparison.
    fn visit_src(&self, _fi: &Info) {}

    /// A destination tree entry was visited during comparison.
    fn visit_dst(&self, _fi: &Info) {}

    /// The comparison finished with this result.
    fn difference(&self, _d: &Difference) {}

    /// A destination directory is being created.
    fn mkdir(&self, _dst: &Path) {}

    /// A source entry is being copied onto the destination.
    fn copy(&self, _dst: &Path, _src: &Path) {}

    /// A destination-only entry is being removed.
    fn delete(&self, _dst: &Path) {}

    /// A deferred hardlink is being established.
    fn link(&self, _dst: &Path, _src: &Path) {}

    /// Full metadata is being re-applied to a destination path.
    fn metadata_update(&self, _dst: &Path, _src: &Path) {}
}

/// An [`Observer`] that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopObserver;

impl Observer for NopObserver {}
