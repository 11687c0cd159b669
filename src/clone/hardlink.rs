//! Hardlink coalescing.
//!
//! Only the source tree knows how many names share an inode. The first
//! time a multi-link regular source is copied, its `(dev, rdev, ino)` key
//! is bound to that destination path. Every later occurrence of the same
//! key skips its copy and instead records `new destination -> first
//! destination`; those pairs become `link(2)` calls once all copies have
//! finished, so every link target exists before any link is attempted.

use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::info::Info;

pub(crate) struct Hardlinker {
    // src (dev, rdev, ino) -> first destination path
    first: DashMap<(u64, u64, u64), PathBuf>,
    // deferred: new destination -> first destination
    links: DashMap<PathBuf, PathBuf>,
}

impl Hardlinker {
    pub(crate) fn new() -> Self {
        Self {
            first: DashMap::new(),
            links: DashMap::new(),
        }
    }

    /// Returns true if `dst` was deferred: the inode group already has a
    /// destination and `dst` must become a hardlink to it instead of a
    /// copy. Only multi-link regular files participate.
    pub(crate) fn track(&self, src: &Info, dst: &Path) -> bool {
        if src.nlink <= 1 || !src.is_regular() {
            return false;
        }

        match self.first.entry((src.dev, src.rdev, src.ino)) {
            Entry::Occupied(e) => {
                self.links.insert(dst.to_path_buf(), e.get().clone());
                true
            }
            Entry::Vacant(v) => {
                v.insert(dst.to_path_buf());
                false
            }
        }
    }

    /// Drain the deferred table as `(new destination, link target)` pairs.
    pub(crate) fn take_links(&self) -> Vec<(PathBuf, PathBuf)> {
        let out: Vec<(PathBuf, PathBuf)> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.links.clear();
        out
    }
}
