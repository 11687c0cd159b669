//! Tree cloning.
//!
//! [`tree`] mutates the destination tree until it equals the source tree
//! (modulo the configured ignore flags). The computed difference is turned
//! into four strictly ordered stages, each drained on a worker pool before
//! the next begins:
//!
//! 1. create source-only directories (parents before children);
//! 2. copy changed and source-only entries, delete destination-only ones —
//!    multi-link regular sources are coalesced: the first name is copied,
//!    the rest are deferred;
//! 3. establish the deferred hardlinks;
//! 4. re-apply metadata to every touched directory, deepest first, so
//!    parent mtimes settle after their children stop changing.
//!
//! If the difference contains funny entries (same name, different type on
//! the two sides) the clone refuses up front and nothing is modified.
//! Workers never short-circuit: every failure is recorded and the joined
//! set is returned at the end.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::cmp::{self, CmpOptions, Difference, IgnoreFlag};
use crate::error::{Error, FunnyEntry, Result};
use crate::info::Info;
use crate::observer::{NopObserver, Observer};
use crate::walk::{Type, WalkOptions};
use crate::workpool::{default_concurrency, WorkPool};

mod entry;
mod hardlink;

pub use entry::{clone_entry, metadata, update_metadata};

use hardlink::Hardlinker;

/// Options for tree cloning.
#[derive(Clone)]
pub struct CloneOptions {
    /// Traversal options for capturing both trees
    pub walk: WalkOptions,
    /// Attributes excluded from the change detection
    pub ignore: IgnoreFlag,
    /// Tolerate sources disappearing mid-clone (live source trees)
    pub ignore_missing: bool,
    /// Progress sink
    pub observer: Arc<dyn Observer>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            walk: WalkOptions::default()
                .with_types(Type::ALL)
                .with_exclude(".zfs"),
            ignore: IgnoreFlag::NONE,
            ignore_missing: false,
            observer: Arc::new(NopObserver),
        }
    }
}

impl CloneOptions {
    /// Use `wo` for the tree traversal. An empty type mask is widened to
    /// [`Type::ALL`]: cloning needs to see every entry.
    #[must_use]
    pub fn with_walk_options(mut self, wo: WalkOptions) -> Self {
        self.walk = wo;
        if self.walk.types == Type::default() {
            self.walk.types = Type::ALL;
        }
        self
    }

    /// Set the attributes to ignore during change detection.
    #[must_use]
    pub fn with_ignore(mut self, fl: IgnoreFlag) -> Self {
        self.ignore = fl;
        self
    }

    /// Tolerate source entries vanishing between capture and clone.
    #[must_use]
    pub fn with_ignore_missing(mut self) -> Self {
        self.ignore_missing = true;
        self
    }

    /// Install a progress observer.
    #[must_use]
    pub fn with_observer(mut self, o: Arc<dyn Observer>) -> Self {
        self.observer = o;
        self
    }
}

/// Clone the whole tree under `src` into `dst` (so `src/a/b` becomes
/// `dst/a/b`), creating `dst` if necessary.
pub fn tree(dst: &Path, src: &Path, opt: &CloneOptions) -> Result<()> {
    validate(dst, src)?;

    let cmp_opt = CmpOptions {
        walk: opt.walk.clone(),
        ignore: opt.ignore,
        deep_eq: None,
        observer: opt.observer.clone(),
    };
    let diff = cmp::fs_tree(src, dst, &cmp_opt)?;
    opt.observer.difference(&diff);

    if !diff.funny.is_empty() {
        let mut funny: Vec<FunnyEntry> = diff
            .funny
            .iter()
            .map(|e| FunnyEntry {
                name: e.key().clone(),
                src: e.value().src.clone(),
                dst: e.value().dst.clone(),
            })
            .collect();
        funny.sort_by(|a, b| a.name.cmp(&b.name));
        return Err(Error::Funny(funny));
    }

    TreeCloner::new(src, dst, diff, opt).run()
}

// dst must be a directory; bootstrap it from src if it's absent
fn validate(dst: &Path, src: &Path) -> Result<()> {
    match Info::lstat(dst) {
        Ok(di) => {
            if !di.is_dir() {
                return Err(Error::NotADirectory(dst.to_path_buf()));
            }
            Ok(())
        }
        Err(e) if e.is_not_found() => clone_entry(dst, src),
        Err(e) => Err(e),
    }
}

// copy one entry or remove one destination-only entry
enum FileOp {
    Copy(String, Arc<Info>),
    Rm(String),
}

struct TreeCloner {
    src: Arc<PathBuf>,
    dst: Arc<PathBuf>,
    diff: Difference,
    observer: Arc<dyn Observer>,
    ignore_missing: bool,
    nworkers: usize,
    // per-worker shards of "directories whose metadata must be re-applied"
    touched: Arc<Vec<Mutex<HashSet<PathBuf>>>>,
    hl: Arc<Hardlinker>,
}

impl TreeCloner {
    fn new(src: &Path, dst: &Path, diff: Difference, opt: &CloneOptions) -> Self {
        let nworkers = if opt.walk.concurrency == 0 {
            default_concurrency()
        } else {
            opt.walk.concurrency
        };
        let touched = Arc::new(
            (0..nworkers)
                .map(|_| Mutex::new(HashSet::new()))
                .collect::<Vec<Mutex<HashSet<PathBuf>>>>(),
        );
        Self {
            src: Arc::new(src.to_path_buf()),
            dst: Arc::new(dst.to_path_buf()),
            diff,
            observer: opt.observer.clone(),
            ignore_missing: opt.ignore_missing,
            nworkers,
            touched,
            hl: Arc::new(Hardlinker::new()),
        }
    }

    fn run(self) -> Result<()> {
        let mut errs = Vec::new();
        self.stage_mkdir(&mut errs);
        self.stage_fileops(&mut errs);
        self.stage_links(&mut errs);
        self.stage_fixup(&mut errs);

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::aggregate(errs))
        }
    }

    fn drain(&self, res: Result<()>, errs: &mut Vec<Error>) {
        match res {
            Ok(()) => {}
            Err(Error::Aggregate(v)) => errs.extend(v),
            Err(e) => errs.push(e),
        }
    }

    // Stage 1: source-only directories, parents enqueued before children.
    fn stage_mkdir(&self, errs: &mut Vec<Error>) {
        let mut dirs: Vec<String> = self.diff.left_dirs.iter().map(|e| e.key().clone()).collect();
        if dirs.is_empty() {
            return;
        }
        dirs.sort();
        debug!(count = dirs.len(), "clone stage 1: create directories");

        let src = self.src.clone();
        let dst = self.dst.clone();
        let obs = self.observer.clone();
        let touched = self.touched.clone();
        let ignore_missing = self.ignore_missing;

        let pool = WorkPool::new(self.nworkers, move |i, rel: String| {
            let dpath = dst.join(&rel);
            let spath = src.join(&rel);
            obs.mkdir(&dpath);
            touched[i].lock().expect("touched shard").insert(dpath.clone());
            match clone_entry(&dpath, &spath) {
                Err(e) if ignore_missing && e.is_not_found() => Ok(()),
                r => r,
            }
        });
        for rel in dirs {
            pool.submit(rel);
        }
        self.drain(pool.wait(), errs);
    }

    // Stage 2: copies (with hardlink deferral) and deletes, in any order.
    fn stage_fileops(&self, errs: &mut Vec<Error>) {
        let total = self.diff.diff.len()
            + self.diff.left_files.len()
            + self.diff.right_files.len()
            + self.diff.right_dirs.len();
        if total == 0 {
            return;
        }
        debug!(count = total, "clone stage 2: file operations");

        let src = self.src.clone();
        let dst = self.dst.clone();
        let obs = self.observer.clone();
        let touched = self.touched.clone();
        let hl = self.hl.clone();
        let ignore_missing = self.ignore_missing;

        let pool = WorkPool::new(self.nworkers, move |i, op: FileOp| {
            match op {
                FileOp::Copy(rel, src_fi) => {
                    let dpath = dst.join(&rel);
                    let spath = src.join(&rel);
                    if let Some(parent) = dpath.parent() {
                        touched[i]
                            .lock()
                            .expect("touched shard")
                            .insert(parent.to_path_buf());
                    }
                    if hl.track(&src_fi, &dpath) {
                        // a later pass links it to the first copy
                        return Ok(());
                    }
                    obs.copy(&dpath, &spath);
                    match clone_entry(&dpath, &spath) {
                        Err(e) if ignore_missing && e.is_not_found() => Ok(()),
                        r => r,
                    }
                }
                FileOp::Rm(rel) => {
                    let dpath = dst.join(&rel);
                    if let Some(parent) = dpath.parent() {
                        touched[i]
                            .lock()
                            .expect("touched shard")
                            .insert(parent.to_path_buf());
                    }
                    obs.delete(&dpath);
                    entry::remove_existing(&dpath).map_err(|e| Error::Path {
                        op: "rm",
                        path: dpath.clone(),
                        source: e,
                    })
                }
            }
        });

        for e in self.diff.diff.iter() {
            pool.submit(FileOp::Copy(e.key().clone(), e.value().src.clone()));
        }
        for e in self.diff.left_files.iter() {
            pool.submit(FileOp::Copy(e.key().clone(), e.value().clone()));
        }
        for e in self.diff.right_files.iter() {
            pool.submit(FileOp::Rm(e.key().clone()));
        }
        for e in self.diff.right_dirs.iter() {
            pool.submit(FileOp::Rm(e.key().clone()));
        }
        self.drain(pool.wait(), errs);
    }

    // Stage 3: deferred hardlinks; every link target exists by now.
    fn stage_links(&self, errs: &mut Vec<Error>) {
        let links = self.hl.take_links();
        if links.is_empty() {
            return;
        }
        debug!(count = links.len(), "clone stage 3: hardlinks");

        let obs = self.observer.clone();
        let touched = self.touched.clone();

        let pool = WorkPool::new(self.nworkers, move |i, (newd, orig): (PathBuf, PathBuf)| {
            if let Some(parent) = newd.parent() {
                touched[i]
                    .lock()
                    .expect("touched shard")
                    .insert(parent.to_path_buf());
            }
            // replace whatever is there; the link must win
            if let Err(e) = fs::remove_file(&newd) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::Path {
                        op: "rm",
                        path: newd.clone(),
                        source: e,
                    });
                }
            }
            obs.link(&newd, &orig);
            fs::hard_link(&orig, &newd).map_err(|e| Error::Clone {
                op: "ln",
                src: orig.clone(),
                dst: newd.clone(),
                source: Box::new(Error::Io(e)),
            })
        });
        for l in links {
            pool.submit(l);
        }
        self.drain(pool.wait(), errs);
    }

    // Stage 4: re-apply metadata to touched directories, deepest first, so
    // a parent's restored mtime is not trashed by further child updates.
    fn stage_fixup(&self, errs: &mut Vec<Error>) {
        let mut all: HashSet<PathBuf> = HashSet::new();
        for shard in self.touched.iter() {
            all.extend(shard.lock().expect("touched shard").drain());
        }
        if all.is_empty() {
            return;
        }

        let mut dirs: Vec<PathBuf> = all.into_iter().collect();
        dirs.sort();
        dirs.reverse();
        debug!(count = dirs.len(), "clone stage 4: directory metadata");

        let src = self.src.clone();
        let dst = self.dst.clone();
        let obs = self.observer.clone();
        let ignore_missing = self.ignore_missing;

        let pool = WorkPool::new(self.nworkers, move |_, dpath: PathBuf| {
            let rel = match dpath.strip_prefix(dst.as_path()) {
                Ok(r) => r.to_path_buf(),
                Err(_) => return Ok(()),
            };
            // the parent of a removed subtree may be gone itself
            if fs::symlink_metadata(&dpath).is_err() {
                return Ok(());
            }
            let spath = src.join(&rel);
            let fi = match Info::lstat(&spath) {
                Ok(fi) => fi,
                Err(e) if ignore_missing && e.is_not_found() => return Ok(()),
                Err(e) => {
                    return Err(Error::Clone {
                        op: "md-update",
                        src: spath,
                        dst: dpath,
                        source: Box::new(e),
                    })
                }
            };
            obs.metadata_update(&dpath, &spath);
            update_metadata(&dpath, &fi)
        });
        for d in dirs {
            pool.submit(d);
        }
        self.drain(pool.wait(), errs);
    }
}
