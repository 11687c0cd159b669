//! Concurrent filesystem traversal.
//!
//! The walker fans directory reads out over a set of workers and produces a
//! stream of [`Info`] values for every matching entry. It can stay on one
//! filesystem, follow symlinks, suppress duplicate inodes, and filter by
//! basename glob, caller predicate and entry type.
//!
//! Filtering precedence per entry, first match wins: basename glob →
//! lstat → duplicate-inode check → caller filter → type-mask output gate.
//! A directory's own entry is always emitted before any of its children.
//!
//! Two surface forms:
//! - [`walk`] streams results over a pair of channels the caller drains.
//! - [`walk_func`] invokes a concurrency-safe callback per entry and
//!   returns an aggregated error once traversal completes.
//!
//! Errors (stat, readdir, symlink resolution, bad glob patterns) are
//! reported on the error side and never stop the traversal.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use dashmap::DashSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::info::{FileType, Info};
use crate::workpool::default_concurrency;

/// Bitmask of entry types the walker reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Type(u32);

impl Type {
    /// Regular files
    pub const FILE: Type = Type(1 << 0);
    /// Directories
    pub const DIR: Type = Type(1 << 1);
    /// Symbolic links
    pub const SYMLINK: Type = Type(1 << 2);
    /// Block and character devices
    pub const DEVICE: Type = Type(1 << 3);
    /// Fifos and sockets
    pub const SPECIAL: Type = Type(1 << 4);
    /// Everything
    pub const ALL: Type = Type(0b11111);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: Type) -> bool {
        self.0 & other.0 == other.0
    }

    fn of(ft: FileType) -> Type {
        match ft {
            FileType::Regular => Type::FILE,
            FileType::Directory => Type::DIR,
            FileType::Symlink => Type::SYMLINK,
            FileType::BlockDevice | FileType::CharDevice => Type::DEVICE,
            FileType::Fifo | FileType::Socket => Type::SPECIAL,
            FileType::Unknown => Type(0),
        }
    }
}

impl std::ops::BitOr for Type {
    type Output = Type;

    fn bitor(self, rhs: Type) -> Type {
        Type(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Type::FILE, "File"),
            (Type::DIR, "Dir"),
            (Type::SYMLINK, "Symlink"),
            (Type::DEVICE, "Device"),
            (Type::SPECIAL, "Special"),
        ];
        let mut first = true;
        for (t, nm) in names {
            if self.contains(t) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{nm}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Caller supplied predicate; returning true removes the entry from all
/// further processing (an excluded directory is not descended).
pub type WalkFilter = Arc<dyn Fn(&Info) -> bool + Send + Sync>;

/// Options controlling a filesystem walk.
///
/// # Default Values
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `concurrency` | 0 (= logical CPUs) | Worker count |
/// | `follow_symlinks` | `false` | Resolve symlinks and classify targets |
/// | `one_fs` | `false` | Do not cross mount points |
/// | `ignore_duplicate_inode` | `false` | Emit each `(dev,rdev,ino)` once |
/// | `types` | [`Type::ALL`] | Output type mask |
/// | `excludes` | empty | Basename shell globs to prune |
/// | `filter` | `None` | Caller predicate |
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WalkOptions {
    /// Number of workers; 0 means one per logical CPU
    pub concurrency: usize,

    /// Resolve symlinks and enumerate their targets (directory targets are
    /// descended)
    pub follow_symlinks: bool,

    /// Stay on the filesystems of the starting paths
    pub one_fs: bool,

    /// Suppress entries whose `(dev, rdev, ino)` was already emitted
    pub ignore_duplicate_inode: bool,

    /// Which entry types to report
    pub types: Type,

    /// Shell glob patterns matched against basenames; matches are neither
    /// reported nor descended
    pub excludes: Vec<String>,

    /// Caller predicate evaluated after stat; true means skip
    #[cfg_attr(feature = "serde", serde(skip))]
    pub filter: Option<WalkFilter>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            concurrency: 0,
            follow_symlinks: false,
            one_fs: false,
            ignore_duplicate_inode: false,
            types: Type::ALL,
            excludes: Vec::new(),
            filter: None,
        }
    }
}

impl std::fmt::Debug for WalkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalkOptions")
            .field("concurrency", &self.concurrency)
            .field("follow_symlinks", &self.follow_symlinks)
            .field("one_fs", &self.one_fs)
            .field("ignore_duplicate_inode", &self.ignore_duplicate_inode)
            .field("types", &self.types)
            .field("excludes", &self.excludes)
            .field("filter", &self.filter.as_ref().map(|_| "..."))
            .finish()
    }
}

impl WalkOptions {
    /// Set the worker count.
    #[must_use]
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Follow symlinks.
    #[must_use]
    pub fn with_follow_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// Stay on the starting filesystems.
    #[must_use]
    pub fn with_one_fs(mut self) -> Self {
        self.one_fs = true;
        self
    }

    /// Suppress duplicate inodes.
    #[must_use]
    pub fn with_ignore_duplicate_inode(mut self) -> Self {
        self.ignore_duplicate_inode = true;
        self
    }

    /// Set the output type mask.
    #[must_use]
    pub fn with_types(mut self, t: Type) -> Self {
        self.types = t;
        self
    }

    /// Add a basename exclude pattern.
    #[must_use]
    pub fn with_exclude<S: Into<String>>(mut self, pat: S) -> Self {
        self.excludes.push(pat.into());
        self
    }

    /// Set the caller filter predicate.
    #[must_use]
    pub fn with_filter(mut self, f: WalkFilter) -> Self {
        self.filter = Some(f);
        self
    }
}

/// Traverse `paths` concurrently, streaming matching entries on the first
/// channel and errors on the second. Both channels close when the
/// traversal completes; the caller must drain them.
pub fn walk(paths: Vec<PathBuf>, opt: WalkOptions) -> (Receiver<Arc<Info>>, Receiver<Error>) {
    let conc = resolve_concurrency(opt.concurrency);
    let (out_tx, out_rx) = bounded(conc);
    let (err_tx, err_rx) = unbounded();

    let apply: Apply = Box::new(move |fi| {
        let _ = out_tx.send(fi);
    });
    launch(paths, opt, apply, err_tx);

    (out_rx, err_rx)
}

/// Traverse `paths` concurrently, invoking `apply` for every matching
/// entry. `apply` is called from multiple workers at once and must be
/// concurrency-safe; its errors join the traversal errors in the
/// aggregated result.
pub fn walk_func<F>(paths: Vec<PathBuf>, opt: WalkOptions, apply: F) -> Result<()>
where
    F: Fn(Arc<Info>) -> Result<()> + Send + Sync + 'static,
{
    let (err_tx, err_rx) = unbounded();

    let etx = err_tx.clone();
    let applyb: Apply = Box::new(move |fi| {
        if let Err(e) = apply(fi) {
            let _ = etx.send(e);
        }
    });
    launch(paths, opt, applyb, err_tx);

    let errs: Vec<Error> = err_rx.iter().collect();
    if errs.is_empty() {
        Ok(())
    } else {
        Err(Error::aggregate(errs))
    }
}

type Apply = Box<dyn Fn(Arc<Info>) + Send + Sync>;

fn resolve_concurrency(n: usize) -> usize {
    if n == 0 {
        default_concurrency()
    } else {
        n
    }
}

// One queued directory. The wait-group guard tracks traversal completion:
// it is cloned into every child job and dropped when the directory has been
// fully read.
struct DirJob {
    path: PathBuf,
    wg: WaitGroup,
}

struct WalkState {
    opt: WalkOptions,
    patterns: Vec<glob::Pattern>,
    apply: Apply,
    err_tx: Sender<Error>,
    dir_tx: Mutex<Option<Sender<DirJob>>>,

    // (dev, rdev) of the starting filesystems, for one_fs containment
    fs_set: DashSet<(u64, u64)>,
    // (dev, rdev, ino) already emitted, for duplicate suppression
    seen: DashSet<(u64, u64, u64)>,
}

fn launch(paths: Vec<PathBuf>, mut opt: WalkOptions, apply: Apply, err_tx: Sender<Error>) {
    opt.concurrency = resolve_concurrency(opt.concurrency);
    let conc = opt.concurrency;

    let mut patterns = Vec::with_capacity(opt.excludes.len());
    for pat in &opt.excludes {
        match glob::Pattern::new(pat) {
            Ok(p) => patterns.push(p),
            Err(e) => {
                let _ = err_tx.send(Error::Path {
                    op: "exclude-glob",
                    path: PathBuf::from(pat),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                });
            }
        }
    }

    debug!(roots = paths.len(), concurrency = conc, "starting walk");

    let (dir_tx, dir_rx) = unbounded::<DirJob>();
    let state = Arc::new(WalkState {
        opt,
        patterns,
        apply,
        err_tx,
        dir_tx: Mutex::new(Some(dir_tx)),
        fs_set: DashSet::new(),
        seen: DashSet::new(),
    });

    for i in 0..conc {
        let st = state.clone();
        let rx = dir_rx.clone();
        std::thread::Builder::new()
            .name(format!("fsmirror-walk-{i}"))
            .spawn(move || {
                for job in rx.iter() {
                    st.process_dir(&job.path, &job.wg);
                    // the guard must outlive the full directory read
                    drop(job);
                }
            })
            .expect("spawn walk worker");
    }

    let wg = WaitGroup::new();
    for p in paths {
        state.walk_root(p, &wg);
    }

    // close the submission channel once every queued directory is done
    let st = state;
    std::thread::Builder::new()
        .name("fsmirror-walk-closer".to_string())
        .spawn(move || {
            wg.wait();
            st.dir_tx.lock().expect("dir queue").take();
        })
        .expect("spawn walk closer");
}

impl WalkState {
    fn error(&self, e: Error) {
        let _ = self.err_tx.send(e);
    }

    fn enqueue(&self, path: PathBuf, wg: WaitGroup) {
        if let Some(tx) = self.dir_tx.lock().expect("dir queue").as_ref() {
            let _ = tx.send(DirJob { path, wg });
        }
    }

    // true iff the basename matches one of the exclude patterns
    fn excluded(&self, path: &Path) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let base = match path.file_name() {
            Some(b) => b.to_string_lossy(),
            None => return false,
        };
        self.patterns.iter().any(|p| p.matches(&base))
    }

    // true if we've already emitted this inode; first occurrence wins
    fn entry_seen(&self, fi: &Info) -> bool {
        if !self.opt.ignore_duplicate_inode {
            return false;
        }
        !self.seen.insert((fi.dev, fi.rdev, fi.ino))
    }

    fn filtered(&self, fi: &Info) -> bool {
        self.opt.filter.as_ref().map(|f| f(fi)).unwrap_or(false)
    }

    // true if descending into fi stays on a starting filesystem
    fn single_fs(&self, fi: &Info) -> bool {
        if !self.opt.one_fs {
            return true;
        }
        self.fs_set.contains(&(fi.dev, fi.rdev))
    }

    fn output(&self, fi: Info) {
        if self.opt.types.contains(Type::of(fi.file_type())) {
            (self.apply)(Arc::new(fi));
        }
    }

    fn walk_root(&self, path: PathBuf, wg: &WaitGroup) {
        if self.excluded(&path) {
            return;
        }
        let fi = match Info::lstat(&path) {
            Ok(fi) => fi,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        if self.entry_seen(&fi) || self.filtered(&fi) {
            return;
        }

        if fi.is_dir() {
            if self.opt.one_fs {
                self.fs_set.insert((fi.dev, fi.rdev));
            }
            self.enqueue(path, wg.clone());
        } else if fi.is_symlink() && self.opt.follow_symlinks {
            self.follow_symlink(&path, wg);
        } else {
            self.output(fi);
        }
    }

    fn process_dir(&self, dir: &Path, wg: &WaitGroup) {
        let fi = match Info::lstat(dir) {
            Ok(fi) => fi,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        // the directory itself goes out before any of its children
        self.output(fi);

        let rd = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                self.error(Error::Path {
                    op: "readdir",
                    path: dir.to_path_buf(),
                    source: e,
                });
                return;
            }
        };

        for ent in rd {
            let ent = match ent {
                Ok(ent) => ent,
                Err(e) => {
                    self.error(Error::Path {
                        op: "readdir",
                        path: dir.to_path_buf(),
                        source: e,
                    });
                    continue;
                }
            };
            let path = dir.join(ent.file_name());
            if self.excluded(&path) {
                continue;
            }
            let fi = match Info::lstat(&path) {
                Ok(fi) => fi,
                Err(e) => {
                    self.error(e);
                    continue;
                }
            };
            if self.entry_seen(&fi) || self.filtered(&fi) {
                continue;
            }

            if fi.is_dir() {
                // don't descend across a mount point
                if self.single_fs(&fi) {
                    self.enqueue(path, wg.clone());
                }
            } else if fi.is_symlink() && self.opt.follow_symlinks {
                self.follow_symlink(&path, wg);
            } else {
                self.output(fi);
            }
        }
    }

    // Resolve a symlink and classify the target by its final type. The
    // emitted path is the resolved one.
    fn follow_symlink(&self, path: &Path, wg: &WaitGroup) {
        let resolved = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) => {
                self.error(Error::Path {
                    op: "symlink",
                    path: path.to_path_buf(),
                    source: e,
                });
                return;
            }
        };

        let fi = match Info::stat(&resolved) {
            Ok(fi) => fi,
            Err(e) => {
                self.error(e);
                return;
            }
        };
        if self.entry_seen(&fi) {
            return;
        }

        if fi.is_dir() {
            // mount containment applies to the resolved device
            if self.single_fs(&fi) {
                self.enqueue(resolved, wg.clone());
            }
        } else {
            self.output(fi);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn collect(paths: Vec<PathBuf>, opt: WalkOptions) -> (Vec<Arc<Info>>, Vec<Error>) {
        let (out, errs) = walk(paths, opt);
        let mut infos = Vec::new();
        let mut es = Vec::new();
        // drain the error channel from a helper thread so a full error
        // stream can't stall the walk
        let eh = std::thread::spawn(move || errs.iter().collect::<Vec<_>>());
        for fi in out.iter() {
            infos.push(fi);
        }
        es.extend(eh.join().unwrap());
        (infos, es)
    }

    fn paths_of(infos: &[Arc<Info>]) -> HashSet<PathBuf> {
        infos.iter().map(|fi| fi.path().to_path_buf()).collect()
    }

    #[test]
    fn test_walk_basic_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/f1"), "1").unwrap();
        fs::write(root.join("a/b/f2"), "2").unwrap();

        let (infos, errs) = collect(vec![root.to_path_buf()], WalkOptions::default().with_types(Type::ALL));
        assert!(errs.is_empty(), "{errs:?}");

        let got = paths_of(&infos);
        assert!(got.contains(&root.to_path_buf()));
        assert!(got.contains(&root.join("a")));
        assert!(got.contains(&root.join("a/b")));
        assert!(got.contains(&root.join("a/f1")));
        assert!(got.contains(&root.join("a/b/f2")));
        assert_eq!(infos.len(), 5);
    }

    #[test]
    fn test_walk_excludes_prune_whole_subtree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join(".zfs/snap")).unwrap();
        fs::write(root.join("a/f"), "x").unwrap();
        fs::write(root.join(".zfs/snap/f"), "x").unwrap();

        let opt = WalkOptions::default()
            .with_types(Type::ALL)
            .with_exclude(".zfs");
        let (infos, errs) = collect(vec![root.to_path_buf()], opt);
        assert!(errs.is_empty(), "{errs:?}");

        let got = paths_of(&infos);
        assert!(got.contains(&root.join("a/f")));
        assert!(!got.iter().any(|p| p.starts_with(root.join(".zfs"))));
    }

    #[test]
    fn test_walk_type_mask_files_only() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::write(root.join("d/f"), "x").unwrap();

        let opt = WalkOptions::default().with_types(Type::FILE);
        let (infos, errs) = collect(vec![root.to_path_buf()], opt);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_regular());
    }

    #[test]
    fn test_walk_dir_emitted_before_children() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("d/e")).unwrap();
        fs::write(root.join("d/e/f"), "x").unwrap();

        let opt = WalkOptions::default()
            .with_types(Type::ALL)
            .with_concurrency(1);
        let (infos, _) = collect(vec![root.to_path_buf()], opt);

        let order: Vec<PathBuf> = infos.iter().map(|fi| fi.path().to_path_buf()).collect();
        let pos = |p: &Path| order.iter().position(|q| q == p).unwrap();
        assert!(pos(&root.join("d")) < pos(&root.join("d/e")));
        assert!(pos(&root.join("d/e")) < pos(&root.join("d/e/f")));
    }

    #[test]
    fn test_walk_duplicate_inode_suppression() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a"), "x").unwrap();
        fs::hard_link(root.join("a"), root.join("b")).unwrap();

        let opt = WalkOptions::default()
            .with_types(Type::FILE)
            .with_ignore_duplicate_inode();
        let (infos, errs) = collect(vec![root.to_path_buf()], opt);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(infos.len(), 1);

        let mut keys = HashSet::new();
        for fi in &infos {
            assert!(keys.insert((fi.dev, fi.rdev, fi.ino)));
        }
    }

    #[test]
    fn test_walk_caller_filter() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("keep"), "x").unwrap();
        fs::write(root.join("drop"), "x").unwrap();

        let opt = WalkOptions::default()
            .with_types(Type::FILE)
            .with_filter(Arc::new(|fi: &Info| fi.name() == "drop"));
        let (infos, errs) = collect(vec![root.to_path_buf()], opt);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name(), "keep");
    }

    #[test]
    fn test_walk_symlinks_literal_by_default() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("t"), "x").unwrap();
        symlink("t", root.join("l")).unwrap();

        let opt = WalkOptions::default().with_types(Type::SYMLINK);
        let (infos, errs) = collect(vec![root.to_path_buf()], opt);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_symlink());
    }

    #[test]
    fn test_walk_follow_symlink_dir_descends() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("real")).unwrap();
        fs::write(root.join("real/f"), "x").unwrap();
        fs::create_dir_all(root.join("tree")).unwrap();
        symlink(root.join("real"), root.join("tree/link")).unwrap();

        let opt = WalkOptions::default()
            .with_types(Type::FILE)
            .with_follow_symlinks();
        let (infos, errs) = collect(vec![root.join("tree")], opt);
        assert!(errs.is_empty(), "{errs:?}");
        // resolved target directory was descended; its file was found
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name(), "f");
    }

    #[test]
    fn test_walk_func_reports_missing_root() {
        let err = walk_func(
            vec![PathBuf::from("/definitely/not/here")],
            WalkOptions::default().with_types(Type::ALL),
            |_| Ok(()),
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_walk_func_aggregates_apply_errors() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("f"), "x").unwrap();

        let err = walk_func(
            vec![root.to_path_buf()],
            WalkOptions::default().with_types(Type::FILE),
            |fi| {
                Err(Error::NotADirectory(fi.path().to_path_buf()))
            },
        )
        .unwrap_err();
        match err {
            Error::NotADirectory(_) | Error::Aggregate(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
