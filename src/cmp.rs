//! Two-tree comparison.
//!
//! The differencer takes two captured trees ([`FioMap`]s keyed by path
//! relative to their roots) and classifies every name into exactly one of:
//! left-only, right-only, common (equal), different, or funny (same name,
//! different entry type).
//!
//! For regular files a size mismatch is a difference outright; everything
//! else runs through an ordered, short-circuit attribute comparator:
//! mtime (symlinks always compare equal) → uid → gid → xattr → caller's
//! deep comparison. uid/gid/xattr participation is controlled by
//! [`IgnoreFlag`]; hardlink counts are never compared.
//!
//! [`fs_tree`] walks both roots concurrently (with halved per-side
//! concurrency) and then compares; [`diff`] compares two already captured
//! maps without touching the filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fiomap::{new_fio_map, new_fio_pair_map, FioMap, FioPairMap, Pair};
use crate::info::Info;
use crate::observer::{NopObserver, Observer};
use crate::walk::{self, Type, WalkOptions};
use crate::workpool::default_concurrency;

/// Attributes to leave out of the equality comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IgnoreFlag(u32);

impl IgnoreFlag {
    /// Compare everything.
    pub const NONE: IgnoreFlag = IgnoreFlag(0);
    /// Ignore owner uid.
    pub const UID: IgnoreFlag = IgnoreFlag(1 << 0);
    /// Ignore owner gid.
    pub const GID: IgnoreFlag = IgnoreFlag(1 << 1);
    /// Ignore extended attributes.
    pub const XATTR: IgnoreFlag = IgnoreFlag(1 << 2);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: IgnoreFlag) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for IgnoreFlag {
    type Output = IgnoreFlag;

    fn bitor(self, rhs: IgnoreFlag) -> IgnoreFlag {
        IgnoreFlag(self.0 | rhs.0)
    }
}

impl std::fmt::Display for IgnoreFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (IgnoreFlag::UID, "uid"),
            (IgnoreFlag::GID, "gid"),
            (IgnoreFlag::XATTR, "xattr"),
        ];
        let mut first = true;
        for (fl, nm) in names {
            if self.contains(fl) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{nm}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Caller supplied comparison, invoked only when every other compared
/// attribute is identical. Returns true if the entries are the same.
pub type DeepEq = Arc<dyn Fn(&Info, &Info) -> bool + Send + Sync>;

/// Options for tree comparison.
#[derive(Clone)]
pub struct CmpOptions {
    /// Traversal options used by [`fs_tree`]
    pub walk: WalkOptions,
    /// Attributes excluded from the equality comparison
    pub ignore: IgnoreFlag,
    /// Optional expensive comparison, run last
    pub deep_eq: Option<DeepEq>,
    /// Progress sink
    pub observer: Arc<dyn Observer>,
}

impl Default for CmpOptions {
    fn default() -> Self {
        Self {
            walk: WalkOptions::default()
                .with_types(Type::ALL)
                .with_exclude(".zfs"),
            ignore: IgnoreFlag::NONE,
            deep_eq: None,
            observer: Arc::new(NopObserver),
        }
    }
}

impl CmpOptions {
    /// Set the attributes to ignore.
    #[must_use]
    pub fn with_ignore(mut self, fl: IgnoreFlag) -> Self {
        self.ignore = fl;
        self
    }

    /// Use `wo` for the tree traversal. An empty type mask is widened to
    /// [`Type::ALL`]: the comparison needs to see every entry.
    #[must_use]
    pub fn with_walk_options(mut self, wo: WalkOptions) -> Self {
        self.walk = wo;
        if self.walk.types == Type::default() {
            self.walk.types = Type::ALL;
        }
        self
    }

    /// Install a deep comparison callback.
    #[must_use]
    pub fn with_deep_eq(mut self, f: DeepEq) -> Self {
        self.deep_eq = Some(f);
        self
    }

    /// Install a progress observer.
    #[must_use]
    pub fn with_observer(mut self, o: Arc<dyn Observer>) -> Self {
        self.observer = o;
        self
    }
}

/// The result of comparing two directory trees.
///
/// Every name appears in exactly one classification map; names are paths
/// relative to the compared roots.
#[derive(Debug)]
pub struct Difference {
    /// Source root
    pub src: PathBuf,
    /// Destination root
    pub dst: PathBuf,

    /// Directories present only in the source
    pub left_dirs: FioMap,
    /// Non-directories present only in the source
    pub left_files: FioMap,
    /// Directories present only in the destination
    pub right_dirs: FioMap,
    /// Non-directories present only in the destination
    pub right_files: FioMap,

    /// Directories present on both sides and equal
    pub common_dirs: FioPairMap,
    /// Non-directories present on both sides and equal
    pub common_files: FioPairMap,

    /// Present on both sides with the same type but differing attributes
    pub diff: FioPairMap,
    /// Present on both sides with different types
    pub funny: FioPairMap,
}

impl Difference {
    fn new(src: &Path, dst: &Path) -> Self {
        Self {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            left_dirs: new_fio_map(),
            left_files: new_fio_map(),
            right_dirs: new_fio_map(),
            right_files: new_fio_map(),
            common_dirs: new_fio_pair_map(),
            common_files: new_fio_pair_map(),
            diff: new_fio_pair_map(),
            funny: new_fio_pair_map(),
        }
    }

    /// True if both trees held exactly the same entries with equal
    /// attributes.
    pub fn is_identical(&self) -> bool {
        self.left_dirs.is_empty()
            && self.left_files.is_empty()
            && self.right_dirs.is_empty()
            && self.right_files.is_empty()
            && self.diff.is_empty()
            && self.funny.is_empty()
    }
}

impl std::fmt::Display for Difference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d1 = |f: &mut std::fmt::Formatter<'_>, desc: &str, m: &FioMap| -> std::fmt::Result {
            writeln!(f, "{desc}:")?;
            for e in m.iter() {
                writeln!(f, "\t{}: {}", e.key(), e.value())?;
            }
            Ok(())
        };
        let d2 =
            |f: &mut std::fmt::Formatter<'_>, desc: &str, m: &FioPairMap| -> std::fmt::Result {
                writeln!(f, "{desc}:")?;
                for e in m.iter() {
                    writeln!(
                        f,
                        "\t{}:\n\t\tsrc {}\n\t\tdst {}",
                        e.key(),
                        e.value().src,
                        e.value().dst
                    )?;
                }
                Ok(())
            };

        writeln!(
            f,
            "---Diff Output---\nSrc: {}\nDst: {}",
            self.src.display(),
            self.dst.display()
        )?;
        d1(f, "Left-only dirs", &self.left_dirs)?;
        d1(f, "Left-only files", &self.left_files)?;
        d1(f, "Right-only dirs", &self.right_dirs)?;
        d1(f, "Right-only files", &self.right_files)?;
        d2(f, "Common dirs", &self.common_dirs)?;
        d2(f, "Common files", &self.common_files)?;
        d2(f, "Funny files", &self.funny)?;
        d2(f, "Differences", &self.diff)?;
        writeln!(f, "---End Diff Output---")
    }
}

/// Walk `src` and `dst` concurrently (each side with half the configured
/// concurrency) and compare the captured trees.
pub fn fs_tree(src: &Path, dst: &Path, opt: &CmpOptions) -> Result<Difference> {
    let lhs = Info::lstat(src)?;
    if !lhs.is_dir() {
        return Err(Error::NotADirectory(src.to_path_buf()));
    }
    let rhs = Info::lstat(dst)?;
    if !rhs.is_dir() {
        return Err(Error::NotADirectory(dst.to_path_buf()));
    }

    let conc = if opt.walk.concurrency == 0 {
        default_concurrency()
    } else {
        opt.walk.concurrency
    };
    let mut wo = opt.walk.clone();
    wo.concurrency = std::cmp::max(conc / 2, 1);

    let (ltree, rtree) = std::thread::scope(|s| {
        let wo2 = wo.clone();
        let h = s.spawn(move || gather(dst, &wo2));
        let l = gather(src, &wo);
        let r = match h.join() {
            Ok(r) => r,
            Err(_) => Err(Error::Panic("tree capture panicked".to_string())),
        };
        (l, r)
    });
    let (ltree, rtree) = (ltree?, rtree?);

    debug!(
        src_entries = ltree.len(),
        dst_entries = rtree.len(),
        "captured both trees"
    );

    Ok(diff_maps(src, dst, &ltree, &rtree, opt))
}

/// Compare two captured trees. Pure: no filesystem access.
pub fn diff(lhs: &FioMap, rhs: &FioMap, opt: &CmpOptions) -> Result<Difference> {
    Ok(diff_maps(Path::new(""), Path::new(""), lhs, rhs, opt))
}

/// Capture one tree as a map of root-relative path to [`Info`].
fn gather(root: &Path, wo: &WalkOptions) -> Result<FioMap> {
    let map = Arc::new(new_fio_map());
    let m = map.clone();
    let rootb = root.to_path_buf();

    walk::walk_func(vec![rootb.clone()], wo.clone(), move |fi| {
        let rel = match fi.path().strip_prefix(&rootb) {
            Ok(r) => r,
            Err(_) => {
                // a followed symlink resolved outside the root; there is
                // no relative name to compare it under
                warn!(path = %fi.path().display(), "entry outside walk root, skipped");
                return Ok(());
            }
        };
        if rel.as_os_str().is_empty() {
            return Ok(());
        }
        m.insert(rel.to_string_lossy().into_owned(), fi);
        Ok(())
    })?;

    Ok(Arc::try_unwrap(map).unwrap_or_else(|m| m.as_ref().clone()))
}

struct Comparator {
    ignore: IgnoreFlag,
    deep_eq: Option<DeepEq>,
}

impl Comparator {
    // ordered short-circuit chain; the expensive caller comparison last
    fn eq(&self, lhs: &Info, rhs: &Info) -> bool {
        // symlink mtimes are not meaningfully settable everywhere
        if !lhs.is_symlink() && lhs.mtime != rhs.mtime {
            return false;
        }
        if !self.ignore.contains(IgnoreFlag::UID) && lhs.uid != rhs.uid {
            return false;
        }
        if !self.ignore.contains(IgnoreFlag::GID) && lhs.gid != rhs.gid {
            return false;
        }
        if !self.ignore.contains(IgnoreFlag::XATTR) && lhs.xattr != rhs.xattr {
            return false;
        }
        if let Some(deep) = &self.deep_eq {
            if !deep(lhs, rhs) {
                return false;
            }
        }
        true
    }
}

fn diff_maps(src: &Path, dst: &Path, lhs: &FioMap, rhs: &FioMap, opt: &CmpOptions) -> Difference {
    let d = Difference::new(src, dst);
    let done: DashSet<String> = DashSet::new();
    let cmp = Comparator {
        ignore: opt.ignore,
        deep_eq: opt.deep_eq.clone(),
    };
    let obs = opt.observer.clone();

    let conc = if opt.walk.concurrency == 0 {
        default_concurrency()
    } else {
        opt.walk.concurrency
    };
    let pool = rayon::ThreadPoolBuilder::new().num_threads(conc).build();

    let lsnap: Vec<(String, Arc<Info>)> = lhs
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    let left_pass = || {
        lsnap
            .par_iter()
            .for_each(|(nm, fi)| lhs_one(&d, rhs, &done, &cmp, obs.as_ref(), nm, fi));
    };
    match &pool {
        Ok(p) => p.install(left_pass),
        Err(_) => left_pass(),
    }

    // the handled set is complete; anything unclaimed on the right is
    // right-only
    let rsnap: Vec<(String, Arc<Info>)> = rhs
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();
    let right_pass = || {
        rsnap
            .par_iter()
            .for_each(|(nm, fi)| rhs_one(&d, &done, obs.as_ref(), nm, fi));
    };
    match &pool {
        Ok(p) => p.install(right_pass),
        Err(_) => right_pass(),
    }

    d
}

fn lhs_one(
    d: &Difference,
    rhs: &FioMap,
    done: &DashSet<String>,
    cmp: &Comparator,
    obs: &dyn Observer,
    nm: &str,
    lhs: &Arc<Info>,
) {
    obs.visit_src(lhs);

    let rhs_fi = match rhs.get(nm) {
        Some(e) => e.value().clone(),
        None => {
            if lhs.is_dir() {
                d.left_dirs.insert(nm.to_string(), lhs.clone());
            } else {
                d.left_files.insert(nm.to_string(), lhs.clone());
            }
            return;
        }
    };

    let pair = Pair {
        src: lhs.clone(),
        dst: rhs_fi.clone(),
    };

    if lhs.file_type() != rhs_fi.file_type() {
        d.funny.insert(nm.to_string(), pair);
        return;
    }

    done.insert(nm.to_string());

    if lhs.is_regular() && lhs.size != rhs_fi.size {
        d.diff.insert(nm.to_string(), pair);
        return;
    }

    if !cmp.eq(lhs, &rhs_fi) {
        d.diff.insert(nm.to_string(), pair);
        return;
    }

    if lhs.is_dir() {
        d.common_dirs.insert(nm.to_string(), pair);
    } else {
        d.common_files.insert(nm.to_string(), pair);
    }
}

fn rhs_one(d: &Difference, done: &DashSet<String>, obs: &dyn Observer, nm: &str, rhs: &Arc<Info>) {
    obs.visit_dst(rhs);

    if done.contains(nm) || d.funny.contains_key(nm) {
        return;
    }

    if rhs.is_dir() {
        d.right_dirs.insert(nm.to_string(), rhs.clone());
    } else {
        d.right_files.insert(nm.to_string(), rhs.clone());
    }
}
