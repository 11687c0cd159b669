//! Error types for fsmirror.
//!
//! This module provides the [`Error`] enum containing all possible errors
//! that can occur during traversal, comparison and cloning, and the
//! [`Result`] type alias.
//!
//! # Error Categories
//!
//! | Category | Errors |
//! |----------|--------|
//! | Path | [`Error::Path`], [`Error::NotADirectory`] |
//! | Copy | [`Error::CopyOp`], [`Error::Copy`] |
//! | Clone | [`Error::Clone`], [`Error::Funny`] |
//! | Codec | [`Error::TooSmall`], [`Error::Truncated`], [`Error::UnsupportedVersion`] |
//! | SafeFile | [`Error::WontOverwrite`], [`Error::NotRegular`], [`Error::NotOpen`], [`Error::Aborted`] |
//! | Pool | [`Error::Panic`], [`Error::Aggregate`] |

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::info::Info;

/// Result type for fsmirror operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A pair of same-named entries whose types disagree (e.g. a regular file
/// on one side and a directory on the other). The cloner refuses to touch
/// a tree containing any of these.
#[derive(Debug, Clone)]
pub struct FunnyEntry {
    /// Path relative to the compared roots
    pub name: String,
    /// The source side entry
    pub src: Arc<Info>,
    /// The destination side entry
    pub dst: Arc<Info>,
}

/// Errors that can occur during fsmirror operations.
///
/// All errors carry the operation name and the path(s) involved so that a
/// single aggregated failure report remains actionable.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// IO error with no more specific context
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A path-level operation (stat, readdir, open, rename, ...) failed
    #[error("{op} {path}: {source}")]
    Path {
        /// Operation that failed
        op: &'static str,
        /// Path it failed on
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The given path exists but is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// One tier of the byte-copy engine failed
    #[error("copy: {op}: {source}")]
    CopyOp {
        /// Engine tier (`reflink`, `range-copy`, `mmap-read`, `mmap-write`, `seek`, `sync`)
        op: &'static str,
        /// Underlying error
        source: io::Error,
    },

    /// A byte copy between two named files failed
    #[error("copy '{src}' -> '{dst}': {source}")]
    Copy {
        /// Source path
        src: PathBuf,
        /// Destination path
        dst: PathBuf,
        /// Underlying error
        source: Box<Error>,
    },

    /// A cloner pipeline operation failed
    #[error("clone: {op} '{src}' -> '{dst}': {source}")]
    Clone {
        /// Pipeline phase (mkdir, safefile, copyfile, readlink, mknod, lchown, ...)
        op: &'static str,
        /// Source path
        src: PathBuf,
        /// Destination path
        dst: PathBuf,
        /// Underlying error
        source: Box<Error>,
    },

    /// Source and destination trees disagree on the type of one or more
    /// entries; nothing was modified.
    #[error("funny entries:\n{}", format_funny(.0))]
    Funny(Vec<FunnyEntry>),

    /// Marshal buffer is too small
    #[error("marshal: buffer too small (need {need}, have {have})")]
    TooSmall {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Unmarshal input ended prematurely
    #[error("unmarshal: truncated buffer (need {need}, have {have})")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    /// Unmarshal input carries an encoding version we don't understand
    #[error("unmarshal: unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Refusing to overwrite an existing file without `OVERWRITE`
    #[error("safefile: won't overwrite existing {0}")]
    WontOverwrite(PathBuf),

    /// The target of a safe write exists and is not a regular file
    #[error("safefile: {0} is not a regular file")]
    NotRegular(PathBuf),

    /// Write attempted on a closed or aborted [`SafeFile`](crate::SafeFile)
    #[error("safefile: {0} is not open")]
    NotOpen(PathBuf),

    /// `close` called on an aborted [`SafeFile`](crate::SafeFile)
    #[error("safefile: {0}: aborted; file not committed")]
    Aborted(PathBuf),

    /// A pool worker panicked while processing an item
    #[error("worker panic: {0}")]
    Panic(String),

    /// Several independent failures joined into one report
    #[error("{} errors:\n{}", .0.len(), format_multi(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Join a list of errors into a single one. A single-element list is
    /// returned as-is, anything longer becomes [`Error::Aggregate`].
    pub(crate) fn aggregate(mut errs: Vec<Error>) -> Error {
        if errs.len() == 1 {
            errs.pop().expect("len checked")
        } else {
            Error::Aggregate(errs)
        }
    }

    /// True if this error (or the error it wraps) is a NotFound IO error.
    /// Used to tolerate races against a live source tree.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Error::Path { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Error::CopyOp { source, .. } => source.kind() == io::ErrorKind::NotFound,
            Error::Copy { source, .. } => source.is_not_found(),
            Error::Clone { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True if this error (or the error it wraps) reports an unsupported
    /// operation (xattr on a filesystem without xattr support, typically).
    pub fn is_unsupported(&self) -> bool {
        fn unsupported(e: &io::Error) -> bool {
            e.kind() == io::ErrorKind::Unsupported
                || e.raw_os_error() == Some(libc::EOPNOTSUPP)
                || e.raw_os_error() == Some(libc::ENOSYS)
        }
        match self {
            Error::Io(e) => unsupported(e),
            Error::Path { source, .. } => unsupported(source),
            Error::CopyOp { source, .. } => unsupported(source),
            Error::Copy { source, .. } => source.is_unsupported(),
            Error::Clone { source, .. } => source.is_unsupported(),
            _ => false,
        }
    }
}

fn format_funny(entries: &[FunnyEntry]) -> String {
    let mut s = String::new();
    for f in entries {
        s.push_str(&format!("\t{}:\n\t\t{}\n\t\t{}\n", f.name, f.src, f.dst));
    }
    s
}

fn format_multi(errs: &[Error]) -> String {
    let mut s = String::new();
    for e in errs {
        s.push_str(&format!("\t{e}\n"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_single_unwraps() {
        let e = Error::aggregate(vec![Error::NotADirectory(PathBuf::from("/x"))]);
        assert!(matches!(e, Error::NotADirectory(_)));
    }

    #[test]
    fn test_aggregate_many() {
        let e = Error::aggregate(vec![
            Error::NotADirectory(PathBuf::from("/x")),
            Error::WontOverwrite(PathBuf::from("/y")),
        ]);
        match e {
            Error::Aggregate(v) => assert_eq!(v.len(), 2),
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_not_found_through_wrapping() {
        let inner = Error::Path {
            op: "lstat",
            path: PathBuf::from("/gone"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        let wrapped = Error::Clone {
            op: "stat-src",
            src: PathBuf::from("/gone"),
            dst: PathBuf::from("/dst"),
            source: Box::new(inner),
        };
        assert!(wrapped.is_not_found());
    }
}
