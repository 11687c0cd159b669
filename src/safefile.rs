//! Atomic file creation with unwinding on error.
//!
//! [`SafeFile`] writes through a scratch file next to the target
//! (`<target>.tmp.<pid>.<hex32>`) and atomically renames it over the target
//! on a clean [`close`](SafeFile::close). The recommended usage is:
//!
//! ```no_run
//! use fsmirror::{CreateFlags, SafeFile};
//! use std::path::Path;
//!
//! let mut sf = SafeFile::create(
//!     Path::new("out.bin"),
//!     CreateFlags::OVERWRITE,
//!     libc::O_RDWR,
//!     0o644,
//! )?;
//! sf.write(b"payload")?;
//! sf.close()?;
//! # Ok::<(), fsmirror::Error>(())
//! ```
//!
//! The first call to [`close`](SafeFile::close) or [`abort`](SafeFile::abort)
//! seals the outcome; later calls return the committed result. Dropping a
//! still-open `SafeFile` aborts it. The target is never observable in a
//! partially written state: if the process dies before the rename, the
//! target is untouched and only the scratch file remains.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::copy;
use crate::error::{Error, Result};

/// Options for [`SafeFile::create`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateFlags(u32);

impl CreateFlags {
    /// No options.
    pub const NONE: CreateFlags = CreateFlags(0);

    /// Allow replacing an existing regular file.
    pub const OVERWRITE: CreateFlags = CreateFlags(1 << 0);

    /// Prefill the scratch file with the target's current contents
    /// (update-in-place semantics). Forces the scratch open mode to
    /// read-write.
    pub const COW: CreateFlags = CreateFlags(1 << 1);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: CreateFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CreateFlags {
    type Output = CreateFlags;

    fn bitor(self, rhs: CreateFlags) -> CreateFlags {
        CreateFlags(self.0 | rhs.0)
    }
}

const ST_OPEN: i32 = 0;
const ST_CLOSED: i32 = 1;
const ST_ABORTED: i32 = -1;

/// A write handle whose effects only become visible atomically on `close`.
///
/// Not meant to be shared across threads: one producer per handle.
#[derive(Debug)]
pub struct SafeFile {
    file: Option<File>,
    target: PathBuf,
    scratch: PathBuf,
    state: AtomicI32,
    // first write error, reported on every later call
    sticky: Option<(io::ErrorKind, String)>,
}

impl SafeFile {
    /// Open a scratch file for `target`.
    ///
    /// Fails if `target` exists and [`CreateFlags::OVERWRITE`] is not set,
    /// or if it exists and is not a regular file. `open_flags` are `libc`
    /// `O_*` flags; `O_CREAT | O_TRUNC` are always added and a pure
    /// read-only open mode is upgraded to read-write. `mode` is made
    /// owner-writable if it is not already.
    pub fn create(target: &Path, opts: CreateFlags, open_flags: i32, mode: u32) -> Result<SafeFile> {
        if let Ok(md) = fs::metadata(target) {
            if !opts.contains(CreateFlags::OVERWRITE) {
                return Err(Error::WontOverwrite(target.to_path_buf()));
            }
            if !md.is_file() {
                return Err(Error::NotRegular(target.to_path_buf()));
            }
        }

        let mut flags = open_flags;
        if opts.contains(CreateFlags::COW) {
            flags = (flags & !libc::O_WRONLY) | libc::O_RDWR;
        }
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            flags |= libc::O_RDWR;
        }

        let mode = if mode & 0o200 == 0 { mode | 0o200 } else { mode };

        // keep the old file around; Abort() must not destroy it
        let scratch = PathBuf::from(format!(
            "{}.tmp.{}.{:x}",
            target.display(),
            std::process::id(),
            rand::random::<u32>()
        ));

        let fd = open_scratch(&scratch, flags, mode)
            .map_err(|e| path_err("open-scratch", &scratch, e))?;

        if opts.contains(CreateFlags::COW) {
            match File::open(target) {
                Ok(old) => {
                    if let Err(e) = copy::copy_fd(&fd, &old) {
                        let _ = fs::remove_file(&scratch);
                        return Err(Error::Copy {
                            src: target.to_path_buf(),
                            dst: scratch,
                            source: Box::new(e),
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    let _ = fs::remove_file(&scratch);
                    return Err(path_err("open-cow", target, e));
                }
            }
        }

        Ok(SafeFile {
            file: Some(fd),
            target: target.to_path_buf(),
            scratch,
            state: AtomicI32::new(ST_OPEN),
            sticky: None,
        })
    }

    /// The final pathname this file will commit to.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The scratch pathname being written through.
    pub fn scratch_path(&self) -> &Path {
        &self.scratch
    }

    /// The underlying open scratch file.
    ///
    /// Panics if the handle has already been closed or aborted.
    pub fn file(&self) -> &File {
        self.file.as_ref().expect("safefile: not open")
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ST_OPEN
    }

    fn set_sticky(&mut self, e: &io::Error) {
        if self.sticky.is_none() {
            self.sticky = Some((e.kind(), e.to_string()));
        }
    }

    fn sticky_err(&self) -> Option<Error> {
        self.sticky.as_ref().map(|(kind, msg)| Error::Path {
            op: "write",
            path: self.scratch.clone(),
            source: io::Error::new(*kind, msg.clone()),
        })
    }

    /// Write all of `buf` at the current position. Short writes are retried
    /// to completion; the first error becomes sticky and is returned by
    /// every subsequent call.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        if !self.is_open() {
            return Err(Error::NotOpen(self.target.clone()));
        }

        let mut f = self.file.as_ref().expect("open state implies file");
        let mut rest = buf;
        let mut wrote = 0usize;
        while !rest.is_empty() {
            match f.write(rest) {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "zero sized write");
                    self.set_sticky(&e);
                    return Err(self.sticky_err().expect("just set"));
                }
                Ok(n) => {
                    wrote += n;
                    rest = &rest[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.set_sticky(&e);
                    return Err(self.sticky_err().expect("just set"));
                }
            }
        }
        Ok(wrote)
    }

    /// Write all of `buf` at absolute offset `off`, without moving the
    /// current position. Same sticky-error contract as
    /// [`write`](SafeFile::write).
    pub fn write_at(&mut self, off: u64, buf: &[u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;

        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        if !self.is_open() {
            return Err(Error::NotOpen(self.target.clone()));
        }

        let f = self.file.as_ref().expect("open state implies file");
        let mut at = off;
        let mut rest = buf;
        let mut wrote = 0usize;
        while !rest.is_empty() {
            match f.write_at(rest, at) {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "zero sized write");
                    self.set_sticky(&e);
                    return Err(self.sticky_err().expect("just set"));
                }
                Ok(n) => {
                    wrote += n;
                    at += n as u64;
                    rest = &rest[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.set_sticky(&e);
                    return Err(self.sticky_err().expect("just set"));
                }
            }
        }
        Ok(wrote)
    }

    /// Flush data to disk, close the scratch file and atomically rename it
    /// over the target. Any failure (or an earlier sticky write error)
    /// aborts instead, leaving the target untouched.
    pub fn close(&mut self) -> Result<()> {
        if let Some(e) = self.sticky_err() {
            self.abort();
            return Err(e);
        }

        match self.state.load(Ordering::SeqCst) {
            ST_ABORTED => return Err(Error::Aborted(self.target.clone())),
            ST_CLOSED => return Ok(()),
            _ => {}
        }

        let f = self.file.take().expect("open state implies file");
        if let Err(e) = f.sync_all() {
            drop(f);
            self.abort_scratch();
            return Err(path_err("sync", &self.scratch, e));
        }
        drop(f);

        if let Err(e) = fs::rename(&self.scratch, &self.target) {
            self.abort_scratch();
            return Err(path_err("rename", &self.target, e));
        }

        self.state.store(ST_CLOSED, Ordering::SeqCst);
        Ok(())
    }

    /// Remove the scratch file and mark the handle aborted. Safe to call
    /// any number of times and after `close`; the first call to either
    /// takes precedence.
    pub fn abort(&mut self) {
        if !self.is_open() {
            return;
        }
        self.file.take();
        self.abort_scratch();
    }

    fn abort_scratch(&mut self) {
        let _ = fs::remove_file(&self.scratch);
        self.state.store(ST_ABORTED, Ordering::SeqCst);
    }
}

impl Write for SafeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SafeFile::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SafeFile {
    fn drop(&mut self) {
        if self.is_open() {
            self.abort();
        }
    }
}

fn open_scratch(path: &Path, flags: i32, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut oo = OpenOptions::new();
    oo.write(true).create(true).truncate(true).mode(mode);
    if flags & libc::O_ACCMODE == libc::O_RDWR {
        oo.read(true);
    }
    // pass through everything std does not model (O_EXCL, O_SYNC, ...)
    let extra = (flags & !libc::O_ACCMODE) & !(libc::O_CREAT | libc::O_TRUNC);
    if extra != 0 {
        oo.custom_flags(extra);
    }
    oo.open(path)
}

fn path_err(op: &'static str, path: &Path, source: io::Error) -> Error {
    Error::Path {
        op,
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tmp_leftovers(dir: &Path, base: &str) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&format!("{base}.tmp.")))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[test]
    fn test_close_commits() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"NEW").unwrap();
        sf.close().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"NEW");
        assert!(tmp_leftovers(dir.path(), "f").is_empty());
    }

    #[test]
    fn test_abort_preserves_old_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, "OLD").unwrap();

        let mut sf =
            SafeFile::create(&target, CreateFlags::OVERWRITE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"NEW").unwrap();
        sf.abort();

        assert_eq!(fs::read(&target).unwrap(), b"OLD");
        assert!(tmp_leftovers(dir.path(), "f").is_empty());
    }

    #[test]
    fn test_abort_without_prior_target_leaves_nothing() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"NEW").unwrap();
        sf.abort();

        assert!(!target.exists());
        assert!(tmp_leftovers(dir.path(), "f").is_empty());
    }

    #[test]
    fn test_refuses_overwrite_without_flag() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, "OLD").unwrap();

        match SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644) {
            Err(Error::WontOverwrite(p)) => assert_eq!(p, target),
            other => panic!("expected WontOverwrite, got {other:?}"),
        }
    }

    #[test]
    fn test_refuses_non_regular_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("d");
        fs::create_dir(&target).unwrap();

        match SafeFile::create(&target, CreateFlags::OVERWRITE, libc::O_RDWR, 0o644) {
            Err(Error::NotRegular(p)) => assert_eq!(p, target),
            other => panic!("expected NotRegular, got {other:?}"),
        }
    }

    #[test]
    fn test_cow_prefills_from_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, "PREVIOUS").unwrap();

        let mut sf = SafeFile::create(
            &target,
            CreateFlags::COW | CreateFlags::OVERWRITE,
            libc::O_RDWR,
            0o644,
        )
        .unwrap();
        // position is at 0 after the prefill: overwrite the first 3 bytes
        sf.write(b"NEW").unwrap();
        sf.close().unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"NEWVIOUS");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"X").unwrap();
        sf.close().unwrap();

        match sf.write(b"Y") {
            Err(Error::NotOpen(_)) => {}
            other => panic!("expected NotOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_close_after_abort_reports_aborted() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.abort();
        sf.abort(); // idempotent

        match sf.close() {
            Err(Error::Aborted(_)) => {}
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert!(!target.exists());
    }

    #[test]
    fn test_double_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"X").unwrap();
        sf.close().unwrap();
        sf.close().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"X");
    }

    #[test]
    fn test_write_at() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");

        let mut sf =
            SafeFile::create(&target, CreateFlags::NONE, libc::O_RDWR, 0o644).unwrap();
        sf.write(b"aaaa").unwrap();
        sf.write_at(1, b"bb").unwrap();
        sf.close().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"abba");
    }

    #[test]
    fn test_drop_aborts_open_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("f");
        fs::write(&target, "OLD").unwrap();

        {
            let mut sf =
                SafeFile::create(&target, CreateFlags::OVERWRITE, libc::O_RDWR, 0o644).unwrap();
            sf.write(b"NEW").unwrap();
        }

        assert_eq!(fs::read(&target).unwrap(), b"OLD");
        assert!(tmp_leftovers(dir.path(), "f").is_empty());
    }
}
