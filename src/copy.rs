//! Platform-optimal regular file byte copy.
//!
//! Three tiers, best first:
//!
//! 1. **Reflink** (`FICLONE`): an atomic refcounted clone when source and
//!    destination are on the same CoW-capable filesystem. O(1) space.
//! 2. **`copy_file_range(2)`**: kernel-side copy in 256 KiB chunks, no
//!    userspace bounce. Zero-byte progress is treated as failure.
//! 3. **mmap**: map the source read-only and write it out, retrying short
//!    writes. The fallback for cross-filesystem copies and filesystems
//!    without either fast path.
//!
//! On success the destination holds an exact byte-for-byte copy of the
//! source as seen at open time, its position is left at 0, and its data is
//! fsync'ed. The engine never touches metadata; the cloner handles that
//! separately.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::safefile::{CreateFlags, SafeFile};

/// copy_file_range chunk size
const IO_CHUNK_SIZE: usize = 256 * 1024;

/// Copy the contents of `src` into `dst` using the best primitive the
/// platform and filesystems offer. Leaves `dst` positioned at 0 and
/// fsync'ed.
pub fn copy_fd(dst: &File, src: &File) -> Result<()> {
    sys_copy_fd(dst, src)?;

    (&*dst)
        .seek(SeekFrom::Start(0))
        .map_err(|e| copy_op("seek", e))?;
    dst.sync_all().map_err(|e| copy_op("sync", e))?;
    Ok(())
}

/// Copy `src` to a fresh `dst` with permissions `perm`, writing through a
/// [`SafeFile`] so the destination appears atomically. An existing regular
/// file at `dst` is replaced.
pub fn copy_file(dst: &Path, src: &Path, perm: u32) -> Result<()> {
    let wrap = |e: Error| Error::Copy {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source: Box::new(e),
    };

    let s = File::open(src).map_err(|e| Error::Path {
        op: "open-src",
        path: src.to_path_buf(),
        source: e,
    })?;

    let mut d = SafeFile::create(
        dst,
        CreateFlags::OVERWRITE,
        libc::O_RDWR | libc::O_EXCL,
        perm,
    )
    .map_err(wrap)?;

    if let Err(e) = copy_fd(d.file(), &s) {
        d.abort();
        return Err(wrap(e));
    }
    d.close().map_err(wrap)
}

fn copy_op(op: &'static str, source: io::Error) -> Error {
    Error::CopyOp { op, source }
}

#[cfg(target_os = "linux")]
fn sys_copy_fd(dst: &File, src: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // reflink first
    let r = unsafe { libc::ioctl(dst.as_raw_fd(), libc::FICLONE, src.as_raw_fd()) };
    if r == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if !matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP)
            | Some(libc::ENOSYS)
            | Some(libc::EXDEV)
            | Some(libc::EINVAL)
            | Some(libc::ENOTTY)
    ) {
        return Err(copy_op("reflink", err));
    }

    copy_ranges(dst, src)
}

#[cfg(not(target_os = "linux"))]
fn sys_copy_fd(dst: &File, src: &File) -> Result<()> {
    copy_mmap(dst, src)
}

/// Kernel range copy in bounded chunks. Falls through to the mmap tier if
/// the very first chunk reports the filesystem can't do it.
#[cfg(target_os = "linux")]
fn copy_ranges(dst: &File, src: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let len = src.metadata().map_err(|e| copy_op("range-copy", e))?.len();
    dst.set_len(len).map_err(|e| copy_op("range-copy", e))?;

    let mut roff: libc::off64_t = 0;
    let mut woff: libc::off64_t = 0;
    let mut left = len as i64;
    while left > 0 {
        let n = std::cmp::min(IO_CHUNK_SIZE as i64, left) as usize;
        let m = unsafe {
            libc::copy_file_range(src.as_raw_fd(), &mut roff, dst.as_raw_fd(), &mut woff, n, 0)
        };
        if m < 0 {
            let err = io::Error::last_os_error();
            if roff == 0
                && matches!(
                    err.raw_os_error(),
                    Some(libc::EXDEV)
                        | Some(libc::ENOSYS)
                        | Some(libc::EINVAL)
                        | Some(libc::EOPNOTSUPP)
                )
            {
                return copy_mmap(dst, src);
            }
            return Err(copy_op("range-copy", err));
        }
        if m == 0 {
            return Err(copy_op(
                "range-copy",
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("zero sized transfer at offset {roff}"),
                ),
            ));
        }
        left -= m as i64;
    }
    Ok(())
}

/// Map the source read-only and write the bytes out in full.
fn copy_mmap(dst: &File, src: &File) -> Result<()> {
    let len = src.metadata().map_err(|e| copy_op("mmap-read", e))?.len();
    dst.set_len(len).map_err(|e| copy_op("mmap-write", e))?;
    (&*dst)
        .seek(SeekFrom::Start(0))
        .map_err(|e| copy_op("seek", e))?;

    // mapping a zero-length file is an error; there is nothing to copy
    if len == 0 {
        return Ok(());
    }

    let map = unsafe { memmap2::Mmap::map(src) }.map_err(|e| copy_op("mmap-read", e))?;
    full_write(dst, &map)
}

fn full_write(dst: &File, mut buf: &[u8]) -> Result<()> {
    let mut f = dst;
    while !buf.is_empty() {
        match f.write(buf) {
            Ok(0) => {
                return Err(copy_op(
                    "mmap-write",
                    io::Error::new(io::ErrorKind::WriteZero, "zero sized write"),
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(copy_op("mmap-write", e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Read;
    use tempfile::tempdir;

    fn open_rw(p: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(p)
            .unwrap()
    }

    #[test]
    fn test_copy_fd_exact_bytes_and_position() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("s");
        let dp = dir.path().join("d");
        fs::write(&sp, "hello world").unwrap();

        let s = File::open(&sp).unwrap();
        let d = open_rw(&dp);
        copy_fd(&d, &s).unwrap();

        // position is back at 0: reading from the same handle sees it all
        let mut got = String::new();
        (&d).read_to_string(&mut got).unwrap();
        assert_eq!(got, "hello world");
    }

    #[test]
    fn test_copy_fd_empty_file() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("s");
        let dp = dir.path().join("d");
        fs::write(&sp, "").unwrap();

        let s = File::open(&sp).unwrap();
        let d = open_rw(&dp);
        copy_fd(&d, &s).unwrap();
        assert_eq!(fs::metadata(&dp).unwrap().len(), 0);
    }

    #[test]
    fn test_copy_fd_multi_chunk() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("s");
        let dp = dir.path().join("d");

        let mut data = Vec::with_capacity(IO_CHUNK_SIZE * 2 + 17);
        for i in 0..(IO_CHUNK_SIZE * 2 + 17) {
            data.push((i % 251) as u8);
        }
        fs::write(&sp, &data).unwrap();

        let s = File::open(&sp).unwrap();
        let d = open_rw(&dp);
        copy_fd(&d, &s).unwrap();
        assert_eq!(fs::read(&dp).unwrap(), data);
    }

    #[test]
    fn test_copy_fd_truncates_longer_destination() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("s");
        let dp = dir.path().join("d");
        fs::write(&sp, "short").unwrap();
        fs::write(&dp, "a much longer previous content").unwrap();

        let s = File::open(&sp).unwrap();
        let d = OpenOptions::new().read(true).write(true).open(&dp).unwrap();
        copy_fd(&d, &s).unwrap();
        assert_eq!(fs::read(&dp).unwrap(), b"short");
    }

    #[test]
    fn test_copy_file_replaces_existing() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("s");
        let dp = dir.path().join("d");
        fs::write(&sp, "new content").unwrap();
        fs::write(&dp, "old").unwrap();

        copy_file(&dp, &sp, 0o644).unwrap();
        assert_eq!(fs::read(&dp).unwrap(), b"new content");
    }

    #[test]
    fn test_copy_file_missing_source() {
        let dir = tempdir().unwrap();
        let sp = dir.path().join("nope");
        let dp = dir.path().join("d");

        let err = copy_file(&dp, &sp, 0o644).unwrap_err();
        assert!(err.is_not_found());
        assert!(!dp.exists());
    }
}
