//! Cloning one filesystem entry.
//!
//! [`clone_entry`] reproduces a single source entry (file, directory,
//! symlink, device node or fifo) at a destination path, bytes and metadata
//! both. Metadata application order matters: later steps may lose the
//! privilege earlier ones require, so it is always xattr, then ownership,
//! then mode, then times.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use tracing::warn;

use crate::copy;
use crate::error::{Error, Result};
use crate::info::{FileType, Info};
use crate::safefile::{CreateFlags, SafeFile};
use crate::xattr;

fn clone_err(op: &'static str, src: &Path, dst: &Path, source: Error) -> Error {
    Error::Clone {
        op,
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source: Box::new(source),
    }
}

fn clone_io_err(op: &'static str, src: &Path, dst: &Path, source: io::Error) -> Error {
    clone_err(op, src, dst, Error::Io(source))
}

/// Clone `src` to `dst`: content (for regular files, through the tiered
/// copy engine and a [`SafeFile`]) plus xattr, ownership, mode and times.
///
/// Directories are created (parents included); symlinks are recreated with
/// the same target; device nodes and fifos are `mknod`'ed. An existing
/// destination symlink or node is replaced. Socket entries are not
/// clonable and produce an error.
pub fn clone_entry(dst: &Path, src: &Path) -> Result<()> {
    let fi = Info::lstat(src).map_err(|e| clone_err("stat-src", src, dst, e))?;

    match fi.file_type() {
        FileType::Regular => copy_regular(dst, src, &fi)?,
        FileType::Directory => make_dir(dst, &fi).map_err(|e| clone_io_err("mkdir", src, dst, e))?,
        FileType::Symlink => clone_link(dst, src)?,
        FileType::BlockDevice | FileType::CharDevice | FileType::Fifo => make_node(dst, &fi)?,
        other => {
            return Err(clone_io_err(
                "file-type",
                src,
                dst,
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported entry type {other:?}"),
                ),
            ))
        }
    }

    update_meta(dst, &fi)
}

/// Re-apply all metadata of `src` (stat'ed now) onto `dst`.
pub fn metadata(dst: &Path, src: &Path) -> Result<()> {
    let fi = Info::lstat(src).map_err(|e| clone_err("stat-src", src, dst, e))?;
    update_meta(dst, &fi)
}

/// Apply the metadata captured in `fi` onto `dst`: xattr, uid/gid, mode,
/// atime/mtime, in that order.
pub fn update_metadata(dst: &Path, fi: &Info) -> Result<()> {
    update_meta(dst, fi)
}

// directories get at least u+x so we can descend into them
fn make_dir(dst: &Path, fi: &Info) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(fi.perm() | 0o100)
        .create(dst)
}

fn copy_regular(dst: &Path, src: &Path, fi: &Info) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            make_dir(parent, fi).map_err(|e| clone_io_err("mkdir", src, dst, e))?;
        }
    }

    let s = File::open(src).map_err(|e| clone_io_err("open-src", src, dst, e))?;

    // perm bits are set by the metadata pass after the rename
    let mut d = SafeFile::create(
        dst,
        CreateFlags::COW | CreateFlags::OVERWRITE,
        libc::O_RDWR | libc::O_EXCL,
        0o600,
    )
    .map_err(|e| clone_err("safefile", src, dst, e))?;

    if let Err(e) = copy::copy_fd(d.file(), &s) {
        d.abort();
        return Err(clone_err("copyfile", src, dst, e));
    }
    d.close().map_err(|e| clone_err("close", src, dst, e))
}

fn clone_link(dst: &Path, src: &Path) -> Result<()> {
    let target = fs::read_link(src).map_err(|e| clone_io_err("readlink", src, dst, e))?;

    // symlink(2) refuses to replace; the contract here is "make dst equal"
    remove_existing(dst).map_err(|e| clone_io_err("rm", src, dst, e))?;

    std::os::unix::fs::symlink(&target, dst).map_err(|e| clone_io_err("symlink", src, dst, e))
}

fn make_node(dst: &Path, fi: &Info) -> Result<()> {
    use rustix::fs::{mknodat, FileType as RawType, Mode, CWD};

    let ft = match fi.file_type() {
        FileType::BlockDevice => RawType::BlockDevice,
        FileType::CharDevice => RawType::CharacterDevice,
        _ => RawType::Fifo,
    };

    remove_existing(dst).map_err(|e| clone_io_err("rm", fi.path(), dst, e))?;

    mknodat(CWD, dst, ft, Mode::from_bits_truncate(fi.perm()), fi.rdev)
        .map_err(|e| clone_io_err("mknod", fi.path(), dst, io::Error::from(e)))
}

/// Remove whatever currently sits at `path`. Missing entries are fine.
pub(crate) fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn update_meta(dst: &Path, fi: &Info) -> Result<()> {
    apply_xattr(dst, fi)?;
    apply_ugid(dst, fi)?;
    apply_mode(dst, fi)?;
    apply_times(dst, fi)
}

fn apply_xattr(dst: &Path, fi: &Info) -> Result<()> {
    let res = if fi.is_symlink() {
        xattr::lreplace_xattr(dst, &fi.xattr)
    } else {
        xattr::replace_xattr(dst, &fi.xattr)
    };
    match res {
        Ok(()) => Ok(()),
        // xattr-less filesystem: nothing was captured, nothing to write
        Err(e) if e.is_unsupported() && fi.xattr.is_empty() => {
            warn!(dst = %dst.display(), "xattr unsupported, skipped");
            Ok(())
        }
        Err(e) => Err(clone_err("replace-xattr", fi.path(), dst, e)),
    }
}

fn apply_ugid(dst: &Path, fi: &Info) -> Result<()> {
    use rustix::fs::{chownat, AtFlags, Gid, Uid, CWD};

    let uid = unsafe { Uid::from_raw(fi.uid) };
    let gid = unsafe { Gid::from_raw(fi.gid) };
    chownat(CWD, dst, Some(uid), Some(gid), AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|e| clone_io_err("lchown", fi.path(), dst, io::Error::from(e)))
}

fn apply_mode(dst: &Path, fi: &Info) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // a symlink's own mode is immutable on most platforms
    if fi.is_symlink() {
        return Ok(());
    }
    fs::set_permissions(dst, fs::Permissions::from_mode(fi.perm()))
        .map_err(|e| clone_io_err("chmod", fi.path(), dst, e))
}

fn apply_times(dst: &Path, fi: &Info) -> Result<()> {
    let atime = filetime::FileTime::from_system_time(fi.atime);
    let mtime = filetime::FileTime::from_system_time(fi.mtime);
    let res = if fi.is_symlink() {
        filetime::set_symlink_file_times(dst, atime, mtime)
    } else {
        filetime::set_file_times(dst, atime, mtime)
    };
    res.map_err(|e| clone_io_err("utimes", fi.path(), dst, e))
}
