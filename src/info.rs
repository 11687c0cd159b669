//! Normalized filesystem metadata.
//!
//! [`Info`] captures one filesystem entry: identity (`dev`, `rdev`, `ino`),
//! size, the full `st_mode` bitfield, ownership, link count, nanosecond
//! timestamps and extended attributes. It is produced by [`Info::stat`],
//! [`Info::lstat`] and [`Info::fstat`], by the walker, or by unmarshaling
//! the portable binary encoding (see [`MarshalFlag`](crate::MarshalFlag)).
//! Consumers treat it as immutable.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::xattr::{self, Xattr};

pub(crate) mod marshal;

/// The type of a filesystem entry, decoded from the `S_IFMT` nibble of
/// its mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Block device node
    BlockDevice,
    /// Character device node
    CharDevice,
    /// Named pipe
    Fifo,
    /// Unix domain socket
    Socket,
    /// Anything else (should not occur on supported platforms)
    Unknown,
}

/// Metadata of one file system entry in a normalized form.
///
/// Field semantics follow `stat(2)`; `size` is meaningful for regular
/// files, `rdev` for device nodes. `(dev, rdev, ino)` identifies a
/// hardlink group on one filesystem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Info {
    /// Inode number
    pub ino: u64,
    /// Content size in bytes
    pub size: i64,
    /// Device id of the containing filesystem
    pub dev: u64,
    /// Device number of the entry itself (device nodes)
    pub rdev: u64,

    /// Full `st_mode`: permission bits, suid/sgid/sticky and the type nibble
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Hardlink count
    pub nlink: u32,

    /// Last access time
    pub atime: SystemTime,
    /// Last modification time
    pub mtime: SystemTime,
    /// Last status change time
    pub ctime: SystemTime,

    pub(crate) path: PathBuf,

    /// Extended attributes
    pub xattr: Xattr,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            dev: 0,
            rdev: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            path: PathBuf::new(),
            xattr: Xattr::new(),
        }
    }
}

impl Info {
    /// Like `stat(2)` but also collects extended attributes.
    /// Follows symlinks.
    pub fn stat(path: &Path) -> Result<Info> {
        let md = fs::metadata(path).map_err(|e| stat_err("stat", path, e))?;
        let x = tolerant_xattr(xattr::get_xattr(path))?;
        Ok(Self::from_metadata(path, &md, x))
    }

    /// Like `lstat(2)` but also collects extended attributes. A symlink
    /// yields the metadata and attributes of the link itself.
    pub fn lstat(path: &Path) -> Result<Info> {
        let md = fs::symlink_metadata(path).map_err(|e| stat_err("lstat", path, e))?;
        let x = tolerant_xattr(xattr::lget_xattr(path))?;
        Ok(Self::from_metadata(path, &md, x))
    }

    /// Like `fstat(2)`. The resulting `Info` carries an empty path and no
    /// extended attributes (an open descriptor has no name to query them
    /// through).
    pub fn fstat(fd: &File) -> Result<Info> {
        let md = fd.metadata().map_err(Error::Io)?;
        Ok(Self::from_metadata(Path::new(""), &md, Xattr::new()))
    }

    /// Build an `Info` from already-fetched metadata.
    pub fn from_metadata(path: &Path, md: &fs::Metadata, x: Xattr) -> Info {
        use std::os::unix::fs::MetadataExt;

        Info {
            ino: md.ino(),
            size: md.size() as i64,
            dev: md.dev(),
            rdev: md.rdev(),
            mode: md.mode(),
            uid: md.uid(),
            gid: md.gid(),
            nlink: md.nlink() as u32,
            atime: unix_time(md.atime(), md.atime_nsec()),
            mtime: unix_time(md.mtime(), md.mtime_nsec()),
            ctime: unix_time(md.ctime(), md.ctime_nsec()),
            path: path.to_path_buf(),
            xattr: x,
        }
    }

    /// The path this entry was stat'ed through. Depending on the producer
    /// it may be relative to a traversal root, absolute, or a basename.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored path.
    pub fn set_path<P: Into<PathBuf>>(&mut self, p: P) {
        self.path = p.into();
    }

    /// Basename of the stored path.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Entry type from the mode's type nibble.
    pub fn file_type(&self) -> FileType {
        const S_IFMT: u32 = libc::S_IFMT as u32;
        const S_IFREG: u32 = libc::S_IFREG as u32;
        const S_IFDIR: u32 = libc::S_IFDIR as u32;
        const S_IFLNK: u32 = libc::S_IFLNK as u32;
        const S_IFBLK: u32 = libc::S_IFBLK as u32;
        const S_IFCHR: u32 = libc::S_IFCHR as u32;
        const S_IFIFO: u32 = libc::S_IFIFO as u32;
        const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

        match self.mode & S_IFMT {
            S_IFREG => FileType::Regular,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            S_IFBLK => FileType::BlockDevice,
            S_IFCHR => FileType::CharDevice,
            S_IFIFO => FileType::Fifo,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// True for regular files.
    pub fn is_regular(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    /// True for symbolic links.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// Permission bits plus suid/sgid/sticky (everything below the type
    /// nibble).
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    /// True if `self` and `other` live on the same filesystem.
    pub fn same_fs(&self, other: &Info) -> bool {
        self.dev == other.dev && self.rdev == other.rdev
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self
            .mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        write!(
            f,
            "{}: {} {}; mtime {}ns; {:o}",
            self.path.display(),
            self.size,
            self.nlink,
            ns,
            self.mode
        )
    }
}

fn stat_err(op: &'static str, path: &Path, source: io::Error) -> Error {
    Error::Path {
        op,
        path: path.to_path_buf(),
        source,
    }
}

// A filesystem without xattr support still stats cleanly: treat
// "unsupported" as an empty attribute set so traversal keeps working.
// Everything else propagates.
fn tolerant_xattr(r: Result<Xattr>) -> Result<Xattr> {
    match r {
        Ok(x) => Ok(x),
        Err(e) if e.is_unsupported() => Ok(Xattr::new()),
        Err(e) => Err(e),
    }
}

fn unix_time(secs: i64, nsec: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0) + Duration::new(0, nsec as u32)
    }
}
