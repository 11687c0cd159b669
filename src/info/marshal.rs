//! Portable binary encoding of [`Info`].
//!
//! Layout (big-endian, version-tagged):
//!
//! ```text
//! u32 length of everything that follows
//! u8  version (currently 1)
//! u64 ino; u64 size; u64 dev; u64 rdev
//! u32 mode; u32 uid; u32 gid; u32 nlink
//! u64 atime; u64 mtime; u64 ctime      (nanoseconds since Unix epoch)
//! u32 path length; path bytes
//! u32 xattr blob length; { u32 klen; u32 vlen; key; value }*
//! ```
//!
//! The same logical value marshals to byte-identical output on every
//! platform. Times before the epoch cannot be represented and encode as 0.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::xattr::Xattr;

use super::Info;

/// Options for [`Info::marshal`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MarshalFlag(u32);

impl MarshalFlag {
    /// No options.
    pub const NONE: MarshalFlag = MarshalFlag(0);

    /// Encode only the basename of the stored path.
    pub const JUNK_PATH: MarshalFlag = MarshalFlag(1 << 0);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: MarshalFlag) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MarshalFlag {
    type Output = MarshalFlag;

    fn bitor(self, rhs: MarshalFlag) -> MarshalFlag {
        MarshalFlag(self.0 | rhs.0)
    }
}

const MARSHAL_VERSION: u8 = 1;

// version + 4x u64 + 4x u32 + 3x u64 time
const FIXED_SIZE: usize = 1 + 4 * 8 + 4 * 4 + 3 * 8;

impl Info {
    /// The exact number of bytes [`Info::marshal_to`] will produce for
    /// this instance.
    pub fn marshal_size(&self, flag: MarshalFlag) -> usize {
        4 + FIXED_SIZE + 4 + self.encoded_path(flag).len() + self.xattr.marshal_size()
    }

    /// Marshal into `buf`, which must hold at least
    /// [`marshal_size`](Info::marshal_size) bytes. Returns the number of
    /// bytes written.
    pub fn marshal_to(&self, buf: &mut [u8], flag: MarshalFlag) -> Result<usize> {
        let sz = self.marshal_size(flag);
        if buf.len() < sz {
            return Err(Error::TooSmall {
                need: sz,
                have: buf.len(),
            });
        }

        let mut at = 0usize;
        put_u32(buf, &mut at, (sz - 4) as u32);
        buf[at] = MARSHAL_VERSION;
        at += 1;

        put_u64(buf, &mut at, self.ino);
        put_u64(buf, &mut at, self.size as u64);
        put_u64(buf, &mut at, self.dev);
        put_u64(buf, &mut at, self.rdev);

        put_u32(buf, &mut at, self.mode);
        put_u32(buf, &mut at, self.uid);
        put_u32(buf, &mut at, self.gid);
        put_u32(buf, &mut at, self.nlink);

        put_u64(buf, &mut at, encode_time(self.atime));
        put_u64(buf, &mut at, encode_time(self.mtime));
        put_u64(buf, &mut at, encode_time(self.ctime));

        put_bytes(buf, &mut at, &self.encoded_path(flag));

        at += self.xattr.marshal_to(&mut buf[at..])?;
        debug_assert_eq!(at, sz);
        Ok(sz)
    }

    /// Marshal into a freshly allocated, exactly sized buffer.
    pub fn marshal(&self, flag: MarshalFlag) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.marshal_size(flag)];
        self.marshal_to(&mut buf, flag)?;
        Ok(buf)
    }

    /// Rehydrate an `Info` from `buf`. Returns the instance and the number
    /// of bytes consumed.
    pub fn unmarshal(buf: &[u8]) -> Result<(Info, usize)> {
        let mut at = 0usize;
        let total = take_u32(buf, &mut at)? as usize;
        if buf.len() - at < total {
            return Err(Error::Truncated {
                need: total,
                have: buf.len() - at,
            });
        }
        if total < FIXED_SIZE {
            return Err(Error::Truncated {
                need: FIXED_SIZE,
                have: total,
            });
        }

        let ver = buf[at];
        at += 1;
        if ver != MARSHAL_VERSION {
            return Err(Error::UnsupportedVersion(ver));
        }

        let mut fi = Info {
            ino: take_u64(buf, &mut at)?,
            ..Info::default()
        };
        fi.size = take_u64(buf, &mut at)? as i64;
        fi.dev = take_u64(buf, &mut at)?;
        fi.rdev = take_u64(buf, &mut at)?;

        fi.mode = take_u32(buf, &mut at)?;
        fi.uid = take_u32(buf, &mut at)?;
        fi.gid = take_u32(buf, &mut at)?;
        fi.nlink = take_u32(buf, &mut at)?;

        fi.atime = decode_time(take_u64(buf, &mut at)?);
        fi.mtime = decode_time(take_u64(buf, &mut at)?);
        fi.ctime = decode_time(take_u64(buf, &mut at)?);

        fi.set_path(decode_path(take_bytes(buf, &mut at)?));

        let (x, n) = Xattr::unmarshal(&buf[at..])?;
        fi.xattr = x;
        at += n;

        Ok((fi, at))
    }

    fn encoded_path(&self, flag: MarshalFlag) -> Vec<u8> {
        let p: &Path = if flag.contains(MarshalFlag::JUNK_PATH) {
            Path::new(self.path.file_name().unwrap_or_default())
        } else {
            &self.path
        };
        encode_path(p)
    }
}

impl Xattr {
    /// The exact number of bytes [`Xattr::marshal_to`] will produce.
    pub fn marshal_size(&self) -> usize {
        let mut n = 4;
        for (k, v) in self.iter() {
            n += 8 + k.len() + v.len();
        }
        n
    }

    /// Marshal into `buf`; returns the number of bytes written.
    pub fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let sz = self.marshal_size();
        if buf.len() < sz {
            return Err(Error::TooSmall {
                need: sz,
                have: buf.len(),
            });
        }

        let mut at = 0usize;
        put_u32(buf, &mut at, (sz - 4) as u32);
        for (k, v) in self.iter() {
            put_u32(buf, &mut at, k.len() as u32);
            put_u32(buf, &mut at, v.len() as u32);
            buf[at..at + k.len()].copy_from_slice(k.as_bytes());
            at += k.len();
            buf[at..at + v.len()].copy_from_slice(v.as_bytes());
            at += v.len();
        }
        Ok(sz)
    }

    /// Rehydrate an `Xattr` from `buf`. Returns the map and the number of
    /// bytes consumed.
    pub fn unmarshal(buf: &[u8]) -> Result<(Xattr, usize)> {
        let mut at = 0usize;
        let blob = take_u32(buf, &mut at)? as usize;
        if buf.len() - at < blob {
            return Err(Error::Truncated {
                need: blob,
                have: buf.len() - at,
            });
        }

        let mut x = Xattr::new();
        let end = at + blob;
        while at < end {
            let klen = take_u32(buf, &mut at)? as usize;
            let vlen = take_u32(buf, &mut at)? as usize;
            if end - at < klen + vlen {
                return Err(Error::Truncated {
                    need: klen + vlen,
                    have: end - at,
                });
            }
            let k = String::from_utf8_lossy(&buf[at..at + klen]).into_owned();
            at += klen;
            let v = String::from_utf8_lossy(&buf[at..at + vlen]).into_owned();
            at += vlen;
            x.insert(k, v);
        }
        Ok((x, end))
    }
}

fn put_u32(buf: &mut [u8], at: &mut usize, v: u32) {
    buf[*at..*at + 4].copy_from_slice(&v.to_be_bytes());
    *at += 4;
}

fn put_u64(buf: &mut [u8], at: &mut usize, v: u64) {
    buf[*at..*at + 8].copy_from_slice(&v.to_be_bytes());
    *at += 8;
}

fn put_bytes(buf: &mut [u8], at: &mut usize, b: &[u8]) {
    put_u32(buf, at, b.len() as u32);
    buf[*at..*at + b.len()].copy_from_slice(b);
    *at += b.len();
}

fn take_u32(buf: &[u8], at: &mut usize) -> Result<u32> {
    if buf.len() - *at < 4 {
        return Err(Error::Truncated {
            need: 4,
            have: buf.len() - *at,
        });
    }
    let v = u32::from_be_bytes(buf[*at..*at + 4].try_into().expect("4 bytes"));
    *at += 4;
    Ok(v)
}

fn take_u64(buf: &[u8], at: &mut usize) -> Result<u64> {
    if buf.len() - *at < 8 {
        return Err(Error::Truncated {
            need: 8,
            have: buf.len() - *at,
        });
    }
    let v = u64::from_be_bytes(buf[*at..*at + 8].try_into().expect("8 bytes"));
    *at += 8;
    Ok(v)
}

fn take_bytes<'a>(buf: &'a [u8], at: &mut usize) -> Result<&'a [u8]> {
    let n = take_u32(buf, at)? as usize;
    if buf.len() - *at < n {
        return Err(Error::Truncated {
            need: n,
            have: buf.len() - *at,
        });
    }
    let b = &buf[*at..*at + n];
    *at += n;
    Ok(b)
}

// Times are a single u64 nanosecond count since the Unix epoch: reliable
// high precision for 584 years, no representation for anything earlier.
fn encode_time(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn decode_time(ns: u64) -> SystemTime {
    UNIX_EPOCH + Duration::new(ns / 1_000_000_000, (ns % 1_000_000_000) as u32)
}

#[cfg(unix)]
fn encode_path(p: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    p.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn decode_path(b: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Info {
        let mut fi = Info {
            ino: 42,
            size: 1000,
            dev: 7,
            rdev: 0,
            mode: libc::S_IFREG | 0o640,
            uid: 1000,
            gid: 1000,
            nlink: 1,
            atime: UNIX_EPOCH + Duration::new(1_704_067_200, 0),
            mtime: UNIX_EPOCH + Duration::new(1_704_067_200, 123_456_789),
            ctime: UNIX_EPOCH + Duration::new(1_704_067_201, 1),
            ..Info::default()
        };
        fi.set_path("a/b/c");
        fi.xattr = Xattr::from([("user.k1", "v1"), ("user.k2", "")]);
        fi
    }

    #[test]
    fn test_roundtrip_all_fields() {
        let fi = sample();
        let buf = fi.marshal(MarshalFlag::NONE).unwrap();
        assert_eq!(buf.len(), fi.marshal_size(MarshalFlag::NONE));

        let (got, consumed) = Info::unmarshal(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(got, fi);
    }

    #[test]
    fn test_junk_path_keeps_basename() {
        let fi = sample();
        let buf = fi.marshal(MarshalFlag::JUNK_PATH).unwrap();
        assert_eq!(buf.len(), fi.marshal_size(MarshalFlag::JUNK_PATH));

        let (got, _) = Info::unmarshal(&buf).unwrap();
        assert_eq!(got.path(), Path::new("c"));
        assert_eq!(got.ino, fi.ino);
        assert_eq!(got.xattr, fi.xattr);
    }

    #[test]
    fn test_marshal_buffer_too_small() {
        let fi = sample();
        let mut buf = vec![0u8; 8];
        match fi.marshal_to(&mut buf, MarshalFlag::NONE) {
            Err(Error::TooSmall { .. }) => {}
            other => panic!("expected TooSmall, got {other:?}"),
        }
    }

    #[test]
    fn test_unmarshal_truncated() {
        let fi = sample();
        let buf = fi.marshal(MarshalFlag::NONE).unwrap();
        match Info::unmarshal(&buf[..buf.len() - 3]) {
            Err(Error::Truncated { .. }) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn test_unmarshal_bad_version() {
        let fi = sample();
        let mut buf = fi.marshal(MarshalFlag::NONE).unwrap();
        buf[4] = 99;
        match Info::unmarshal(&buf) {
            Err(Error::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_xattr_roundtrip() {
        let mut fi = sample();
        fi.xattr = Xattr::new();
        let buf = fi.marshal(MarshalFlag::NONE).unwrap();
        let (got, n) = Info::unmarshal(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert!(got.xattr.is_empty());
    }
}
