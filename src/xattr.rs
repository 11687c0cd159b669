//! Extended attribute support.
//!
//! [`Xattr`] is the in-memory form of a file's extended attributes: a map
//! from attribute name to value. Every accessor comes in two flavors: the
//! plain one follows symlinks (it operates on the referent), the `l`-prefixed
//! one operates on the symlink itself.
//!
//! None of the multi-key operations ([`set_xattr`], [`replace_xattr`],
//! [`clear_xattr`]) are atomic across keys; a failure leaves the target with
//! a partial update.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::error::{Error, Result};

/// All the extended attributes of one filesystem entry.
///
/// Two `Xattr` values are equal iff they have the same key set and each key
/// maps to an identical value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Xattr(BTreeMap<String, String>);

impl Xattr {
    /// Create an empty attribute set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }
}

impl Deref for Xattr {
    type Target = BTreeMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Xattr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for Xattr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.0 {
            writeln!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Xattr {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Xattr {
    fn from(kv: [(&str, &str); N]) -> Self {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

fn path_err(op: &'static str, path: &Path, source: io::Error) -> Error {
    Error::Path {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Return all the extended attributes of `path`, following symlinks.
pub fn get_xattr(path: &Path) -> Result<Xattr> {
    fetch(path, true)
}

/// Return all the extended attributes of `path`. If `path` is a symlink
/// the attributes of the symlink itself are returned, not the target's.
pub fn lget_xattr(path: &Path) -> Result<Xattr> {
    fetch(path, false)
}

/// Write every attribute of `x` onto `path`, following symlinks.
/// Attributes already on `path` but absent from `x` are kept.
pub fn set_xattr(path: &Path, x: &Xattr) -> Result<()> {
    store(path, x, true)
}

/// Symlink-literal variant of [`set_xattr`].
pub fn lset_xattr(path: &Path, x: &Xattr) -> Result<()> {
    store(path, x, false)
}

/// Replace all extended attributes of `path` with `x`: existing keys are
/// removed first, then every key of `x` is written. Follows symlinks.
pub fn replace_xattr(path: &Path, x: &Xattr) -> Result<()> {
    clear(path, true)?;
    store(path, x, true)
}

/// Symlink-literal variant of [`replace_xattr`].
pub fn lreplace_xattr(path: &Path, x: &Xattr) -> Result<()> {
    clear(path, false)?;
    store(path, x, false)
}

/// Remove every extended attribute of `path`, following symlinks.
pub fn clear_xattr(path: &Path) -> Result<()> {
    clear(path, true)
}

/// Symlink-literal variant of [`clear_xattr`].
pub fn lclear_xattr(path: &Path) -> Result<()> {
    clear(path, false)
}

fn list_keys(path: &Path, follow: bool) -> Result<Vec<std::ffi::OsString>> {
    let it = if follow {
        xattr::list_deref(path)
    } else {
        xattr::list(path)
    }
    .map_err(|e| path_err("listxattr", path, e))?;
    Ok(it.collect())
}

fn fetch(path: &Path, follow: bool) -> Result<Xattr> {
    let mut x = Xattr::new();
    for key in list_keys(path, follow)? {
        let val = if follow {
            xattr::get_deref(path, &key)
        } else {
            xattr::get(path, &key)
        }
        .map_err(|e| path_err("getxattr", path, e))?;

        // a key listed a moment ago can vanish if someone else removes it
        let val = val.ok_or_else(|| {
            path_err(
                "getxattr",
                path,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("attribute {:?} disappeared", key),
                ),
            )
        })?;

        x.insert(
            key.to_string_lossy().into_owned(),
            String::from_utf8_lossy(&val).into_owned(),
        );
    }
    Ok(x)
}

fn store(path: &Path, x: &Xattr, follow: bool) -> Result<()> {
    for (k, v) in x.iter() {
        if follow {
            xattr::set_deref(path, k.as_str(), v.as_bytes())
        } else {
            xattr::set(path, k.as_str(), v.as_bytes())
        }
        .map_err(|e| path_err("setxattr", path, e))?;
    }
    Ok(())
}

fn clear(path: &Path, follow: bool) -> Result<()> {
    for key in list_keys(path, follow)? {
        if follow {
            xattr::remove_deref(path, &key)
        } else {
            xattr::remove(path, &key)
        }
        .map_err(|e| path_err("removexattr", path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_same_contents() {
        let a = Xattr::from([("user.k1", "v1"), ("user.k2", "")]);
        let b = Xattr::from([("user.k2", ""), ("user.k1", "v1")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_equal_differs_on_value() {
        let a = Xattr::from([("user.k1", "v1")]);
        let b = Xattr::from([("user.k1", "v2")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_equal_differs_on_key_set() {
        let a = Xattr::from([("user.k1", "v1")]);
        let b = Xattr::from([("user.k1", "v1"), ("user.k2", "x")]);
        assert_ne!(a, b);
        assert_ne!(b, a);
    }

    #[test]
    fn test_display() {
        let a = Xattr::from([("user.k", "v")]);
        assert_eq!(a.to_string(), "user.k=v\n");
    }

    // Exercising the real syscalls requires an xattr-capable filesystem;
    // tolerate Unsupported so the suite passes on tmpfs-backed runners.
    #[test]
    fn test_roundtrip_on_fs() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        std::fs::write(&f, "x").unwrap();

        let want = Xattr::from([("user.test.a", "1"), ("user.test.b", "")]);
        match set_xattr(&f, &want) {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => return,
            Err(e) => panic!("setxattr: {e}"),
        }

        let got = get_xattr(&f).unwrap();
        assert_eq!(got, want);

        clear_xattr(&f).unwrap();
        assert!(get_xattr(&f).unwrap().is_empty());
    }
}
