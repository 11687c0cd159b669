//! End-to-end mirroring scenarios against real directory trees.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsmirror::clone::{self, CloneOptions};
use fsmirror::cmp::{self, CmpOptions};
use fsmirror::walk::{walk_func, Type, WalkOptions};
use fsmirror::{CloneBuilder, Error, Info, MarshalFlag};

use tempfile::tempdir;

fn mirror(dst: &Path, src: &Path) {
    clone::tree(dst, src, &CloneOptions::default()).unwrap();
}

fn assert_converged(src: &Path, dst: &Path) {
    let d = cmp::fs_tree(src, dst, &CmpOptions::default()).unwrap();
    assert!(d.is_identical(), "trees still differ:\n{d}");
}

fn build_fixture(root: &Path) {
    fs::create_dir_all(root.join("docs/deep/deeper")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("readme"), "top level").unwrap();
    fs::write(root.join("docs/a"), "alpha").unwrap();
    fs::write(root.join("docs/deep/b"), "beta").unwrap();
    fs::write(root.join("docs/deep/deeper/c"), "gamma").unwrap();
    std::os::unix::fs::symlink("../a", root.join("docs/deep/rel-link")).unwrap();
    fs::hard_link(root.join("docs/a"), root.join("docs/a-link")).unwrap();
}

#[test]
fn mirror_fresh_then_converged() {
    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir(&src).unwrap();
    build_fixture(&src);

    mirror(&dst, &src);
    assert_converged(&src, &dst);

    // hardlink group reproduced in bijection
    let a = fs::metadata(dst.join("docs/a")).unwrap();
    let al = fs::metadata(dst.join("docs/a-link")).unwrap();
    assert_eq!(a.ino(), al.ino());
    assert_eq!(a.nlink(), 2);

    // symlink target string preserved verbatim
    assert_eq!(
        fs::read_link(dst.join("docs/deep/rel-link")).unwrap(),
        PathBuf::from("../a")
    );
}

#[test]
fn mirror_converges_after_source_mutation() {
    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir(&src).unwrap();
    build_fixture(&src);
    mirror(&dst, &src);

    // mutate the source: change, add, remove, restructure
    fs::write(src.join("docs/a"), "alpha v2, longer than before").unwrap();
    fs::write(src.join("new-file"), "brand new").unwrap();
    fs::remove_file(src.join("readme")).unwrap();
    fs::create_dir_all(src.join("fresh/sub")).unwrap();
    fs::write(src.join("fresh/sub/x"), "x").unwrap();
    fs::remove_dir_all(src.join("docs/deep/deeper")).unwrap();

    mirror(&dst, &src);
    assert_converged(&src, &dst);

    assert_eq!(
        fs::read(dst.join("docs/a")).unwrap(),
        b"alpha v2, longer than before"
    );
    assert!(!dst.join("readme").exists());
    assert!(!dst.join("docs/deep/deeper").exists());
    assert_eq!(fs::read(dst.join("fresh/sub/x")).unwrap(), b"x");
}

#[test]
fn mirror_is_idempotent() {
    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir(&src).unwrap();
    build_fixture(&src);

    mirror(&dst, &src);
    let stats = CloneBuilder::new(&src, &dst).run().unwrap();

    assert_eq!(stats.dirs_created, 0);
    assert_eq!(stats.entries_copied, 0);
    assert_eq!(stats.entries_deleted, 0);
    assert_eq!(stats.links_created, 0);
}

#[test]
fn mirror_refuses_funny_tree_without_mutation() {
    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir(&src).unwrap();
    fs::create_dir(&dst).unwrap();
    fs::write(src.join("clash"), "file here").unwrap();
    fs::create_dir(dst.join("clash")).unwrap();
    fs::write(dst.join("clash/inner"), "keep me").unwrap();
    fs::write(src.join("other"), "never copied").unwrap();

    match clone::tree(&dst, &src, &CloneOptions::default()) {
        Err(Error::Funny(v)) => assert_eq!(v[0].name, "clash"),
        other => panic!("expected funny refusal, got {other:?}"),
    }

    // nothing was touched
    assert_eq!(fs::read(dst.join("clash/inner")).unwrap(), b"keep me");
    assert!(!dst.join("other").exists());
}

#[test]
fn mirror_skips_excluded_names_on_both_sides() {
    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir_all(src.join(".zfs/snapshot")).unwrap();
    fs::write(src.join(".zfs/snapshot/f"), "x").unwrap();
    fs::write(src.join("real"), "y").unwrap();
    fs::create_dir_all(dst.join(".zfs")).unwrap();
    fs::write(dst.join(".zfs/g"), "z").unwrap();

    // default options exclude .zfs
    mirror(&dst, &src);

    assert!(dst.join("real").exists());
    assert!(!dst.join(".zfs/snapshot").exists());
    // the destination's excluded subtree is invisible, not deleted
    assert_eq!(fs::read(dst.join(".zfs/g")).unwrap(), b"z");
}

#[test]
fn walked_entries_roundtrip_through_the_codec() {
    let t = tempdir().unwrap();
    let root = t.path().join("root");
    fs::create_dir(&root).unwrap();
    build_fixture(&root);

    let opts = WalkOptions::default().with_types(Type::ALL);
    walk_func(vec![root.clone()], opts, |fi| {
        let buf = fi.marshal(MarshalFlag::NONE)?;
        assert_eq!(buf.len(), fi.marshal_size(MarshalFlag::NONE));
        let (back, used) = Info::unmarshal(&buf)?;
        assert_eq!(used, buf.len());
        assert_eq!(back, *fi);
        Ok(())
    })
    .unwrap();
}

#[test]
fn observer_difference_event_fires_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct DiffSeen(AtomicUsize);
    impl fsmirror::Observer for DiffSeen {
        fn difference(&self, _d: &cmp::Difference) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let t = tempdir().unwrap();
    let src = t.path().join("src");
    let dst = t.path().join("dst");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("f"), "x").unwrap();

    let obs = Arc::new(DiffSeen::default());
    let opt = CloneOptions::default().with_observer(obs.clone());
    clone::tree(&dst, &src, &opt).unwrap();

    assert_eq!(obs.0.load(Ordering::Relaxed), 1);
}
