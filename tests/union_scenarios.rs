//! End-to-end scenarios exercising the fan-out state machine the way a real
//! mount would: build a branch stack, perform lookups/mutations through
//! `unionfs-core`'s public API with `test_support::LocalFs`, and assert on
//! what lands on the underlying directories. Mirrors spec §8's S1-S7 table.

use std::ffi::OsStr;

use tempfile::TempDir;

use unionfs_core::branch::Perms;
use unionfs_core::copyup::ParentStep;
use unionfs_core::openfile::OpenFile;
use unionfs_core::test_support::{root_node, superblock, LocalFs};
use unionfs_core::{lookup, ops, LowerFs};

fn two_branch(a: &TempDir, b: &TempDir) -> unionfs_core::Superblock<LocalFs> {
    superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), Perms::Rw),
    ])
}

#[test]
fn s1_read_from_lower_branch() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(b.path().join("hello"), b"world").unwrap();

    let sb = superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), Perms::Ro),
    ]);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("hello")).unwrap();
    assert_eq!(node.start(), 1);
    assert_eq!(node.end(), 1);

    let file = OpenFile::open(&sb, &node, false, false).unwrap();
    let mut buf = [0u8; 5];
    let n = file.read(&sb, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");
}

#[test]
fn s2_write_triggers_copy_up_and_leaves_lower_untouched() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(b.path().join("hello"), b"world").unwrap();

    let sb = superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), Perms::Ro),
    ]);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("hello")).unwrap();

    let mut file = OpenFile::open(&sb, &node, true, false).unwrap();
    let chain: Vec<ParentStep<LocalFs>> = vec![];
    file.revalidate_file(&sb, &chain, OsStr::new("hello"), &node, true)
        .unwrap();

    assert_eq!(node.start(), 0);
    assert_eq!(node.end(), 0);
    assert!(a.path().join("hello").exists());

    file.write(&sb, 0, b"WORLD").unwrap();

    let mut buf = [0u8; 5];
    let n = file.read(&sb, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"WORLD");

    let still_lower = std::fs::read(b.path().join("hello")).unwrap();
    assert_eq!(still_lower, b"world");
}

#[test]
fn s3_unlink_leaves_whiteout_when_lower_copy_remains() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(a.path().join("x"), b"top").unwrap();
    std::fs::write(b.path().join("x"), b"bottom").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let target = lookup::lookup(&sb, &root, OsStr::new("x")).unwrap();

    ops::unlink(&sb, &[], OsStr::new("x"), &target, false).unwrap();

    assert!(!a.path().join("x").exists());
    assert!(a.path().join(".wh.x").exists());
    assert!(b.path().join("x").exists());
    assert!(target.is_negative());

    let relookup = lookup::lookup(&sb, &root, OsStr::new("x")).unwrap();
    assert!(relookup.is_negative());
}

#[test]
fn s4_rmdir_nonempty_fails_without_state_change() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    std::fs::write(b.path().join("d/y"), b"").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let dir = lookup::lookup(&sb, &root, OsStr::new("d")).unwrap();

    let err = ops::rmdir(&sb, &[], OsStr::new("d"), &dir).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert!(b.path().join("d/y").exists());
    assert!(dir.is_positive());
}

#[test]
fn s5_unlink_then_rmdir_shadows_lower_directory() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    std::fs::write(b.path().join("d/y"), b"").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let dir = lookup::lookup(&sb, &root, OsStr::new("d")).unwrap();
    let chain_to_d = vec![ParentStep {
        node: dir.clone(),
        name: OsStr::new("d").to_os_string(),
    }];

    let y = lookup::lookup(&sb, &dir, OsStr::new("y")).unwrap();
    ops::unlink(&sb, &chain_to_d, OsStr::new("y"), &y, false).unwrap();
    assert!(a.path().join("d/.wh.y").exists());

    // `unlink` created branch 0's copy of `d` as a side effect of
    // `create_parents`, but `dir`'s own fan-out node predates that; a fresh
    // lookup (what the FUSE binding does between distinct syscalls) picks it
    // up the way a real second `rmdir` call would.
    let dir = lookup::lookup(&sb, &root, OsStr::new("d")).unwrap();
    ops::rmdir(&sb, &[], OsStr::new("d"), &dir).unwrap();
    assert!(!a.path().join("d/.wh.y").exists());
    assert!(!a.path().join("d").exists());
    assert!(a.path().join(".wh.d").exists());
    assert!(dir.is_negative());
}

#[test]
fn s6_readlink_on_lower_branch() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink("target", b.path().join("link")).unwrap();

    let sb = superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), Perms::Ro),
    ]);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("link")).unwrap();
    let (_, top) = node.top().unwrap();
    let text = sb.fs().readlink(&top).unwrap();
    assert_eq!(text, "target");
}

#[test]
fn s7_open_across_branch_table_growth_still_reads_old_bytes() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(b.path().join("hello"), b"world").unwrap();

    let sb = superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), Perms::Ro),
    ]);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("hello")).unwrap();
    let mut file = OpenFile::open(&sb, &node, false, false).unwrap();

    // A new top branch is mounted above `a`; the superblock generation
    // bumps, but `node` itself hasn't been told about the new layout yet.
    let c = tempfile::tempdir().unwrap();
    let mut roots = Vec::new();
    for (p, perms) in [
        (c.path(), Perms::Rw),
        (a.path(), Perms::Rw),
        (b.path(), Perms::Ro),
    ] {
        roots.push((p.to_path_buf(), p.to_path_buf(), perms));
    }
    let new_table = unionfs_core::branch::BranchTable::new(roots).unwrap();
    sb.reconfigure(new_table);

    // The handle predates the reshuffle, so the bytes it serves are still
    // the ones it opened against.
    let mut buf = [0u8; 5];
    let n = file.read(&sb, 0, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"world");

    let chain: Vec<ParentStep<LocalFs>> = vec![];
    file.revalidate_file(&sb, &chain, OsStr::new("hello"), &node, false)
        .unwrap();
    let mut buf2 = [0u8; 5];
    let n2 = file.read(&sb, 0, &mut buf2).unwrap();
    assert_eq!(&buf2[..n2], b"world");
}

#[test]
fn p7_reserved_names_rejected_on_every_entry_point() {
    let a = tempfile::tempdir().unwrap();
    let sb = superblock(&[(a.path().to_path_buf(), Perms::Rw)]);
    let root = root_node(&sb);

    assert!(lookup::lookup(&sb, &root, OsStr::new(".wh.x")).is_err());
    assert!(ops::create(&sb, &[], &root, OsStr::new(".wh.x"), 0o644).is_err());

    std::fs::write(a.path().join("real"), b"").unwrap();
    let real = lookup::lookup(&sb, &root, OsStr::new("real")).unwrap();
    assert!(ops::link(&sb, &[], OsStr::new("real"), &real, &[], &root, OsStr::new(".wh.y")).is_err());
    assert!(ops::rename(&sb, &[], OsStr::new("real"), &real, &[], &root, OsStr::new(".wh.y")).is_err());
}

#[test]
fn p1_shadowing_by_whiteout_on_intermediate_branch() {
    let a = tempfile::tempdir().unwrap();
    let mid = tempfile::tempdir().unwrap();
    let bottom = tempfile::tempdir().unwrap();
    std::fs::write(mid.path().join(".wh.x"), b"").unwrap();
    std::fs::write(bottom.path().join("x"), b"hidden").unwrap();

    let sb = superblock(&[
        (a.path().to_path_buf(), Perms::Rw),
        (mid.path().to_path_buf(), Perms::Rw),
        (bottom.path().to_path_buf(), Perms::Ro),
    ]);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("x")).unwrap();
    assert!(node.is_negative());
}

#[test]
fn p3_copy_up_is_idempotent() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(a.path().join("x"), b"top").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let node = lookup::lookup(&sb, &root, OsStr::new("x")).unwrap();
    assert_eq!(node.start(), 0);

    let parent_dst = unionfs_core::copyup::create_parents(&sb, &[], 0).unwrap();
    unionfs_core::copyup::copy_up(&sb, &parent_dst, OsStr::new("x"), &node, 0).unwrap();
    assert_eq!(node.start(), 0);
    assert_eq!(node.end(), 0);
    assert_eq!(std::fs::read(a.path().join("x")).unwrap(), b"top");
}

#[test]
fn p4_generation_is_nondecreasing_across_reconfigure() {
    let a = tempfile::tempdir().unwrap();
    let sb = superblock(&[(a.path().to_path_buf(), Perms::Rw)]);
    let g0 = sb.generation();
    let b = tempfile::tempdir().unwrap();
    let table = unionfs_core::branch::BranchTable::new(vec![
        (a.path().to_path_buf(), a.path().to_path_buf(), Perms::Rw),
        (b.path().to_path_buf(), b.path().to_path_buf(), Perms::Rw),
    ])
    .unwrap();
    let g1 = sb.reconfigure(table);
    assert!(g1 > g0);
    assert_eq!(sb.generation(), g1);
}

#[test]
fn p6_rmdir_accepts_all_whiteouts_across_branches() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::create_dir(b.path().join("d")).unwrap();
    std::fs::write(b.path().join("d/y"), b"").unwrap();
    std::fs::create_dir(a.path().join("d")).unwrap();
    std::fs::write(a.path().join("d/.wh.y"), b"").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let dir = lookup::lookup(&sb, &root, OsStr::new("d")).unwrap();
    ops::rmdir(&sb, &[], OsStr::new("d"), &dir).unwrap();
    assert!(!a.path().join("d").exists());
    assert!(dir.is_negative());
}

#[test]
fn create_reoccupies_whiteout_at_top_branch() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(a.path().join(".wh.x"), b"").unwrap();
    std::fs::write(b.path().join("x"), b"bottom").unwrap();

    let sb = two_branch(&a, &b);
    let root = root_node(&sb);
    let node = ops::create(&sb, &[], &root, OsStr::new("x"), 0o644).unwrap();
    assert_eq!(node.start(), 0);
    assert!(!a.path().join(".wh.x").exists());
    assert!(a.path().join("x").exists());
}
