//! Copy-up Engine (C6): promotes an object from a lower branch to a writable
//! branch, spec §4.5.

use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use log::debug;

use crate::branch::silly_rename_name;
use crate::directory::{stream_copy, FileKind, LowerFs};
use crate::error::{Result, UnionError};
use crate::fanout::FanoutNode;
use crate::name::opaque_marker_name;
use crate::superblock::Superblock;

/// One link in the ancestor chain above a copy-up target, root-first. Used by
/// [`create_parents`] to replicate missing directories onto the destination
/// branch before the target itself is copied.
pub struct ParentStep<L: LowerFs> {
    pub node: Arc<FanoutNode<L>>,
    pub name: OsString,
}

/// Ensures every ancestor in `chain` exists as a directory on branch `dst`,
/// creating missing ones with the same mode as their top counterpart (spec
/// §4.5 step 1). `chain` is root-first; the root's own directory on `dst` is
/// `sb.branches()[dst].root()` and is assumed to already exist. Returns the
/// handle for the immediate parent of the copy-up target on `dst`.
pub fn create_parents<L: LowerFs>(
    sb: &Superblock<L>,
    chain: &[ParentStep<L>],
    dst: usize,
) -> Result<L::Node> {
    let fs = sb.fs();
    let mut current = {
        let branches = sb.branches();
        let branch = branches
            .get(dst)
            .ok_or_else(|| UnionError::invariant("destination branch out of range"))?;
        branch.root().clone()
    };

    for step in chain {
        match fs.lookup(&current, &step.name)? {
            Some(existing) => current = existing,
            None => {
                let (_, src) = step
                    .node
                    .top()
                    .ok_or_else(|| UnionError::invariant("parent chain entry is negative"))?;
                let mode = fs.stat(&src)?.mode;
                current = fs.mkdir(&current, &step.name, mode)?;
            }
        }
    }
    Ok(current)
}

/// Copies `target`'s topmost object down onto branch `dst` under `name`
/// inside `parent_dst` (the already-materialized destination parent
/// directory, typically [`create_parents`]'s return value), then repoints
/// `target`'s fan-out node at the new copy (spec §4.5 steps 2-5).
///
/// A no-op if the topmost populated branch is already `dst` or higher
/// priority (spec property P3, copy-up idempotence).
pub fn copy_up<L: LowerFs>(
    sb: &Superblock<L>,
    parent_dst: &L::Node,
    name: &OsStr,
    target: &Arc<FanoutNode<L>>,
    dst: usize,
) -> Result<()> {
    let Some((src_branch, src)) = target.top() else {
        return Err(UnionError::invariant("copy-up of a negative node"));
    };
    if src_branch <= dst {
        return Ok(());
    }

    let fs = sb.fs();
    let st = fs.stat(&src)?;
    debug!("copy_up: {:?} branch {} -> {}", name, src_branch, dst);

    match st.kind {
        FileKind::RegularFile => {
            let dst_node = fs.create(parent_dst, name, st.mode)?;
            let src_file = fs.open(&src, false)?;
            let dst_file = fs.open(&dst_node, true)?;
            stream_copy(fs, &src_file, &dst_file, None)?;
            fs.fsync(&dst_file)?;
            target.repoint_single(dst, dst_node)?;
        }
        FileKind::Symlink => {
            let text = fs.readlink(&src)?;
            let dst_node = fs.symlink(parent_dst, name, &text)?;
            target.repoint_single(dst, dst_node)?;
        }
        FileKind::Directory => {
            let dst_node = fs.mkdir(parent_dst, name, st.mode)?;
            if target.opaque_at() != crate::fanout::NONE && target.opaque_at() as usize == src_branch
            {
                fs.create(&dst_node, opaque_marker_name(), 0o644)?;
            }
            target.widen_end(dst, dst_node)?;
        }
        FileKind::CharDevice | FileKind::BlockDevice | FileKind::Fifo | FileKind::Socket => {
            let dst_node = fs.mknod(parent_dst, name, st.mode, st.rdev)?;
            target.repoint_single(dst, dst_node)?;
        }
    }
    Ok(())
}

/// Silly-renames `src_name` under `src_dir` to a freshly generated
/// `.unionfs<ino-hex><counter-hex>` name, probing for a negative slot and
/// retrying on `EEXIST` (spec §4.5 "Silly-rename for open-deleted files").
/// Returns the generated name so the caller can copy up from it and unlink it
/// once the copy has landed.
pub fn silly_rename<L: LowerFs>(
    sb: &Superblock<L>,
    src_dir: &L::Node,
    src_name: &OsStr,
    src_ino: u64,
) -> Result<OsString> {
    let fs = sb.fs();
    loop {
        let candidate = silly_rename_name(src_ino, sb.silly_counter().next());
        if fs.lookup(src_dir, &candidate)?.is_some() {
            continue;
        }
        match fs.rename(src_dir, src_name, src_dir, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Removes the silly-renamed source once its copy-up has succeeded and the
/// open handle holds the only remaining reference.
pub fn finish_silly_rename<L: LowerFs>(
    sb: &Superblock<L>,
    src_dir: &L::Node,
    silly_name: &OsStr,
) -> Result<()> {
    sb.fs().unlink(src_dir, silly_name).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Perms;
    use crate::test_support::{root_node, superblock, LocalFs};
    use std::ffi::OsStr;

    #[test]
    fn copy_up_is_idempotent_when_already_top() {
        let top = tempfile::tempdir().unwrap();
        let bottom = tempfile::tempdir().unwrap();
        std::fs::write(top.path().join("x"), b"top").unwrap();

        let sb = superblock(&[
            (top.path().to_path_buf(), Perms::Rw),
            (bottom.path().to_path_buf(), Perms::Ro),
        ]);
        let root = root_node(&sb);
        let lower = vec![Some(top.path().join("x")), None];
        let node: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(2, 0, 0, None, lower).unwrap();
        let _ = &root;
        copy_up(&sb, top.path(), OsStr::new("x"), &node, 0).unwrap();
        assert_eq!(node.top().unwrap().0, 0);
    }

    #[test]
    fn copy_up_streams_regular_file_content() {
        let top = tempfile::tempdir().unwrap();
        let bottom = tempfile::tempdir().unwrap();
        std::fs::write(bottom.path().join("x"), b"hello from below").unwrap();

        let sb = superblock(&[
            (top.path().to_path_buf(), Perms::Rw),
            (bottom.path().to_path_buf(), Perms::Ro),
        ]);
        let lower = vec![None, Some(bottom.path().join("x"))];
        let node: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(2, 1, 1, None, lower).unwrap();

        copy_up(&sb, top.path(), OsStr::new("x"), &node, 0).unwrap();

        assert_eq!(node.start(), 0);
        assert_eq!(node.end(), 0);
        let content = std::fs::read(top.path().join("x")).unwrap();
        assert_eq!(content, b"hello from below");
        let still_there = std::fs::read(bottom.path().join("x")).unwrap();
        assert_eq!(still_there, b"hello from below");
    }

    #[test]
    fn silly_rename_then_finish_removes_source() {
        let top = tempfile::tempdir().unwrap();
        std::fs::write(top.path().join("deleted"), b"data").unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);

        let silly = silly_rename(&sb, &top.path().to_path_buf(), OsStr::new("deleted"), 42).unwrap();
        assert!(silly.to_string_lossy().starts_with(".unionfs"));
        assert!(!top.path().join("deleted").exists());
        assert!(top.path().join(&silly).exists());

        finish_silly_rename(&sb, &top.path().to_path_buf(), &silly).unwrap();
        assert!(!top.path().join(&silly).exists());
    }
}
