//! Mutation Operations (C7): create/link/unlink/rmdir/rename/mkdir/symlink/
//! mknod/setattr/permission, composed from C3-C6, spec §4.6.
//!
//! Every creation-style operation retries leftward across writable branches
//! when a branch refuses the operation (spec §4.5 "Copy-up error sentinel",
//! §9 "Copy-up as a function, not a state"): [`UnionError::CopyUp`] is used
//! internally to drive the loop and is converted to a lower `EROFS` before
//! any function here returns, so it never reaches a caller.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::io;
use std::sync::Arc;

use log::warn;

use crate::branch::BranchTable;
use crate::copyup::{copy_up, create_parents, silly_rename, ParentStep};
use crate::directory::{AccessMask, FileKind, LowerFs, SetAttr};
use crate::error::{Result, UnionError};
use crate::fanout::{FanoutNode, NONE};
use crate::name::{is_reserved, name_behind_whiteout, opaque_marker_name, whiteout_name_for};
use crate::superblock::Superblock;

fn exhausted() -> UnionError {
    UnionError::Lower(io::Error::from_raw_os_error(libc::EROFS))
}

fn is_rofs(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EROFS)
}

fn leftmost_rw_at_or_above<N>(branches: &BranchTable<N>, from: usize) -> Option<usize> {
    (0..=from).rev().find(|&b| branches.get(b).map(|br| br.is_rw()).unwrap_or(false))
}

fn single_node<L: LowerFs>(
    branch_count: usize,
    branch: usize,
    node: L::Node,
) -> Result<Arc<FanoutNode<L>>> {
    let mut lower: Vec<Option<L::Node>> = vec![None; branch_count];
    lower[branch] = Some(node);
    FanoutNode::positive(branch_count, branch, branch, None, lower)
}

/// create(name) (spec §4.6): tries branches from `parent.start()` down to 0,
/// skipping RO branches. A pre-existing whiteout is reused in place (truncate
/// then rename) so the replacement is a single atomic step on the lower.
pub fn create<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    mode: u32,
) -> Result<Arc<FanoutNode<L>>> {
    if is_reserved(name) {
        return Err(UnionError::NameViolation);
    }
    let from = if parent.start() == NONE {
        0
    } else {
        parent.start() as usize
    };
    let fs = sb.fs();
    let wh = whiteout_name_for(name);

    for b in (0..=from).rev() {
        let is_rw = sb.branches().get(b).map(|br| br.is_rw()).unwrap_or(false);
        if !is_rw {
            continue;
        }
        let parent_dst = create_parents(sb, parent_chain, b)?;

        let result: io::Result<L::Node> = match fs.lookup(&parent_dst, &wh) {
            Ok(Some(wh_node)) => fs
                .truncate(&wh_node, 0)
                .and_then(|_| fs.rename(&parent_dst, &wh, &parent_dst, name))
                .and_then(|_| fs.lookup(&parent_dst, name))
                .and_then(|renamed| {
                    let renamed = renamed.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::NotFound, "renamed whiteout vanished")
                    })?;
                    fs.notify_change(
                        &renamed,
                        &SetAttr {
                            mode: Some(mode),
                            ..Default::default()
                        },
                    )?;
                    Ok(renamed)
                }),
            Ok(None) => fs.create(&parent_dst, name, mode),
            Err(e) => Err(e),
        };

        match result {
            Ok(node) => return single_node(sb.branches().len(), b, node),
            Err(e) if is_rofs(&e) => {
                warn!("create: branch {} refused {:?}, retrying leftward", b, name);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(exhausted())
}

fn create_like<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    attempt: impl Fn(&L, &L::Node) -> io::Result<L::Node>,
) -> Result<Arc<FanoutNode<L>>> {
    if is_reserved(name) {
        return Err(UnionError::NameViolation);
    }
    let from = if parent.start() == NONE {
        0
    } else {
        parent.start() as usize
    };
    let fs = sb.fs();
    let wh = whiteout_name_for(name);

    for b in (0..=from).rev() {
        let is_rw = sb.branches().get(b).map(|br| br.is_rw()).unwrap_or(false);
        if !is_rw {
            continue;
        }
        let parent_dst = create_parents(sb, parent_chain, b)?;
        if let Some(wh_node) = fs.lookup(&parent_dst, &wh)? {
            let _ = wh_node;
            fs.unlink(&parent_dst, &wh)?;
        }
        match attempt(fs, &parent_dst) {
            Ok(node) => return single_node(sb.branches().len(), b, node),
            Err(e) if is_rofs(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(exhausted())
}

pub fn mkdir<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    mode: u32,
) -> Result<Arc<FanoutNode<L>>> {
    create_like(sb, parent_chain, parent, name, |fs, dir| {
        fs.mkdir(dir, name, mode)
    })
}

pub fn symlink<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    target: &OsStr,
) -> Result<Arc<FanoutNode<L>>> {
    create_like(sb, parent_chain, parent, name, |fs, dir| {
        fs.symlink(dir, name, target)
    })
}

pub fn mknod<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    mode: u32,
    rdev: u32,
) -> Result<Arc<FanoutNode<L>>> {
    create_like(sb, parent_chain, parent, name, |fs, dir| {
        fs.mknod(dir, name, mode, rdev)
    })
}

/// unlink(name) (spec §4.6): physically removes the top-branch copy when one
/// exists, and leaves (or adds) a whiteout whenever a lower copy remains or
/// no writable copy existed to remove. Leaves `target` negative — unless
/// `has_open_handles` is set and a top-branch copy was physically present,
/// in which case the silly-rename path (spec §4.5 "Silly-rename for
/// open-deleted files") runs instead: the top copy is renamed aside rather
/// than removed, and `target` stays positive at `b`, pointing at the hidden
/// name, so a handle already holding this node can still find a copy-up
/// source until it closes.
pub fn unlink<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    name: &OsStr,
    target: &Arc<FanoutNode<L>>,
    has_open_handles: bool,
) -> Result<()> {
    if is_reserved(name) {
        return Err(UnionError::NameViolation);
    }
    let b = sb
        .branches()
        .leftmost_rw()
        .ok_or_else(|| UnionError::invariant("no writable branch"))?;
    let parent_dst = create_parents(sb, parent_chain, b)?;
    let fs = sb.fs();

    let physically_present = target.lower_at(b).is_some();
    let lower_remains = target.end() > b as i32;
    let mut sillied = false;
    if physically_present {
        if has_open_handles {
            let top = target.lower_at(b).expect("checked above");
            let ino = fs.stat(&top)?.ino;
            let silly_name = silly_rename(sb, &parent_dst, name, ino)?;
            let silly_node = fs
                .lookup(&parent_dst, &silly_name)?
                .ok_or_else(|| UnionError::invariant("silly-renamed node vanished"))?;
            target.repoint_single(b, silly_node)?;
            sillied = true;
        } else {
            fs.unlink(&parent_dst, name)?;
        }
    }
    if lower_remains || !physically_present {
        let wh = whiteout_name_for(name);
        if fs.lookup(&parent_dst, &wh)?.is_none() {
            fs.create(&parent_dst, &wh, 0o644)?;
        }
    }
    if sillied {
        return Ok(());
    }
    let branch_count = sb.branches().len();
    target.reset(NONE, NONE, NONE, vec![None; branch_count])
}

/// rmdir(name) (spec §4.6, property P6): the directory must be logically
/// empty — every name visible in any populated branch at or above
/// `opaque_at` must itself be a whiteout, or be shadowed by one at a higher
/// branch.
pub fn rmdir<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    name: &OsStr,
    dir: &Arc<FanoutNode<L>>,
) -> Result<()> {
    if is_reserved(name) {
        return Err(UnionError::NameViolation);
    }
    let fs = sb.fs();
    let populated = dir.populated();

    let mut whiteouted: HashSet<OsString> = HashSet::new();
    for (_, node) in &populated {
        for entry in fs.readdir(node)? {
            if entry.name.as_os_str() == opaque_marker_name() {
                continue;
            }
            if let Some(behind) = name_behind_whiteout(&entry.name) {
                whiteouted.insert(behind.to_os_string());
            } else if !whiteouted.contains(&entry.name) {
                return Err(UnionError::Lower(io::Error::from_raw_os_error(
                    libc::ENOTEMPTY,
                )));
            }
        }
    }

    for (_, node) in &populated {
        for entry in fs.readdir(node)? {
            if entry.name.as_os_str() == opaque_marker_name() || name_behind_whiteout(&entry.name).is_some()
            {
                fs.unlink(node, &entry.name)?;
            }
        }
    }

    let (top_branch, _) = dir.top().ok_or_else(|| UnionError::invariant("rmdir of a negative node"))?;
    let parent_dst = create_parents(sb, parent_chain, top_branch)?;
    fs.rmdir(&parent_dst, name)?;

    if dir.end() > top_branch as i32 {
        let wh = whiteout_name_for(name);
        if fs.lookup(&parent_dst, &wh)?.is_none() {
            fs.create(&parent_dst, &wh, 0o644)?;
        }
    }

    let branch_count = sb.branches().len();
    dir.reset(NONE, NONE, NONE, vec![None; branch_count])
}

/// link(dst_name) (spec §4.6): copies the source up to the destination's
/// writable branch first when the two differ, then asks the lower to link
/// against the (now same-branch) source.
pub fn link<L: LowerFs>(
    sb: &Superblock<L>,
    src_chain: &[ParentStep<L>],
    src_name: &OsStr,
    src: &Arc<FanoutNode<L>>,
    dst_chain: &[ParentStep<L>],
    dst_parent: &Arc<FanoutNode<L>>,
    dst_name: &OsStr,
) -> Result<Arc<FanoutNode<L>>> {
    if is_reserved(dst_name) {
        return Err(UnionError::NameViolation);
    }
    let (src_branch, _) = src.top().ok_or_else(|| UnionError::invariant("link of a negative source"))?;
    let dst_from = if dst_parent.start() == NONE {
        0
    } else {
        dst_parent.start() as usize
    };
    let dst_branch = leftmost_rw_at_or_above(&sb.branches(), dst_from)
        .ok_or_else(|| UnionError::invariant("no writable branch"))?;

    if src_branch != dst_branch {
        let src_parent_dst = create_parents(sb, src_chain, dst_branch)?;
        copy_up(sb, &src_parent_dst, src_name, src, dst_branch)?;
    }
    let target_on_branch = src
        .lower_at(dst_branch)
        .ok_or_else(|| UnionError::invariant("copy-up did not populate destination branch"))?;

    let dst_parent_dst = create_parents(sb, dst_chain, dst_branch)?;
    let fs = sb.fs();
    let wh = whiteout_name_for(dst_name);
    if fs.lookup(&dst_parent_dst, &wh)?.is_some() {
        fs.unlink(&dst_parent_dst, &wh)?;
    }
    let new_node = fs.link(&dst_parent_dst, dst_name, &target_on_branch)?;
    single_node(sb.branches().len(), dst_branch, new_node)
}

/// rename(src, dst) (spec §4.6): a plain lower rename when both names already
/// live on the same branch; otherwise copy-up-then-remove-original. Crossing
/// branches with a directory target is refused with `EXDEV`, mirroring the
/// real restriction overlay filesystems place on cross-branch directory
/// moves rather than attempting a partial, non-atomic tree copy.
pub fn rename<L: LowerFs>(
    sb: &Superblock<L>,
    src_chain: &[ParentStep<L>],
    src_name: &OsStr,
    src: &Arc<FanoutNode<L>>,
    dst_chain: &[ParentStep<L>],
    dst_parent: &Arc<FanoutNode<L>>,
    dst_name: &OsStr,
) -> Result<()> {
    if is_reserved(src_name) || is_reserved(dst_name) {
        return Err(UnionError::NameViolation);
    }
    let (src_branch, _) = src.top().ok_or_else(|| UnionError::invariant("rename of a negative source"))?;
    let dst_from = if dst_parent.start() == NONE {
        0
    } else {
        dst_parent.start() as usize
    };
    let dst_branch = leftmost_rw_at_or_above(&sb.branches(), dst_from)
        .ok_or_else(|| UnionError::invariant("no writable branch"))?;
    let fs = sb.fs();

    if src_branch == dst_branch {
        let src_parent_dst = create_parents(sb, src_chain, dst_branch)?;
        let dst_parent_dst = create_parents(sb, dst_chain, dst_branch)?;
        let wh = whiteout_name_for(dst_name);
        if fs.lookup(&dst_parent_dst, &wh)?.is_some() {
            fs.unlink(&dst_parent_dst, &wh)?;
        }
        fs.rename(&src_parent_dst, src_name, &dst_parent_dst, dst_name)?;
        let node = fs
            .lookup(&dst_parent_dst, dst_name)?
            .ok_or_else(|| UnionError::invariant("renamed object vanished"))?;
        let mut lower: Vec<Option<L::Node>> = vec![None; sb.branches().len()];
        for (b, n) in src.populated() {
            lower[b] = Some(n);
        }
        lower[dst_branch] = Some(node);
        return src.reset(src.start(), src.end(), src.opaque_at(), lower);
    }

    if src.is_dir_fanout() || fs.stat(&src.top().unwrap().1)?.kind == FileKind::Directory {
        return Err(UnionError::Lower(io::Error::from_raw_os_error(libc::EXDEV)));
    }

    let old_populated = src.populated();
    let dst_parent_dst = create_parents(sb, dst_chain, dst_branch)?;
    let wh = whiteout_name_for(dst_name);
    if fs.lookup(&dst_parent_dst, &wh)?.is_some() {
        fs.unlink(&dst_parent_dst, &wh)?;
    }
    copy_up(sb, &dst_parent_dst, dst_name, src, dst_branch)?;

    if let Some(&(ob, _)) = old_populated.first() {
        let src_parent_dst = create_parents(sb, src_chain, ob)?;
        let is_rw = sb.branches().get(ob).map(|br| br.is_rw()).unwrap_or(false);
        if is_rw {
            fs.unlink(&src_parent_dst, src_name)?;
        }
        if old_populated.len() > 1 || !is_rw {
            let src_wh = whiteout_name_for(src_name);
            if fs.lookup(&src_parent_dst, &src_wh)?.is_none() {
                fs.create(&src_parent_dst, &src_wh, 0o644)?;
            }
        }
    }
    Ok(())
}

/// setattr (spec §4.6): copies up when the current top is read-only, then
/// applies the attribute change to the (now writable) top branch only.
pub fn setattr<L: LowerFs>(
    sb: &Superblock<L>,
    parent_chain: &[ParentStep<L>],
    name: &OsStr,
    node: &Arc<FanoutNode<L>>,
    attr: &SetAttr,
) -> Result<crate::directory::NodeStat> {
    let (top_branch, _) = node.top().ok_or_else(|| UnionError::invariant("setattr on a negative node"))?;
    let is_rw = sb.branches().get(top_branch).map(|b| b.is_rw()).unwrap_or(false);
    let dst_branch = if is_rw {
        top_branch
    } else {
        sb.branches()
            .leftmost_rw()
            .ok_or_else(|| UnionError::invariant("no writable branch"))?
    };
    if dst_branch != top_branch {
        let parent_dst = create_parents(sb, parent_chain, dst_branch)?;
        copy_up(sb, &parent_dst, name, node, dst_branch)?;
    }
    let (_, target_node) = node
        .top()
        .ok_or_else(|| UnionError::invariant("setattr target vanished after copy-up"))?;
    sb.fs().notify_change(&target_node, attr)?;
    sb.fs().stat(&target_node).map_err(Into::into)
}

/// permission (spec §4.6): every populated branch must grant the requested
/// access; write checks against a read-only branch other than branch 0 are
/// skipped (so the caller can copy-up instead of failing outright), but
/// branch 0 denying a write surfaces `EROFS` directly since there is nowhere
/// left to copy up to. `immutable` models the visible inode's own immutable
/// bit, which blocks writes regardless of what the lowers would allow.
pub fn permission<L: LowerFs>(
    sb: &Superblock<L>,
    node: &Arc<FanoutNode<L>>,
    mask: AccessMask,
    immutable: bool,
) -> Result<()> {
    let wants_write = mask.0 & AccessMask::WRITE.0 != 0;
    if immutable && wants_write {
        return Err(UnionError::Lower(io::Error::from_raw_os_error(libc::EPERM)));
    }
    let fs = sb.fs();
    for (b, lower) in node.populated() {
        if wants_write {
            let is_rw = sb.branches().get(b).map(|br| br.is_rw()).unwrap_or(false);
            if !is_rw {
                if b == 0 {
                    return Err(UnionError::Lower(io::Error::from_raw_os_error(libc::EROFS)));
                }
                continue;
            }
        }
        fs.permission(&lower, mask)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::Perms;
    use crate::fanout::FanoutNode;
    use crate::name::whiteout_name_for;
    use crate::test_support::{root_node, superblock, LocalFs};
    use std::ffi::OsStr;

    fn chain(root: &Arc<FanoutNode<LocalFs>>, name: &str) -> Vec<ParentStep<LocalFs>> {
        vec![ParentStep {
            node: root.clone(),
            name: OsString::from(name),
        }]
    }

    #[test]
    fn create_lands_on_branch_zero() {
        let top = tempfile::tempdir().unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);
        let root = root_node(&sb);
        let node = create(&sb, &[], &root, OsStr::new("new"), 0o644).unwrap();
        assert_eq!(node.start(), 0);
        assert!(top.path().join("new").exists());
    }

    #[test]
    fn create_reuses_whiteout() {
        let top = tempfile::tempdir().unwrap();
        let wh = whiteout_name_for(OsStr::new("new"));
        std::fs::write(top.path().join(&wh), b"").unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);
        let root = root_node(&sb);
        create(&sb, &[], &root, OsStr::new("new"), 0o600).unwrap();
        assert!(!top.path().join(&wh).exists());
        assert!(top.path().join("new").exists());
    }

    #[test]
    fn unlink_creates_whiteout_when_lower_remains() {
        let top = tempfile::tempdir().unwrap();
        let bottom = tempfile::tempdir().unwrap();
        std::fs::write(top.path().join("x"), b"top").unwrap();
        std::fs::write(bottom.path().join("x"), b"bottom").unwrap();
        let sb = superblock(&[
            (top.path().to_path_buf(), Perms::Rw),
            (bottom.path().to_path_buf(), Perms::Rw),
        ]);
        let lower = vec![
            Some(top.path().join("x")),
            Some(bottom.path().join("x")),
        ];
        let target: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(2, 0, 1, None, lower).unwrap();
        unlink(&sb, &[], OsStr::new("x"), &target, false).unwrap();
        assert!(!top.path().join("x").exists());
        assert!(top.path().join(".wh.x").exists());
        assert!(bottom.path().join("x").exists());
        assert!(target.is_negative());
    }

    #[test]
    fn unlink_silly_renames_when_open_handles_remain() {
        let top = tempfile::tempdir().unwrap();
        std::fs::write(top.path().join("x"), b"data").unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);
        let lower = vec![Some(top.path().join("x"))];
        let target: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(1, 0, 0, None, lower).unwrap();

        unlink(&sb, &[], OsStr::new("x"), &target, true).unwrap();

        assert!(!top.path().join("x").exists());
        assert!(top.path().join(".wh.x").exists());
        assert!(target.is_positive());
        let (branch, node) = target.top().unwrap();
        assert_eq!(branch, 0);
        assert!(node.to_string_lossy().contains(".unionfs"));
        assert_eq!(std::fs::read(&node).unwrap(), b"data");
    }

    #[test]
    fn rmdir_rejects_nonempty() {
        let top = tempfile::tempdir().unwrap();
        std::fs::create_dir(top.path().join("d")).unwrap();
        std::fs::write(top.path().join("d/y"), b"").unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);
        let root = root_node(&sb);
        let _ = &root;
        let lower = vec![Some(top.path().join("d"))];
        let dir: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(1, 0, 0, None, lower).unwrap();
        let err = rmdir(&sb, &[], OsStr::new("d"), &dir).unwrap_err();
        assert!(matches!(err, UnionError::Lower(e) if e.raw_os_error() == Some(libc::ENOTEMPTY)));
    }

    #[test]
    fn rmdir_accepts_all_whiteouts() {
        let top = tempfile::tempdir().unwrap();
        std::fs::create_dir(top.path().join("d")).unwrap();
        std::fs::write(top.path().join("d").join(".wh.y"), b"").unwrap();
        let sb = superblock(&[(top.path().to_path_buf(), Perms::Rw)]);
        let lower = vec![Some(top.path().join("d"))];
        let dir: Arc<FanoutNode<LocalFs>> = FanoutNode::positive(1, 0, 0, None, lower).unwrap();
        let c = chain(&root_node(&sb), "d");
        rmdir(&sb, &c, OsStr::new("d"), &dir).unwrap();
        assert!(!top.path().join("d").exists());
        assert!(dir.is_negative());
    }
}
