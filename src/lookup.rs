//! Lookup Engine (C4): builds a fan-out node for one name under an already
//! revalidated parent, spec §4.3.

use std::ffi::OsStr;
use std::sync::Arc;

use crate::directory::{FileKind, LowerFs};
use crate::error::{Result, UnionError};
use crate::fanout::{FanoutNode, NONE};
use crate::name;
use crate::superblock::Superblock;

/// Looks up `name` under `parent`, which must already be revalidated.
/// Implements the per-branch scan from spec §4.3 steps 1-6.
pub fn lookup<L: LowerFs>(
    sb: &Superblock<L>,
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
) -> Result<Arc<FanoutNode<L>>> {
    if name::is_reserved(name) {
        return Err(UnionError::NameViolation);
    }

    let branches = sb.branches();
    let branch_count = branches.len();
    let p_start = parent.start();
    if p_start == NONE {
        return Ok(FanoutNode::negative(branch_count, None));
    }
    let p_end = parent.end();
    let p_opaque = parent.opaque_at();
    let scan_end = if p_opaque != NONE {
        std::cmp::min(p_end, p_opaque)
    } else {
        p_end
    };

    let fs = sb.fs();
    let wh_name = name::whiteout_name_for(name);
    let opaque_marker = name::opaque_marker_name();

    let mut lower: Vec<Option<L::Node>> = vec![None; branch_count];
    let mut start: i32 = NONE;
    let mut end: i32 = NONE;
    let mut opaque_at: i32 = NONE;
    let mut first_negative: Option<usize> = None;

    for b in (p_start as usize)..=(scan_end as usize) {
        let Some(pdir) = parent.lower_at(b) else {
            continue; // step 1: no directory on this branch, skip
        };

        // step 2: a whiteout on this branch shadows everything below it.
        if let Some(wh_node) = fs.lookup(&pdir, &wh_name)? {
            let st = fs.stat(&wh_node)?;
            if st.kind != FileKind::RegularFile {
                return Err(UnionError::Lower(std::io::Error::from_raw_os_error(
                    libc::EIO,
                )));
            }
            end = b as i32;
            opaque_at = b as i32;
            break;
        }

        // step 3: the name itself.
        match fs.lookup(&pdir, name)? {
            None => {
                // step 4: remember only the first negative slot.
                if first_negative.is_none() {
                    first_negative = Some(b);
                }
            }
            Some(node) => {
                let st = fs.stat(&node)?;
                if start == NONE {
                    start = b as i32;
                }
                lower[b] = Some(node.clone());
                end = b as i32;

                if st.kind != FileKind::Directory {
                    // step 5: files cannot fan out.
                    break;
                }
                if fs.lookup(&node, opaque_marker)?.is_some() {
                    opaque_at = b as i32;
                    break;
                }
            }
        }
    }

    if start != NONE {
        FanoutNode::positive(
            branch_count,
            start as usize,
            end as usize,
            if opaque_at != NONE {
                Some(opaque_at as usize)
            } else {
                None
            },
            lower,
        )
    } else {
        Ok(FanoutNode::negative(branch_count, first_negative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{root_node, LocalFs};
    use crate::branch::{BranchTable, Perms};

    fn mk_sb(dirs: &[(&std::path::Path, Perms)]) -> Superblock<LocalFs> {
        let mut roots = Vec::new();
        for (p, perms) in dirs {
            roots.push((p.to_path_buf(), p.to_path_buf(), *perms));
        }
        let table = BranchTable::new(roots).unwrap();
        Superblock::new(LocalFs, table)
    }

    #[test]
    fn whiteout_shadows_lower_positives() {
        let top = tempfile::tempdir().unwrap();
        let bottom = tempfile::tempdir().unwrap();
        std::fs::write(bottom.path().join("x"), b"hi").unwrap();
        std::fs::write(top.path().join(".wh.x"), b"").unwrap();

        let sb = mk_sb(&[(top.path(), Perms::Rw), (bottom.path(), Perms::Ro)]);
        let root = root_node(&sb);
        let child = lookup(&sb, &root, OsStr::new("x")).unwrap();
        assert!(child.is_negative());
    }

    #[test]
    fn positive_picks_topmost_branch() {
        let top = tempfile::tempdir().unwrap();
        let bottom = tempfile::tempdir().unwrap();
        std::fs::write(top.path().join("x"), b"top").unwrap();
        std::fs::write(bottom.path().join("x"), b"bottom").unwrap();

        let sb = mk_sb(&[(top.path(), Perms::Rw), (bottom.path(), Perms::Ro)]);
        let root = root_node(&sb);
        let child = lookup(&sb, &root, OsStr::new("x")).unwrap();
        assert_eq!(child.start(), 0);
        assert_eq!(child.end(), 0);
    }

    #[test]
    fn reserved_name_rejected() {
        let top = tempfile::tempdir().unwrap();
        let sb = mk_sb(&[(top.path(), Perms::Rw)]);
        let root = root_node(&sb);
        let err = lookup(&sb, &root, OsStr::new(".wh.x")).unwrap_err();
        assert!(matches!(err, UnionError::NameViolation));
    }
}
