//! Fan-out Node (C2): the per-visible-object record of lower references,
//! spec §3 and §9 "Fan-out as a value type, not a pointer graph".
//!
//! The spec describes one fan-out node per dentry and one per inode, kept in
//! lockstep (`d.start == i.start`, invariant 4). The core collapses that into
//! a single [`FanoutNode`] that the host shares between its dentry and inode
//! private-data slots, which satisfies the invariant by construction instead
//! of by bookkeeping — see `DESIGN.md` for the reasoning.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::directory::LowerFs;
use crate::error::{Result, UnionError};

/// Sentinel for "no branch"/"empty" in `start`/`end`/`opaque_at`.
pub const NONE: i32 = -1;

/// Most mounts stack a handful of branches; inlining up to 8 slots avoids a
/// heap allocation per fan-out node in the common case.
type LowerSlots<N> = SmallVec<[Option<N>; 8]>;

struct Inner<L: LowerFs> {
    start: i32,
    end: i32,
    opaque_at: i32,
    lower: LowerSlots<L::Node>,
    stale: bool,
    /// For a negative node: the first branch whose lookup came back
    /// negative, remembered so a future `create` can target it directly
    /// without rescanning (spec §4.3 steps 4 and 6). Not a positive slot —
    /// does not affect `start`/`end`/invariant checking.
    negative_branch: Option<usize>,
}

impl<L: LowerFs> Inner<L> {
    fn check_invariants(&self) -> Result<()> {
        if self.start == NONE && self.end != NONE {
            return Err(UnionError::invariant("start == -1 but end != -1"));
        }
        if self.start != NONE && self.start > self.end {
            return Err(UnionError::invariant("start > end"));
        }
        if self.start != NONE {
            let s = self.start as usize;
            let e = self.end as usize;
            if self.lower.get(s).map(Option::is_none).unwrap_or(true) {
                return Err(UnionError::invariant("lower[start] absent"));
            }
            if self.lower.get(e).map(Option::is_none).unwrap_or(true) {
                return Err(UnionError::invariant("lower[end] absent"));
            }
        }
        Ok(())
    }
}

/// One fan-out node, guarded by its own mutex (spec §5 "per-fan-out-node
/// mutex"). Generation is a separate atomic so staleness can be checked
/// without taking the lock (spec §9 "cheap, wait-free read").
pub struct FanoutNode<L: LowerFs> {
    generation: AtomicU32,
    inner: Mutex<Inner<L>>,
}

impl<L: LowerFs> std::fmt::Debug for FanoutNode<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FanoutNode")
            .field("start", &inner.start)
            .field("end", &inner.end)
            .field("opaque_at", &inner.opaque_at)
            .field("generation", &self.generation.load(Ordering::Acquire))
            .field("stale", &inner.stale)
            .finish()
    }
}

impl<L: LowerFs> FanoutNode<L> {
    /// Builds a negative node (no positive slot found anywhere), optionally
    /// remembering a single "first negative slot" branch for a future
    /// `create` (spec §4.3 step 4/6).
    pub fn negative(branch_count: usize, negative_branch: Option<usize>) -> Arc<Self> {
        let lower: LowerSlots<L::Node> = vec![None; branch_count].into();
        Arc::new(FanoutNode {
            generation: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                start: NONE,
                end: NONE,
                opaque_at: NONE,
                lower,
                stale: false,
                negative_branch,
            }),
        })
    }

    /// The remembered negative-lookup branch, if this node is negative (spec
    /// §4.3 step 6).
    pub fn negative_branch(&self) -> Option<usize> {
        self.inner.lock().negative_branch
    }

    /// Builds a positive node from a lookup scan's results.
    pub fn positive(
        branch_count: usize,
        start: usize,
        end: usize,
        opaque_at: Option<usize>,
        lower: Vec<Option<L::Node>>,
    ) -> Result<Arc<Self>> {
        debug_assert_eq!(lower.len(), branch_count);
        let node = FanoutNode {
            generation: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                start: start as i32,
                end: end as i32,
                opaque_at: opaque_at.map(|b| b as i32).unwrap_or(NONE),
                lower: lower.into(),
                stale: false,
                negative_branch: None,
            }),
        };
        node.inner.lock().check_invariants()?;
        Ok(Arc::new(node))
    }

    pub fn is_negative(&self) -> bool {
        self.inner.lock().start == NONE
    }

    pub fn is_positive(&self) -> bool {
        !self.is_negative()
    }

    pub fn start(&self) -> i32 {
        self.inner.lock().start
    }

    pub fn end(&self) -> i32 {
        self.inner.lock().end
    }

    pub fn opaque_at(&self) -> i32 {
        self.inner.lock().opaque_at
    }

    pub fn is_dir_fanout(&self) -> bool {
        let inner = self.inner.lock();
        inner.start != inner.end
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_generation(&self, gen: u32) {
        self.generation.store(gen, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.inner.lock().stale
    }

    pub fn mark_stale(&self) {
        self.inner.lock().stale = true;
    }

    /// Reads the lower handle at `branch`, if populated.
    pub fn lower_at(&self, branch: usize) -> Option<L::Node> {
        self.inner.lock().lower.get(branch).cloned().flatten()
    }

    /// The topmost populated lower handle — the one consulted for attribute
    /// visibility (spec §4.3 "tie-breaks").
    pub fn top(&self) -> Option<(usize, L::Node)> {
        let inner = self.inner.lock();
        if inner.start == NONE {
            return None;
        }
        let s = inner.start as usize;
        inner.lower[s].clone().map(|n| (s, n))
    }

    /// Iterates over every populated branch in `[start, end]`, inclusive,
    /// top to bottom.
    pub fn populated(&self) -> Vec<(usize, L::Node)> {
        let inner = self.inner.lock();
        if inner.start == NONE {
            return Vec::new();
        }
        let (s, e) = (inner.start as usize, inner.end as usize);
        (s..=e)
            .filter_map(|b| inner.lower[b].clone().map(|n| (b, n)))
            .collect()
    }

    /// Replaces the whole lower vector and `start`/`end`/`opaque_at` after a
    /// re-lookup (revalidation engine) or a copy-up. Re-checks invariants
    /// before committing.
    pub fn reset(
        &self,
        start: i32,
        end: i32,
        opaque_at: i32,
        lower: Vec<Option<L::Node>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let prev = Inner {
            start: inner.start,
            end: inner.end,
            opaque_at: inner.opaque_at,
            lower: inner.lower.clone(),
            stale: inner.stale,
            negative_branch: inner.negative_branch,
        };
        inner.start = start;
        inner.end = end;
        inner.opaque_at = opaque_at;
        inner.lower = lower.into();
        inner.negative_branch = None;
        if let Err(e) = inner.check_invariants() {
            // Propagation policy (spec §7): leave state unchanged on failure.
            *inner = prev;
            return Err(e);
        }
        Ok(())
    }

    /// Repoints the node at a single branch (post copy-up of a regular file,
    /// spec §4.5 step 5: "set start = dst, keep end = dst").
    pub fn repoint_single(&self, branch: usize, node: L::Node) -> Result<()> {
        let mut lower = vec![None; self.inner.lock().lower.len()];
        lower[branch] = Some(node);
        self.reset(branch as i32, branch as i32, NONE, lower)
    }

    /// Widens `end` to include a newly-populated branch (copy-up of a
    /// directory, spec §4.5 step 5: "widen end for directories").
    pub fn widen_end(&self, branch: usize, node: L::Node) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.start == NONE {
            inner.start = branch as i32;
        }
        inner.end = std::cmp::max(inner.end, branch as i32);
        if branch >= inner.lower.len() {
            return Err(UnionError::invariant("branch index out of range"));
        }
        inner.lower[branch] = Some(node);
        inner.check_invariants()
    }

    /// Raw pointer identity, used for the paired-lock ordering rule (spec
    /// §4.4/§5: lock two unrelated nodes in address order, smaller first).
    pub fn identity(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// Returns `(a, b)` reordered so the lower raw-pointer identity comes first.
/// Callers lock in that order when an operation must hold two unrelated
/// nodes at once (`link`/`rename` across two directories), per the pair-lock
/// rule in spec §4.4/§5/§9.
pub fn order_by_identity<'a, L: LowerFs>(
    a: &'a Arc<FanoutNode<L>>,
    b: &'a Arc<FanoutNode<L>>,
) -> (&'a Arc<FanoutNode<L>>, &'a Arc<FanoutNode<L>>) {
    if a.identity() <= b.identity() {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{FileKind, LowerDirent, NodeStat};
    use std::ffi::{OsStr, OsString};
    use std::io;
    use std::time::SystemTime;

    #[derive(Clone, Debug)]
    struct DummyNode(u32);

    struct DummyFs;
    impl LowerFs for DummyFs {
        type Node = DummyNode;
        type File = ();
        fn lookup(&self, _dir: &Self::Node, _name: &OsStr) -> io::Result<Option<Self::Node>> {
            Ok(None)
        }
        fn stat(&self, _node: &Self::Node) -> io::Result<NodeStat> {
            Ok(NodeStat {
                kind: FileKind::RegularFile,
                mode: 0o644,
                uid: 0,
                gid: 0,
                size: 0,
                nlink: 1,
                mtime: SystemTime::UNIX_EPOCH,
                ctime: SystemTime::UNIX_EPOCH,
                rdev: 0,
                ino: 0,
            })
        }
        fn create(&self, _d: &Self::Node, _n: &OsStr, _m: u32) -> io::Result<Self::Node> {
            unimplemented!()
        }
        fn mkdir(&self, _d: &Self::Node, _n: &OsStr, _m: u32) -> io::Result<Self::Node> {
            unimplemented!()
        }
        fn symlink(&self, _d: &Self::Node, _n: &OsStr, _t: &OsStr) -> io::Result<Self::Node> {
            unimplemented!()
        }
        fn mknod(&self, _d: &Self::Node, _n: &OsStr, _m: u32, _r: u32) -> io::Result<Self::Node> {
            unimplemented!()
        }
        fn link(&self, _d: &Self::Node, _n: &OsStr, _t: &Self::Node) -> io::Result<Self::Node> {
            unimplemented!()
        }
        fn unlink(&self, _d: &Self::Node, _n: &OsStr) -> io::Result<()> {
            unimplemented!()
        }
        fn rmdir(&self, _d: &Self::Node, _n: &OsStr) -> io::Result<()> {
            unimplemented!()
        }
        fn rename(
            &self,
            _sd: &Self::Node,
            _sn: &OsStr,
            _dd: &Self::Node,
            _dn: &OsStr,
        ) -> io::Result<()> {
            unimplemented!()
        }
        fn readlink(&self, _n: &Self::Node) -> io::Result<OsString> {
            unimplemented!()
        }
        fn readdir(&self, _d: &Self::Node) -> io::Result<Vec<LowerDirent>> {
            unimplemented!()
        }
        fn permission(&self, _n: &Self::Node, _m: crate::directory::AccessMask) -> io::Result<()> {
            unimplemented!()
        }
        fn notify_change(&self, _n: &Self::Node, _a: &crate::directory::SetAttr) -> io::Result<()> {
            unimplemented!()
        }
        fn truncate(&self, _n: &Self::Node, _s: u64) -> io::Result<()> {
            unimplemented!()
        }
        fn open(&self, _n: &Self::Node, _w: bool) -> io::Result<Self::File> {
            unimplemented!()
        }
        fn read(&self, _f: &Self::File, _o: u64, _b: &mut [u8]) -> io::Result<usize> {
            unimplemented!()
        }
        fn write(&self, _f: &Self::File, _o: u64, _b: &[u8]) -> io::Result<usize> {
            unimplemented!()
        }
        fn fsync(&self, _f: &Self::File) -> io::Result<()> {
            unimplemented!()
        }
        fn flush(&self, _f: &Self::File) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn negative_node_has_no_positive_slot() {
        let node: Arc<FanoutNode<DummyFs>> = FanoutNode::negative(3, None);
        assert!(node.is_negative());
        assert_eq!(node.start(), NONE);
    }

    #[test]
    fn positive_node_enforces_lower_start_end_present() {
        let lower = vec![None, Some(DummyNode(1)), None];
        let node: Arc<FanoutNode<DummyFs>> =
            FanoutNode::positive(3, 1, 1, None, lower).unwrap();
        assert!(node.is_positive());
        assert_eq!(node.top().unwrap().0, 1);
    }

    #[test]
    fn rejects_missing_start_slot() {
        let lower = vec![None, None, None];
        let result: Result<Arc<FanoutNode<DummyFs>>> = FanoutNode::positive(3, 1, 2, None, lower);
        assert!(result.is_err());
    }

    #[test]
    fn repoint_single_collapses_fanout() {
        let lower = vec![Some(DummyNode(0)), Some(DummyNode(1))];
        let node: Arc<FanoutNode<DummyFs>> = FanoutNode::positive(2, 0, 1, None, lower).unwrap();
        node.repoint_single(0, DummyNode(9)).unwrap();
        assert_eq!(node.start(), 0);
        assert_eq!(node.end(), 0);
    }
}
