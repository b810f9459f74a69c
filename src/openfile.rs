//! Open File Redirection (C8): maps one user-visible open handle onto one or
//! many lower handles, tracks the branch each was opened against, and
//! reopens/copies-up on demand, spec §4.7.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::branch::BranchTable;
use crate::copyup::{copy_up, create_parents, ParentStep};
use crate::directory::LowerFs;
use crate::error::{Result, UnionError};
use crate::fanout::{FanoutNode, NONE};
use crate::superblock::Superblock;

/// Per-handle state behind one lower slot, remembering the branch id (not
/// index) active when it was opened so a later branch-table reshuffle can be
/// resolved by id-to-index remapping rather than assuming indices are stable
/// (spec §3 "saved_branch_ids").
struct Slot<L: LowerFs> {
    file: L::File,
    branch_id: u32,
}

struct Inner<L: LowerFs> {
    lowers: Vec<Option<Slot<L>>>,
    fstart: i32,
    fend: i32,
}

/// One open-file record (spec §3 "Open-file record"). `directory` handles
/// open every populated lower as read-only; a file handle opens only the
/// top.
pub struct OpenFile<L: LowerFs> {
    gen: AtomicU32,
    write: bool,
    directory: bool,
    inner: Mutex<Inner<L>>,
}

impl<L: LowerFs> OpenFile<L> {
    /// Opens `node` (spec §4.7 "On open"). Directories open every populated
    /// lower; regular files open only the top.
    pub fn open(sb: &Superblock<L>, node: &Arc<FanoutNode<L>>, write: bool, is_dir: bool) -> Result<Self> {
        let fs = sb.fs();
        let branches = sb.branches();
        let branch_count = branches.len();
        let mut lowers: Vec<Option<Slot<L>>> = (0..branch_count).map(|_| None).collect();

        let targets: Vec<(usize, L::Node)> = if is_dir {
            node.populated()
        } else {
            node.top().into_iter().collect()
        };

        for (b, lower) in targets {
            let branch = branches
                .get(b)
                .ok_or_else(|| UnionError::invariant("open against unknown branch"))?;
            let open_write = write && !is_dir;
            let file = fs.open(&lower, open_write)?;
            branch.get();
            lowers[b] = Some(Slot {
                file,
                branch_id: branch.branch_id(),
            });
        }
        drop(branches);

        Ok(OpenFile {
            gen: AtomicU32::new(sb.generation()),
            write,
            directory: is_dir,
            inner: Mutex::new(Inner {
                lowers,
                fstart: node.start(),
                fend: node.end(),
            }),
        })
    }

    pub fn generation(&self) -> u32 {
        self.gen.load(Ordering::Acquire)
    }

    /// `revalidate_file` (spec §4.7 step 1-2): tears down and reopens lower
    /// handles when the dentry's generation has moved past this handle's, or
    /// its top branch has shifted; performs a delayed copy-up when the
    /// caller is about to write through a read-only top.
    pub fn revalidate_file(
        &mut self,
        sb: &Superblock<L>,
        parent_chain: &[ParentStep<L>],
        name: &std::ffi::OsStr,
        dentry: &Arc<FanoutNode<L>>,
        will_write: bool,
    ) -> Result<()> {
        let sb_gen = sb.generation();
        let shifted = {
            let inner = self.inner.lock();
            dentry.generation() != self.gen.load(Ordering::Acquire) || dentry.start() != inner.fstart
        };

        if shifted {
            self.reopen(sb, dentry)?;
        }

        if will_write && !self.directory {
            let (top_branch, _) = dentry
                .top()
                .ok_or_else(|| UnionError::invariant("write against a negative node"))?;
            let is_rw = sb.branches().get(top_branch).map(|b| b.is_rw()).unwrap_or(false);
            if !is_rw {
                let dst = sb
                    .branches()
                    .leftmost_rw()
                    .ok_or_else(|| UnionError::invariant("no writable branch"))?;
                let parent_dst = create_parents(sb, parent_chain, dst)?;
                copy_up(sb, &parent_dst, name, dentry, dst)?;
                self.reopen(sb, dentry)?;
            }
        }
        self.gen.store(sb_gen, Ordering::Release);
        Ok(())
    }

    fn reopen(&mut self, sb: &Superblock<L>, dentry: &Arc<FanoutNode<L>>) -> Result<()> {
        let fresh = OpenFile::open(sb, dentry, self.write, self.directory)?;
        let fresh_gen = fresh.gen.load(Ordering::Acquire);
        let mut fresh_inner = fresh.inner.into_inner();
        let stale_inner = {
            let mut inner = self.inner.lock();
            std::mem::swap(&mut *inner, &mut fresh_inner);
            fresh_inner
        };
        // `stale_inner` now holds what this handle pointed at before the
        // swap; release its branch references the same way `close` does.
        let branches = sb.branches();
        for slot in stale_inner.lowers.into_iter().flatten() {
            if let Some(branch) = branches.iter().find(|b| b.branch_id() == slot.branch_id) {
                branch.put();
            }
        }
        self.gen.store(fresh_gen, Ordering::Release);
        Ok(())
    }

    fn top_slot(&self) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.fstart == NONE {
            return Err(UnionError::invariant("operation on a negative open file"));
        }
        Ok(inner.fstart as usize)
    }

    pub fn read(&self, sb: &Superblock<L>, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let b = self.top_slot()?;
        let inner = self.inner.lock();
        let slot = inner.lowers[b]
            .as_ref()
            .ok_or_else(|| UnionError::invariant("top slot not open"))?;
        sb.fs().read(&slot.file, offset, buf).map_err(Into::into)
    }

    pub fn write(&self, sb: &Superblock<L>, offset: u64, buf: &[u8]) -> Result<usize> {
        let b = self.top_slot()?;
        let inner = self.inner.lock();
        let slot = inner.lowers[b]
            .as_ref()
            .ok_or_else(|| UnionError::invariant("top slot not open"))?;
        sb.fs().write(&slot.file, offset, buf).map_err(Into::into)
    }

    pub fn fsync(&self, sb: &Superblock<L>) -> Result<()> {
        let b = self.top_slot()?;
        let inner = self.inner.lock();
        let slot = inner.lowers[b]
            .as_ref()
            .ok_or_else(|| UnionError::invariant("top slot not open"))?;
        sb.fs().fsync(&slot.file).map_err(Into::into)
    }

    pub fn flush(&self, sb: &Superblock<L>) -> Result<()> {
        let b = self.top_slot()?;
        let inner = self.inner.lock();
        let slot = inner.lowers[b]
            .as_ref()
            .ok_or_else(|| UnionError::invariant("top slot not open"))?;
        sb.fs().flush(&slot.file).map_err(Into::into)
    }

    /// The branch-membership ioctl (spec §6): a bit-mask, bit `b` set iff
    /// this handle currently has branch `b` open.
    pub fn branch_mask(&self, branches: &BranchTable<L::Node>) -> u128 {
        let inner = self.inner.lock();
        let mut mask: u128 = 0;
        for (b, slot) in inner.lowers.iter().enumerate() {
            if slot.is_some() && branches.get(b).is_some() {
                mask |= 1u128 << b;
            }
        }
        mask
    }

    /// Drops every held lower handle, balancing the `branchget` done at open
    /// (spec §5 "shared resources").
    pub fn close(self, branches: &BranchTable<L::Node>) {
        let mut inner = self.inner.into_inner();
        for slot in inner.lowers.drain(..).flatten() {
            if let Some(branch) = branches.iter().find(|b| b.branch_id() == slot.branch_id) {
                branch.put();
            }
        }
    }
}
