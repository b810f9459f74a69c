//! Revalidation Engine (C5): the generation-driven protocol that keeps a
//! fan-out node coherent when a lower filesystem changes behind the union,
//! spec §4.4.

use std::ffi::OsStr;
use std::sync::Arc;

use log::debug;

use crate::directory::LowerFs;
use crate::error::Result;
use crate::fanout::FanoutNode;
use crate::flags::InterposeFlags;
use crate::lookup;
use crate::superblock::Superblock;

/// One ancestor in the parent chain, as seen by Stage A.
pub struct Ancestor<L: LowerFs> {
    pub node: Arc<FanoutNode<L>>,
    pub name: std::ffi::OsString,
    pub parent: Arc<FanoutNode<L>>,
}

/// Stage A (spec §4.4): walk upward from `target`'s parent, collecting every
/// ancestor whose generation trails the superblock's, or whose lower shows
/// newer mtime/ctime than cached. `chain` must be ordered root-first so
/// revalidation of parents happens before children (spec §4.4 "Ordering").
pub fn revalidate_parent_chain<L: LowerFs>(
    sb: &Superblock<L>,
    chain: &[Ancestor<L>],
) -> Result<()> {
    let sb_gen = sb.generation();
    let branch_count = sb.branches().len();
    for ancestor in chain {
        let needs_reval = ancestor.node.generation() < sb_gen || is_newer_lower(sb, &ancestor.node)?;
        if needs_reval {
            debug!("revalidate_parent_chain: purging stale ancestor {:?}", ancestor.name);
            // Purge: reset generation to force a full re-lookup, then
            // rebuild this ancestor from its own parent top-down.
            ancestor.node.set_generation(0);
            let fresh = lookup::lookup(sb, &ancestor.parent, &ancestor.name)?;
            adopt(&ancestor.node, &fresh, branch_count)?;
            ancestor.node.set_generation(sb_gen);
        }
    }
    Ok(())
}

/// The core keeps no cached mtime/ctime of its own — attributes live on the
/// host's inode — so generation comparison is its only staleness signal.
/// A host that caches attributes can run `LowerFs::is_newer` itself against
/// its cached values and call `node.set_generation(0)` to force the next
/// revalidation through the full re-lookup path; this function exists so the
/// probe still happens here too, surfacing a vanished-branch I/O error as
/// staleness evidence even when the host hasn't done that extra bookkeeping.
fn is_newer_lower<L: LowerFs>(sb: &Superblock<L>, node: &Arc<FanoutNode<L>>) -> Result<bool> {
    let Some((branch, lower)) = node.top() else {
        return Ok(false);
    };
    let branches = sb.branches();
    if branches.get(branch).is_none() {
        return Ok(false);
    }
    drop(branches);
    sb.fs().stat(&lower)?;
    Ok(false)
}

/// The outcome of revalidating the target itself (Stage B).
pub enum Validity {
    /// The cached node is still correct.
    Valid,
    /// The cached node was stale and has been replaced in place; the host
    /// should still treat the dentry/inode as valid (we already repointed
    /// it), but must be told via `REVAL`/`REVAL_NEG` which shape of
    /// interpose happened.
    Replaced(InterposeFlags),
    /// The object is gone; the host must evict the inode and drop the dentry.
    Stale,
}

/// Stage B (spec §4.4): validate `target` against its already-revalidated
/// `parent`.
pub fn revalidate_target<L: LowerFs>(
    sb: &Superblock<L>,
    parent: &Arc<FanoutNode<L>>,
    name: &OsStr,
    target: &Arc<FanoutNode<L>>,
) -> Result<Validity> {
    let sb_gen = sb.generation();
    if target.generation() == sb_gen && !is_newer_lower(sb, target)? {
        // Ask each populated lower to confirm and refresh attributes. A
        // failed stat is treated as "gone"; the caller's mutation/read path
        // will see the resulting staleness on its next access.
        for (b, lower) in target.populated() {
            if sb.fs().stat(&lower).is_err() {
                debug!("revalidate_target: {:?} gone on branch {}", name, b);
                target.mark_stale();
                return Ok(Validity::Stale);
            }
        }
        return Ok(Validity::Valid);
    }

    let was_positive = target.is_positive();
    let fresh = lookup::lookup(sb, parent, name)?;
    if fresh.is_positive() {
        // Mirror the populated-lower probe above: a name that still resolves
        // can still be gone underneath (raced unlink between the lookup and
        // here), so confirm each populated lower before trusting `fresh`.
        for (b, lower) in fresh.populated() {
            if sb.fs().stat(&lower).is_err() {
                debug!("revalidate_target: fresh lookup of {:?} gone on branch {}", name, b);
                fresh.mark_stale();
                return Ok(Validity::Stale);
            }
        }
    }
    let branch_count = sb.branches().len();
    adopt(target, &fresh, branch_count)?;
    target.set_generation(sb_gen);

    let flags = match (was_positive, fresh.is_positive()) {
        (true, true) => InterposeFlags::REVAL,
        (_, false) => InterposeFlags::REVAL_NEG,
        (false, true) => InterposeFlags::REVAL,
    };
    Ok(Validity::Replaced(flags))
}

/// Copies a freshly-looked-up node's shape into an existing, host-retained
/// node (so dentry/inode identity held by the host survives a re-lookup).
/// `branch_count` sizes the rebuilt lower vector to the full branch table so
/// later copy-up/widen operations on `target` stay in bounds.
fn adopt<L: LowerFs>(
    target: &Arc<FanoutNode<L>>,
    fresh: &Arc<FanoutNode<L>>,
    branch_count: usize,
) -> Result<()> {
    let mut lower: Vec<Option<L::Node>> = vec![None; branch_count];
    for (b, n) in fresh.populated() {
        if b < lower.len() {
            lower[b] = Some(n);
        }
    }
    target.reset(fresh.start(), fresh.end(), fresh.opaque_at(), lower)
}
