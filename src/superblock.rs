//! Superblock state (spec §3): the branch table plus the mount generation
//! counter that drives revalidation (C5) and the multi-reader/single-writer
//! lock that guards branch management (spec §5).

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::branch::{BranchTable, SillyCounter};
use crate::directory::LowerFs;

/// Superblock state shared by every fan-out node under one mount.
pub struct Superblock<L: LowerFs> {
    branches: RwLock<BranchTable<L::Node>>,
    generation: AtomicU32,
    high_branch_id: AtomicU32,
    silly_counter: SillyCounter,
    fs: L,
}

impl<L: LowerFs> Superblock<L> {
    pub fn new(fs: L, branches: BranchTable<L::Node>) -> Self {
        let high = branches.iter().map(|b| b.branch_id()).max().unwrap_or(0);
        Superblock {
            branches: RwLock::new(branches),
            generation: AtomicU32::new(0),
            high_branch_id: AtomicU32::new(high),
            silly_counter: SillyCounter::new(),
            fs,
        }
    }

    pub fn fs(&self) -> &L {
        &self.fs
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bumps the generation; called on any branch add/remove/reorder (spec
    /// §3). Returns the new value.
    pub fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn high_branch_id(&self) -> u32 {
        self.high_branch_id.load(Ordering::Acquire)
    }

    /// Read access to the branch table. Held by almost every operation
    /// (spec §5).
    pub fn branches(&self) -> parking_lot::RwLockReadGuard<'_, BranchTable<L::Node>> {
        self.branches.read()
    }

    /// Write access, held only by branch management.
    pub fn branches_mut(&self) -> parking_lot::RwLockWriteGuard<'_, BranchTable<L::Node>> {
        self.branches.write()
    }

    pub fn silly_counter(&self) -> &SillyCounter {
        &self.silly_counter
    }

    /// Branch management: replaces the branch table wholesale (add, remove,
    /// or reorder), reassigns branch ids, and bumps the generation so open
    /// fan-out nodes know to revalidate. Held under the superblock write
    /// lock for the whole operation.
    pub fn reconfigure(&self, mut new_table: BranchTable<L::Node>) -> u32 {
        new_table.remount_ids();
        let high = new_table.iter().map(|b| b.branch_id()).max().unwrap_or(0);
        {
            let mut branches = self.branches.write();
            *branches = new_table;
        }
        self.high_branch_id.store(high, Ordering::Release);
        self.bump_generation()
    }
}
