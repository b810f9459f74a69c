//! Inode table: FUSE only knows inodes by `u64`, while `unionfs-core` tracks
//! state in `Arc<FanoutNode<_>>` values reached by walking down from a
//! revalidated parent. This module is the glue between the two: it keeps a
//! `u64 -> (fan-out node, parent ino, name)` table and rebuilds the
//! root-first ancestor/parent chains the core's revalidation and mutation
//! engines need from any given inode.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use unionfs_core::copyup::ParentStep;
use unionfs_core::revalidate::Ancestor;
use unionfs_core::FanoutNode;

use crate::dirfs::DirFs;

/// The inode number FUSE reserves for the mount's root.
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

struct Entry {
    node: Arc<FanoutNode<DirFs>>,
    parent: u64,
    name: OsString,
    nlookup: u64,
}

/// Maps FUSE inode numbers onto fan-out nodes and their place in the
/// directory tree, so any FUSE callback can reconstruct the ancestor chain
/// a core operation needs from nothing but the one `ino` the kernel gave it.
pub struct InodeTable {
    entries: Mutex<HashMap<u64, Entry>>,
    next_ino: AtomicU64,
}

impl InodeTable {
    pub fn new(root: Arc<FanoutNode<DirFs>>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INO,
            Entry {
                node: root,
                parent: ROOT_INO,
                name: OsString::new(),
                nlookup: 1,
            },
        );
        InodeTable {
            entries: Mutex::new(entries),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    pub fn get(&self, ino: u64) -> Option<Arc<FanoutNode<DirFs>>> {
        self.entries.lock().get(&ino).map(|e| e.node.clone())
    }

    /// Registers `node` as a child of `parent` reached by `name`, reusing
    /// `ino` if the pair is already resident (bumping its lookup count
    /// instead of minting a new number, so a repeated `lookup` of the same
    /// name doesn't leak inodes).
    pub fn intern(&self, parent: u64, name: &std::ffi::OsStr, node: Arc<FanoutNode<DirFs>>) -> u64 {
        let mut entries = self.entries.lock();
        if let Some((&ino, existing)) = entries
            .iter_mut()
            .find(|(_, e)| e.parent == parent && e.name == name)
        {
            existing.node = node;
            existing.nlookup += 1;
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::AcqRel);
        entries.insert(
            ino,
            Entry {
                node,
                parent,
                name: name.to_os_string(),
                nlookup: 1,
            },
        );
        ino
    }

    /// `forget(nlookup)` (FUSE semantics): drops `nlookup` references, and
    /// evicts the entry entirely once the count reaches zero. The root is
    /// never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&ino) {
            entry.nlookup = entry.nlookup.saturating_sub(nlookup);
            if entry.nlookup == 0 {
                entries.remove(&ino);
            }
        }
    }

    /// Looks up the inode already assigned to `(parent, name)`, if any,
    /// without interning a new one or bumping `nlookup` — used where a
    /// caller needs to cross-reference open handles by ino but has no
    /// lookup of its own to register.
    pub fn existing_ino(&self, parent: u64, name: &std::ffi::OsStr) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .find(|(_, e)| e.parent == parent && e.name == name)
            .map(|(&ino, _)| ino)
    }

    fn name_and_parent(&self, ino: u64) -> Option<(OsString, u64, Arc<FanoutNode<DirFs>>)> {
        let entries = self.entries.lock();
        entries
            .get(&ino)
            .map(|e| (e.name.clone(), e.parent, e.node.clone()))
    }

    /// The root-first `ParentStep` chain for `ino` itself: every ancestor
    /// from just below the mount root down to and including `ino`, each
    /// carrying its own fan-out node and the name it has within its parent
    /// (spec §4.5 "replicate missing directories"). Root itself is never a
    /// step since every branch root always exists.
    pub fn parent_chain(&self, ino: u64) -> Vec<ParentStep<DirFs>> {
        let mut steps = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            let Some((name, parent, node)) = self.name_and_parent(current) else {
                break;
            };
            steps.push(ParentStep { node, name });
            current = parent;
        }
        steps.reverse();
        steps
    }

    /// The Stage A ancestor chain (spec §4.4) for the parent of `ino`: every
    /// ancestor from just below root down to `ino`'s parent, root-first, each
    /// paired with its own parent so [`revalidate_parent_chain`] can re-look
    /// up a stale one in place.
    ///
    /// [`revalidate_parent_chain`]: unionfs_core::revalidate::revalidate_parent_chain
    pub fn ancestor_chain(&self, ino: u64) -> Vec<Ancestor<DirFs>> {
        let mut chain = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            let Some((name, parent_ino, node)) = self.name_and_parent(current) else {
                break;
            };
            let Some(parent_node) = self.get(parent_ino) else {
                break;
            };
            chain.push(Ancestor {
                node,
                name,
                parent: parent_node,
            });
            current = parent_ino;
        }
        chain.reverse();
        chain
    }

    pub fn parent_node(&self, ino: u64) -> Option<Arc<FanoutNode<DirFs>>> {
        let entries = self.entries.lock();
        let parent = entries.get(&ino)?.parent;
        entries.get(&parent).map(|e| e.node.clone())
    }

    pub fn parent_ino(&self, ino: u64) -> Option<u64> {
        self.entries.lock().get(&ino).map(|e| e.parent)
    }

    pub fn name_of(&self, ino: u64) -> Option<OsString> {
        self.entries.lock().get(&ino).map(|e| e.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn root_for(dir: &std::path::Path) -> Arc<FanoutNode<DirFs>> {
        FanoutNode::positive(1, 0, 0, None, vec![Some(dir.to_path_buf())]).unwrap()
    }

    #[test]
    fn intern_reuses_ino_for_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(root_for(dir.path()));
        let child = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a"))]).unwrap();

        let ino1 = table.intern(ROOT_INO, OsStr::new("a"), child.clone());
        let ino2 = table.intern(ROOT_INO, OsStr::new("a"), child.clone());
        assert_eq!(ino1, ino2);
        assert_ne!(ino1, ROOT_INO);
    }

    #[test]
    fn forget_evicts_at_zero_refcount() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(root_for(dir.path()));
        let child = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a"))]).unwrap();
        let ino = table.intern(ROOT_INO, OsStr::new("a"), child);

        table.forget(ino, 1);
        assert!(table.get(ino).is_none());
    }

    #[test]
    fn parent_chain_is_root_first() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(root_for(dir.path()));
        let a = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a"))]).unwrap();
        let a_ino = table.intern(ROOT_INO, OsStr::new("a"), a);
        let b = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a/b"))]).unwrap();
        let b_ino = table.intern(a_ino, OsStr::new("b"), b);

        let chain = table.parent_chain(b_ino);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name, OsStr::new("a"));
        assert_eq!(chain[1].name, OsStr::new("b"));
    }

    #[test]
    fn ancestor_chain_pairs_each_node_with_its_parent() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(root_for(dir.path()));
        let a = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a"))]).unwrap();
        let a_ino = table.intern(ROOT_INO, OsStr::new("a"), a);
        let b = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a/b"))]).unwrap();
        let b_ino = table.intern(a_ino, OsStr::new("b"), b);

        let chain = table.ancestor_chain(b_ino);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name, OsStr::new("a"));
        assert!(Arc::ptr_eq(&chain[0].parent, &table.get(ROOT_INO).unwrap()));
    }

    #[test]
    fn existing_ino_finds_interned_entry_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new(root_for(dir.path()));
        let child = FanoutNode::positive(1, 0, 0, None, vec![Some(dir.path().join("a"))]).unwrap();
        let ino = table.intern(ROOT_INO, OsStr::new("a"), child);

        assert_eq!(table.existing_ino(ROOT_INO, OsStr::new("a")), Some(ino));
        assert_eq!(table.existing_ino(ROOT_INO, OsStr::new("missing")), None);
    }
}
