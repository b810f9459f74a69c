//! Branch Table (C1): the ordered vector of backing roots that make up a
//! union mount, plus the `dirs=` mount-option grammar from spec §4.1.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Hard ceiling on the number of branches in one mount, per spec §6.
pub const MAX_BRANCHES: usize = 128;

/// Per-branch access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perms {
    /// Read-only: mutation on this branch always triggers copy-up.
    Ro,
    /// Read-write: mutation may land here directly.
    Rw,
}

impl Perms {
    pub fn is_rw(self) -> bool {
        matches!(self, Perms::Rw)
    }
}

/// One backing filesystem in the stack, numbered by mount-time position.
///
/// `branch_id` is reassigned on every (re)mount (see [`BranchTable::remount_id`])
/// so that handles held by open files can detect that the branch table under
/// them has been reshuffled (spec §3, `saved_branch_ids`).
pub struct Branch<N> {
    root: N,
    path: PathBuf,
    perms: Perms,
    branch_id: u32,
    /// Outstanding lower opens charged to this branch; gates unmount.
    open_files: std::sync::atomic::AtomicU64,
}

impl<N: fmt::Debug> fmt::Debug for Branch<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("path", &self.path)
            .field("perms", &self.perms)
            .field("branch_id", &self.branch_id)
            .finish()
    }
}

impl<N> Branch<N> {
    pub fn root(&self) -> &N {
        &self.root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn branch_id(&self) -> u32 {
        self.branch_id
    }

    pub fn is_rw(&self) -> bool {
        self.perms.is_rw()
    }

    /// A lower handle on this branch is about to be opened; "branchget" from
    /// spec §5.
    pub fn get(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    /// Balances a prior [`Branch::get`]; "branchput" from spec §5.
    pub fn put(&self) {
        self.open_files.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_count(&self) -> u64 {
        self.open_files.load(Ordering::Acquire)
    }
}

/// One `dir[=mode]` clause of a `dirs=` mount option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSpec {
    pub path: PathBuf,
    pub perms: Perms,
}

/// Parse error for the `dirs=` grammar (spec §4.1 / §6).
#[derive(Debug, thiserror::Error)]
pub enum BranchSpecError {
    #[error("branch specification is empty")]
    Empty,
    #[error("unknown branch mode {0:?}, expected \"ro\" or \"rw\"")]
    UnknownMode(String),
    #[error("branch 0 ({0:?}) must be rw")]
    TopNotRw(PathBuf),
    #[error("branch {1:?} is an ancestor or descendant of branch {0:?}")]
    NestedBranches(PathBuf, PathBuf),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("too many branches: max is {MAX_BRANCHES}")]
    TooManyBranches,
}

impl BranchSpec {
    /// Parses a full `<spec>` of the form `dir[=mode](:dir[=mode])*`.
    pub fn parse_list(spec: &str) -> Result<Vec<BranchSpec>, BranchSpecError> {
        if spec.is_empty() {
            return Err(BranchSpecError::Empty);
        }
        let mut out = Vec::new();
        for clause in spec.split(':') {
            out.push(Self::parse_one(clause)?);
        }
        if out.is_empty() {
            return Err(BranchSpecError::Empty);
        }
        Ok(out)
    }

    fn parse_one(clause: &str) -> Result<BranchSpec, BranchSpecError> {
        match clause.split_once('=') {
            Some((dir, mode)) => {
                let perms = match mode {
                    "ro" => Perms::Ro,
                    "rw" => Perms::Rw,
                    other => return Err(BranchSpecError::UnknownMode(other.to_string())),
                };
                Ok(BranchSpec {
                    path: PathBuf::from(dir),
                    perms,
                })
            }
            None => Ok(BranchSpec {
                path: PathBuf::from(clause),
                perms: Perms::Rw,
            }),
        }
    }
}

/// Validates the branch list against the rules in spec §4.1: branch 0 must be
/// RW, at least one branch, no branch nests inside another, and each branch
/// path is an existing directory. Validation happens before any `Branch<N>` is
/// constructed so mount can fail atomically.
pub fn validate(specs: &[BranchSpec]) -> Result<(), BranchSpecError> {
    if specs.is_empty() {
        return Err(BranchSpecError::Empty);
    }
    if specs[0].perms != Perms::Rw {
        return Err(BranchSpecError::TopNotRw(specs[0].path.clone()));
    }
    for s in specs {
        if !s.path.is_dir() {
            return Err(BranchSpecError::NotADirectory(s.path.clone()));
        }
    }
    for i in 0..specs.len() {
        for j in 0..specs.len() {
            if i == j {
                continue;
            }
            if is_nested(&specs[i].path, &specs[j].path) {
                return Err(BranchSpecError::NestedBranches(
                    specs[i].path.clone(),
                    specs[j].path.clone(),
                ));
            }
        }
    }
    Ok(())
}

fn is_nested(a: &Path, b: &Path) -> bool {
    a != b && (a.starts_with(b) || b.starts_with(a))
}

/// The ordered table of branches for one mount generation.
///
/// `N` is the host's per-branch root handle type (opaque to the core; see
/// [`crate::directory::LowerFs::Node`]).
pub struct BranchTable<N> {
    branches: Vec<Branch<N>>,
    next_branch_id: AtomicU32,
}

impl<N: fmt::Debug> fmt::Debug for BranchTable<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchTable")
            .field("branches", &self.branches)
            .finish()
    }
}

impl<N> BranchTable<N> {
    /// Builds a fresh table, assigning branch ids `1..=N` (0 is reserved so
    /// that "no branch" / "not yet opened" can be represented unambiguously
    /// where callers store a raw `u32`).
    pub fn new(roots: Vec<(N, PathBuf, Perms)>) -> Result<Self, BranchSpecError> {
        if roots.is_empty() {
            return Err(BranchSpecError::Empty);
        }
        if roots.len() > MAX_BRANCHES {
            return Err(BranchSpecError::TooManyBranches);
        }
        let mut branches = Vec::with_capacity(roots.len());
        for (idx, (root, path, perms)) in roots.into_iter().enumerate() {
            branches.push(Branch {
                root,
                path,
                perms,
                branch_id: idx as u32 + 1,
                open_files: std::sync::atomic::AtomicU64::new(0),
            });
        }
        Ok(BranchTable {
            branches,
            next_branch_id: AtomicU32::new(branches_len_plus_one(&branches)),
        })
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Branch<N>> {
        self.branches.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch<N>> {
        self.branches.iter()
    }

    /// Linear scan from branch id to table index, per spec §4.1.
    pub fn branch_id_to_index(&self, id: u32) -> Option<usize> {
        self.branches.iter().position(|b| b.branch_id == id)
    }

    /// Index of the leftmost RW branch, if any (used by copy-up and the
    /// `permission` mutation to find a destination).
    pub fn leftmost_rw(&self) -> Option<usize> {
        self.branches.iter().position(|b| b.is_rw())
    }

    /// Reassigns every branch id, bumping the mount generation's notion of
    /// "current layout". Called by branch-management (add/remove/reorder)
    /// under the superblock write lock.
    pub fn remount_ids(&mut self) {
        for b in &mut self.branches {
            b.branch_id = self.next_branch_id.fetch_add(1, Ordering::AcqRel);
        }
    }
}

fn branches_len_plus_one<N>(branches: &[Branch<N>]) -> u32 {
    branches.len() as u32 + 1
}

/// A process-wide monotonically increasing counter, used for the silly-rename
/// template's counter field (spec §4.5/§6).
#[derive(Debug, Default)]
pub struct SillyCounter(AtomicU32);

impl SillyCounter {
    pub const fn new() -> Self {
        SillyCounter(AtomicU32::new(0))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

/// Renders a silly-rename name: `.unionfs%0*lx%0*x` with the first field the
/// source-branch inode number in hex (width `2*sizeof(u64)`) and the second
/// the counter in hex (width `2*sizeof(u32)`), per spec §6.
pub fn silly_rename_name(src_ino: u64, counter: u32) -> OsString {
    let s = format!(".unionfs{:016x}{:08x}", src_ino, counter);
    OsString::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_rw() {
        let specs = BranchSpec::parse_list("/a:/b=ro").unwrap();
        assert_eq!(specs[0].perms, Perms::Rw);
        assert_eq!(specs[1].perms, Perms::Ro);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = BranchSpec::parse_list("/a=bogus").unwrap_err();
        assert!(matches!(err, BranchSpecError::UnknownMode(_)));
    }

    #[test]
    fn silly_name_is_stable_width() {
        let name = silly_rename_name(0xFF, 3);
        assert_eq!(name.to_str().unwrap(), ".unionfs00000000000000ff00000003");
    }
}
