//! Fan-out dentry/inode state machine for a stackable union filesystem.
//!
//! This crate is the core described at the top of the workspace: the branch
//! table, the per-name fan-out node, the whiteout/opaque name protocol, the
//! lookup and revalidation engines, the copy-up engine, the mutation
//! operations composed from them, and open-file redirection. It has no FUSE
//! (or any other VFS) dependency; a host collaborator implements
//! [`directory::LowerFs`] against real backing directories — see the
//! `unionfs-fuse` crate in this workspace for one such host, or
//! [`test_support::LocalFs`] for the one used by this crate's own tests.

pub mod branch;
pub mod copyup;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod flags;
pub mod lookup;
pub mod name;
pub mod ops;
pub mod openfile;
pub mod revalidate;
pub mod superblock;

pub mod test_support;

pub use directory::LowerFs;
pub use error::{Result, UnionError};
pub use fanout::FanoutNode;
pub use superblock::Superblock;
