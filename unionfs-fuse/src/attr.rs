//! Conversions between `unionfs-core`'s host-agnostic [`NodeStat`] and
//! `fuser`'s wire-level [`FileAttr`]/[`FileType`].

use std::time::Duration;

use fuser::{FileAttr, FileType};
use unionfs_core::directory::{FileKind, NodeStat};

/// Attribute cache lifetime handed back on every `entry`/`attr` reply.
/// `unionfs-core` invalidates explicitly via the generation counter, not
/// via kernel attribute-cache timeouts, so this just needs to be short
/// enough that the kernel re-asks often (spec §4.4 is the real authority).
pub const ATTR_TTL: Duration = Duration::from_secs(1);

pub fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

/// Builds the `FileAttr` FUSE expects for `ino`, folding in `nlink` for a
/// directory's worth of fanned-out branches the way spec §4.2's
/// `get_nlinks` describes: a directory's visible link count is the sum of
/// its populated lowers' link counts, not any single lower's own value,
/// since each lower's own subdirectory entries don't account for siblings
/// hidden by whiteouts on other branches.
pub fn to_file_attr(ino: u64, st: &NodeStat, nlink_override: Option<u32>) -> FileAttr {
    FileAttr {
        ino,
        size: st.size,
        blocks: st.size.div_ceil(512),
        atime: st.mtime,
        mtime: st.mtime,
        ctime: st.ctime,
        crtime: st.ctime,
        kind: file_type(st.kind),
        perm: (st.mode & 0o7777) as u16,
        nlink: nlink_override.unwrap_or(st.nlink as u32),
        uid: st.uid,
        gid: st.gid,
        rdev: st.rdev,
        blksize: 4096,
        flags: 0,
    }
}
