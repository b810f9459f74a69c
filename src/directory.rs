//! The "Directory Interface" (spec §6): the minimal contract the core
//! requires from a host collaborator. Everything the core does to a lower
//! filesystem — lookups, mutation primitives, open handles — goes through
//! this trait. A concrete host (e.g. the `unionfs-fuse` binding crate, or the
//! in-process test harness under `tests/support`) implements it once against
//! real backing directories.
//!
//! This is deliberately the only seam between the core and the outside
//! world: everything on the other side of it — xattr passthrough, page-cache
//! copy loops, ioctl plumbing, module init — is out of scope per spec §1.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::time::SystemTime;

/// What kind of object a lower name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// Lower-filesystem attributes the core needs to make fan-out and
/// copy-up decisions, and to compose the visible inode's attributes
/// (`copy_attr_all`, spec §4.3).
#[derive(Debug, Clone)]
pub struct NodeStat {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub rdev: u32,
    /// The lower filesystem's own native inode number, used as the
    /// `<ino-hex>` field of the silly-rename template (spec §4.5/§6). Not
    /// the FUSE-visible inode — that is a property of the fan-out node, not
    /// of any one lower.
    pub ino: u64,
}

impl NodeStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Attributes a `setattr`/`notify_change` call may update. `None` fields are
/// left untouched on the lower.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Access check mask for `permission`, mirroring the host's own R/W/X bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const READ: AccessMask = AccessMask(0b100);
    pub const WRITE: AccessMask = AccessMask(0b010);
    pub const EXEC: AccessMask = AccessMask(0b001);
}

/// An entry returned by `readdir`.
#[derive(Debug, Clone)]
pub struct LowerDirent {
    pub name: OsString,
    pub kind: FileKind,
}

/// The per-branch collaborator contract. `Node` is an opaque handle to an
/// object on one branch (a path, an fd, whatever the host finds natural);
/// `File` is an opaque open-file handle on one branch.
///
/// All methods take `&self` — the host owns whatever locking spec §5 demands
/// around its own lower mutex; the core never assumes it can serialize two
/// calls into the same branch itself.
pub trait LowerFs: Send + Sync + 'static {
    /// Handle to a directory or file on this branch (e.g. a path or raw fd).
    type Node: Clone + Send + Sync + fmt::Debug + 'static;
    /// Handle to an open file on this branch.
    type File: Send + Sync + fmt::Debug + 'static;

    fn lookup(&self, dir: &Self::Node, name: &OsStr) -> io::Result<Option<Self::Node>>;
    fn stat(&self, node: &Self::Node) -> io::Result<NodeStat>;

    fn create(&self, dir: &Self::Node, name: &OsStr, mode: u32) -> io::Result<Self::Node>;
    fn mkdir(&self, dir: &Self::Node, name: &OsStr, mode: u32) -> io::Result<Self::Node>;
    fn symlink(&self, dir: &Self::Node, name: &OsStr, target: &OsStr) -> io::Result<Self::Node>;
    fn mknod(&self, dir: &Self::Node, name: &OsStr, mode: u32, rdev: u32) -> io::Result<Self::Node>;
    fn link(&self, dir: &Self::Node, name: &OsStr, target: &Self::Node) -> io::Result<Self::Node>;
    fn unlink(&self, dir: &Self::Node, name: &OsStr) -> io::Result<()>;
    fn rmdir(&self, dir: &Self::Node, name: &OsStr) -> io::Result<()>;
    fn rename(
        &self,
        src_dir: &Self::Node,
        src_name: &OsStr,
        dst_dir: &Self::Node,
        dst_name: &OsStr,
    ) -> io::Result<()>;
    fn readlink(&self, node: &Self::Node) -> io::Result<OsString>;
    fn readdir(&self, dir: &Self::Node) -> io::Result<Vec<LowerDirent>>;
    fn permission(&self, node: &Self::Node, mask: AccessMask) -> io::Result<()>;
    fn notify_change(&self, node: &Self::Node, attr: &SetAttr) -> io::Result<()>;
    fn truncate(&self, node: &Self::Node, size: u64) -> io::Result<()>;

    fn open(&self, node: &Self::Node, write: bool) -> io::Result<Self::File>;
    fn read(&self, file: &Self::File, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, file: &Self::File, offset: u64, buf: &[u8]) -> io::Result<usize>;
    fn fsync(&self, file: &Self::File) -> io::Result<()>;
    fn flush(&self, file: &Self::File) -> io::Result<()>;

    /// `is_newer_lower` from spec §4.4: compares the stored mtime/ctime
    /// against what the lower reports right now.
    fn is_newer(&self, node: &Self::Node, cached_mtime: SystemTime, cached_ctime: SystemTime) -> io::Result<bool> {
        let st = self.stat(node)?;
        Ok(st.mtime > cached_mtime || st.ctime > cached_ctime)
    }
}

/// Streams every byte of `src` into `dst` starting at offset 0, for the
/// copy-up engine's regular-file path (spec §4.5 step 2). A caller-specified
/// size cap stops the stream early (used by silly-rename copy-up of a file
/// truncated mid-write).
pub fn stream_copy<L: LowerFs>(
    fs: &L,
    src: &L::File,
    dst: &L::File,
    cap: Option<u64>,
) -> io::Result<u64> {
    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut offset: u64 = 0;
    loop {
        if let Some(cap) = cap {
            if offset >= cap {
                break;
            }
        }
        let want = match cap {
            Some(cap) => std::cmp::min(CHUNK as u64, cap - offset) as usize,
            None => CHUNK,
        };
        let n = fs.read(src, offset, &mut buf[..want])?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            let w = fs.write(dst, offset + written as u64, &buf[written..n])?;
            if w == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write during copy-up"));
            }
            written += w;
        }
        offset += n as u64;
    }
    Ok(offset)
}
