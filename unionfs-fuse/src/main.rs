//! `unionfs-fuse`: mounts `unionfs-core`'s fan-out state machine as a real
//! FUSE filesystem. This binary is deliberately thin — almost everything it
//! does is translate one `fuser::Filesystem` callback into one
//! `unionfs_core::ops`/`lookup`/`revalidate`/`copyup`/`openfile` call and
//! translate the result back into one `fuser::Reply*` call.

mod attr;
mod cli;
mod dirfs;
mod inode;

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use clap::Parser;
use fuser::{
    FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, error, info};
use parking_lot::Mutex;

use unionfs_core::branch::{BranchSpec, BranchTable, Perms};
use unionfs_core::copyup::finish_silly_rename;
use unionfs_core::directory::{AccessMask, SetAttr};
use unionfs_core::openfile::OpenFile;
use unionfs_core::{lookup, name, ops, revalidate, FanoutNode, Superblock, UnionError};

use attr::{to_file_attr, ATTR_TTL};
use dirfs::DirFs;
use inode::{InodeTable, ROOT_INO};

struct OpenHandle {
    file: OpenFile<DirFs>,
    ino: u64,
}

/// Branch-membership query (spec §6): returns the open handle's branch mask
/// as a little-endian `u128`.
const UNIONFS_IOC_BRANCHES: u32 = 0x7501;
/// The legacy ioctl spec §6 calls out as explicitly deprecated: always
/// `ENOTTY`, never implemented.
const UNIONFS_IOC_RELOAD_LEGACY: u32 = 0x7502;

/// The `fuser::Filesystem` implementation. All state lives behind
/// `Superblock`'s own locking and the inode table's mutex; `&self` suffices
/// for every operation the way `unionfs-core`'s own API expects (spec §5).
struct UnionFs {
    sb: Superblock<DirFs>,
    inodes: InodeTable,
    open_files: Mutex<HashMap<u64, OpenHandle>>,
    /// Inodes unlinked via the silly-rename path (spec §4.5) while still
    /// open, keyed by the ino that was open at the time, pointing at the
    /// hidden name's parent directory and its `.unionfs<ino-hex><counter-hex>`
    /// name. Drained by `release` once the last handle on that ino closes.
    sillied: Mutex<HashMap<u64, (PathBuf, OsString)>>,
    next_fh: AtomicU64,
}

fn errno(e: UnionError) -> i32 {
    e.to_errno()
}

fn io_errno(e: std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

impl UnionFs {
    fn new(sb: Superblock<DirFs>) -> Self {
        let root = {
            let branches = sb.branches();
            let lower: Vec<Option<std::path::PathBuf>> =
                branches.iter().map(|b| Some(b.root().clone())).collect();
            let end = branches.len() - 1;
            drop(branches);
            FanoutNode::positive(lower.len(), 0, end, None, lower)
                .expect("mount root is well-formed")
        };
        UnionFs {
            sb,
            inodes: InodeTable::new(root),
            open_files: Mutex::new(HashMap::new()),
            sillied: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Stage A + (implicit) Stage B: brings every ancestor of `ino` up to
    /// date before the caller trusts `ino`'s own fan-out node (spec §4.4).
    fn revalidate_ancestors(&self, ino: u64) -> Result<(), i32> {
        let chain = self.inodes.ancestor_chain(ino);
        revalidate::revalidate_parent_chain(&self.sb, &chain).map_err(errno)
    }

    fn stat_node(&self, node: &std::sync::Arc<FanoutNode<DirFs>>) -> Result<unionfs_core::directory::NodeStat, i32> {
        let Some((_, top)) = node.top() else {
            return Err(libc::ENOENT);
        };
        let mut st = self.sb.fs().stat(&top).map_err(io_errno)?;
        if st.is_dir() {
            // get_nlinks (spec §4.2 supplement): fold every populated
            // branch's own link count instead of trusting a single lower,
            // since whiteouts on other branches hide entries a lone lower's
            // nlink would still be counting. Each contributing branch folds
            // its own `.`/`..` pair in as `max(2, nlink - 2) + 2`; a branch
            // reporting `nlink == 0` is a deleted directory and is skipped;
            // if nothing is left to fold, the total is 0.
            let mut total: u64 = 0;
            let mut any = false;
            for (_, lower) in node.populated() {
                if let Ok(s) = self.sb.fs().stat(&lower) {
                    if s.nlink == 0 {
                        continue;
                    }
                    any = true;
                    total += s.nlink.saturating_sub(2).max(2) + 2;
                }
            }
            st.nlink = if any { total } else { 0 };
        }
        Ok(st)
    }

    fn entry_reply(&self, ino: u64, node: &std::sync::Arc<FanoutNode<DirFs>>) -> Result<(std::time::Duration, fuser::FileAttr, u64), i32> {
        let st = self.stat_node(node)?;
        Ok((ATTR_TTL, to_file_attr(ino, &st, None), 0))
    }
}

impl Filesystem for UnionFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if let Err(e) = self.revalidate_ancestors(parent) {
            reply.error(e);
            return;
        }
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = match lookup::lookup(&self.sb, &parent_node, name) {
            Ok(c) => c,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        if child.is_negative() {
            reply.error(libc::ENOENT);
            return;
        }
        let ino = self.inodes.intern(parent, name, child.clone());
        match self.entry_reply(ino, &child) {
            Ok((ttl, attr, gen)) => reply.entry(&ttl, &attr, gen),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.stat_node(&node) {
            Ok(st) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &st, None)),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let parent_ino = self.inodes.parent_ino(ino).unwrap_or(ROOT_INO);
        let chain = self.inodes.parent_chain(parent_ino);
        let name = self.inodes.name_of(ino).unwrap_or_default();
        let attr = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        };
        match ops::setattr(&self.sb, &chain, &name, &node, &attr) {
            Ok(st) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &st, None)),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some((_, top)) = node.top() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.sb.fs().readlink(&top) {
            Ok(text) => reply.data(text.as_encoded_bytes()),
            Err(e) => reply.error(io_errno(e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let chain = self.inodes.parent_chain(parent);
        match ops::mknod(&self.sb, &chain, &parent_node, name, mode & !umask, rdev) {
            Ok(node) => {
                let ino = self.inodes.intern(parent, name, node.clone());
                match self.entry_reply(ino, &node) {
                    Ok((ttl, attr, gen)) => reply.entry(&ttl, &attr, gen),
                    Err(e) => reply.error(e),
                }
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let chain = self.inodes.parent_chain(parent);
        match ops::mkdir(&self.sb, &chain, &parent_node, name, mode & !umask) {
            Ok(node) => {
                let ino = self.inodes.intern(parent, name, node.clone());
                match self.entry_reply(ino, &node) {
                    Ok((ttl, attr, gen)) => reply.entry(&ttl, &attr, gen),
                    Err(e) => reply.error(e),
                }
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = match lookup::lookup(&self.sb, &parent_node, name) {
            Ok(t) => t,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        if target.is_negative() {
            reply.error(libc::ENOENT);
            return;
        }
        let chain = self.inodes.parent_chain(parent);
        let existing_ino = self.inodes.existing_ino(parent, name);
        let has_open_handles = existing_ino
            .map(|ino| self.open_files.lock().values().any(|h| h.ino == ino))
            .unwrap_or(false);
        match ops::unlink(&self.sb, &chain, name, &target, has_open_handles) {
            Ok(()) => {
                if has_open_handles && target.is_positive() {
                    if let (Some(ino), Some((_, silly_path))) = (existing_ino, target.top()) {
                        if let (Some(dir), Some(silly_name)) =
                            (silly_path.parent(), silly_path.file_name())
                        {
                            self.sillied
                                .lock()
                                .insert(ino, (dir.to_path_buf(), silly_name.to_os_string()));
                        }
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = match lookup::lookup(&self.sb, &parent_node, name) {
            Ok(t) => t,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        if target.is_negative() {
            reply.error(libc::ENOENT);
            return;
        }
        let chain = self.inodes.parent_chain(parent);
        match ops::rmdir(&self.sb, &chain, name, &target) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let chain = self.inodes.parent_chain(parent);
        match ops::symlink(&self.sb, &chain, &parent_node, link_name, target.as_os_str()) {
            Ok(node) => {
                let ino = self.inodes.intern(parent, link_name, node.clone());
                match self.entry_reply(ino, &node) {
                    Ok((ttl, attr, gen)) => reply.entry(&ttl, &attr, gen),
                    Err(e) => reply.error(e),
                }
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_node), Some(newparent_node)) =
            (self.inodes.get(parent), self.inodes.get(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let src = match lookup::lookup(&self.sb, &parent_node, name) {
            Ok(s) => s,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        if src.is_negative() {
            reply.error(libc::ENOENT);
            return;
        }
        let src_chain = self.inodes.parent_chain(parent);
        let dst_chain = self.inodes.parent_chain(newparent);
        match ops::rename(&self.sb, &src_chain, name, &src, &dst_chain, &newparent_node, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(src), Some(dst_parent_node)) = (self.inodes.get(ino), self.inodes.get(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let src_parent_ino = self.inodes.parent_ino(ino).unwrap_or(ROOT_INO);
        let src_name = self.inodes.name_of(ino).unwrap_or_default();
        let src_chain = self.inodes.parent_chain(src_parent_ino);
        let dst_chain = self.inodes.parent_chain(newparent);
        match ops::link(&self.sb, &src_chain, &src_name, &src, &dst_chain, &dst_parent_node, newname) {
            Ok(node) => {
                let new_ino = self.inodes.intern(newparent, newname, node.clone());
                match self.entry_reply(new_ino, &node) {
                    Ok((ttl, attr, gen)) => reply.entry(&ttl, &attr, gen),
                    Err(e) => reply.error(e),
                }
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let write = (flags & (libc::O_WRONLY | libc::O_RDWR)) != 0;
        let mut file = match OpenFile::open(&self.sb, &node, write, false) {
            Ok(f) => f,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        let parent_ino = self.inodes.parent_ino(ino).unwrap_or(ROOT_INO);
        let chain = self.inodes.parent_chain(parent_ino);
        let name = self.inodes.name_of(ino).unwrap_or_default();
        if let Err(e) = file.revalidate_file(&self.sb, &chain, &name, &node, write) {
            reply.error(errno(e));
            return;
        }
        let fh = self.next_fh.fetch_add(1, Ordering::AcqRel);
        self.open_files.lock().insert(fh, OpenHandle { file, ino });
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let files = self.open_files.lock();
        let Some(handle) = files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match handle.file.read(&self.sb, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let files = self.open_files.lock();
        let Some(handle) = files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.file.write(&self.sb, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let files = self.open_files.lock();
        match files.get(&fh) {
            Some(handle) => match handle.file.flush(&self.sb) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let closed = self.open_files.lock().remove(&fh);
        if let Some(handle) = closed {
            debug!("release: fh {} (ino {})", fh, handle.ino);
            let ino = handle.ino;
            handle.file.close(&self.sb.branches());
            let still_open = self.open_files.lock().values().any(|h| h.ino == ino);
            if !still_open {
                if let Some((dir, silly_name)) = self.sillied.lock().remove(&ino) {
                    if let Err(e) = finish_silly_rename(&self.sb, &dir, &silly_name) {
                        error!("release: finish_silly_rename for ino {} failed: {}", ino, e);
                    }
                }
            }
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let files = self.open_files.lock();
        match files.get(&fh) {
            Some(handle) => match handle.file.fsync(&self.sb) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match OpenFile::open(&self.sb, &node, false, true) {
            Ok(file) => {
                let fh = self.next_fh.fetch_add(1, Ordering::AcqRel);
                self.open_files.lock().insert(fh, OpenHandle { file, ino });
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(errno(e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut entries: Vec<(OsString, FileType)> = vec![
            (OsString::from("."), FileType::Directory),
            (OsString::from(".."), FileType::Directory),
        ];
        let mut seen: HashSet<OsString> = HashSet::new();
        let mut whited: HashSet<OsString> = HashSet::new();
        for (_, lower) in node.populated() {
            let dirents = match self.sb.fs().readdir(&lower) {
                Ok(d) => d,
                Err(e) => {
                    reply.error(io_errno(e));
                    return;
                }
            };
            for entry in dirents {
                if entry.name.as_os_str() == name::opaque_marker_name() {
                    continue;
                }
                if let Some(behind) = name::name_behind_whiteout(&entry.name) {
                    whited.insert(behind.to_os_string());
                    continue;
                }
                if whited.contains(&entry.name) || !seen.insert(entry.name.clone()) {
                    continue;
                }
                entries.push((entry.name, attr::file_type(entry.kind)));
            }
        }
        // A bare placeholder ino: the kernel re-validates every name through
        // `lookup` before trusting it, so an inexact d_ino here only affects
        // `d_type` fast paths, not correctness.
        for (i, (entry_name, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &entry_name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        if let Some(handle) = self.open_files.lock().remove(&fh) {
            handle.file.close(&self.sb.branches());
        }
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let files = self.open_files.lock();
        match files.get(&fh) {
            Some(handle) => match handle.file.fsync(&self.sb) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno(e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let branches = self.sb.branches();
        let Some(branch) = branches.get(0) else {
            reply.error(libc::EIO);
            return;
        };
        let path = branch.path().to_path_buf();
        drop(branches);
        match statvfs(&path) {
            Ok(vfs) => reply.statfs(
                vfs.f_blocks,
                vfs.f_bfree,
                vfs.f_bavail,
                vfs.f_files,
                vfs.f_ffree,
                vfs.f_bsize as u32,
                255,
                vfs.f_frsize as u32,
            ),
            Err(e) => reply.error(io_errno(e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(node) = self.inodes.get(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if mask == libc::F_OK {
            reply.ok();
            return;
        }
        match ops::permission(&self.sb, &node, AccessMask(mask as u32), false) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(e)),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_node) = self.inodes.get(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let chain = self.inodes.parent_chain(parent);
        let node = match ops::create(&self.sb, &chain, &parent_node, name, mode & !umask) {
            Ok(n) => n,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        let write = (flags & (libc::O_WRONLY | libc::O_RDWR)) != 0;
        let file = match OpenFile::open(&self.sb, &node, write, false) {
            Ok(f) => f,
            Err(e) => {
                reply.error(errno(e));
                return;
            }
        };
        let ino = self.inodes.intern(parent, name, node.clone());
        let fh = self.next_fh.fetch_add(1, Ordering::AcqRel);
        self.open_files.lock().insert(fh, OpenHandle { file, ino });
        match self.entry_reply(ino, &node) {
            Ok((ttl, attr, gen)) => reply.created(&ttl, &attr, gen, fh, 0),
            Err(e) => reply.error(e),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        _in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        match cmd {
            UNIONFS_IOC_BRANCHES => {
                let files = self.open_files.lock();
                let Some(handle) = files.get(&fh) else {
                    reply.error(libc::EBADF);
                    return;
                };
                let mask = handle.file.branch_mask(&self.sb.branches());
                let bytes = mask.to_le_bytes();
                let take = (out_size as usize).min(bytes.len());
                reply.ioctl(0, &bytes[..take]);
            }
            UNIONFS_IOC_RELOAD_LEGACY => reply.error(libc::ENOTTY),
            _ => reply.error(libc::ENOTTY),
        }
    }
}

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

struct Statvfs {
    f_blocks: u64,
    f_bfree: u64,
    f_bavail: u64,
    f_files: u64,
    f_ffree: u64,
    f_bsize: u64,
    f_frsize: u64,
}

fn statvfs(path: &Path) -> std::io::Result<Statvfs> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let mut raw: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut raw) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(Statvfs {
        f_blocks: raw.f_blocks,
        f_bfree: raw.f_bfree,
        f_bavail: raw.f_bavail,
        f_files: raw.f_files,
        f_ffree: raw.f_ffree,
        f_bsize: raw.f_bsize as u64,
        f_frsize: raw.f_frsize as u64,
    })
}

fn build_superblock(dirs_spec: &str) -> std::io::Result<Superblock<DirFs>> {
    let specs = BranchSpec::parse_list(dirs_spec)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    unionfs_core::branch::validate(&specs)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let roots = specs
        .into_iter()
        .map(|s| (s.path.clone(), s.path, s.perms))
        .collect::<Vec<(std::path::PathBuf, std::path::PathBuf, Perms)>>();
    let table = BranchTable::new(roots)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    Ok(Superblock::new(DirFs, table))
}

fn main() {
    env_logger::init();
    let args = cli::Args::parse();

    let sb = match build_superblock(&args.dirs) {
        Ok(sb) => sb,
        Err(e) => {
            error!("invalid branch specification: {e}");
            std::process::exit(1);
        }
    };

    let mut options = vec![MountOption::FSName("unionfs".to_string())];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }
    if args.debug {
        options.push(MountOption::CUSTOM("debug".to_string()));
    }

    info!("mounting {} branches at {:?}", sb.branches().len(), args.mountpoint);
    let fs = UnionFs::new(sb);
    if let Err(e) = fuser::mount2(fs, &args.mountpoint, &options) {
        error!("mount failed: {e}");
        std::process::exit(1);
    }
}
