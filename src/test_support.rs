//! A `LowerFs` implementation backed by real directories on the host's own
//! filesystem, used by this crate's unit tests and by the integration tests
//! under `tests/`. Not gated behind `cfg(test)` so external integration
//! tests (which compile this crate as a normal dependency) can reach it.

use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::branch::{BranchTable, Perms};
use crate::directory::{AccessMask, FileKind, LowerDirent, LowerFs, NodeStat, SetAttr};
use crate::fanout::FanoutNode;
use crate::superblock::Superblock;

/// A [`LowerFs`] whose nodes are plain paths and whose files are plain
/// `std::fs::File`s. Intended for tests only — it does no caching and does
/// none of the privilege-separation a real mount would need.
#[derive(Debug, Clone, Copy)]
pub struct LocalFs;

fn kind_of(md: &fs::Metadata) -> FileKind {
    let ft = md.file_type();
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_file() {
        FileKind::RegularFile
    } else {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else {
            FileKind::Socket
        }
    }
}

fn to_stat(md: fs::Metadata) -> NodeStat {
    NodeStat {
        kind: kind_of(&md),
        mode: md.mode(),
        uid: md.uid(),
        gid: md.gid(),
        size: md.len(),
        nlink: md.nlink(),
        mtime: md.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        ctime: md
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH), // std has no portable ctime accessor
        rdev: md.rdev() as u32,
        ino: md.ino(),
    }
}

impl LowerFs for LocalFs {
    type Node = PathBuf;
    type File = fs::File;

    fn lookup(&self, dir: &PathBuf, name: &OsStr) -> io::Result<Option<PathBuf>> {
        let path = dir.join(name);
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(Some(path)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stat(&self, node: &PathBuf) -> io::Result<NodeStat> {
        Ok(to_stat(fs::symlink_metadata(node)?))
    }

    fn create(&self, dir: &PathBuf, name: &OsStr, mode: u32) -> io::Result<PathBuf> {
        let path = dir.join(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)?;
        Ok(path)
    }

    fn mkdir(&self, dir: &PathBuf, name: &OsStr, mode: u32) -> io::Result<PathBuf> {
        let path = dir.join(name);
        fs::create_dir(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        Ok(path)
    }

    fn symlink(&self, dir: &PathBuf, name: &OsStr, target: &OsStr) -> io::Result<PathBuf> {
        let path = dir.join(name);
        std::os::unix::fs::symlink(target, &path)?;
        Ok(path)
    }

    fn mknod(&self, dir: &PathBuf, name: &OsStr, mode: u32, rdev: u32) -> io::Result<PathBuf> {
        let path = dir.join(name);
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let rc = unsafe { libc::mknod(cpath.as_ptr(), mode, rdev as libc::dev_t) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(path)
    }

    fn link(&self, dir: &PathBuf, name: &OsStr, target: &PathBuf) -> io::Result<PathBuf> {
        let path = dir.join(name);
        fs::hard_link(target, &path)?;
        Ok(path)
    }

    fn unlink(&self, dir: &PathBuf, name: &OsStr) -> io::Result<()> {
        fs::remove_file(dir.join(name))
    }

    fn rmdir(&self, dir: &PathBuf, name: &OsStr) -> io::Result<()> {
        fs::remove_dir(dir.join(name))
    }

    fn rename(
        &self,
        src_dir: &PathBuf,
        src_name: &OsStr,
        dst_dir: &PathBuf,
        dst_name: &OsStr,
    ) -> io::Result<()> {
        fs::rename(src_dir.join(src_name), dst_dir.join(dst_name))
    }

    fn readlink(&self, node: &PathBuf) -> io::Result<OsString> {
        Ok(fs::read_link(node)?.into_os_string())
    }

    fn readdir(&self, dir: &PathBuf) -> io::Result<Vec<LowerDirent>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let kind = kind_of(&entry.metadata()?);
            out.push(LowerDirent {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(out)
    }

    fn permission(&self, node: &PathBuf, mask: AccessMask) -> io::Result<()> {
        let mut amode = 0;
        if mask.0 & AccessMask::READ.0 != 0 {
            amode |= libc::R_OK;
        }
        if mask.0 & AccessMask::WRITE.0 != 0 {
            amode |= libc::W_OK;
        }
        if mask.0 & AccessMask::EXEC.0 != 0 {
            amode |= libc::X_OK;
        }
        let cpath = std::ffi::CString::new(node.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let rc = unsafe { libc::access(cpath.as_ptr(), amode) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn notify_change(&self, node: &PathBuf, attr: &SetAttr) -> io::Result<()> {
        if let Some(mode) = attr.mode {
            fs::set_permissions(node, fs::Permissions::from_mode(mode))?;
        }
        if let Some(size) = attr.size {
            let f = OpenOptions::new().write(true).open(node)?;
            f.set_len(size)?;
        }
        Ok(())
    }

    fn truncate(&self, node: &PathBuf, size: u64) -> io::Result<()> {
        let f = OpenOptions::new().write(true).open(node)?;
        f.set_len(size)
    }

    fn open(&self, node: &PathBuf, write: bool) -> io::Result<fs::File> {
        OpenOptions::new().read(true).write(write).open(node)
    }

    fn read(&self, file: &fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        file.read_at(buf, offset)
    }

    fn write(&self, file: &fs::File, offset: u64, buf: &[u8]) -> io::Result<usize> {
        file.write_at(buf, offset)
    }

    fn fsync(&self, file: &fs::File) -> io::Result<()> {
        file.sync_all()
    }

    fn flush(&self, _file: &fs::File) -> io::Result<()> {
        Ok(())
    }
}

/// Builds a positive fan-out node for the root of every branch (the
/// `LocalFs` root nodes are just the branch root paths themselves).
pub fn root_node(sb: &Superblock<LocalFs>) -> Arc<FanoutNode<LocalFs>> {
    let branches = sb.branches();
    let lower: Vec<Option<PathBuf>> = branches.iter().map(|b| Some(b.root().clone())).collect();
    let end = branches.len() - 1;
    drop(branches);
    FanoutNode::positive(lower.len(), 0, end, None, lower).expect("root fan-out is well-formed")
}

/// Convenience constructor for a [`Superblock<LocalFs>`] over a list of
/// `(path, perms)` branch roots, used throughout the test suite.
pub fn superblock(dirs: &[(PathBuf, Perms)]) -> Superblock<LocalFs> {
    let roots = dirs
        .iter()
        .map(|(p, perms)| (p.clone(), p.clone(), *perms))
        .collect();
    let table = BranchTable::new(roots).expect("valid branch table");
    Superblock::new(LocalFs, table)
}
