//! [`LowerFs`] implementation over real directories on the host's own
//! filesystem — the Directory Interface collaborator every branch of a
//! union mount is stacked on top of.

use std::ffi::{OsStr, OsString};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::SystemTime;

use unionfs_core::directory::{AccessMask, FileKind, LowerDirent, LowerFs, NodeStat, SetAttr};

/// A branch root and every object under it are addressed by their path.
/// Open files are plain `std::fs::File`s. No caching is done here; every
/// call goes straight to the syscall, the same way `unionfs-core`'s own
/// `LowerFs` expects.
#[derive(Debug, Clone, Copy)]
pub struct DirFs;

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
        ctime: ctime_of(&md),
        rdev: md.rdev() as u32,
        ino: md.ino(),
    }
}

#[cfg(target_os = "linux")]
fn ctime_of(md: &fs::Metadata) -> SystemTime {
    let secs = md.ctime();
    let nsecs = md.ctime_nsec() as u32;
    SystemTime::UNIX_EPOCH + std::time::Duration::new(secs.max(0) as u64, nsecs)
}

#[cfg(not(target_os = "linux"))]
fn ctime_of(md: &fs::Metadata) -> SystemTime {
    md.modified().unwrap_or(SystemTime::UNIX_EPOCH)
}

fn to_cstring(path: &std::path::Path) -> io::Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

fn to_timespec(t: SystemTime) -> libc::timespec {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as i64,
        },
        Err(_) => libc::timespec { tv_sec: 0, tv_nsec: 0 },
    }
}

impl LowerFs for DirFs {
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
        let cpath = to_cstring(&path)?;
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
        let cpath = to_cstring(node)?;
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
        if attr.uid.is_some() || attr.gid.is_some() {
            let cpath = to_cstring(node)?;
            let uid = attr.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
            let gid = attr.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
            let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if let Some(size) = attr.size {
            let f = OpenOptions::new().write(true).open(node)?;
            f.set_len(size)?;
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            let existing = fs::symlink_metadata(node)?;
            let atime = attr.atime.unwrap_or_else(|| existing.accessed().unwrap_or(SystemTime::now()));
            let mtime = attr.mtime.unwrap_or_else(|| existing.modified().unwrap_or(SystemTime::now()));
            let cpath = to_cstring(node)?;
            let times = [to_timespec(atime), to_timespec(mtime)];
            let rc = unsafe { libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
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
