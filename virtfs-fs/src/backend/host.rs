use super::{DirEntry, FileSystem, FileType, OpenFlags, Result, SetTime, Stat, StatFs};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
#[cfg(any(target_os = "linux", target_os = "android"))]
use rustix::fd::AsRawFd;
use rustix::fs::{cwd, AtFlags, Mode, OFlags};
use rustix::process::{Gid, RawGid, RawUid, Uid};
use std::ffi::OsStr;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use virtfs_constants::error::Error;

/// An open directory with a seekable position.
///
/// Positions are entry counts from the start of the stream, so they stay valid across a reopen
/// of the same directory as long as it is not modified.  The last entry read is kept so that
/// backing up by one entry does not require a rescan.
pub struct DirStream {
    dir: rustix::fs::Dir,
    pos: u64,
    last: Option<DirEntry>,
    replay: bool,
}

impl DirStream {
    fn new(dir: rustix::fs::Dir) -> Self {
        DirStream {
            dir,
            pos: 0,
            last: None,
            replay: false,
        }
    }

    /// The number of entries consumed so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        if self.replay {
            self.replay = false;
            self.pos += 1;
            return Ok(self.last.clone());
        }
        match self.dir.read() {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(entry)) => {
                self.pos += 1;
                let ent = DirEntry {
                    name: entry.file_name().to_bytes().to_vec(),
                    ino: entry.ino() as u64,
                    kind: FileType::from_unix(entry.file_type()).dirent_type(),
                    offset: self.pos,
                };
                self.last = Some(ent.clone());
                Ok(Some(ent))
            }
        }
    }

    fn rewind(&mut self) {
        self.dir.rewind();
        self.pos = 0;
        self.last = None;
        self.replay = false;
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos == self.pos {
            return Ok(());
        }
        if pos + 1 == self.pos && self.last.is_some() && !self.replay {
            self.pos = pos;
            self.replay = true;
            return Ok(());
        }
        if pos < self.pos {
            self.rewind();
        }
        while self.pos < pos {
            if self.next_entry()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// The host file system, exported from `root`.
///
/// Export paths are never handed to the host whole.  Each directory on the way is opened
/// relative to the one before it, starting at the root, and no symlink is followed, so a
/// symlink anywhere in the export cannot lead a call outside it.  The final component is then
/// operated on with the `*at` form of each call.
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        HostFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The names making up an export path.  Only normal components count; callers resolve
    /// `..` before building a path.
    fn names(path: &Path) -> Vec<&OsStr> {
        path.components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Flags that open a file just to refer to it, without following a symlink.
    fn pin_flags() -> OFlags {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let base = OFlags::PATH;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let base = OFlags::RDONLY | OFlags::NONBLOCK;
        base | OFlags::NOFOLLOW | OFlags::CLOEXEC
    }

    /// Opens the directory holding the last component of `path`, returning it together with
    /// that component.  The root itself is `.` in the root.
    fn parent_of<'a>(&self, path: &'a Path) -> Result<(OwnedFd, &'a OsStr)> {
        let walk = Self::pin_flags() | OFlags::DIRECTORY;
        let mut dir = rustix::fs::openat(cwd(), &self.root, walk, Mode::empty())?;
        let names = Self::names(path);
        let (last, inner) = match names.split_last() {
            Some((last, inner)) => (*last, inner),
            None => return Ok((dir, OsStr::new("."))),
        };
        for name in inner {
            dir = rustix::fs::openat(&dir, *name, walk, Mode::empty())?;
        }
        Ok((dir, last))
    }

    /// Names an open file through procfs, for calls with no descriptor-relative form.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn proc_path(fd: &OwnedFd) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
    }

    /// A path the path-only xattr calls can use for `path`.  The returned descriptor must be
    /// kept open while the path is in use.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn xattr_path(&self, path: &Path) -> Result<(OwnedFd, PathBuf)> {
        let (dir, name) = self.parent_of(path)?;
        let full = Self::proc_path(&dir).join(name);
        Ok((dir, full))
    }

    #[cfg(target_os = "macos")]
    fn xattr_path(&self, path: &Path) -> Result<(OwnedFd, PathBuf)> {
        let (dir, _) = self.parent_of(path)?;
        let mut full = self.root.clone();
        full.extend(Self::names(path));
        Ok((dir, full))
    }

    fn mode(mode: u32) -> Mode {
        Mode::from_bits_truncate((mode & 0o7777) as rustix::fs::RawMode)
    }

    fn timespec(t: SetTime) -> rustix::fs::Timespec {
        match t {
            SetTime::At { sec, nsec } => rustix::fs::Timespec {
                tv_sec: sec as rustix::fs::Secs,
                tv_nsec: nsec as rustix::fs::Nsecs,
            },
            SetTime::Now => rustix::fs::Timespec {
                tv_sec: 0,
                tv_nsec: rustix::fs::UTIME_NOW,
            },
            SetTime::Omit => rustix::fs::Timespec {
                tv_sec: 0,
                tv_nsec: rustix::fs::UTIME_OMIT,
            },
        }
    }

    fn open_nofollow(&self, path: &Path, flags: OFlags, mode: u32) -> Result<OwnedFd> {
        let (dir, name) = self.parent_of(path)?;
        Ok(rustix::fs::openat(
            &dir,
            name,
            flags | OFlags::NOFOLLOW | OFlags::CLOEXEC | OFlags::NOCTTY,
            Self::mode(mode),
        )?)
    }

    /// `fchmodat` always follows a final symlink, so the file is pinned first and changed
    /// through procfs.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn chmod_at(dir: &OwnedFd, name: &OsStr, mode: Mode) -> Result<()> {
        let fd = rustix::fs::openat(dir, name, Self::pin_flags(), Mode::empty())?;
        let st = rustix::fs::fstat(&fd)?;
        if rustix::fs::FileType::from_raw_mode(st.st_mode as rustix::fs::RawMode)
            == rustix::fs::FileType::Symlink
        {
            return Err(Error::ELOOP);
        }
        Ok(rustix::fs::chmodat(cwd(), Self::proc_path(&fd), mode)?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn chmod_at(dir: &OwnedFd, name: &OsStr, mode: Mode) -> Result<()> {
        let st = rustix::fs::statat(dir, name, AtFlags::SYMLINK_NOFOLLOW)?;
        if rustix::fs::FileType::from_raw_mode(st.st_mode as rustix::fs::RawMode)
            == rustix::fs::FileType::Symlink
        {
            return Err(Error::ELOOP);
        }
        Ok(rustix::fs::chmodat(dir, name, mode)?)
    }
}

impl FileSystem for HostFs {
    fn lstat(&self, path: &Path) -> Result<Stat> {
        let (dir, name) = self.parent_of(path)?;
        let st = rustix::fs::statat(&dir, name, AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(Stat::from_unix(&st))
    }

    fn fstat(&self, fd: BorrowedFd<'_>) -> Result<Stat> {
        Ok(Stat::from_unix(&rustix::fs::fstat(fd)?))
    }

    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<OwnedFd> {
        self.open_nofollow(path, flags.to_unix(), mode)
    }

    fn close(&self, fd: OwnedFd) {
        drop(fd);
    }

    fn opendir(&self, path: &Path) -> Result<DirStream> {
        let fd = self.open_nofollow(path, OFlags::RDONLY | OFlags::DIRECTORY, 0)?;
        let dir = rustix::fs::Dir::read_from(fd.as_fd())?;
        Ok(DirStream::new(dir))
    }

    fn readdir(&self, dir: &mut DirStream) -> Result<Option<DirEntry>> {
        dir.next_entry()
    }

    fn rewinddir(&self, dir: &mut DirStream) {
        dir.rewind()
    }

    fn seekdir(&self, dir: &mut DirStream, pos: u64) -> Result<()> {
        dir.seek(pos)
    }

    fn telldir(&self, dir: &DirStream) -> u64 {
        dir.pos
    }

    fn closedir(&self, dir: DirStream) {
        drop(dir);
    }

    fn preadv(
        &self,
        fd: BorrowedFd<'_>,
        bufs: &mut [IoSliceMut<'_>],
        offset: u64,
    ) -> Result<usize> {
        Ok(rustix::io::preadv(fd, bufs, offset)?)
    }

    fn pwritev(&self, fd: BorrowedFd<'_>, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
        Ok(rustix::io::pwritev(fd, bufs, offset)?)
    }

    fn fsync(&self, fd: BorrowedFd<'_>, datasync: bool) -> Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if datasync {
                return Ok(rustix::fs::fdatasync(fd)?);
            }
        }
        let _ = datasync;
        Ok(rustix::fs::fsync(fd)?)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        Ok(rustix::fs::mkdirat(&dir, name, Self::mode(mode))?)
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn mknod(&self, path: &Path, mode: u32, major: u32, minor: u32) -> Result<()> {
        let ft = FileType::from_mode(mode).to_unix();
        if ft == rustix::fs::FileType::Unknown || ft == rustix::fs::FileType::Directory {
            return Err(Error::EINVAL);
        }
        let (dir, name) = self.parent_of(path)?;
        Ok(rustix::fs::mknodat(
            &dir,
            name,
            ft,
            Self::mode(mode),
            rustix::fs::makedev(major, minor),
        )?)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn mknod(&self, _path: &Path, _mode: u32, _major: u32, _minor: u32) -> Result<()> {
        Err(Error::EOPNOTSUPP)
    }

    fn symlink(&self, target: &[u8], path: &Path) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        Ok(rustix::fs::symlinkat(OsStr::from_bytes(target), &dir, name)?)
    }

    fn link(&self, old: &Path, new: &Path) -> Result<()> {
        let (old_dir, old_name) = self.parent_of(old)?;
        let (new_dir, new_name) = self.parent_of(new)?;
        Ok(rustix::fs::linkat(
            &old_dir,
            old_name,
            &new_dir,
            new_name,
            AtFlags::empty(),
        )?)
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        let (old_dir, old_name) = self.parent_of(old)?;
        let (new_dir, new_name) = self.parent_of(new)?;
        Ok(rustix::fs::renameat(&old_dir, old_name, &new_dir, new_name)?)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let is_dir = self.lstat(path)?.is_dir();
        self.unlink(path, is_dir)
    }

    fn unlink(&self, path: &Path, remove_dir: bool) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        let flags = if remove_dir {
            AtFlags::REMOVEDIR
        } else {
            AtFlags::empty()
        };
        Ok(rustix::fs::unlinkat(&dir, name, flags)?)
    }

    fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let fd = self.open_nofollow(path, OFlags::WRONLY, 0)?;
        Ok(rustix::fs::ftruncate(&fd, size)?)
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        Self::chmod_at(&dir, name, Self::mode(mode))
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        // SAFETY: the raw ids come straight from the client and are only passed to the kernel.
        let (uid, gid) = unsafe {
            (
                uid.map(|u| Uid::from_raw(u as RawUid)),
                gid.map(|g| Gid::from_raw(g as RawGid)),
            )
        };
        Ok(rustix::fs::chownat(
            &dir,
            name,
            uid,
            gid,
            AtFlags::SYMLINK_NOFOLLOW,
        )?)
    }

    fn utimens(&self, path: &Path, atime: SetTime, mtime: SetTime) -> Result<()> {
        let (dir, name) = self.parent_of(path)?;
        let times = rustix::fs::Timestamps {
            last_access: Self::timespec(atime),
            last_modification: Self::timespec(mtime),
        };
        Ok(rustix::fs::utimensat(
            &dir,
            name,
            &times,
            AtFlags::SYMLINK_NOFOLLOW,
        )?)
    }

    fn statfs(&self, path: &Path) -> Result<StatFs> {
        let (dir, name) = self.parent_of(path)?;
        let fd = rustix::fs::openat(&dir, name, Self::pin_flags(), Mode::empty())?;
        let vfs = rustix::fs::fstatvfs(&fd)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let fs_type = rustix::fs::fstatfs(&fd)?.f_type as u32;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let fs_type = 0;
        Ok(StatFs {
            fs_type,
            bsize: vfs.f_bsize as u32,
            blocks: vfs.f_blocks as u64,
            bfree: vfs.f_bfree as u64,
            bavail: vfs.f_bavail as u64,
            files: vfs.f_files as u64,
            ffree: vfs.f_ffree as u64,
            fsid: vfs.f_fsid as u64,
            namelen: vfs.f_namemax as u32,
        })
    }

    fn readlink(&self, path: &Path) -> Result<Vec<u8>> {
        let (dir, name) = self.parent_of(path)?;
        Ok(rustix::fs::readlinkat(&dir, name, Vec::new())?.into_bytes())
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    fn getxattr(&self, path: &Path, name: &[u8]) -> Result<Vec<u8>> {
        let (_dir, full) = self.xattr_path(path)?;
        let name = OsStr::from_bytes(name);
        loop {
            let size = rustix::fs::lgetxattr(&full, name, &mut [])?;
            let mut buf = vec![0u8; size];
            match rustix::fs::lgetxattr(&full, name, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                // The value grew between the two calls.
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    fn listxattr(&self, path: &Path) -> Result<Vec<u8>> {
        let (_dir, full) = self.xattr_path(path)?;
        loop {
            let size = rustix::fs::llistxattr(&full, &mut [])?;
            let mut buf = vec![0u8; size];
            match rustix::fs::llistxattr(&full, &mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    fn setxattr(&self, path: &Path, name: &[u8], value: &[u8], flags: u32) -> Result<()> {
        let (_dir, full) = self.xattr_path(path)?;
        let flags = rustix::fs::XattrFlags::from_bits(flags as _).ok_or(Error::EINVAL)?;
        Ok(rustix::fs::lsetxattr(
            &full,
            OsStr::from_bytes(name),
            value,
            flags,
        )?)
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    fn removexattr(&self, path: &Path, name: &[u8]) -> Result<()> {
        let (_dir, full) = self.xattr_path(path)?;
        Ok(rustix::fs::lremovexattr(&full, OsStr::from_bytes(name))?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    fn getxattr(&self, _path: &Path, _name: &[u8]) -> Result<Vec<u8>> {
        Err(Error::EOPNOTSUPP)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    fn listxattr(&self, _path: &Path) -> Result<Vec<u8>> {
        Err(Error::EOPNOTSUPP)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    fn setxattr(&self, _path: &Path, _name: &[u8], _value: &[u8], _flags: u32) -> Result<()> {
        Err(Error::EOPNOTSUPP)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    fn removexattr(&self, _path: &Path, _name: &[u8]) -> Result<()> {
        Err(Error::EOPNOTSUPP)
    }
}
