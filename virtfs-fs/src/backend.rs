#![allow(clippy::unnecessary_cast)]

use bitflags::bitflags;
use std::io::{IoSlice, IoSliceMut};
use std::path::Path;
use virtfs_constants::error::Error;

#[cfg(feature = "unix")]
use rustix::fd::{BorrowedFd, OwnedFd};

#[cfg(feature = "unix")]
pub mod host;

pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Open flags, using the Linux values that 9P2000.L carries on the wire.
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_ACCMODE = 0o3;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_NOCTTY = 0o400;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_NONBLOCK = 0o4000;
        const O_DSYNC = 0o10000;
        const O_ASYNC = 0o20000;
        const O_DIRECT = 0o40000;
        const O_LARGEFILE = 0o100000;
        const O_DIRECTORY = 0o200000;
        const O_NOFOLLOW = 0o400000;
        const O_NOATIME = 0o1000000;
        const O_CLOEXEC = 0o2000000;
        const O_SYNC = 0o4010000;
    }

    pub struct FileType: u32 {
        const S_IFMT  = 0o170000;
        const S_IFDIR = 0o040000;
        const S_IFCHR = 0o020000;
        const S_IFBLK = 0o060000;
        const S_IFREG = 0o100000;
        const S_IFIFO = 0o010000;
        const S_IFLNK = 0o120000;
        const S_IFSOCK = 0o140000;
        // Permission bits, so that from_bits_truncate keeps them.
        const S_ISUID = 0o4000;
        const S_ISGID = 0o2000;
        const S_ISVTX = 0o1000;
        const S_IRWXU = 0o0700;
        const S_IRWXG = 0o0070;
        const S_IRWXO = 0o0007;
    }
}

impl OpenFlags {
    pub fn is_exclusive_create(self) -> bool {
        self.contains(Self::O_CREAT | Self::O_EXCL)
    }

    #[cfg(feature = "unix")]
    pub fn to_unix(self) -> rustix::fs::OFlags {
        use rustix::fs::OFlags;
        let mut val = match self & Self::O_ACCMODE {
            x if x == Self::O_WRONLY => OFlags::WRONLY,
            x if x == Self::O_RDWR => OFlags::RDWR,
            _ => OFlags::RDONLY,
        };
        let table = [
            (Self::O_CREAT, OFlags::CREATE),
            (Self::O_EXCL, OFlags::EXCL),
            (Self::O_NOCTTY, OFlags::NOCTTY),
            (Self::O_TRUNC, OFlags::TRUNC),
            (Self::O_APPEND, OFlags::APPEND),
            (Self::O_NONBLOCK, OFlags::NONBLOCK),
            (Self::O_DSYNC, OFlags::DSYNC),
            (Self::O_DIRECTORY, OFlags::DIRECTORY),
            (Self::O_NOFOLLOW, OFlags::NOFOLLOW),
            (Self::O_CLOEXEC, OFlags::CLOEXEC),
            (Self::O_SYNC, OFlags::SYNC),
        ];
        for (ours, theirs) in table.iter() {
            if self.contains(*ours) {
                val |= *theirs;
            }
        }
        #[cfg(target_os = "linux")]
        {
            if self.contains(Self::O_NOATIME) {
                val |= OFlags::NOATIME;
            }
            if self.contains(Self::O_DIRECT) {
                val |= OFlags::DIRECT;
            }
        }
        val
    }
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode)
    }

    pub fn kind(self) -> FileType {
        self & Self::S_IFMT
    }

    pub fn permissions(self) -> u32 {
        self.bits() & 0o7777
    }

    /// The `d_type` value a directory entry of this type carries.
    pub fn dirent_type(self) -> u8 {
        match self.kind() {
            Self::S_IFIFO => 1,
            Self::S_IFCHR => 2,
            Self::S_IFDIR => 4,
            Self::S_IFBLK => 6,
            Self::S_IFREG => 8,
            Self::S_IFLNK => 10,
            Self::S_IFSOCK => 12,
            _ => 0,
        }
    }

    #[cfg(feature = "unix")]
    pub fn from_unix(kind: rustix::fs::FileType) -> Self {
        match kind {
            rustix::fs::FileType::Socket => Self::S_IFSOCK,
            rustix::fs::FileType::Symlink => Self::S_IFLNK,
            rustix::fs::FileType::BlockDevice => Self::S_IFBLK,
            rustix::fs::FileType::CharacterDevice => Self::S_IFCHR,
            rustix::fs::FileType::Fifo => Self::S_IFIFO,
            rustix::fs::FileType::Directory => Self::S_IFDIR,
            rustix::fs::FileType::RegularFile => Self::S_IFREG,
            _ => Self::empty(),
        }
    }

    #[cfg(feature = "unix")]
    pub fn to_unix(self) -> rustix::fs::FileType {
        match self.kind() {
            Self::S_IFSOCK => rustix::fs::FileType::Socket,
            Self::S_IFLNK => rustix::fs::FileType::Symlink,
            Self::S_IFBLK => rustix::fs::FileType::BlockDevice,
            Self::S_IFCHR => rustix::fs::FileType::CharacterDevice,
            Self::S_IFIFO => rustix::fs::FileType::Fifo,
            Self::S_IFDIR => rustix::fs::FileType::Directory,
            Self::S_IFREG => rustix::fs::FileType::RegularFile,
            _ => rustix::fs::FileType::Unknown,
        }
    }
}

/// Metadata about a host file, as returned by `lstat`.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
}

impl Stat {
    #[cfg(all(feature = "unix", not(target_os = "netbsd")))]
    pub(crate) fn from_unix(meta: &rustix::fs::Stat) -> Self {
        Self {
            dev: meta.st_dev as u64,
            ino: meta.st_ino as u64,
            mode: meta.st_mode as u32,
            nlink: meta.st_nlink as u64,
            uid: meta.st_uid as u32,
            gid: meta.st_gid as u32,
            rdev: meta.st_rdev as u64,
            size: meta.st_size as u64,
            blksize: meta.st_blksize as u64,
            blocks: meta.st_blocks as u64,
            atime_sec: meta.st_atime as u64,
            atime_nsec: meta.st_atime_nsec as u64,
            mtime_sec: meta.st_mtime as u64,
            mtime_nsec: meta.st_mtime_nsec as u64,
            ctime_sec: meta.st_ctime as u64,
            ctime_nsec: meta.st_ctime_nsec as u64,
        }
    }

    #[cfg(all(feature = "unix", target_os = "netbsd"))]
    pub(crate) fn from_unix(meta: &rustix::fs::Stat) -> Self {
        Self {
            dev: meta.st_dev as u64,
            ino: meta.st_ino as u64,
            mode: meta.st_mode as u32,
            nlink: meta.st_nlink as u64,
            uid: meta.st_uid as u32,
            gid: meta.st_gid as u32,
            rdev: meta.st_rdev as u64,
            size: meta.st_size as u64,
            blksize: meta.st_blksize as u64,
            blocks: meta.st_blocks as u64,
            atime_sec: meta.st_atime as u64,
            atime_nsec: meta.st_atimensec as u64,
            mtime_sec: meta.st_mtime as u64,
            mtime_nsec: meta.st_mtimensec as u64,
            ctime_sec: meta.st_ctime as u64,
            ctime_nsec: meta.st_ctimensec as u64,
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode).kind()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        matches!(self.file_type(), FileType::S_IFBLK | FileType::S_IFCHR)
    }

    #[cfg(feature = "unix")]
    pub fn major(&self) -> u32 {
        rustix::fs::major(self.rdev as rustix::fs::Dev)
    }

    #[cfg(feature = "unix")]
    pub fn minor(&self) -> u32 {
        rustix::fs::minor(self.rdev as rustix::fs::Dev)
    }
}

/// File system statistics, in the shape `Rstatfs` wants them.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct StatFs {
    pub fs_type: u32,
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub fsid: u64,
    pub namelen: u32,
}

/// One entry read from a directory stream.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: u64,
    /// The `d_type` of the entry.
    pub kind: u8,
    /// The stream position just past this entry, usable with `seekdir`.
    pub offset: u64,
}

/// A timestamp argument to `utimens`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum SetTime {
    Omit,
    Now,
    At { sec: u64, nsec: u64 },
}

/// Blocking host file system operations.
///
/// Paths are absolute and rooted at the export, so `/` is the export root.  Implementations map
/// them onto the host namespace.  Every method may run on a worker thread and fails with a Linux
/// error code.
#[cfg(feature = "unix")]
pub trait FileSystem: Send + Sync {
    /// Stats `path` without following a final symlink.
    fn lstat(&self, path: &Path) -> Result<Stat>;
    fn fstat(&self, fd: BorrowedFd<'_>) -> Result<Stat>;
    /// Opens `path`, creating it with `mode` if `flags` contains `O_CREAT`.
    ///
    /// A final symlink is never followed.
    fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> Result<OwnedFd>;
    fn close(&self, fd: OwnedFd);

    fn opendir(&self, path: &Path) -> Result<host::DirStream>;
    /// Reads the next entry, or `None` at the end of the stream.
    fn readdir(&self, dir: &mut host::DirStream) -> Result<Option<DirEntry>>;
    fn rewinddir(&self, dir: &mut host::DirStream);
    fn seekdir(&self, dir: &mut host::DirStream, pos: u64) -> Result<()>;
    fn telldir(&self, dir: &host::DirStream) -> u64;
    fn closedir(&self, dir: host::DirStream);

    fn preadv(&self, fd: BorrowedFd<'_>, bufs: &mut [IoSliceMut<'_>], offset: u64)
        -> Result<usize>;
    fn pwritev(&self, fd: BorrowedFd<'_>, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize>;
    fn fsync(&self, fd: BorrowedFd<'_>, datasync: bool) -> Result<()>;

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;
    /// Creates a special file; `mode` carries both the file type and permissions.
    fn mknod(&self, path: &Path, mode: u32, major: u32, minor: u32) -> Result<()>;
    fn symlink(&self, target: &[u8], path: &Path) -> Result<()>;
    fn link(&self, old: &Path, new: &Path) -> Result<()>;
    fn rename(&self, old: &Path, new: &Path) -> Result<()>;
    /// Removes a file or an empty directory, whichever `path` is.
    fn remove(&self, path: &Path) -> Result<()>;
    fn unlink(&self, path: &Path, remove_dir: bool) -> Result<()>;
    fn truncate(&self, path: &Path, size: u64) -> Result<()>;
    fn chmod(&self, path: &Path, mode: u32) -> Result<()>;
    /// Changes ownership without following a final symlink.
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
    fn utimens(&self, path: &Path, atime: SetTime, mtime: SetTime) -> Result<()>;
    fn statfs(&self, path: &Path) -> Result<StatFs>;
    fn readlink(&self, path: &Path) -> Result<Vec<u8>>;

    fn getxattr(&self, path: &Path, name: &[u8]) -> Result<Vec<u8>>;
    /// Lists attribute names, each terminated by a NUL byte.
    fn listxattr(&self, path: &Path) -> Result<Vec<u8>>;
    fn setxattr(&self, path: &Path, name: &[u8], value: &[u8], flags: u32) -> Result<()>;
    fn removexattr(&self, path: &Path, name: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::{FileType, OpenFlags};

    #[test]
    fn file_type_bits() {
        let ft = FileType::from_mode(0o100644);
        assert_eq!(ft.kind(), FileType::S_IFREG);
        assert_eq!(ft.permissions(), 0o644);
        assert_eq!(ft.dirent_type(), 8);
        assert_eq!(FileType::from_mode(0o040755).dirent_type(), 4);
        assert_eq!(FileType::from_mode(0o120777).dirent_type(), 10);
    }

    #[test]
    fn exclusive_create() {
        assert!((OpenFlags::O_CREAT | OpenFlags::O_EXCL | OpenFlags::O_RDWR).is_exclusive_create());
        assert!(!OpenFlags::O_EXCL.is_exclusive_create());
        assert!(!(OpenFlags::O_CREAT | OpenFlags::O_TRUNC).is_exclusive_create());
    }

    #[cfg(feature = "unix")]
    #[test]
    fn translates_access_mode() {
        use rustix::fs::OFlags;
        let f = (OpenFlags::O_RDWR | OpenFlags::O_TRUNC).to_unix();
        assert!(f.contains(OFlags::RDWR));
        assert!(f.contains(OFlags::TRUNC));
        assert!(!f.contains(OFlags::CREATE));
        assert_eq!(OpenFlags::O_RDONLY.to_unix() & OFlags::ACCMODE, OFlags::RDONLY);
    }
}
