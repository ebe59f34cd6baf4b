//! Protocol constants shared by the codec and the operation handlers.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use std::fmt;
use std::str::FromStr;
use virtfs_fs::backend::{FileType as HostFileType, Stat};

/// The fid value meaning "no fid".
pub const NOFID: u32 = u32::MAX;
/// The tag used by `Tversion`.
pub const NOTAG: u16 = u16::MAX;
/// The most names a single walk may carry.
pub const MAX_WALK_ELEMENTS: usize = 16;
/// The smallest maximum message size we accept.
pub const MIN_MSIZE: u32 = 4096;
/// Bytes of header in front of read and write payloads, as used for iounit sizing.
pub const IO_HEADER_SIZE: u32 = 24;
/// The largest extended attribute value a client may create.
pub const XATTR_SIZE_MAX: u64 = 65536;
/// `unlinkat` flag selecting directory removal.
pub const AT_REMOVEDIR: u32 = 0x200;

#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Tlerror = 6,
    Rlerror = 7,
    Tstatfs = 8,
    Rstatfs = 9,
    Tlopen = 12,
    Rlopen = 13,
    Tlcreate = 14,
    Rlcreate = 15,
    Tsymlink = 16,
    Rsymlink = 17,
    Tmknod = 18,
    Rmknod = 19,
    Trename = 20,
    Rrename = 21,
    Treadlink = 22,
    Rreadlink = 23,
    Tgetattr = 24,
    Rgetattr = 25,
    Tsetattr = 26,
    Rsetattr = 27,
    Txattrwalk = 30,
    Rxattrwalk = 31,
    Txattrcreate = 32,
    Rxattrcreate = 33,
    Treaddir = 40,
    Rreaddir = 41,
    Tfsync = 50,
    Rfsync = 51,
    Tlock = 52,
    Rlock = 53,
    Tgetlock = 54,
    Rgetlock = 55,
    Tlink = 70,
    Rlink = 71,
    Tmkdir = 72,
    Rmkdir = 73,
    Trenameat = 74,
    Rrenameat = 75,
    Tunlinkat = 76,
    Runlinkat = 77,
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Terror = 106,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl Opcode {
    /// Whether this request only exists in 9P2000.L.
    pub fn is_linux_only(self) -> bool {
        (self as u8) < (Opcode::Tversion as u8)
    }

    /// Whether this request is not valid in 9P2000.L.
    pub fn is_classic_only(self) -> bool {
        matches!(self, Opcode::Tcreate | Opcode::Tstat | Opcode::Twstat)
    }
}

/// The negotiated protocol dialect.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dialect {
    /// No `Tversion` yet, or an unrecognized version string; behaves like `Original`.
    Unnegotiated,
    Original,
    Unix,
    Linux,
}

impl Dialect {
    pub fn to_str(self) -> &'static str {
        match self {
            Dialect::Unnegotiated => "unknown",
            Dialect::Original => "9P2000",
            Dialect::Unix => "9P2000.u",
            Dialect::Linux => "9P2000.L",
        }
    }

    pub fn is_linux(self) -> bool {
        self == Dialect::Linux
    }

    pub fn is_unix(self) -> bool {
        self == Dialect::Unix
    }
}

impl FromStr for Dialect {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "9P2000" => Ok(Dialect::Original),
            "9P2000.u" => Ok(Dialect::Unix),
            "9P2000.L" => Ok(Dialect::Linux),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

bitflags! {
    pub struct QidType: u8 {
        const QTDIR = 0x80;
        const QTAPPEND = 0x40;
        const QTEXCL = 0x20;
        const QTMOUNT = 0x10;
        const QTAUTH = 0x08;
        const QTTMP = 0x04;
        const QTSYMLINK = 0x02;
        const QTLINK = 0x01;
        const QTFILE = 0x00;
    }

    pub struct SimpleOpenMode: u8 {
        const O_READ = 0x00;
        const O_WRITE = 0x01;
        const O_RDWR = 0x02;
        const O_EXEC = 0x03;
        const O_ACCMODE = 0x03;
        const O_TRUNC = 0x10;
        const O_CEXEC = 0x20;
        const O_RCLOSE = 0x40;
        const O_APPEND = 0x80;
    }

    /// Mode bits of the classic stat block.
    pub struct FileMode: u32 {
        const DMDIR =            0x80000000;
        const DMAPPEND =         0x40000000;
        const DMEXCL =           0x20000000;
        const DMMOUNT =          0x10000000;
        const DMAUTH =           0x08000000;
        const DMTMP =            0x04000000;
        const DMSYMLINK =        0x02000000;
        const DMLINK =           0x01000000;
        const DMDEVICE =         0x00800000;
        const DMNAMEDPIPE =      0x00200000;
        const DMSOCKET =         0x00100000;
        const DMSETUID =         0x00080000;
        const DMSETGID =         0x00040000;
        const DMSETVTX =         0x00010000;
        const DMPERM =           0o777;
    }

    pub struct LinuxStatValidity: u64 {
        const MODE = 0x00000001;
        const NLINK = 0x00000002;
        const UID = 0x00000004;
        const GID = 0x00000008;
        const RDEV = 0x00000010;
        const ATIME = 0x00000020;
        const MTIME = 0x00000040;
        const CTIME = 0x00000080;
        const INODE = 0x00000100;
        const SIZE = 0x00000200;
        const BLOCKS = 0x00000400;
        const BTIME = 0x00000800;
        const GEN = 0x00001000;
        const DATA_VERSION = 0x00002000;
        const BASIC = 0x000007ff;
        const ALL = 0x00003fff;
    }

    pub struct LinuxSetattrValidity: u32 {
        const MODE = 0x00000001;
        const UID = 0x00000002;
        const GID = 0x00000004;
        const SIZE = 0x00000008;
        const ATIME = 0x00000010;
        const MTIME = 0x00000020;
        const CTIME = 0x00000040;
        const ATIME_SET = 0x00000080;
        const MTIME_SET = 0x00000100;
    }
}

impl SimpleOpenMode {
    /// Translates a classic open mode into Linux open flags.
    pub fn to_open_flags(self) -> virtfs_fs::backend::OpenFlags {
        use virtfs_fs::backend::OpenFlags;
        let mut flags = match self & Self::O_ACCMODE {
            x if x == Self::O_WRITE => OpenFlags::O_WRONLY,
            x if x == Self::O_RDWR => OpenFlags::O_RDWR,
            _ => OpenFlags::O_RDONLY,
        };
        if self.contains(Self::O_TRUNC) {
            flags |= OpenFlags::O_TRUNC;
        }
        if self.contains(Self::O_APPEND) {
            flags |= OpenFlags::O_APPEND;
        }
        flags
    }
}

impl FileMode {
    /// Converts a host mode into classic stat mode bits.
    pub fn from_host(mode: u32) -> Self {
        let host = HostFileType::from_mode(mode);
        let mut val = FileMode::from_bits_truncate(mode & 0o777);
        val |= match host.kind() {
            HostFileType::S_IFDIR => FileMode::DMDIR,
            HostFileType::S_IFLNK => FileMode::DMSYMLINK,
            HostFileType::S_IFSOCK => FileMode::DMSOCKET,
            HostFileType::S_IFIFO => FileMode::DMNAMEDPIPE,
            HostFileType::S_IFBLK | HostFileType::S_IFCHR => FileMode::DMDEVICE,
            _ => FileMode::empty(),
        };
        if host.contains(HostFileType::S_ISUID) {
            val |= FileMode::DMSETUID;
        }
        if host.contains(HostFileType::S_ISGID) {
            val |= FileMode::DMSETGID;
        }
        if host.contains(HostFileType::S_ISVTX) {
            val |= FileMode::DMSETVTX;
        }
        val
    }

    /// Converts classic mode bits into host permission bits, without the file type.
    pub fn to_host_permissions(self) -> u32 {
        let mut mode = self.bits() & 0o777;
        if self.contains(FileMode::DMSETUID) {
            mode |= 0o4000;
        }
        if self.contains(FileMode::DMSETGID) {
            mode |= 0o2000;
        }
        if self.contains(FileMode::DMSETVTX) {
            mode |= 0o1000;
        }
        mode
    }
}

/// A `Tlock` reply status.
#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockStatus {
    Success = 0,
    Blocked = 1,
    Error = 2,
    Grace = 3,
}

/// A lock type as used by `Tlock` and `Tgetlock`.
#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LockType {
    ReadLock = 0,
    WriteLock = 1,
    Unlock = 2,
}

/// Computes the QID type for a host file.
pub fn qid_type(st: &Stat) -> QidType {
    match st.file_type() {
        HostFileType::S_IFDIR => QidType::QTDIR,
        HostFileType::S_IFLNK => QidType::QTSYMLINK,
        _ => QidType::QTFILE,
    }
}
