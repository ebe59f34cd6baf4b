use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::fmt;
use std::io;

macro_rules! errno_table {
    ($( $(#[$attr:meta])* $name:ident = $value:literal ),* $(,)?) => {
        /// A Linux error code.
        ///
        /// The numeric values are the Linux ones regardless of the host, since that is what the
        /// 9P2000.L and 9P2000.u dialects put on the wire.  Conversions to and from host errors
        /// go through the host's own `errno` constants.
        #[derive(FromPrimitive, Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
        pub enum Error {
            $( $name = $value, )*
        }

        impl Error {
            #[allow(unreachable_patterns)]
            fn host_code(self) -> Option<i32> {
                match self {
                    $( $(#[$attr])* Error::$name => Some(libc::$name), )*
                    _ => None,
                }
            }

            #[allow(unreachable_patterns)]
            fn from_host_code(code: i32) -> Option<Error> {
                match code {
                    $( $(#[$attr])* libc::$name => Some(Error::$name), )*
                    _ => None,
                }
            }
        }
    };
}

errno_table! {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    ENOTBLK = 15,
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    ETXTBSY = 26,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    EDOM = 33,
    ERANGE = 34,
    EDEADLK = 35,
    ENAMETOOLONG = 36,
    ENOLCK = 37,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
    ENOMSG = 42,
    EIDRM = 43,
    #[cfg(target_os = "linux")]
    ECHRNG = 44,
    #[cfg(target_os = "linux")]
    EL2NSYNC = 45,
    #[cfg(target_os = "linux")]
    EL3HLT = 46,
    #[cfg(target_os = "linux")]
    EL3RST = 47,
    #[cfg(target_os = "linux")]
    ELNRNG = 48,
    #[cfg(target_os = "linux")]
    EUNATCH = 49,
    #[cfg(target_os = "linux")]
    ENOCSI = 50,
    #[cfg(target_os = "linux")]
    EL2HLT = 51,
    #[cfg(target_os = "linux")]
    EBADE = 52,
    #[cfg(target_os = "linux")]
    EBADR = 53,
    #[cfg(target_os = "linux")]
    EXFULL = 54,
    #[cfg(target_os = "linux")]
    ENOANO = 55,
    #[cfg(target_os = "linux")]
    EBADRQC = 56,
    #[cfg(target_os = "linux")]
    EBADSLT = 57,
    #[cfg(target_os = "linux")]
    EBFONT = 59,
    ENOSTR = 60,
    ENODATA = 61,
    ETIME = 62,
    ENOSR = 63,
    #[cfg(target_os = "linux")]
    ENONET = 64,
    #[cfg(target_os = "linux")]
    ENOPKG = 65,
    EREMOTE = 66,
    ENOLINK = 67,
    #[cfg(target_os = "linux")]
    EADV = 68,
    #[cfg(target_os = "linux")]
    ESRMNT = 69,
    #[cfg(target_os = "linux")]
    ECOMM = 70,
    EPROTO = 71,
    EMULTIHOP = 72,
    #[cfg(target_os = "linux")]
    EDOTDOT = 73,
    EBADMSG = 74,
    EOVERFLOW = 75,
    #[cfg(target_os = "linux")]
    ENOTUNIQ = 76,
    #[cfg(target_os = "linux")]
    EBADFD = 77,
    #[cfg(target_os = "linux")]
    EREMCHG = 78,
    #[cfg(target_os = "linux")]
    ELIBACC = 79,
    #[cfg(target_os = "linux")]
    ELIBBAD = 80,
    #[cfg(target_os = "linux")]
    ELIBSCN = 81,
    #[cfg(target_os = "linux")]
    ELIBMAX = 82,
    #[cfg(target_os = "linux")]
    ELIBEXEC = 83,
    EILSEQ = 84,
    #[cfg(target_os = "linux")]
    ERESTART = 85,
    #[cfg(target_os = "linux")]
    ESTRPIPE = 86,
    EUSERS = 87,
    ENOTSOCK = 88,
    EDESTADDRREQ = 89,
    EMSGSIZE = 90,
    EPROTOTYPE = 91,
    ENOPROTOOPT = 92,
    EPROTONOSUPPORT = 93,
    ESOCKTNOSUPPORT = 94,
    EOPNOTSUPP = 95,
    EPFNOSUPPORT = 96,
    EAFNOSUPPORT = 97,
    EADDRINUSE = 98,
    EADDRNOTAVAIL = 99,
    ENETDOWN = 100,
    ENETUNREACH = 101,
    ENETRESET = 102,
    ECONNABORTED = 103,
    ECONNRESET = 104,
    ENOBUFS = 105,
    EISCONN = 106,
    ENOTCONN = 107,
    ESHUTDOWN = 108,
    ETOOMANYREFS = 109,
    ETIMEDOUT = 110,
    ECONNREFUSED = 111,
    EHOSTDOWN = 112,
    EHOSTUNREACH = 113,
    EALREADY = 114,
    EINPROGRESS = 115,
    ESTALE = 116,
    #[cfg(target_os = "linux")]
    EUCLEAN = 117,
    #[cfg(target_os = "linux")]
    ENOTNAM = 118,
    #[cfg(target_os = "linux")]
    ENAVAIL = 119,
    #[cfg(target_os = "linux")]
    EISNAM = 120,
    #[cfg(target_os = "linux")]
    EREMOTEIO = 121,
    EDQUOT = 122,
    #[cfg(target_os = "linux")]
    ENOMEDIUM = 123,
    #[cfg(target_os = "linux")]
    EMEDIUMTYPE = 124,
    ECANCELED = 125,
    #[cfg(target_os = "linux")]
    ENOKEY = 126,
    #[cfg(target_os = "linux")]
    EKEYEXPIRED = 127,
    #[cfg(target_os = "linux")]
    EKEYREVOKED = 128,
    #[cfg(target_os = "linux")]
    EKEYREJECTED = 129,
    EOWNERDEAD = 130,
    ENOTRECOVERABLE = 131,
    #[cfg(target_os = "linux")]
    ERFKILL = 132,
    #[cfg(target_os = "linux")]
    EHWPOISON = 133,
}

impl Error {
    /// The Linux error number, as sent in `Rlerror` and `Rerror`.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Looks up an error by its Linux error number.
    pub fn from_code(code: u32) -> Option<Error> {
        Error::from_u32(code)
    }

    /// A human-readable description without the trailing OS error number.
    pub fn message(self) -> String {
        let s = io::Error::from(self).to_string();
        match s.rfind(" (os error ") {
            Some(idx) => s[..idx].to_string(),
            None => s,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let e: io::Error = (*self).into();
        write!(f, "{}", e)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::from_raw_os_error(err.host_code().unwrap_or(libc::EINVAL))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from(&err)
    }
}

impl<'a> From<&'a io::Error> for Error {
    fn from(err: &'a io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::from_host_code(code).unwrap_or(Error::EIO),
            None => match err.kind() {
                io::ErrorKind::NotFound => Error::ENOENT,
                io::ErrorKind::PermissionDenied => Error::EACCES,
                io::ErrorKind::AlreadyExists => Error::EEXIST,
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Error::EINVAL,
                io::ErrorKind::UnexpectedEof => Error::EIO,
                io::ErrorKind::OutOfMemory => Error::ENOMEM,
                _ => Error::EIO,
            },
        }
    }
}

#[cfg(feature = "rustix")]
impl From<rustix::io::Errno> for Error {
    fn from(err: rustix::io::Errno) -> Error {
        Error::from_host_code(err.raw_os_error()).unwrap_or(Error::EIO)
    }
}
