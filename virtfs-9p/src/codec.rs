//! The 9P wire codec.
//!
//! Every value on the wire is little-endian.  Strings carry a 16-bit length prefix and no
//! terminator.  Messages live in scatter/gather lists whose segments need not be contiguous, so
//! the codec reads and writes through [`SgList`] rather than a flat slice.

use std::convert::TryInto;
use virtfs_constants::error::Error;

/// Bytes of `size[4] type[1] tag[2]` at the start of every message.
pub const HEADER_SIZE: usize = 7;

/// An ordered list of separately allocated byte ranges.
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct SgList {
    segs: Vec<Vec<u8>>,
}

impl SgList {
    pub fn new(segs: Vec<Vec<u8>>) -> Self {
        SgList { segs }
    }

    /// A zero-filled list of `total` bytes split into segments of at most `segment` bytes.
    pub fn zeroed(total: usize, segment: usize) -> Self {
        let segment = segment.max(1);
        let mut segs = Vec::with_capacity(total / segment + 1);
        let mut left = total;
        while left > 0 {
            let n = left.min(segment);
            segs.push(vec![0u8; n]);
            left -= n;
        }
        SgList { segs }
    }

    pub fn from_bytes(data: &[u8], segment: usize) -> Self {
        SgList {
            segs: data.chunks(segment.max(1)).map(|c| c.to_vec()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.segs.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> usize {
        self.segs.len()
    }

    /// Copies `dst.len()` bytes starting at `off`.
    pub fn read_at(&self, off: usize, dst: &mut [u8]) -> Result<(), Error> {
        let mut done = 0;
        for chunk in self.slices(off, dst.len()) {
            dst[done..done + chunk.len()].copy_from_slice(chunk);
            done += chunk.len();
        }
        if done == dst.len() {
            Ok(())
        } else {
            Err(Error::EINVAL)
        }
    }

    /// Copies `src` into the list starting at `off`.
    pub fn write_at(&mut self, off: usize, src: &[u8]) -> Result<(), Error> {
        if off.checked_add(src.len()).map_or(true, |end| end > self.len()) {
            return Err(Error::ENOBUFS);
        }
        let mut done = 0;
        for chunk in self.slices_mut(off, src.len()) {
            let n = chunk.len();
            chunk.copy_from_slice(&src[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Views up to `len` bytes starting at `off`, capped at the end of the list.
    pub fn slices(&self, off: usize, len: usize) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let (mut skip, mut want) = (off, len);
        for seg in &self.segs {
            if want == 0 {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(want);
            out.push(&seg[skip..skip + n]);
            want -= n;
            skip = 0;
        }
        out
    }

    pub fn slices_mut(&mut self, off: usize, len: usize) -> Vec<&mut [u8]> {
        let mut out = Vec::new();
        let (mut skip, mut want) = (off, len);
        for seg in self.segs.iter_mut() {
            if want == 0 {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(want);
            out.push(&mut seg[skip..skip + n]);
            want -= n;
            skip = 0;
        }
        out
    }

    /// Flattens the first `len` bytes.
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        self.slices(0, len).concat()
    }
}

/// Reads wire values from a request, never past the declared message size.
pub struct Deserializer<'a> {
    buf: &'a SgList,
    offset: usize,
    limit: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a SgList, offset: usize, limit: usize) -> Self {
        Deserializer {
            buf,
            offset,
            limit: limit.min(buf.len()),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.offset)
    }

    fn reserve(&mut self, n: usize) -> Result<usize, Error> {
        if n > self.remaining() {
            return Err(Error::EINVAL);
        }
        let start = self.offset;
        self.offset += n;
        Ok(start)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let start = self.reserve(N)?;
        let mut out = [0u8; N];
        self.buf.read_at(start, &mut out)?;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_data(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let start = self.reserve(len)?;
        let mut out = vec![0u8; len];
        self.buf.read_at(start, &mut out)?;
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u16()?;
        self.read_data(len as usize)
    }

    /// Claims a bulk payload of `len` bytes, returning its offset without copying.
    ///
    /// The length is capped at what the declared message size still holds.
    pub fn read_view(&mut self, len: usize) -> (usize, usize) {
        let len = len.min(self.remaining());
        let start = self.offset;
        self.offset += len;
        (start, len)
    }

    pub fn read<T: Wire>(&mut self) -> Result<T, Error> {
        T::decode(self)
    }
}

/// Writes wire values into a response, never past the negotiated message size.
pub struct Serializer<'a> {
    buf: &'a mut SgList,
    offset: usize,
    limit: usize,
}

impl<'a> Serializer<'a> {
    pub fn new(buf: &'a mut SgList, offset: usize, limit: usize) -> Self {
        let limit = limit.min(buf.len());
        Serializer { buf, offset, limit }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.offset)
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.remaining() {
            return Err(Error::ENOBUFS);
        }
        self.buf.write_at(self.offset, data)?;
        self.offset += data.len();
        Ok(())
    }

    pub fn write_u8(&mut self, val: u8) -> Result<(), Error> {
        self.write_data(&[val])
    }

    pub fn write_u16(&mut self, val: u16) -> Result<(), Error> {
        self.write_data(&val.to_le_bytes())
    }

    pub fn write_u32(&mut self, val: u32) -> Result<(), Error> {
        self.write_data(&val.to_le_bytes())
    }

    pub fn write_u64(&mut self, val: u64) -> Result<(), Error> {
        self.write_data(&val.to_le_bytes())
    }

    pub fn write_string(&mut self, s: &[u8]) -> Result<(), Error> {
        let len: u16 = s.len().try_into().map_err(|_| Error::ENAMETOOLONG)?;
        self.write_u16(len)?;
        self.write_data(s)
    }

    /// Reserves `len` bytes to be filled in place, returning their offset.
    pub fn write_view(&mut self, len: usize) -> Result<usize, Error> {
        if len > self.remaining() {
            return Err(Error::ENOBUFS);
        }
        let start = self.offset;
        self.offset += len;
        Ok(start)
    }

    pub fn write<T: Wire>(&mut self, val: &T) -> Result<(), Error> {
        val.encode(self)
    }
}

/// A value with a fixed 9P wire layout.
pub trait Wire: Sized {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error>;
    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error>;
}

/// Reads one value at `offset`, returning it with the number of bytes consumed.
pub fn unmarshal<T: Wire>(buf: &SgList, offset: usize, limit: usize) -> Result<(T, usize), Error> {
    let mut d = Deserializer::new(buf, offset, limit);
    let val = T::decode(&mut d)?;
    Ok((val, d.offset() - offset))
}

/// Writes one value at `offset`, returning the number of bytes written.
pub fn marshal<T: Wire>(
    buf: &mut SgList,
    offset: usize,
    limit: usize,
    val: &T,
) -> Result<usize, Error> {
    let mut s = Serializer::new(buf, offset, limit);
    val.encode(&mut s)?;
    Ok(s.offset() - offset)
}

macro_rules! int_impls {
    ($($t:ty => $read:ident, $write:ident;)*) => {
        $(
            impl Wire for $t {
                fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
                    d.$read()
                }

                fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
                    s.$write(*self)
                }
            }
        )*
    };
}

int_impls! {
    u8 => read_u8, write_u8;
    u16 => read_u16, write_u16;
    u32 => read_u32, write_u32;
    u64 => read_u64, write_u64;
}

/// A byte vector is a 9P string.
impl Wire for Vec<u8> {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        d.read_string()
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write_string(self)
    }
}

/// An empty body.
impl Wire for () {
    fn decode(_d: &mut Deserializer<'_>) -> Result<Self, Error> {
        Ok(())
    }

    fn encode(&self, _s: &mut Serializer<'_>) -> Result<(), Error> {
        Ok(())
    }
}

// Based on Rust's src/core/tuple.rs.
macro_rules! tuple_impls {
    ($T:ident) => {
        tuple_impls!(@impl $T);
    };
    ($T:ident $( $U:ident )+) => {
        tuple_impls!($( $U )+);
        tuple_impls!(@impl $T $( $U )+);
    };
    (@impl $( $T:ident )+) => {
        impl<$($T: Wire),+> Wire for ($($T,)+) {
            fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
                Ok(($(d.read::<$T>()?,)+))
            }

            #[allow(non_snake_case)]
            fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
                let ($($T,)+) = self;
                $( $T.encode(s)?; )+
                Ok(())
            }
        }
    };
}

tuple_impls!(A B C D E F G H I J K L);

/// A server's unique identification of a file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Qid {
    pub kind: u8,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub const SIZE: usize = 13;
}

impl Wire for Qid {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        Ok(Qid {
            kind: d.read_u8()?,
            version: d.read_u32()?,
            path: d.read_u64()?,
        })
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write_u8(self.kind)?;
        s.write_u32(self.version)?;
        s.write_u64(self.path)
    }
}

/// The 9P2000.u additions to the classic stat block.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct UnixStatExt {
    pub extension: Vec<u8>,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

/// The classic stat block, with the 9P2000.u fields when `unix` is present.
///
/// On the wire it starts with its own 16-bit size, which decoding uses to tell whether the
/// 9P2000.u fields follow.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct WireStat {
    pub kind: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: Vec<u8>,
    pub uid: Vec<u8>,
    pub gid: Vec<u8>,
    pub muid: Vec<u8>,
    pub unix: Option<UnixStatExt>,
}

impl WireStat {
    const FIXED_SIZE: usize = 2 + 2 + 4 + Qid::SIZE + 4 + 4 + 4 + 8 + 2 + 2 + 2 + 2;

    /// The encoded size including the leading size field.
    pub fn wire_len(&self) -> usize {
        let mut len = Self::FIXED_SIZE
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len();
        if let Some(u) = &self.unix {
            len += 2 + u.extension.len() + 4 + 4 + 4;
        }
        len
    }

    /// A stat in which every field means "don't touch", as `Twstat` uses for a sync request.
    pub fn dont_touch(unix: bool) -> Self {
        WireStat {
            kind: u16::MAX,
            dev: u32::MAX,
            qid: Qid {
                kind: u8::MAX,
                version: u32::MAX,
                path: u64::MAX,
            },
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            name: Vec::new(),
            uid: Vec::new(),
            gid: Vec::new(),
            muid: Vec::new(),
            unix: if unix {
                Some(UnixStatExt {
                    extension: Vec::new(),
                    n_uid: u32::MAX,
                    n_gid: u32::MAX,
                    n_muid: u32::MAX,
                })
            } else {
                None
            },
        }
    }

    pub fn is_dont_touch(&self) -> bool {
        let mut copy = self.clone();
        if let Some(u) = &mut copy.unix {
            if u.extension.is_empty() && u.n_uid == u32::MAX && u.n_gid == u32::MAX {
                copy.unix = None;
            }
        }
        copy == WireStat::dont_touch(false)
    }
}

impl Wire for WireStat {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        let size = d.read_u16()? as usize;
        let start = d.offset();
        let mut st = WireStat {
            kind: d.read_u16()?,
            dev: d.read_u32()?,
            qid: d.read()?,
            mode: d.read_u32()?,
            atime: d.read_u32()?,
            mtime: d.read_u32()?,
            length: d.read_u64()?,
            name: d.read_string()?,
            uid: d.read_string()?,
            gid: d.read_string()?,
            muid: d.read_string()?,
            unix: None,
        };
        if d.offset() - start < size {
            st.unix = Some(UnixStatExt {
                extension: d.read_string()?,
                n_uid: d.read_u32()?,
                n_gid: d.read_u32()?,
                n_muid: d.read_u32()?,
            });
        }
        if d.offset() - start != size {
            return Err(Error::EINVAL);
        }
        Ok(st)
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        let size: u16 = (self.wire_len() - 2)
            .try_into()
            .map_err(|_| Error::ENAMETOOLONG)?;
        s.write_u16(size)?;
        s.write_u16(self.kind)?;
        s.write_u32(self.dev)?;
        s.write(&self.qid)?;
        s.write_u32(self.mode)?;
        s.write_u32(self.atime)?;
        s.write_u32(self.mtime)?;
        s.write_u64(self.length)?;
        s.write_string(&self.name)?;
        s.write_string(&self.uid)?;
        s.write_string(&self.gid)?;
        s.write_string(&self.muid)?;
        if let Some(u) = &self.unix {
            s.write_string(&u.extension)?;
            s.write_u32(u.n_uid)?;
            s.write_u32(u.n_gid)?;
            s.write_u32(u.n_muid)?;
        }
        Ok(())
    }
}

/// The 9P2000.L attribute block of `Rgetattr`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct LinuxStat {
    pub valid: u64,
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
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
    pub btime_sec: u64,
    pub btime_nsec: u64,
    pub gen: u64,
    pub data_version: u64,
}

impl Wire for LinuxStat {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        Ok(LinuxStat {
            valid: d.read_u64()?,
            qid: d.read()?,
            mode: d.read_u32()?,
            uid: d.read_u32()?,
            gid: d.read_u32()?,
            nlink: d.read_u64()?,
            rdev: d.read_u64()?,
            size: d.read_u64()?,
            blksize: d.read_u64()?,
            blocks: d.read_u64()?,
            atime_sec: d.read_u64()?,
            atime_nsec: d.read_u64()?,
            mtime_sec: d.read_u64()?,
            mtime_nsec: d.read_u64()?,
            ctime_sec: d.read_u64()?,
            ctime_nsec: d.read_u64()?,
            btime_sec: d.read_u64()?,
            btime_nsec: d.read_u64()?,
            gen: d.read_u64()?,
            data_version: d.read_u64()?,
        })
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write_u64(self.valid)?;
        s.write(&self.qid)?;
        s.write_u32(self.mode)?;
        s.write_u32(self.uid)?;
        s.write_u32(self.gid)?;
        for v in &[
            self.nlink,
            self.rdev,
            self.size,
            self.blksize,
            self.blocks,
            self.atime_sec,
            self.atime_nsec,
            self.mtime_sec,
            self.mtime_nsec,
            self.ctime_sec,
            self.ctime_nsec,
            self.btime_sec,
            self.btime_nsec,
            self.gen,
            self.data_version,
        ] {
            s.write_u64(*v)?;
        }
        Ok(())
    }
}

/// The body of `Tsetattr`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct SetAttr {
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

impl Wire for SetAttr {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        Ok(SetAttr {
            valid: d.read_u32()?,
            mode: d.read_u32()?,
            uid: d.read_u32()?,
            gid: d.read_u32()?,
            size: d.read_u64()?,
            atime_sec: d.read_u64()?,
            atime_nsec: d.read_u64()?,
            mtime_sec: d.read_u64()?,
            mtime_nsec: d.read_u64()?,
        })
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write(&(self.valid, self.mode, self.uid, self.gid, self.size))?;
        s.write(&(
            self.atime_sec,
            self.atime_nsec,
            self.mtime_sec,
            self.mtime_nsec,
        ))
    }
}

/// The body of `Rstatfs`.
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

impl Wire for StatFs {
    fn decode(d: &mut Deserializer<'_>) -> Result<Self, Error> {
        let (fs_type, bsize, blocks, bfree, bavail, files, ffree, fsid, namelen) = d.read()?;
        Ok(StatFs {
            fs_type,
            bsize,
            blocks,
            bfree,
            bavail,
            files,
            ffree,
            fsid,
            namelen,
        })
    }

    fn encode(&self, s: &mut Serializer<'_>) -> Result<(), Error> {
        s.write(&(
            self.fs_type,
            self.bsize,
            self.blocks,
            self.bfree,
            self.bavail,
            self.files,
            self.ffree,
            self.fsid,
            self.namelen,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{marshal, unmarshal, LinuxStat, Qid, SgList, UnixStatExt, WireStat};
    use virtfs_constants::error::Error;

    #[test]
    fn integers_are_little_endian() {
        let mut buf = SgList::zeroed(32, 3);
        let n = marshal(&mut buf, 1, 32, &(0x11u8, 0x2233u16, 0x44556677u32, 0x8899aabbccddeeffu64))
            .unwrap();
        assert_eq!(n, 15);
        assert_eq!(
            buf.to_vec(16),
            [
                0x00, 0x11, 0x33, 0x22, 0x77, 0x66, 0x55, 0x44, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa,
                0x99, 0x88
            ]
        );
        let ((a, b, c, d), used): ((u8, u16, u32, u64), usize) = unmarshal(&buf, 1, 32).unwrap();
        assert_eq!(used, 15);
        assert_eq!((a, b, c, d), (0x11, 0x2233, 0x44556677, 0x8899aabbccddeeff));
    }

    #[test]
    fn strings_span_segments() {
        let mut buf = SgList::zeroed(20, 4);
        assert_eq!(buf.segments(), 5);
        let n = marshal(&mut buf, 3, 20, &b"hello, world".to_vec()).unwrap();
        assert_eq!(n, 14);
        let (s, used): (Vec<u8>, usize) = unmarshal(&buf, 3, 20).unwrap();
        assert_eq!(used, 14);
        assert_eq!(s, b"hello, world");
    }

    #[test]
    fn never_reads_past_declared_size() {
        let buf = SgList::from_bytes(&[5, 0, b'a', b'b', b'c', b'd', b'e'], 2);
        assert!(unmarshal::<Vec<u8>>(&buf, 0, 7).is_ok());
        assert_eq!(unmarshal::<Vec<u8>>(&buf, 0, 6).unwrap_err(), Error::EINVAL);
        assert_eq!(unmarshal::<u64>(&buf, 0, 7).unwrap_err(), Error::EINVAL);
    }

    #[test]
    fn never_writes_past_limit() {
        let mut buf = SgList::zeroed(64, 8);
        assert_eq!(marshal(&mut buf, 0, 11, &(1u32, 2u64)).unwrap_err(), Error::ENOBUFS);
        assert_eq!(marshal(&mut buf, 0, 12, &(1u32, 2u64)).unwrap(), 12);
    }

    #[test]
    fn stat_blocks() {
        let qid = Qid {
            kind: 0x80,
            version: 7,
            path: 42,
        };
        let mut st = WireStat {
            qid,
            mode: 0x800001ed,
            length: 4096,
            name: b"dir".to_vec(),
            ..Default::default()
        };
        assert_eq!(st.wire_len(), 49 + 3);
        let mut buf = SgList::zeroed(128, 16);
        let n = marshal(&mut buf, 0, 128, &st).unwrap();
        assert_eq!(n, st.wire_len());
        assert_eq!(unmarshal::<WireStat>(&buf, 0, 128).unwrap().0, st);

        st.unix = Some(UnixStatExt {
            extension: b"b 8 1".to_vec(),
            n_uid: 1000,
            n_gid: 100,
            n_muid: u32::MAX,
        });
        let n = marshal(&mut buf, 0, 128, &st).unwrap();
        assert_eq!(n, 49 + 3 + 2 + 5 + 12);
        assert_eq!(unmarshal::<WireStat>(&buf, 0, 128).unwrap(), (st, n));

        assert!(WireStat::dont_touch(false).is_dont_touch());
        assert!(WireStat::dont_touch(true).is_dont_touch());
    }

    #[test]
    fn linux_stat_layout() {
        let st = LinuxStat {
            valid: 0x7ff,
            size: 3,
            ..Default::default()
        };
        let mut buf = SgList::zeroed(256, 100);
        let n = marshal(&mut buf, 0, 256, &st).unwrap();
        assert_eq!(n, 8 + 13 + 4 * 3 + 8 * 15);
        assert_eq!(unmarshal::<LinuxStat>(&buf, 0, 256).unwrap().0, st);
    }
}
