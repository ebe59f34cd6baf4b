//! One handler per request type.
//!
//! Each handler decodes its arguments from the message, does its work against the fid table and
//! the worker, and encodes its reply body.  The dispatcher writes the header or the error reply.

use super::session::{fs_path, qid, Session, NONUNAME};
use super::Message;
use crate::codec::{LinuxStat, Qid, SetAttr, SgList, StatFs, UnixStatExt, WireStat};
use crate::fid::{
    basename, join_path, parent, valid_component, FidKind, FidRef, Resource, XattrBuffer,
};
use crate::protocol::{
    Dialect, FileMode, LinuxSetattrValidity, LinuxStatValidity, LockStatus, LockType, QidType,
    SimpleOpenMode, AT_REMOVEDIR, MAX_WALK_ELEMENTS, MIN_MSIZE, NOFID, XATTR_SIZE_MAX,
};
use crate::worker::retry_intr;
use num_traits::FromPrimitive;
use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use virtfs_constants::error::Error;
use virtfs_fs::backend::host::DirStream;
use virtfs_fs::backend::{DirEntry, FileSystem, FileType, OpenFlags, SetTime, Stat};

#[cfg(feature = "unix")]
use rustix::fd::{AsFd, OwnedFd};

const DT_DIR: u8 = 4;
const DT_LNK: u8 = 10;

/// Checks a name that is to be looked up or created in a directory.
fn check_name(name: &[u8]) -> Result<(), Error> {
    if valid_component(name) {
        Ok(())
    } else {
        Err(Error::ENOENT)
    }
}

fn is_dot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// Translates 9P2000.L open flags, dropping those that make no sense for a server.
fn linux_open_flags(flags: u32) -> OpenFlags {
    OpenFlags::from_bits_truncate(flags)
        & !(OpenFlags::O_NOCTTY | OpenFlags::O_ASYNC | OpenFlags::O_CREAT | OpenFlags::O_DIRECT)
}

/// Parses the `b|c major minor` extension of a device create.
fn parse_device(ext: &[u8]) -> Result<(FileType, u32, u32), Error> {
    let s = std::str::from_utf8(ext).map_err(|_| Error::EINVAL)?;
    let mut it = s.split_whitespace();
    let kind = match it.next() {
        Some("c") => FileType::S_IFCHR,
        Some("b") => FileType::S_IFBLK,
        _ => return Err(Error::EINVAL),
    };
    let mut num = || {
        it.next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(Error::EINVAL)
    };
    let major = num()?;
    let minor = num()?;
    Ok((kind, major, minor))
}

/// The 9P2000.u extension string for a file: a link target or a device description.
fn stat_extension(fs: &dyn FileSystem, path: &Path, st: &Stat) -> Result<Vec<u8>, Error> {
    if st.is_symlink() {
        retry_intr(|| fs.readlink(path))
    } else if st.is_device() {
        let kind = if st.file_type() == FileType::S_IFCHR {
            'c'
        } else {
            'b'
        };
        Ok(format!("{} {} {}", kind, st.major(), st.minor()).into_bytes())
    } else {
        Ok(Vec::new())
    }
}

fn wire_stat(st: &Stat, name: &[u8], extension: Option<Vec<u8>>) -> WireStat {
    WireStat {
        kind: 0,
        dev: 0,
        qid: qid(st),
        mode: FileMode::from_host(st.mode).bits(),
        atime: st.atime_sec as u32,
        mtime: st.mtime_sec as u32,
        length: st.size,
        name: name.to_vec(),
        uid: Vec::new(),
        gid: Vec::new(),
        muid: Vec::new(),
        unix: extension.map(|extension| UnixStatExt {
            extension,
            n_uid: st.uid,
            n_gid: st.gid,
            n_muid: 0,
        }),
    }
}

fn linux_stat(st: &Stat) -> LinuxStat {
    LinuxStat {
        valid: LinuxStatValidity::BASIC.bits(),
        qid: qid(st),
        mode: st.mode,
        uid: st.uid,
        gid: st.gid,
        nlink: st.nlink,
        rdev: st.rdev,
        size: st.size,
        blksize: st.blksize,
        blocks: st.blocks,
        atime_sec: st.atime_sec,
        atime_nsec: st.atime_nsec,
        mtime_sec: st.mtime_sec,
        mtime_nsec: st.mtime_nsec,
        ctime_sec: st.ctime_sec,
        ctime_nsec: st.ctime_nsec,
        ..Default::default()
    }
}

/// A qid built from a directory entry alone, without a stat.
fn dirent_qid(ent: &DirEntry) -> Qid {
    let kind = match ent.kind {
        DT_DIR => QidType::QTDIR,
        DT_LNK => QidType::QTSYMLINK,
        _ => QidType::QTFILE,
    };
    Qid {
        kind: kind.bits(),
        version: 0,
        path: ent.ino,
    }
}

fn dirent_len(ent: &DirEntry) -> usize {
    Qid::SIZE + 8 + 1 + 2 + ent.name.len()
}

fn file_of(f: &FidRef) -> Result<Arc<OwnedFd>, Error> {
    let fd = match &f.borrow().resource {
        Resource::File(fd) => Ok(fd.clone()),
        _ => Err(Error::EBADF),
    };
    fd
}

fn dir_of(f: &FidRef) -> Result<Arc<Mutex<DirStream>>, Error> {
    let dir = match &f.borrow().resource {
        Resource::Dir(dir) => Ok(dir.clone()),
        _ => Err(Error::EINVAL),
    };
    dir
}

fn unset_path(f: &FidRef) -> Result<(Vec<u8>, u32), Error> {
    let x = f.borrow();
    if x.kind != FidKind::Unset {
        return Err(Error::EINVAL);
    }
    Ok((x.path.clone(), x.uid))
}

impl Session {
    /// Gives back a fid reference once a handler is done with it.
    async fn finish<T>(&self, fid: FidRef, res: Result<T, Error>) -> Result<T, Error> {
        let put = self.put_fid(fid).await;
        let val = res?;
        put.map(|_| val)
    }

    async fn path_of(&self, id: u32) -> Result<(Vec<u8>, u32), Error> {
        let f = self.get_fid(id).await?;
        let res = {
            let x = f.borrow();
            (x.path.clone(), x.uid)
        };
        self.finish(f, Ok(res)).await
    }

    async fn run_at<F>(&self, path: &Path, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&dyn FileSystem, &Path) -> Result<(), Error> + Send + 'static,
    {
        let path = path.to_owned();
        self.fs.run(move |fs| f(fs, &path)).await
    }

    /// Renames on the host, then brings the paths of affected fids up to date.
    async fn rename_paths(&self, old: Vec<u8>, new: Vec<u8>) -> Result<(), Error> {
        if old == new {
            return Ok(());
        }
        let (o, n) = (fs_path(&old), fs_path(&new));
        self.fs.run(move |fs| fs.rename(&o, &n)).await?;
        let moved = self.fids.borrow_mut().rename_fixup(&old, &new);
        trace!(
            self.logger,
            "9P: renamed {} to {}, {} fids moved",
            String::from_utf8_lossy(&old),
            String::from_utf8_lossy(&new),
            moved
        );
        Ok(())
    }

    /// Binds a freshly opened resource to a fid that must still be unset.
    async fn install(
        &self,
        f: &FidRef,
        kind: FidKind,
        res: Resource,
        flags: OpenFlags,
    ) -> Result<(), Error> {
        let leftover = {
            let mut x = f.borrow_mut();
            if x.kind != FidKind::Unset {
                Some(res)
            } else {
                x.open_flags = flags & !(OpenFlags::O_CREAT | OpenFlags::O_EXCL | OpenFlags::O_TRUNC);
                if flags.contains(OpenFlags::O_EXCL) {
                    x.set_non_reclaimable();
                }
                x.set_resource(kind, res);
                None
            }
        };
        match leftover {
            Some(res) => {
                self.close_resources(vec![res]).await;
                Err(Error::EINVAL)
            }
            None => Ok(()),
        }
    }

    pub(super) async fn tversion(&self, msg: &mut Message) -> Result<(), Error> {
        let (msize, version): (u32, Vec<u8>) = msg.read()?;
        if msize < MIN_MSIZE {
            return Err(Error::EMSGSIZE);
        }
        let dialect = std::str::from_utf8(&version)
            .ok()
            .and_then(|v| Dialect::from_str(v).ok())
            .unwrap_or(Dialect::Unnegotiated);
        let msize = msize.min(self.config.max_msize);
        self.clunk_all().await;
        self.negotiate(dialect, msize);
        debug!(self.logger, "9P: negotiated {} with msize {}", dialect, msize);
        msg.write(&(msize, dialect.to_str().as_bytes().to_vec()))
    }

    pub(super) async fn tattach(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, _afid, _uname, _aname): (u32, u32, Vec<u8>, Vec<u8>) = msg.read()?;
        let uid = match self.dialect() {
            Dialect::Unix | Dialect::Linux => msg.read()?,
            _ => NONUNAME,
        };
        let st = self.lstat(Path::new("/")).await?;
        if !st.is_dir() {
            return Err(Error::ENOTDIR);
        }
        let f = self.new_fid(fid, b"/".to_vec(), uid)?;
        self.put_fid(f).await?;
        msg.write(&qid(&st))
    }

    pub(super) async fn twalk(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, newfid, nwname): (u32, u32, u16) = msg.read()?;
        if nwname as usize > MAX_WALK_ELEMENTS {
            return Err(Error::EINVAL);
        }
        let mut names = Vec::with_capacity(nwname as usize);
        for _ in 0..nwname {
            let name: Vec<u8> = msg.read()?;
            check_name(&name)?;
            names.push(name);
        }
        let f = self.get_fid(fid).await?;
        let res = self.walk_from(&f, newfid, names).await;
        let qids = self.finish(f, res).await?;
        msg.write(&(qids.len() as u16))?;
        for q in &qids {
            msg.write(q)?;
        }
        Ok(())
    }

    async fn walk_from(
        &self,
        f: &FidRef,
        newfid: u32,
        names: Vec<Vec<u8>>,
    ) -> Result<Vec<Qid>, Error> {
        let (id, start, uid, kind) = {
            let x = f.borrow();
            (x.id(), x.path.clone(), x.uid, x.kind)
        };
        if newfid == id && kind != FidKind::Unset {
            return Err(Error::EINVAL);
        }
        let want = names.len();
        let (qids, path) = self
            .fs
            .job(move |fs| {
                let mut cur = retry_intr(|| fs.lstat(&fs_path(&start)))?;
                let mut path = start;
                let mut qids = Vec::with_capacity(names.len());
                for name in names {
                    let step = if cur.is_dir() {
                        let next = join_path(&path, &name);
                        retry_intr(|| fs.lstat(&fs_path(&next))).map(|st| (next, st))
                    } else {
                        Err(Error::ENOTDIR)
                    };
                    match step {
                        Ok((next, st)) => {
                            qids.push(qid(&st));
                            path = next;
                            cur = st;
                        }
                        Err(e) if qids.is_empty() => return Err(e),
                        Err(_) => break,
                    }
                }
                Ok((qids, path))
            })
            .await?;
        if qids.len() == want {
            if newfid == id {
                f.borrow_mut().path = path;
            } else {
                let n = self.new_fid(newfid, path, uid)?;
                self.put_fid(n).await?;
            }
        }
        Ok(qids)
    }

    pub(super) async fn topen(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, mode): (u32, u8) = msg.read()?;
        let flags = SimpleOpenMode::from_bits_truncate(mode).to_open_flags();
        let f = self.get_fid(fid).await?;
        let res = self.open_fid(&f, flags).await;
        let reply = self.finish(f, res).await?;
        msg.write(&reply)
    }

    pub(super) async fn tlopen(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, flags): (u32, u32) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let res = self.open_fid(&f, linux_open_flags(flags)).await;
        let reply = self.finish(f, res).await?;
        msg.write(&reply)
    }

    async fn open_fid(&self, f: &FidRef, flags: OpenFlags) -> Result<(Qid, u32), Error> {
        let path = fs_path(&unset_path(f)?.0);
        let st = self.lstat(&path).await?;
        let (kind, res) = if st.is_dir() {
            let dir = self.open_dir(path.clone(), 0).await?;
            (FidKind::Directory, Resource::Dir(Arc::new(Mutex::new(dir))))
        } else {
            let fd = self.open_file(path.clone(), flags, 0).await?;
            (FidKind::File, Resource::File(Arc::new(fd)))
        };
        self.install(f, kind, res, flags).await?;
        Ok((qid(&st), self.iounit(&path).await))
    }

    pub(super) async fn tcreate(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, name, perm, mode): (u32, Vec<u8>, u32, u8) = msg.read()?;
        let extension: Vec<u8> = if self.dialect().is_unix() {
            msg.read()?
        } else {
            Vec::new()
        };
        check_name(&name)?;
        if is_dot(&name) {
            return Err(Error::EEXIST);
        }
        let f = self.get_fid(fid).await?;
        let res = self
            .create_in(&f, &name, FileMode::from_bits_truncate(perm), mode, extension)
            .await;
        let reply = self.finish(f, res).await?;
        msg.write(&reply)
    }

    async fn create_in(
        &self,
        f: &FidRef,
        name: &[u8],
        perm: FileMode,
        mode: u8,
        extension: Vec<u8>,
    ) -> Result<(Qid, u32), Error> {
        let (dir, uid) = unset_path(f)?;
        let newpath = join_path(&dir, name);
        let path = fs_path(&newpath);
        let perms = perm.to_host_permissions();
        let mut opened = None;
        if perm.contains(FileMode::DMDIR) {
            self.run_at(&path, move |fs, p| fs.mkdir(p, perms)).await?;
            let d = self.open_dir(path.clone(), 0).await?;
            opened = Some((
                FidKind::Directory,
                Resource::Dir(Arc::new(Mutex::new(d))),
                OpenFlags::O_RDONLY,
            ));
        } else if perm.contains(FileMode::DMSYMLINK) {
            self.run_at(&path, move |fs, p| fs.symlink(&extension, p))
                .await?;
        } else if perm.contains(FileMode::DMLINK) {
            let src = std::str::from_utf8(&extension)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
                .ok_or(Error::EINVAL)?;
            let (old, _) = self.path_of(src).await?;
            let old = fs_path(&old);
            self.run_at(&path, move |fs, p| fs.link(&old, p)).await?;
        } else if perm.contains(FileMode::DMDEVICE) {
            let (kind, major, minor) = parse_device(&extension)?;
            self.run_at(&path, move |fs, p| {
                fs.mknod(p, kind.bits() | perms, major, minor)
            })
            .await?;
        } else if perm.intersects(FileMode::DMNAMEDPIPE | FileMode::DMSOCKET) {
            let kind = if perm.contains(FileMode::DMNAMEDPIPE) {
                FileType::S_IFIFO
            } else {
                FileType::S_IFSOCK
            };
            self.run_at(&path, move |fs, p| fs.mknod(p, kind.bits() | perms, 0, 0))
                .await?;
        } else {
            let flags = SimpleOpenMode::from_bits_truncate(mode).to_open_flags() | OpenFlags::O_CREAT;
            let fd = self.open_file(path.clone(), flags, perms).await?;
            opened = Some((FidKind::File, Resource::File(Arc::new(fd)), flags));
        }
        if let Some((kind, res, flags)) = opened {
            self.install(f, kind, res, flags).await?;
        }
        f.borrow_mut().path = newpath;
        self.post_create(&path, uid, NONUNAME).await?;
        let st = self.lstat(&path).await?;
        Ok((qid(&st), self.iounit(&path).await))
    }

    pub(super) async fn tlcreate(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, name, flags, mode, gid): (u32, Vec<u8>, u32, u32, u32) = msg.read()?;
        check_name(&name)?;
        if is_dot(&name) {
            return Err(Error::EEXIST);
        }
        let flags = linux_open_flags(flags) | OpenFlags::O_CREAT;
        let f = self.get_fid(fid).await?;
        let res = self.lcreate_in(&f, &name, flags, mode, gid).await;
        let reply = self.finish(f, res).await?;
        msg.write(&reply)
    }

    async fn lcreate_in(
        &self,
        f: &FidRef,
        name: &[u8],
        flags: OpenFlags,
        mode: u32,
        gid: u32,
    ) -> Result<(Qid, u32), Error> {
        let (dir, uid) = unset_path(f)?;
        let newpath = join_path(&dir, name);
        let path = fs_path(&newpath);
        let fd = self.open_file(path.clone(), flags, mode & 0o7777).await?;
        self.install(f, FidKind::File, Resource::File(Arc::new(fd)), flags)
            .await?;
        f.borrow_mut().path = newpath;
        self.post_create(&path, uid, gid).await?;
        let st = self.lstat(&path).await?;
        Ok((qid(&st), self.iounit(&path).await))
    }

    pub(super) async fn tread(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, offset, count): (u32, u64, u32) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let kind = f.borrow().kind;
        let res = match kind {
            FidKind::File => self.read_file(&f, offset, count, msg).await,
            FidKind::Directory if self.dialect().is_linux() => {
                self.read_entries(&f, offset, count, msg).await
            }
            FidKind::Directory => self.read_stats(&f, offset, count, msg).await,
            FidKind::Xattr => Self::read_xattr(&f, offset, count, msg),
            FidKind::Unset => Err(Error::EINVAL),
        };
        self.finish(f, res).await
    }

    pub(super) async fn treaddir(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, offset, count): (u32, u64, u32) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let res = self.read_entries(&f, offset, count, msg).await;
        self.finish(f, res).await
    }

    /// Reads file data straight into the reply buffer.
    async fn read_file(
        &self,
        f: &FidRef,
        offset: u64,
        count: u32,
        msg: &mut Message,
    ) -> Result<(), Error> {
        let fd = file_of(f)?;
        let count_off = msg.reserve(4)?;
        let data_off = count_off + 4;
        let want = (count as usize).min(msg.response_room());
        let sg = msg.take_response();
        let (sg, res) = self
            .fs
            .run_with(sg, move |fs, sg: &mut SgList| {
                let mut done = 0;
                while done < want {
                    let mut bufs: Vec<IoSliceMut<'_>> = sg
                        .slices_mut(data_off + done, want - done)
                        .into_iter()
                        .map(IoSliceMut::new)
                        .collect();
                    let n = fs.preadv(fd.as_fd(), &mut bufs, offset + done as u64)?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            })
            .await;
        msg.restore_response(sg);
        let n = res?;
        msg.reserve(n)?;
        msg.patch(count_off, &(n as u32))
    }

    /// Reads packed stat blocks from a directory, as the classic dialects do.
    async fn read_stats(
        &self,
        f: &FidRef,
        offset: u64,
        count: u32,
        msg: &mut Message,
    ) -> Result<(), Error> {
        let dir = dir_of(f)?;
        let path = f.borrow().path.clone();
        let unix = self.dialect().is_unix();
        let count_off = msg.reserve(4)?;
        let room = (count as usize).min(msg.response_room());
        let stats = self
            .fs
            .job(move |fs| {
                let mut d = dir.lock().map_err(|_| Error::EIO)?;
                if offset == 0 {
                    fs.rewinddir(&mut d);
                }
                let mut out = Vec::new();
                let mut used = 0;
                loop {
                    let pos = fs.telldir(&d);
                    let ent = match retry_intr(|| fs.readdir(&mut d))? {
                        Some(ent) => ent,
                        None => break,
                    };
                    if is_dot(&ent.name) {
                        continue;
                    }
                    let child = fs_path(&join_path(&path, &ent.name));
                    let st = match retry_intr(|| fs.lstat(&child)) {
                        Ok(st) => st,
                        Err(Error::ENOENT) => continue,
                        Err(e) => return Err(e),
                    };
                    let ext = if unix {
                        Some(stat_extension(fs, &child, &st)?)
                    } else {
                        None
                    };
                    let ws = wire_stat(&st, &ent.name, ext);
                    if used + ws.wire_len() > room {
                        fs.seekdir(&mut d, pos)?;
                        break;
                    }
                    used += ws.wire_len();
                    out.push(ws);
                }
                Ok(out)
            })
            .await?;
        let start = msg.response_offset();
        for ws in &stats {
            msg.write(ws)?;
        }
        let total = msg.response_offset() - start;
        msg.patch(count_off, &(total as u32))
    }

    /// Reads 9P2000.L directory entries, resuming at a position from an earlier entry.
    async fn read_entries(
        &self,
        f: &FidRef,
        offset: u64,
        count: u32,
        msg: &mut Message,
    ) -> Result<(), Error> {
        let dir = dir_of(f)?;
        let count_off = msg.reserve(4)?;
        let room = (count as usize).min(msg.response_room());
        let entries = self
            .fs
            .job(move |fs| {
                let mut d = dir.lock().map_err(|_| Error::EIO)?;
                if offset == 0 {
                    fs.rewinddir(&mut d);
                } else {
                    retry_intr(|| fs.seekdir(&mut d, offset))?;
                }
                let mut out = Vec::new();
                let mut used = 0;
                loop {
                    let pos = fs.telldir(&d);
                    let ent = match retry_intr(|| fs.readdir(&mut d))? {
                        Some(ent) => ent,
                        None => break,
                    };
                    if used + dirent_len(&ent) > room {
                        fs.seekdir(&mut d, pos)?;
                        break;
                    }
                    used += dirent_len(&ent);
                    out.push(ent);
                }
                Ok(out)
            })
            .await?;
        let start = msg.response_offset();
        for ent in &entries {
            msg.write(&dirent_qid(ent))?;
            msg.write(&ent.offset)?;
            msg.write(&ent.kind)?;
            msg.write(&ent.name)?;
        }
        let total = msg.response_offset() - start;
        msg.patch(count_off, &(total as u32))
    }

    fn read_xattr(f: &FidRef, offset: u64, count: u32, msg: &mut Message) -> Result<(), Error> {
        let data = {
            let x = f.borrow();
            let value = match &x.resource {
                Resource::Xattr(b) => &b.value,
                _ => return Err(Error::EINVAL),
            };
            if offset >= value.len() as u64 {
                Vec::new()
            } else {
                let start = offset as usize;
                let n = (count as usize)
                    .min(value.len() - start)
                    .min(msg.response_room().saturating_sub(4));
                value[start..start + n].to_vec()
            }
        };
        msg.write(&(data.len() as u32))?;
        msg.write_bytes(&data)
    }

    pub(super) async fn twrite(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, offset, count): (u32, u64, u32) = msg.read()?;
        let (data_off, len) = msg.request_payload(count as usize);
        let f = self.get_fid(fid).await?;
        let kind = f.borrow().kind;
        let res = match kind {
            FidKind::File => self.write_file(&f, offset, data_off, len, msg).await,
            FidKind::Xattr => Self::write_xattr(&f, offset, data_off, len, msg),
            _ => Err(Error::EINVAL),
        };
        let n = self.finish(f, res).await?;
        msg.write(&n)
    }

    async fn write_file(
        &self,
        f: &FidRef,
        offset: u64,
        data_off: usize,
        len: usize,
        msg: &mut Message,
    ) -> Result<u32, Error> {
        let fd = file_of(f)?;
        let sg = msg.take_request();
        let (sg, res) = self
            .fs
            .run_with(sg, move |fs, sg: &mut SgList| {
                let mut done = 0;
                while done < len {
                    let bufs: Vec<IoSlice<'_>> = sg
                        .slices(data_off + done, len - done)
                        .into_iter()
                        .map(IoSlice::new)
                        .collect();
                    let n = fs.pwritev(fd.as_fd(), &bufs, offset + done as u64)?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            })
            .await;
        msg.restore_request(sg);
        Ok(res? as u32)
    }

    /// Buffers a write to an extended attribute that is being created.
    fn write_xattr(
        f: &FidRef,
        offset: u64,
        data_off: usize,
        len: usize,
        msg: &Message,
    ) -> Result<u32, Error> {
        let mut x = f.borrow_mut();
        let b = match &mut x.resource {
            Resource::Xattr(b) if b.create => b,
            _ => return Err(Error::EINVAL),
        };
        if offset > b.value.len() as u64 {
            return Err(Error::ENOSPC);
        }
        let start = offset as usize;
        let n = len.min(b.value.len() - start);
        msg.copy_request(data_off, &mut b.value[start..start + n])?;
        b.copied += n as u64;
        Ok(n as u32)
    }

    pub(super) async fn tclunk(&self, msg: &mut Message) -> Result<(), Error> {
        let fid: u32 = msg.read()?;
        self.clunk(fid).await
    }

    pub(super) async fn tremove(&self, msg: &mut Message) -> Result<(), Error> {
        let fid: u32 = msg.read()?;
        let f = self.get_fid(fid).await?;
        let path = f.borrow().path.clone();
        let res = if path == b"/" {
            Err(Error::EBUSY)
        } else {
            match self.pin_path(&path).await {
                Ok(()) => {
                    let p = fs_path(&path);
                    self.fs.run(move |fs| fs.remove(&p)).await
                }
                Err(e) => Err(e),
            }
        };
        // The fid goes away whether or not the removal worked.
        self.fids.borrow_mut().retire_ref(&f);
        self.finish(f, res).await
    }

    pub(super) async fn tstat(&self, msg: &mut Message) -> Result<(), Error> {
        let fid: u32 = msg.read()?;
        let f = self.get_fid(fid).await?;
        let path = f.borrow().path.clone();
        let unix = self.dialect().is_unix();
        let res = self
            .fs
            .job(move |fs| {
                let p = fs_path(&path);
                let st = retry_intr(|| fs.lstat(&p))?;
                let ext = if unix {
                    Some(stat_extension(fs, &p, &st)?)
                } else {
                    None
                };
                Ok(wire_stat(&st, basename(&path), ext))
            })
            .await;
        let ws = self.finish(f, res).await?;
        msg.write(&(ws.wire_len() as u16))?;
        msg.write(&ws)
    }

    pub(super) async fn twstat(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, _size, ws): (u32, u16, WireStat) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let res = self.wstat_fid(&f, ws).await;
        self.finish(f, res).await
    }

    async fn wstat_fid(&self, f: &FidRef, ws: WireStat) -> Result<(), Error> {
        if ws.is_dont_touch() {
            return match file_of(f) {
                Ok(fd) => self.fs.run(move |fs| fs.fsync(fd.as_fd(), false)).await,
                Err(_) => Ok(()),
            };
        }
        let mut path = f.borrow().path.clone();
        let p = fs_path(&path);
        if ws.mode != u32::MAX {
            let mode = FileMode::from_bits_truncate(ws.mode);
            let st = self.lstat(&p).await?;
            if mode.contains(FileMode::DMDIR) != st.is_dir() {
                return Err(Error::EIO);
            }
            let perms = mode.to_host_permissions();
            self.run_at(&p, move |fs, p| fs.chmod(p, perms)).await?;
        }
        if ws.atime != u32::MAX || ws.mtime != u32::MAX {
            let time = |t: u32| match t {
                u32::MAX => SetTime::Omit,
                t => SetTime::At {
                    sec: t as u64,
                    nsec: 0,
                },
            };
            let (atime, mtime) = (time(ws.atime), time(ws.mtime));
            self.run_at(&p, move |fs, p| fs.utimens(p, atime, mtime))
                .await?;
        }
        if let Some(u) = &ws.unix {
            let uid = Some(u.n_uid).filter(|v| *v != u32::MAX);
            let gid = Some(u.n_gid).filter(|v| *v != u32::MAX);
            if uid.is_some() || gid.is_some() {
                self.run_at(&p, move |fs, p| fs.chown(p, uid, gid)).await?;
            }
        }
        if !ws.name.is_empty() {
            check_name(&ws.name)?;
            if is_dot(&ws.name) {
                return Err(Error::EINVAL);
            }
            let new = join_path(&parent(&path), &ws.name);
            self.rename_paths(path, new.clone()).await?;
            path = new;
        }
        if ws.length != u64::MAX {
            let len = ws.length;
            self.run_at(&fs_path(&path), move |fs, p| fs.truncate(p, len))
                .await?;
        }
        Ok(())
    }

    pub(super) async fn tgetattr(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, _mask): (u32, u64) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let path = fs_path(&f.borrow().path);
        let res = match self.lstat(&path).await {
            Err(Error::ENOENT) => match file_of(&f) {
                Ok(fd) => self.fs.run(move |fs| fs.fstat(fd.as_fd())).await,
                Err(_) => Err(Error::ENOENT),
            },
            r => r,
        };
        let st = self.finish(f, res).await?;
        msg.write(&linux_stat(&st))
    }

    pub(super) async fn tsetattr(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, attr): (u32, SetAttr) = msg.read()?;
        let (path, _) = self.path_of(fid).await?;
        let p = fs_path(&path);
        let valid = LinuxSetattrValidity::from_bits_truncate(attr.valid);
        if valid.contains(LinuxSetattrValidity::MODE) {
            let mode = attr.mode & 0o7777;
            self.run_at(&p, move |fs, p| fs.chmod(p, mode)).await?;
        }
        if valid.intersects(LinuxSetattrValidity::ATIME | LinuxSetattrValidity::MTIME) {
            let time = |set: LinuxSetattrValidity, explicit: LinuxSetattrValidity, sec, nsec| {
                if !valid.contains(set) {
                    SetTime::Omit
                } else if valid.contains(explicit) {
                    SetTime::At { sec, nsec }
                } else {
                    SetTime::Now
                }
            };
            let atime = time(
                LinuxSetattrValidity::ATIME,
                LinuxSetattrValidity::ATIME_SET,
                attr.atime_sec,
                attr.atime_nsec,
            );
            let mtime = time(
                LinuxSetattrValidity::MTIME,
                LinuxSetattrValidity::MTIME_SET,
                attr.mtime_sec,
                attr.mtime_nsec,
            );
            self.run_at(&p, move |fs, p| fs.utimens(p, atime, mtime))
                .await?;
        }
        if valid.intersects(LinuxSetattrValidity::UID | LinuxSetattrValidity::GID) {
            let uid = Some(attr.uid).filter(|_| valid.contains(LinuxSetattrValidity::UID));
            let gid = Some(attr.gid).filter(|_| valid.contains(LinuxSetattrValidity::GID));
            self.run_at(&p, move |fs, p| fs.chown(p, uid, gid)).await?;
        }
        if valid.contains(LinuxSetattrValidity::SIZE) {
            let size = attr.size;
            self.run_at(&p, move |fs, p| fs.truncate(p, size)).await?;
        }
        Ok(())
    }

    pub(super) async fn tstatfs(&self, msg: &mut Message) -> Result<(), Error> {
        let fid: u32 = msg.read()?;
        let (path, _) = self.path_of(fid).await?;
        let p = fs_path(&path);
        let st = self.fs.run(move |fs| fs.statfs(&p)).await?;
        msg.write(&StatFs {
            fs_type: st.fs_type,
            bsize: st.bsize,
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            fsid: st.fsid,
            namelen: st.namelen,
        })
    }

    pub(super) async fn treadlink(&self, msg: &mut Message) -> Result<(), Error> {
        let fid: u32 = msg.read()?;
        let (path, _) = self.path_of(fid).await?;
        let p = fs_path(&path);
        let target = self.fs.run(move |fs| fs.readlink(&p)).await?;
        msg.write(&target)
    }

    /// Resolves `name` in directory `dfid` for a node about to be created.
    async fn new_node_path(&self, dfid: u32, name: &[u8]) -> Result<(PathBuf, u32), Error> {
        check_name(name)?;
        if is_dot(name) {
            return Err(Error::EEXIST);
        }
        let (dir, uid) = self.path_of(dfid).await?;
        Ok((fs_path(&join_path(&dir, name)), uid))
    }

    /// Finishes creating a node: ownership, then its qid.
    async fn created(&self, path: &Path, uid: u32, gid: u32) -> Result<Qid, Error> {
        self.post_create(path, uid, gid).await?;
        Ok(qid(&self.lstat(path).await?))
    }

    pub(super) async fn tsymlink(&self, msg: &mut Message) -> Result<(), Error> {
        let (dfid, name, target, gid): (u32, Vec<u8>, Vec<u8>, u32) = msg.read()?;
        let (path, uid) = self.new_node_path(dfid, &name).await?;
        self.run_at(&path, move |fs, p| fs.symlink(&target, p))
            .await?;
        let q = self.created(&path, uid, gid).await?;
        msg.write(&q)
    }

    pub(super) async fn tmknod(&self, msg: &mut Message) -> Result<(), Error> {
        let (dfid, name, mode, major, minor, gid): (u32, Vec<u8>, u32, u32, u32, u32) =
            msg.read()?;
        let (path, uid) = self.new_node_path(dfid, &name).await?;
        self.run_at(&path, move |fs, p| fs.mknod(p, mode, major, minor))
            .await?;
        let q = self.created(&path, uid, gid).await?;
        msg.write(&q)
    }

    pub(super) async fn tmkdir(&self, msg: &mut Message) -> Result<(), Error> {
        let (dfid, name, mode, gid): (u32, Vec<u8>, u32, u32) = msg.read()?;
        let (path, uid) = self.new_node_path(dfid, &name).await?;
        self.run_at(&path, move |fs, p| fs.mkdir(p, mode & 0o7777))
            .await?;
        let q = self.created(&path, uid, gid).await?;
        msg.write(&q)
    }

    pub(super) async fn tlink(&self, msg: &mut Message) -> Result<(), Error> {
        let (dfid, fid, name): (u32, u32, Vec<u8>) = msg.read()?;
        let (path, _) = self.new_node_path(dfid, &name).await?;
        let (old, _) = self.path_of(fid).await?;
        let old = fs_path(&old);
        self.run_at(&path, move |fs, p| fs.link(&old, p)).await
    }

    pub(super) async fn trename(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, dfid, name): (u32, u32, Vec<u8>) = msg.read()?;
        check_name(&name)?;
        if is_dot(&name) {
            return Err(Error::EISDIR);
        }
        let f = self.get_fid(fid).await?;
        let res = unset_path(&f);
        let (old, _) = self.finish(f, res).await?;
        let dir = if dfid == NOFID {
            parent(&old)
        } else {
            self.path_of(dfid).await?.0
        };
        self.rename_paths(old, join_path(&dir, &name)).await
    }

    pub(super) async fn trenameat(&self, msg: &mut Message) -> Result<(), Error> {
        let (olddfid, oldname, newdfid, newname): (u32, Vec<u8>, u32, Vec<u8>) = msg.read()?;
        for name in [&oldname, &newname] {
            check_name(name)?;
            if is_dot(name) {
                return Err(Error::EISDIR);
            }
        }
        let (olddir, _) = self.path_of(olddfid).await?;
        let (newdir, _) = self.path_of(newdfid).await?;
        self.rename_paths(join_path(&olddir, &oldname), join_path(&newdir, &newname))
            .await
    }

    pub(super) async fn tunlinkat(&self, msg: &mut Message) -> Result<(), Error> {
        let (dfid, name, flags): (u32, Vec<u8>, u32) = msg.read()?;
        check_name(&name)?;
        match &name[..] {
            b"." => return Err(Error::EINVAL),
            b".." => return Err(Error::ENOTEMPTY),
            _ => (),
        }
        let (dir, _) = self.path_of(dfid).await?;
        let path = join_path(&dir, &name);
        self.pin_path(&path).await?;
        let remove_dir = flags & AT_REMOVEDIR != 0;
        self.run_at(&fs_path(&path), move |fs, p| fs.unlink(p, remove_dir))
            .await
    }

    pub(super) async fn tfsync(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, datasync): (u32, u32) = msg.read()?;
        let f = self.get_fid(fid).await?;
        let kind = f.borrow().kind;
        let res = match kind {
            FidKind::File => match file_of(&f) {
                Ok(fd) => {
                    self.fs
                        .run(move |fs| fs.fsync(fd.as_fd(), datasync != 0))
                        .await
                }
                Err(e) => Err(e),
            },
            FidKind::Directory => Ok(()),
            _ => Err(Error::EBADF),
        };
        self.finish(f, res).await
    }

    pub(super) async fn txattrwalk(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, newfid, name): (u32, u32, Vec<u8>) = msg.read()?;
        let (path, uid) = self.path_of(fid).await?;
        let p = fs_path(&path);
        let attr = name.clone();
        let value = self
            .fs
            .run(move |fs| {
                if attr.is_empty() {
                    fs.listxattr(&p)
                } else {
                    fs.getxattr(&p, &attr)
                }
            })
            .await?;
        let size = value.len() as u64;
        let n = self.new_fid(newfid, path, uid)?;
        n.borrow_mut().set_resource(
            FidKind::Xattr,
            Resource::Xattr(XattrBuffer {
                name,
                value,
                ..Default::default()
            }),
        );
        self.put_fid(n).await?;
        msg.write(&size)
    }

    pub(super) async fn txattrcreate(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, name, size, flags): (u32, Vec<u8>, u64, u32) = msg.read()?;
        if size > XATTR_SIZE_MAX {
            return Err(Error::E2BIG);
        }
        let f = self.get_fid(fid).await?;
        let res = match unset_path(&f) {
            Ok(_) => {
                f.borrow_mut().set_resource(
                    FidKind::Xattr,
                    Resource::Xattr(XattrBuffer {
                        name,
                        value: vec![0; size as usize],
                        copied: 0,
                        flags,
                        create: true,
                    }),
                );
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.finish(f, res).await
    }

    pub(super) async fn tlock(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, kind, _flags, _start, _length, _proc_id, _client_id): (
            u32,
            u8,
            u32,
            u64,
            u64,
            u32,
            Vec<u8>,
        ) = msg.read()?;
        LockType::from_u8(kind).ok_or(Error::EINVAL)?;
        self.path_of(fid).await?;
        msg.write(&(LockStatus::Success as u8))
    }

    pub(super) async fn tgetlock(&self, msg: &mut Message) -> Result<(), Error> {
        let (fid, kind, start, length, proc_id, client_id): (u32, u8, u64, u64, u32, Vec<u8>) =
            msg.read()?;
        LockType::from_u8(kind).ok_or(Error::EINVAL)?;
        self.path_of(fid).await?;
        msg.write(&(
            LockType::Unlock as u8,
            start,
            length,
            proc_id,
            client_id,
        ))
    }

    /// Requests are never cancelled; the reply only tells the client the tag is free.
    pub(super) async fn tflush(&self, msg: &mut Message) -> Result<(), Error> {
        let _oldtag: u16 = msg.read()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{dirent_len, dirent_qid, linux_open_flags, parse_device, wire_stat};
    use virtfs_constants::error::Error;
    use virtfs_fs::backend::{DirEntry, FileType, OpenFlags, Stat};

    #[test]
    fn device_extensions() {
        assert_eq!(
            parse_device(b"c 1 3").unwrap(),
            (FileType::S_IFCHR, 1, 3)
        );
        assert_eq!(
            parse_device(b"b 8 16").unwrap(),
            (FileType::S_IFBLK, 8, 16)
        );
        assert_eq!(parse_device(b"x 1 3"), Err(Error::EINVAL));
        assert_eq!(parse_device(b"c 1"), Err(Error::EINVAL));
    }

    #[test]
    fn open_flags_drop_client_only_bits() {
        let f = linux_open_flags(0o2 | 0o100 | 0o400 | 0o20000 | 0o40000 | 0o1000);
        assert_eq!(f, OpenFlags::O_RDWR | OpenFlags::O_TRUNC);
    }

    #[test]
    fn entries_and_stats() {
        let ent = DirEntry {
            name: b"subdir".to_vec(),
            ino: 99,
            kind: 4,
            offset: 3,
        };
        let q = dirent_qid(&ent);
        assert_eq!((q.kind, q.version, q.path), (0x80, 0, 99));
        assert_eq!(dirent_len(&ent), 13 + 8 + 1 + 2 + 6);

        let st = Stat {
            mode: 0o100644,
            size: 12,
            uid: 1000,
            gid: 100,
            ..Default::default()
        };
        let ws = wire_stat(&st, b"file", None);
        assert_eq!(ws.mode, 0o644);
        assert_eq!(ws.length, 12);
        assert!(ws.unix.is_none());
        let ws = wire_stat(&st, b"file", Some(Vec::new()));
        let u = ws.unix.unwrap();
        assert_eq!((u.n_uid, u.n_gid), (1000, 100));
    }
}
