use crate::codec::Qid;
use crate::config::ServerConfig;
use crate::fid::{FidKind, FidRef, FidTable, Released, Resource};
use crate::protocol::{qid_type, Dialect, IO_HEADER_SIZE};
use crate::reclaim;
use crate::worker::Worker;
use std::cell::{Cell, RefCell};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use virtfs_constants::error::Error;
use virtfs_constants::logger::Logger;
use virtfs_fs::backend::host::DirStream;
use virtfs_fs::backend::{FileSystem, OpenFlags, Stat};

#[cfg(feature = "unix")]
use rustix::fd::OwnedFd;

/// The uid meaning "no user given".
pub const NONUNAME: u32 = u32::MAX;

pub fn fs_path(path: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(path))
}

pub fn qid(st: &Stat) -> Qid {
    Qid {
        kind: qid_type(st).bits(),
        version: (st.mtime_sec as u32) ^ ((st.size as u32) << 8),
        path: st.ino,
    }
}

/// State shared by every request on one connection.
///
/// Handlers run as tasks on a single thread, so the fid table sits in a `RefCell`; no borrow of
/// it is ever held across an `.await`.
pub struct Session {
    pub(super) config: ServerConfig,
    pub(super) fs: Worker,
    pub(super) logger: Arc<dyn Logger + Send + Sync>,
    dialect: Cell<Dialect>,
    msize: Cell<u32>,
    pub(super) fids: RefCell<FidTable>,
}

impl Session {
    pub fn new(
        config: ServerConfig,
        fs: Arc<dyn FileSystem>,
        logger: Arc<dyn Logger + Send + Sync>,
    ) -> Self {
        Session {
            msize: Cell::new(config.max_msize),
            config,
            fs: Worker::new(fs),
            logger,
            dialect: Cell::new(Dialect::Unnegotiated),
            fids: RefCell::new(FidTable::new()),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect.get()
    }

    pub fn msize(&self) -> u32 {
        self.msize.get()
    }

    pub(super) fn negotiate(&self, dialect: Dialect, msize: u32) {
        self.dialect.set(dialect);
        self.msize.set(msize);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs `f` with the fid table borrowed.
    pub fn with_fids<T, F: FnOnce(&mut FidTable) -> T>(&self, f: F) -> T {
        f(&mut self.fids.borrow_mut())
    }

    /// Looks up a fid and takes a reference to it, reopening its descriptor if it was
    /// reclaimed.  The reference must be given back with [`Session::put_fid`].
    pub async fn get_fid(&self, id: u32) -> Result<FidRef, Error> {
        let fid = self.fids.borrow_mut().acquire(id)?;
        if fid.borrow().needs_reopen() {
            if let Err(e) = self.reopen(&fid).await {
                self.drop_ref(fid).await;
                return Err(e);
            }
        }
        Ok(fid)
    }

    /// Creates a new unset fid.  The reference must be given back with [`Session::put_fid`].
    pub fn new_fid(&self, id: u32, path: Vec<u8>, uid: u32) -> Result<FidRef, Error> {
        Ok(self.fids.borrow_mut().allocate(id, path, uid)?)
    }

    /// Gives back a fid reference, freeing the fid if it was the last one on a retired fid.
    ///
    /// Freeing an extended attribute create fid commits the attribute, and that can fail.
    pub async fn put_fid(&self, fid: FidRef) -> Result<(), Error> {
        let released = self.fids.borrow_mut().release(fid);
        match released {
            Some(r) => self.free(r).await,
            None => Ok(()),
        }
    }

    /// Like [`Session::put_fid`] for paths that already have an error to report.
    async fn drop_ref(&self, fid: FidRef) {
        let id = fid.id();
        if let Err(e) = self.put_fid(fid).await {
            debug!(self.logger, "9P: freeing fid {} failed: {}", id, e);
        }
    }

    /// Retires a fid and drops the table's reference to it.
    pub async fn clunk(&self, id: u32) -> Result<(), Error> {
        let fid = self.fids.borrow_mut().retire(id)?;
        self.put_fid(fid).await
    }

    /// Clunks every fid, as a new version negotiation requires.
    pub async fn clunk_all(&self) {
        let all = self.fids.borrow_mut().retire_all();
        for fid in all {
            self.drop_ref(fid).await;
        }
    }

    async fn free(&self, released: Released) -> Result<(), Error> {
        match released.resource {
            Resource::Xattr(x) if x.create => {
                if x.copied != x.value.len() as u64 {
                    return Err(Error::EINVAL);
                }
                let path = fs_path(&released.path);
                self.fs
                    .run(move |fs| {
                        if x.value.is_empty() {
                            fs.removexattr(&path, &x.name)
                        } else {
                            fs.setxattr(&path, &x.name, &x.value, x.flags)
                        }
                    })
                    .await
            }
            res => {
                self.close_resources(vec![res]).await;
                Ok(())
            }
        }
    }

    /// Closes resources on a worker and returns the descriptors it closed to the budget.
    pub(crate) async fn close_resources(&self, res: Vec<Resource>) {
        if !res.iter().any(Resource::is_descriptor) {
            return;
        }
        let closed = self
            .fs
            .job(move |fs| Ok(res.into_iter().map(|r| r.close(fs)).filter(|&closed| closed).count()))
            .await;
        if let Ok(n) = closed {
            self.config.budget.closed(n);
        }
    }

    /// Runs one reclaim sweep over this session's fids.
    pub async fn reclaim(&self) -> usize {
        let taken = reclaim::sweep(&self.fids.borrow(), self.config.budget.batch());
        let n = taken.len();
        if n > 0 {
            debug!(
                self.logger,
                "9P: reclaiming {} descriptors ({} open)",
                n,
                self.config.budget.open_descriptors()
            );
            self.close_resources(taken).await;
        }
        n
    }

    /// Runs a call that creates a descriptor, keeping within the descriptor budget.
    ///
    /// Under pressure one sweep runs first.  If the host still has no descriptor to spare, one
    /// more sweep runs and the call is retried once.
    async fn open_descriptor<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnMut(&dyn FileSystem) -> Result<T, Error> + Clone + Send + 'static,
    {
        if self.config.budget.under_pressure() {
            self.reclaim().await;
        }
        let res = match self.fs.run(f.clone()).await {
            Err(Error::EMFILE) | Err(Error::ENFILE) => {
                self.reclaim().await;
                self.fs.run(f).await
            }
            r => r,
        };
        if res.is_ok() {
            self.config.budget.opened();
        }
        res
    }

    pub async fn open_file(
        &self,
        path: PathBuf,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<OwnedFd, Error> {
        self.open_descriptor(move |fs| fs.open(&path, flags, mode))
            .await
    }

    pub async fn open_dir(&self, path: PathBuf, pos: u64) -> Result<DirStream, Error> {
        self.open_descriptor(move |fs| {
            let mut dir = fs.opendir(&path)?;
            if pos != 0 {
                fs.seekdir(&mut dir, pos)?;
            }
            Ok(dir)
        })
        .await
    }

    /// Gives a reclaimed fid its descriptor back.
    async fn reopen(&self, fid: &FidRef) -> Result<(), Error> {
        let (kind, path, flags, pos) = {
            let f = fid.borrow();
            (f.kind, f.fs_path(), f.open_flags, f.dir_pos)
        };
        trace!(self.logger, "9P: reopening fid {} ({:?})", fid.id(), path);
        let res = match kind {
            FidKind::Directory => {
                Resource::Dir(Arc::new(Mutex::new(self.open_dir(path, pos).await?)))
            }
            _ => Resource::File(Arc::new(self.open_file(path, flags, 0).await?)),
        };
        let raced = {
            let mut f = fid.borrow_mut();
            if f.needs_reopen() {
                f.set_resource(kind, res);
                None
            } else {
                Some(res)
            }
        };
        if let Some(res) = raced {
            self.close_resources(vec![res]).await;
        }
        Ok(())
    }

    /// Keeps every fid on `path` from being reclaimed, reopening any already reclaimed.
    ///
    /// Used before the path goes away, since such fids could not be reopened afterwards.
    pub async fn pin_path(&self, path: &[u8]) -> Result<(), Error> {
        let reopen = self.fids.borrow_mut().pin_path(path);
        let mut result = Ok(());
        for fid in reopen {
            let r = self.reopen(&fid).await;
            self.drop_ref(fid).await;
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    /// Gives a newly created node to the requesting user, if so configured.
    pub async fn post_create(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        if !self.config.chown_on_create {
            return Ok(());
        }
        let uid = Some(uid).filter(|u| *u != NONUNAME);
        let gid = Some(gid).filter(|g| *g != NONUNAME);
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        let path = path.to_owned();
        self.fs.run(move |fs| fs.chown(&path, uid, gid)).await
    }

    pub async fn lstat(&self, path: &Path) -> Result<Stat, Error> {
        let path = path.to_owned();
        self.fs.run(move |fs| fs.lstat(&path)).await
    }

    /// The largest I/O worth issuing for a file, a whole number of host blocks.
    pub async fn iounit(&self, path: &Path) -> u32 {
        let avail = self.msize().saturating_sub(IO_HEADER_SIZE);
        let path = path.to_owned();
        let bsize = match self.fs.run(move |fs| fs.statfs(&path)).await {
            Ok(st) if st.bsize > 0 => st.bsize,
            _ => return avail,
        };
        match bsize * (avail / bsize) {
            0 => avail,
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{qid, Session};
    use crate::config::ServerConfig;
    use crate::fid::{FidKind, Resource};
    use crate::reclaim::DescriptorBudget;
    use std::sync::{Arc, Mutex};
    use virtfs_constants::error::Error;
    use virtfs_constants::logger::NullLogger;
    use virtfs_fs::backend::host::HostFs;
    use virtfs_fs::backend::{OpenFlags, Stat};

    fn session(root: &std::path::Path, budget: Arc<DescriptorBudget>) -> Session {
        Session::new(
            ServerConfig::with_budget(root, budget),
            Arc::new(HostFs::new(root)),
            Arc::new(NullLogger),
        )
    }

    async fn open(s: &Session, id: u32, name: &str, flags: OpenFlags) {
        let path = format!("/{}", name).into_bytes();
        let fid = s.new_fid(id, path, 0).unwrap();
        let path = fid.borrow().fs_path();
        let fd = s.open_file(path, flags, 0o644).await.unwrap();
        {
            let mut f = fid.borrow_mut();
            f.open_flags = flags & !(OpenFlags::O_CREAT | OpenFlags::O_EXCL);
            if flags.contains(OpenFlags::O_EXCL) {
                f.set_non_reclaimable();
            }
            f.set_resource(FidKind::File, Resource::File(Arc::new(fd)));
        }
        s.put_fid(fid).await.unwrap();
    }

    #[test]
    fn qid_from_stat() {
        let st = Stat {
            ino: 77,
            mode: 0o040755,
            mtime_sec: 0x1000,
            size: 0x10,
            ..Default::default()
        };
        let q = qid(&st);
        assert_eq!(q.kind, 0x80);
        assert_eq!(q.path, 77);
        assert_eq!(q.version, 0x1000 ^ 0x1000);
    }

    #[tokio::test]
    async fn exclusive_fids_survive_pressure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain"), b"contents").unwrap();
        let budget = Arc::new(DescriptorBudget::new(1, 16));
        let s = session(dir.path(), budget.clone());
        open(&s, 1, "excl", OpenFlags::O_RDWR | OpenFlags::O_CREAT | OpenFlags::O_EXCL).await;
        open(&s, 2, "plain", OpenFlags::O_RDONLY).await;
        assert!(budget.under_pressure());

        // The first sweep gives both fids their second chance; the second takes what it may.
        s.reclaim().await;
        assert_eq!(s.reclaim().await, 1);
        let (excl, plain) = s.with_fids(|t| (t.acquire(1).unwrap(), t.acquire(2).unwrap()));
        assert!(!excl.borrow().is_reclaimed());
        assert!(matches!(excl.borrow().resource, Resource::File(_)));
        assert!(plain.borrow().needs_reopen());
        s.put_fid(excl).await.unwrap();
        s.put_fid(plain).await.unwrap();
        assert_eq!(budget.open_descriptors(), 1);

        // Using the reclaimed fid reopens it exactly once.
        let plain = s.get_fid(2).await.unwrap();
        assert!(!plain.borrow().is_reclaimed());
        assert_eq!(budget.open_descriptors(), 2);
        s.put_fid(plain).await.unwrap();
        let plain = s.get_fid(2).await.unwrap();
        assert_eq!(budget.open_descriptors(), 2);
        s.put_fid(plain).await.unwrap();

        s.clunk(1).await.unwrap();
        s.clunk(2).await.unwrap();
        assert_eq!(budget.open_descriptors(), 0);
        assert_eq!(s.clunk(2).await, Err(Error::ENOENT));
    }

    #[tokio::test]
    async fn shared_descriptors_stay_counted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain"), b"contents").unwrap();
        let budget = Arc::new(DescriptorBudget::new(1 << 16, 16));
        let s = session(dir.path(), budget.clone());
        open(&s, 3, "plain", OpenFlags::O_RDONLY).await;
        assert_eq!(budget.open_descriptors(), 1);
        let held = s.with_fids(|t| {
            let f = t.values().find(|f| f.id() == 3).unwrap().borrow();
            match &f.resource {
                Resource::File(fd) => fd.clone(),
                _ => panic!("fid 3 is not an open file"),
            }
        });

        // The descriptor outlives the clunk, so it still counts against the budget.
        s.clunk(3).await.unwrap();
        assert_eq!(Arc::strong_count(&held), 1);
        assert_eq!(budget.open_descriptors(), 1);
        drop(held);

        open(&s, 4, "plain", OpenFlags::O_RDONLY).await;
        assert_eq!(budget.open_descriptors(), 2);
        s.clunk(4).await.unwrap();
        assert_eq!(budget.open_descriptors(), 1);
    }

    #[tokio::test]
    async fn failed_reopen_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone"), b"").unwrap();
        let budget = Arc::new(DescriptorBudget::new(0, 16));
        let s = session(dir.path(), budget);
        open(&s, 4, "gone", OpenFlags::O_RDONLY).await;
        s.reclaim().await;
        s.reclaim().await;
        std::fs::remove_file(dir.path().join("gone")).unwrap();
        assert_eq!(s.get_fid(4).await.err(), Some(Error::ENOENT));
        let fid = s.with_fids(|t| t.acquire(4).unwrap());
        assert_eq!(fid.borrow().refcount(), 1);
        s.put_fid(fid).await.unwrap();
    }

    #[tokio::test]
    async fn pinning_reopens_reclaimed_fids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        let budget = Arc::new(DescriptorBudget::new(0, 16));
        let s = session(dir.path(), budget);
        let fid = s.new_fid(9, b"/d".to_vec(), 0).unwrap();
        let path = fid.borrow().fs_path();
        let stream = s.open_dir(path, 0).await.unwrap();
        fid.borrow_mut()
            .set_resource(FidKind::Directory, Resource::Dir(Arc::new(Mutex::new(stream))));
        s.put_fid(fid).await.unwrap();
        s.reclaim().await;
        s.reclaim().await;
        s.pin_path(b"/d").await.unwrap();
        let fid = s.with_fids(|t| t.acquire(9).unwrap());
        assert!(!fid.borrow().is_reclaimable());
        assert!(matches!(fid.borrow().resource, Resource::Dir(_)));
        s.put_fid(fid).await.unwrap();
    }
}
