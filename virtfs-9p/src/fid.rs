//! The per-session table of client handles.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use virtfs_constants::error::Error;
use virtfs_fs::backend::host::DirStream;
use virtfs_fs::backend::{FileSystem, OpenFlags};

#[cfg(feature = "unix")]
use rustix::fd::OwnedFd;

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FidError {
    #[error("fid {0} is not in use")]
    NotFound(u32),
    #[error("fid {0} is already in use")]
    Duplicate(u32),
}

impl From<FidError> for Error {
    fn from(e: FidError) -> Error {
        match e {
            FidError::NotFound(_) => Error::ENOENT,
            FidError::Duplicate(_) => Error::EINVAL,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FidKind {
    Unset,
    File,
    Directory,
    Xattr,
}

/// An extended attribute being read or written through a fid.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct XattrBuffer {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    /// Bytes written so far, for a pending create.
    pub copied: u64,
    pub flags: u32,
    /// Whether this fid came from `Txattrcreate` and must be committed on release.
    pub create: bool,
}

/// The host resource a fid holds.
pub enum Resource {
    None,
    File(Arc<OwnedFd>),
    Dir(Arc<Mutex<DirStream>>),
    Xattr(XattrBuffer),
}

impl Resource {
    /// Whether this resource holds a host descriptor.
    pub fn is_descriptor(&self) -> bool {
        matches!(self, Resource::File(_) | Resource::Dir(_))
    }

    /// Closes a descriptor resource.  Called on a worker.
    ///
    /// Returns whether a descriptor was actually closed.
    pub fn close(self, fs: &dyn FileSystem) -> bool {
        match self {
            Resource::File(fd) => {
                // Another holder only exists while a call is still finishing; the descriptor
                // closes when it drops its reference.
                match Arc::try_unwrap(fd) {
                    Ok(fd) => {
                        fs.close(fd);
                        true
                    }
                    Err(_) => false,
                }
            }
            Resource::Dir(dir) => match Arc::try_unwrap(dir) {
                Ok(dir) => {
                    fs.closedir(dir.into_inner().unwrap_or_else(|e| e.into_inner()));
                    true
                }
                Err(_) => false,
            },
            Resource::None | Resource::Xattr(_) => false,
        }
    }
}

pub struct Fid {
    id: u32,
    pub kind: FidKind,
    pub resource: Resource,
    /// The export path this fid denotes, always starting with `/`.
    pub path: Vec<u8>,
    pub uid: u32,
    /// The flags to reopen with after a reclaim.
    pub open_flags: OpenFlags,
    /// The directory position to restore after a reclaim.
    pub dir_pos: u64,
    refcount: u32,
    referenced: bool,
    non_reclaimable: bool,
    retired: bool,
    reclaimed: bool,
}

impl Fid {
    fn new(id: u32, path: Vec<u8>, uid: u32) -> Self {
        Fid {
            id,
            kind: FidKind::Unset,
            resource: Resource::None,
            path,
            uid,
            open_flags: OpenFlags::O_RDONLY,
            dir_pos: 0,
            refcount: 0,
            referenced: true,
            non_reclaimable: false,
            retired: false,
            reclaimed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed
    }

    pub fn is_reclaimable(&self) -> bool {
        !self.non_reclaimable
    }

    pub fn set_non_reclaimable(&mut self) {
        self.non_reclaimable = true;
    }

    pub fn fs_path(&self) -> PathBuf {
        PathBuf::from(OsStr::from_bytes(&self.path))
    }

    /// Whether the descriptor was taken by a reclaim and must be reopened before use.
    pub fn needs_reopen(&self) -> bool {
        self.reclaimed
            && matches!(self.resource, Resource::None)
            && matches!(self.kind, FidKind::File | FidKind::Directory)
    }

    /// Installs a freshly opened resource.
    pub fn set_resource(&mut self, kind: FidKind, resource: Resource) {
        self.kind = kind;
        self.resource = resource;
        self.reclaimed = false;
    }

    /// Gives up the descriptor for a reclaim, remembering how to get it back.
    pub(crate) fn take_for_reclaim(&mut self) -> Option<Resource> {
        if !self.resource.is_descriptor() {
            return None;
        }
        if let Resource::Dir(dir) = &self.resource {
            match dir.try_lock() {
                Ok(d) => self.dir_pos = d.position(),
                Err(_) => return None,
            }
        }
        self.reclaimed = true;
        Some(std::mem::replace(&mut self.resource, Resource::None))
    }

    pub(crate) fn second_chance(&mut self) -> bool {
        std::mem::replace(&mut self.referenced, false)
    }
}

/// A shared handle to a fid in (or recently removed from) the table.
#[derive(Clone)]
pub struct FidRef(Rc<RefCell<Fid>>);

impl FidRef {
    pub fn borrow(&self) -> Ref<'_, Fid> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Fid> {
        self.0.borrow_mut()
    }

    pub fn id(&self) -> u32 {
        self.0.borrow().id
    }

    fn same(&self, other: &FidRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// What is left of a fid once its last reference goes away.
pub struct Released {
    pub id: u32,
    pub path: Vec<u8>,
    pub resource: Resource,
}

/// Live fids keyed by id.
///
/// Every method here runs to completion without suspending, so a caller that does not hold a
/// borrow across an `.await` sees each operation as atomic.
#[derive(Default)]
pub struct FidTable {
    fids: BTreeMap<u32, FidRef>,
}

impl FidTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.fids.contains_key(&id)
    }

    /// Creates an unset fid.  The caller holds one reference and must release it.
    pub fn allocate(&mut self, id: u32, path: Vec<u8>, uid: u32) -> Result<FidRef, FidError> {
        if self.fids.contains_key(&id) {
            return Err(FidError::Duplicate(id));
        }
        let mut fid = Fid::new(id, path, uid);
        fid.refcount = 1;
        let fid = FidRef(Rc::new(RefCell::new(fid)));
        self.fids.insert(id, fid.clone());
        Ok(fid)
    }

    /// Takes a reference to a live fid.
    ///
    /// This does not reopen a reclaimed descriptor; the session does that, since it needs the
    /// worker.
    pub fn acquire(&mut self, id: u32) -> Result<FidRef, FidError> {
        let fid = self.fids.get(&id).ok_or(FidError::NotFound(id))?;
        {
            let mut f = fid.borrow_mut();
            f.refcount += 1;
            f.referenced = true;
        }
        Ok(fid.clone())
    }

    /// Drops a reference.  Returns the fid's remains if this was the last reference to a
    /// retired fid; that happens exactly once per fid.
    pub fn release(&mut self, fid: FidRef) -> Option<Released> {
        let mut f = fid.borrow_mut();
        debug_assert!(f.refcount > 0, "fid {} released too often", f.id);
        f.refcount = f.refcount.saturating_sub(1);
        if f.refcount > 0 || !f.retired {
            return None;
        }
        f.kind = FidKind::Unset;
        Some(Released {
            id: f.id,
            path: std::mem::take(&mut f.path),
            resource: std::mem::replace(&mut f.resource, Resource::None),
        })
    }

    /// Removes a fid from the table, so new lookups fail at once.
    ///
    /// The returned handle carries one reference, whose release frees the fid if nothing else
    /// is using it.
    pub fn retire(&mut self, id: u32) -> Result<FidRef, FidError> {
        let fid = self.fids.remove(&id).ok_or(FidError::NotFound(id))?;
        {
            let mut f = fid.borrow_mut();
            f.retired = true;
            f.refcount += 1;
        }
        Ok(fid)
    }

    /// Retires a fid the caller already holds a reference to, if it is still in the table.
    pub fn retire_ref(&mut self, fid: &FidRef) {
        let id = fid.id();
        if self.fids.get(&id).map_or(false, |f| f.same(fid)) {
            self.fids.remove(&id);
        }
        fid.borrow_mut().retired = true;
    }

    /// Retires every fid, returning a releasable handle for each.
    pub fn retire_all(&mut self) -> Vec<FidRef> {
        let ids: Vec<u32> = self.fids.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.retire(id).ok()).collect()
    }

    /// Rewrites the paths of fids at or below `old` to sit below `new` instead.
    pub fn rename_fixup(&mut self, old: &[u8], new: &[u8]) -> usize {
        let mut count = 0;
        for fid in self.fids.values() {
            let mut f = fid.borrow_mut();
            if is_within(&f.path, old) {
                let mut path = new.to_vec();
                path.extend_from_slice(&f.path[old.len()..]);
                f.path = path;
                count += 1;
            }
        }
        count
    }

    /// Marks every fid on `path` as never to be reclaimed.
    ///
    /// Returns referenced handles to those that are currently reclaimed, which the caller must
    /// reopen while the path still exists and then release.
    pub fn pin_path(&mut self, path: &[u8]) -> Vec<FidRef> {
        let mut reopen = Vec::new();
        for fid in self.fids.values() {
            let mut f = fid.borrow_mut();
            if f.path != path {
                continue;
            }
            f.non_reclaimable = true;
            if f.needs_reopen() {
                f.refcount += 1;
                reopen.push(fid.clone());
            }
        }
        reopen
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &FidRef> {
        self.fids.values()
    }
}

/// Whether `path` is `root` or lies below it.
pub fn is_within(path: &[u8], root: &[u8]) -> bool {
    if root == b"/" {
        return path.starts_with(b"/");
    }
    match path.len().cmp(&root.len()) {
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => path == root,
        std::cmp::Ordering::Greater => path.starts_with(root) && path[root.len()] == b'/',
    }
}

/// Whether `name` can be used as a single path component.
pub fn valid_component(name: &[u8]) -> bool {
    !name.is_empty() && !name.contains(&b'/') && !name.contains(&0)
}

/// Appends a component to an export path, resolving `.` and `..` without leaving the root.
pub fn join_path(dir: &[u8], name: &[u8]) -> Vec<u8> {
    match name {
        b"." => dir.to_vec(),
        b".." => parent(dir),
        _ => {
            let mut path = dir.to_vec();
            if !path.ends_with(b"/") {
                path.push(b'/');
            }
            path.extend_from_slice(name);
            path
        }
    }
}

pub fn parent(path: &[u8]) -> Vec<u8> {
    match path.iter().rposition(|c| *c == b'/') {
        Some(0) | None => b"/".to_vec(),
        Some(idx) => path[..idx].to_vec(),
    }
}

/// The last component of `path`, or `/` for the root.
pub fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|c| *c == b'/') {
        Some(idx) if idx + 1 < path.len() => &path[idx + 1..],
        _ => b"/",
    }
}
