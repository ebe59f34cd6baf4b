//! The process-wide descriptor budget and the sweep that keeps fids under it.

use crate::fid::{FidTable, Resource};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The descriptor budget shared by every session in the process.
#[derive(Debug)]
pub struct DescriptorBudget {
    high_water: usize,
    batch: usize,
    open: AtomicUsize,
}

impl DescriptorBudget {
    /// The limit assumed when the host reports no limit at all.
    const UNLIMITED_FALLBACK: u64 = 1 << 20;

    /// Headroom kept free for everything other than fids.
    const RESERVED: usize = 400;

    /// Creates a budget with an explicit high-water mark and batch size.
    pub fn new(high_water: usize, batch: usize) -> Self {
        DescriptorBudget {
            high_water,
            batch: batch.max(1),
            open: AtomicUsize::new(0),
        }
    }

    /// Derives the budget from a descriptor limit.
    pub fn from_limit(limit: u64) -> Self {
        let cur = limit.min(usize::MAX as u64) as usize;
        Self::new(cur - (cur / 3).min(Self::RESERVED), cur / 2)
    }

    /// Derives the budget from the process's `RLIMIT_NOFILE`.
    #[cfg(feature = "unix")]
    pub fn from_rlimit() -> Self {
        let lim = rustix::process::getrlimit(rustix::process::Resource::Nofile);
        Self::from_limit(lim.current.unwrap_or(Self::UNLIMITED_FALLBACK))
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// The number of descriptors currently held by fids in all sessions.
    pub fn open_descriptors(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    pub fn under_pressure(&self) -> bool {
        self.open_descriptors() >= self.high_water
    }

    pub fn opened(&self) {
        self.open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self, n: usize) {
        let _ = self
            .open
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }
}

/// Runs one bounded second-chance pass over `table`.
///
/// Returns the descriptors taken from idle fids; the caller closes them on a worker and reports
/// them to the budget.  A fid that is in use, pinned, or already reclaimed is never touched.
pub fn sweep(table: &FidTable, batch: usize) -> Vec<Resource> {
    let mut taken = Vec::new();
    for fid in table.values() {
        if taken.len() >= batch {
            break;
        }
        let mut f = fid.borrow_mut();
        if f.refcount() > 0 || !f.is_reclaimable() {
            continue;
        }
        if f.second_chance() {
            continue;
        }
        if let Some(res) = f.take_for_reclaim() {
            taken.push(res);
        }
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::{sweep, DescriptorBudget};
    use crate::fid::{FidKind, FidRef, FidTable, Resource};
    use std::sync::Arc;
    use virtfs_fs::backend::host::HostFs;
    use virtfs_fs::backend::{FileSystem, OpenFlags};

    fn open_fid(table: &mut FidTable, fs: &HostFs, id: u32, name: &str) -> FidRef {
        std::fs::write(fs.root().join(name), b"data").unwrap();
        let path = format!("/{}", name);
        let fd = fs
            .open(path.as_ref(), OpenFlags::O_RDONLY, 0)
            .unwrap();
        let fid = table.allocate(id, path.into_bytes(), 0).unwrap();
        fid.borrow_mut()
            .set_resource(FidKind::File, Resource::File(Arc::new(fd)));
        fid
    }

    #[test]
    fn budget_from_limit() {
        let b = DescriptorBudget::from_limit(1024);
        assert_eq!(b.high_water(), 1024 - 341);
        assert_eq!(b.batch(), 512);
        let b = DescriptorBudget::from_limit(65536);
        assert_eq!(b.high_water(), 65536 - 400);
        assert_eq!(b.batch(), 32768);
        assert!(!b.under_pressure());
        b.opened();
        b.opened();
        b.closed(5);
        assert_eq!(b.open_descriptors(), 0);
    }

    #[test]
    fn pressure() {
        let b = DescriptorBudget::new(2, 1);
        b.opened();
        assert!(!b.under_pressure());
        b.opened();
        assert!(b.under_pressure());
        b.closed(1);
        assert!(!b.under_pressure());
    }

    #[test]
    fn second_chance_then_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let mut t = FidTable::new();
        let a = open_fid(&mut t, &fs, 1, "a");
        let b = open_fid(&mut t, &fs, 2, "b");
        t.release(a.clone());
        // b stays in use.

        // Freshly allocated fids are referenced, so the first pass only clears the flag.
        assert!(sweep(&t, 10).is_empty());
        assert!(!a.borrow().is_referenced());
        let taken = sweep(&t, 10);
        assert_eq!(taken.len(), 1);
        assert!(a.borrow().is_reclaimed());
        assert!(a.borrow().needs_reopen());
        assert!(!b.borrow().is_reclaimed());
        for r in taken {
            r.close(&fs);
        }

        // Reclaiming an already reclaimed fid does nothing.
        assert!(sweep(&t, 10).is_empty());
        assert!(a.borrow().is_reclaimed());
    }

    #[test]
    fn pinned_and_batch_limits() {
        let dir = tempfile::tempdir().unwrap();
        let fs = HostFs::new(dir.path());
        let mut t = FidTable::new();
        let mut fids = Vec::new();
        for i in 0..4 {
            let f = open_fid(&mut t, &fs, i, &format!("f{}", i));
            t.release(f.clone());
            fids.push(f);
        }
        fids[0].borrow_mut().set_non_reclaimable();
        sweep(&t, 10);
        let taken = sweep(&t, 2);
        assert_eq!(taken.len(), 2);
        assert!(!fids[0].borrow().is_reclaimed());
        assert!(fids[1].borrow().is_reclaimed());
        assert!(fids[2].borrow().is_reclaimed());
        assert!(!fids[3].borrow().is_reclaimed());
        let taken = sweep(&t, 2);
        assert_eq!(taken.len(), 1);
        assert!(!fids[0].borrow().is_reclaimed());
    }
}
