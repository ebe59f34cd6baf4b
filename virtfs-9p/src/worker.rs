//! Runs blocking file system calls on the worker pool.
//!
//! Handlers await these calls; everything else a handler does happens on the session's own
//! thread, between suspension points.

use std::sync::Arc;
use tokio::task::JoinError;
use virtfs_constants::error::Error;
use virtfs_fs::backend::FileSystem;

/// Retries `f` for as long as it is interrupted by a signal.
pub fn retry_intr<T, F>(mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    loop {
        match f() {
            Err(Error::EINTR) => continue,
            r => return r,
        }
    }
}

fn join_error(e: JoinError) -> Error {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
    Error::EIO
}

#[derive(Clone)]
pub struct Worker {
    fs: Arc<dyn FileSystem>,
}

impl Worker {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Worker { fs }
    }

    /// Runs a single file system call, retrying it on `EINTR`.
    pub async fn run<T, F>(&self, mut f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnMut(&dyn FileSystem) -> Result<T, Error> + Send + 'static,
    {
        let fs = self.fs.clone();
        tokio::task::spawn_blocking(move || retry_intr(|| f(&*fs)))
            .await
            .map_err(join_error)?
    }

    /// Runs a job made of several calls.
    ///
    /// The job is run once; it is responsible for retrying its own calls with [`retry_intr`].
    pub async fn job<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FileSystem) -> Result<T, Error> + Send + 'static,
    {
        let fs = self.fs.clone();
        tokio::task::spawn_blocking(move || f(&*fs))
            .await
            .map_err(join_error)?
    }

    /// Runs a call that borrows `state` on the worker, handing `state` back afterwards.
    ///
    /// This is how bulk I/O reaches the transport buffers without copying them.
    pub async fn run_with<S, T, F>(&self, state: S, mut f: F) -> (S, Result<T, Error>)
    where
        S: Send + Default + 'static,
        T: Send + 'static,
        F: FnMut(&dyn FileSystem, &mut S) -> Result<T, Error> + Send + 'static,
    {
        let fs = self.fs.clone();
        let mut state = state;
        let res = tokio::task::spawn_blocking(move || {
            let r = retry_intr(|| f(&*fs, &mut state));
            (state, r)
        })
        .await;
        match res {
            Ok(pair) => pair,
            Err(e) => (S::default(), Err(join_error(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{retry_intr, Worker};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use virtfs_constants::error::Error;
    use virtfs_fs::backend::host::HostFs;

    #[test]
    fn retries_interrupted_calls() {
        let mut tries = 0;
        let r = retry_intr(|| {
            tries += 1;
            if tries < 3 {
                Err(Error::EINTR)
            } else {
                Ok(tries)
            }
        });
        assert_eq!(r, Ok(3));
        assert_eq!(retry_intr::<(), _>(|| Err(Error::EIO)), Err(Error::EIO));
    }

    #[tokio::test]
    async fn runs_on_the_pool() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        let worker = Worker::new(Arc::new(HostFs::new(dir.path())));
        let st = worker.run(|fs| fs.lstat(Path::new("/f"))).await.unwrap();
        assert_eq!(st.size, 3);
        let (v, r) = worker
            .run_with(vec![1u8], |_fs, v| {
                v.push(2);
                Ok(v.len())
            })
            .await;
        assert_eq!(v, vec![1, 2]);
        assert_eq!(r, Ok(2));
        assert_eq!(
            worker.job(|fs| fs.lstat(Path::new("/missing"))).await.unwrap_err(),
            Error::ENOENT
        );
    }
}
