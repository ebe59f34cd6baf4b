use crate::reclaim::DescriptorBudget;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings for one exported tree.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    /// The largest message size the server will negotiate.
    pub max_msize: u32,
    /// The number of requests that may be in flight at once.
    pub max_requests: usize,
    /// Whether newly created nodes are given to the requesting user.
    pub chown_on_create: bool,
    pub budget: Arc<DescriptorBudget>,
}

impl ServerConfig {
    pub const DEFAULT_MSIZE: u32 = 512 * 1024;
    pub const DEFAULT_MAX_REQUESTS: usize = 128;

    #[cfg(feature = "unix")]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self::with_budget(root, Arc::new(DescriptorBudget::from_rlimit()))
    }

    pub fn with_budget<P: Into<PathBuf>>(root: P, budget: Arc<DescriptorBudget>) -> Self {
        ServerConfig {
            root: root.into(),
            max_msize: Self::DEFAULT_MSIZE,
            max_requests: Self::DEFAULT_MAX_REQUESTS,
            chown_on_create: false,
            budget,
        }
    }

    pub fn max_msize(mut self, msize: u32) -> Self {
        self.max_msize = msize.max(crate::protocol::MIN_MSIZE);
        self
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n.max(1);
        self
    }

    pub fn chown_on_create(mut self, enable: bool) -> Self {
        self.chown_on_create = enable;
        self
    }
}
