//! A 9P file server engine.
//!
//! The engine speaks 9P2000, 9P2000.u and 9P2000.L to one client over a
//! [`transport`], serving files from a [`virtfs_fs::backend::FileSystem`].  Requests are
//! handled as cooperative tasks on one thread while blocking file system calls run on a
//! worker pool, and open descriptors are reclaimed from idle fids when the process gets close
//! to its descriptor limit.

#[macro_use]
extern crate virtfs_constants;

pub mod codec;
pub mod config;
pub mod fid;
pub mod protocol;
pub mod reclaim;
pub mod server;
pub mod transport;
pub mod worker;
