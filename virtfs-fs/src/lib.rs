//! Host file system access for the virtfs 9P server.
//!
//! The [`backend::FileSystem`] trait is the blocking interface the protocol engine drives from
//! worker threads; [`backend::host::HostFs`] implements it on top of the host's system calls.

pub mod backend;
