//! Error codes and logging shared by the virtfs crates.

#[macro_use]
pub mod logger;
pub mod error;
