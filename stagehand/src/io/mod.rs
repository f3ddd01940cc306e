//! I/O helpers: the record store and everything that touches the filesystem
//! or other processes.

pub mod claims;
pub mod config;
pub mod executor;
pub mod issues;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod sessions;
pub mod store;
pub mod tasks;
