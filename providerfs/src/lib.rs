#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod file;
pub mod fs;
pub mod fuse;
pub mod pathfs;
pub mod provider;

// Scripted provider doubles (only compiled during tests)
#[cfg(test)]
mod testing;

pub use config::MountConfig;
pub use error::{FsError, FsResult};
pub use fs::{ProviderFs, new_fuse_filesystem};
pub use fuse::FuseAdapter;
pub use pathfs::{FuseFile, PathFileSystem};
pub use provider::{LinkReader, Linker, ProviderFile, StorageProvider};
