//! Storage provider interface
//!
//! A provider is any backend that can stat, open, list and mutate entries of a
//! hierarchical path namespace. Paths are `/`-separated and relative to the
//! provider root; the root itself is `""`.
//!
//! Submodules:
//! - `memfs`: in-memory provider
//! - `osfs`: host directory provider rooted at a base path
//!
//! Symlink support is optional. A provider advertises it by overriding
//! [`StorageProvider::linker`] / [`StorageProvider::link_reader`]; the default
//! is "not supported", so providers never have to stub these operations.
pub mod memfs;
pub mod osfs;

use std::io;
use std::time::SystemTime;

use async_trait::async_trait;

/// Metadata reported by [`StorageProvider::stat`].
///
/// `mode` carries both the file type (`S_IFMT` bits) and the permission bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            size: 0,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
        }
    }
}

/// One entry of [`StorageProvider::read_dir`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
}

/// An open file. All I/O is positioned; the handle keeps no cursor.
///
/// `read_at` reports end-of-stream either as a short `Ok(n)` or, when nothing
/// could be read, as `ErrorKind::UnexpectedEof`.
#[async_trait]
pub trait ProviderFile: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;
    async fn truncate(&self, size: u64) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> String;

    /// `Ok(None)` means the provider had nothing to report for an entry it did
    /// not reject.
    async fn stat(&self, path: &str) -> io::Result<Option<Metadata>>;
    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()>;
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()>;
    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;
    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    async fn remove(&self, path: &str) -> io::Result<()>;
    async fn rename(&self, old: &str, new: &str) -> io::Result<()>;

    /// `flags` are `open(2)` flags; `mode` only matters when the call creates
    /// the entry.
    async fn open_file(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> io::Result<Box<dyn ProviderFile>>;

    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    /// Symlink creation, if this provider supports it.
    fn linker(&self) -> Option<&dyn Linker> {
        None
    }

    /// Symlink reading, if this provider supports it.
    fn link_reader(&self) -> Option<&dyn LinkReader> {
        None
    }
}

#[async_trait]
pub trait Linker: Send + Sync {
    /// Creates `new` as a symlink pointing at `old`.
    async fn symlink_if_possible(&self, old: &str, new: &str) -> io::Result<()>;
}

#[async_trait]
pub trait LinkReader: Send + Sync {
    async fn readlink_if_possible(&self, path: &str) -> io::Result<String>;
}

/// Normalizes a provider path: drops empty and `.` segments and surrounding
/// slashes. `..` segments are kept for the provider to judge.
pub(crate) fn clean_path(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}
