//! Path-addressed filesystem protocol
//!
//! The surface the kernel bridge talks to: whole-path operations on a
//! [`PathFileSystem`] plus data operations on an opened [`FuseFile`]. Every
//! call returns an [`FsResult`]; `Ok` is the OK status.
//!
//! Submodules:
//! - `locking`: decorator serializing mutating calls
pub mod locking;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::FsResult;
use crate::provider::Metadata;

pub use crate::provider::DirEntry;
pub use locking::LockingFileSystem;

/// Attributes reported for a path. `ino` stays zero; inode numbers belong to
/// the kernel bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 0,
        }
    }
}

impl Attr {
    /// Converts provider metadata; absent metadata yields a zeroed `Attr`.
    pub fn from_metadata(meta: Option<&Metadata>) -> Self {
        let Some(meta) = meta else {
            return Self::default();
        };
        Self {
            ino: 0,
            size: meta.size,
            // st_blocks counts 512-byte units
            blocks: meta.size.div_ceil(512),
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            mode: meta.mode,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            rdev: meta.rdev,
            blksize: meta.blksize,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// Data operations on one opened file.
#[async_trait]
pub trait FuseFile: Send + Sync {
    /// Reads into `dest` and returns the prefix that holds valid data.
    async fn read<'a>(&self, dest: &'a mut [u8], offset: u64) -> FsResult<&'a [u8]>;
    async fn write(&self, data: &[u8], offset: u64) -> FsResult<u32>;
    async fn truncate(&self, size: u64) -> FsResult<()>;
    /// Closes the file. There is no error channel; no call may follow.
    async fn release(&self);
}

/// Path-level operations. Paths are relative to the mount root, which is `""`.
#[async_trait]
pub trait PathFileSystem: Send + Sync {
    fn name(&self) -> String;

    async fn get_attr(&self, path: &str) -> FsResult<Attr>;
    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;
    async fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()>;
    async fn truncate(&self, path: &str, size: u64) -> FsResult<()>;

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()>;
    async fn rmdir(&self, path: &str) -> FsResult<()>;
    async fn unlink(&self, path: &str) -> FsResult<()>;
    async fn rename(&self, old: &str, new: &str) -> FsResult<()>;

    async fn open(&self, path: &str, flags: u32) -> FsResult<Box<dyn FuseFile>>;
    async fn create(&self, path: &str, flags: u32, mode: u32) -> FsResult<Box<dyn FuseFile>>;
    async fn open_dir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Creates `link` pointing at `target`.
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()>;
    async fn readlink(&self, path: &str) -> FsResult<String>;
}
