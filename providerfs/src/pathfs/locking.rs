//! Serializing decorator for a [`PathFileSystem`].
//!
//! Mutating path operations take one mount-wide lock so they never overlap.
//! Lookups, opens and listings run concurrently.

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Attr, DirEntry, FuseFile, PathFileSystem};
use crate::error::FsResult;

pub struct LockingFileSystem<F> {
    inner: F,
    lock: Mutex<()>,
}

impl<F: PathFileSystem> LockingFileSystem<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: PathFileSystem> PathFileSystem for LockingFileSystem<F> {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn get_attr(&self, path: &str) -> FsResult<Attr> {
        self.inner.get_attr(path).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.chmod(path, mode).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.chown(path, uid, gid).await
    }

    async fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.utimens(path, atime, mtime).await
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.truncate(path, size).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.mkdir(path, mode).await
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.rmdir(path).await
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.unlink(path).await
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.rename(old, new).await
    }

    async fn open(&self, path: &str, flags: u32) -> FsResult<Box<dyn FuseFile>> {
        self.inner.open(path, flags).await
    }

    async fn create(&self, path: &str, flags: u32, mode: u32) -> FsResult<Box<dyn FuseFile>> {
        let _guard = self.lock.lock().await;
        self.inner.create(path, flags, mode).await
    }

    async fn open_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.inner.open_dir(path).await
    }

    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let _guard = self.lock.lock().await;
        self.inner.symlink(target, link).await
    }

    async fn readlink(&self, path: &str) -> FsResult<String> {
        self.inner.readlink(path).await
    }
}
