//! Filesystem adapter: a [`StorageProvider`] seen through [`PathFileSystem`].

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{FsError, FsResult};
use crate::file::ProviderFileHandle;
use crate::pathfs::{Attr, DirEntry, FuseFile, LockingFileSystem, PathFileSystem};
use crate::provider::{ProviderFile, StorageProvider};

/// Wraps `provider` in the adapter and the mutation-serializing decorator.
pub fn new_fuse_filesystem<P>(provider: P) -> LockingFileSystem<ProviderFs<P>>
where
    P: StorageProvider + 'static,
{
    LockingFileSystem::new(ProviderFs::new(provider))
}

/// Owns a provider handle opened for one path-level call. If the call is
/// dropped before [`CloseGuard::close`] runs, the handle is closed on the
/// runtime instead.
struct CloseGuard {
    file: Option<Arc<dyn ProviderFile>>,
}

impl CloseGuard {
    fn new(file: Box<dyn ProviderFile>) -> Self {
        Self {
            file: Some(Arc::from(file)),
        }
    }

    fn file(&self) -> Option<&dyn ProviderFile> {
        self.file.as_deref()
    }

    async fn close(mut self) -> std::io::Result<()> {
        let res = match self.file() {
            Some(file) => file.close().await,
            None => Ok(()),
        };
        self.file = None;
        res
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let _ = file.close().await;
                });
            }
            Err(_) => warn!("provider handle dropped outside a runtime; close skipped"),
        }
    }
}

/// Stateless facade over one storage provider. One instance per mount.
pub struct ProviderFs<P> {
    provider: Arc<P>,
}

impl<P: StorageProvider> ProviderFs<P> {
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    async fn open_handle(&self, path: &str, flags: u32, mode: u32) -> FsResult<Box<dyn FuseFile>> {
        let file = self.provider.open_file(path, flags, mode).await?;
        Ok(Box::new(ProviderFileHandle::new(file)))
    }
}

impl<P: StorageProvider> fmt::Display for ProviderFs<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.provider.name())
    }
}

#[async_trait]
impl<P: StorageProvider> PathFileSystem for ProviderFs<P> {
    fn name(&self) -> String {
        self.provider.name()
    }

    async fn get_attr(&self, path: &str) -> FsResult<Attr> {
        let meta = self.provider.stat(path).await?;
        Ok(Attr::from_metadata(meta.as_ref()))
    }

    async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        Ok(self.provider.chmod(path, mode).await?)
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        Ok(self.provider.chown(path, uid, gid).await?)
    }

    async fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<()> {
        let (Some(atime), Some(mtime)) = (atime, mtime) else {
            return Err(FsError::InvalidArgument);
        };
        Ok(self.provider.chtimes(path, atime, mtime).await?)
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let file = self
            .provider
            .open_file(path, libc::O_WRONLY as u32, 0)
            .await?;
        let guard = CloseGuard::new(file);
        let res = match guard.file() {
            Some(file) => file.truncate(size).await,
            None => Ok(()),
        };
        // close runs on every path past a successful open; its error is dropped
        let _ = guard.close().await;
        Ok(res?)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        Ok(self.provider.mkdir(path, mode).await?)
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        Ok(self.provider.remove(path).await?)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.rmdir(path).await
    }

    async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        Ok(self.provider.rename(old, new).await?)
    }

    async fn open(&self, path: &str, flags: u32) -> FsResult<Box<dyn FuseFile>> {
        self.open_handle(path, flags, 0).await
    }

    async fn create(&self, path: &str, flags: u32, mode: u32) -> FsResult<Box<dyn FuseFile>> {
        self.open_handle(path, flags, mode).await
    }

    async fn open_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        Ok(self.provider.read_dir(path).await?)
    }

    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let Some(linker) = self.provider.linker() else {
            return Err(FsError::NotImplemented);
        };
        Ok(linker.symlink_if_possible(target, link).await?)
    }

    async fn readlink(&self, path: &str) -> FsResult<String> {
        let Some(reader) = self.provider.link_reader() else {
            return Err(FsError::NotImplemented);
        };
        Ok(reader.readlink_if_possible(path).await?)
    }
}
