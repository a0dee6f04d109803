//! FileHandle adapter: a provider's open file seen through [`FuseFile`].

use async_trait::async_trait;

use crate::error::{FsError, FsResult, swallow_eof};
use crate::pathfs::FuseFile;
use crate::provider::ProviderFile;

pub struct ProviderFileHandle {
    file: Box<dyn ProviderFile>,
}

impl ProviderFileHandle {
    pub fn new(file: Box<dyn ProviderFile>) -> Self {
        Self { file }
    }
}

#[async_trait]
impl FuseFile for ProviderFileHandle {
    async fn read<'a>(&self, dest: &'a mut [u8], offset: u64) -> FsResult<&'a [u8]> {
        let n = swallow_eof(self.file.read_at(dest, offset).await)?;
        Ok(&dest[..n.min(dest.len())])
    }

    async fn write(&self, data: &[u8], offset: u64) -> FsResult<u32> {
        let n = swallow_eof(self.file.write_at(data, offset).await)?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        self.file.truncate(size).await.map_err(FsError::from)
    }

    async fn release(&self) {
        let _ = self.file.close().await;
    }
}
