//! Mount configuration shared by the mount helpers and the binaries.

use std::time::Duration;

use nix::unistd::{getgid, getuid};
use rfuse3::MountOptions;

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Name reported in the mount table.
    pub fs_name: String,
    /// Owner reported for the mount itself.
    pub uid: u32,
    pub gid: u32,
    /// Let users other than the mounter access the tree.
    pub allow_other: bool,
    /// Mount directly instead of through fusermount3.
    pub privileged: bool,
    /// How long the kernel may cache entries and attributes.
    pub attr_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "providerfs".to_string(),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            allow_other: false,
            privileged: false,
            attr_ttl: Duration::from_secs(1),
        }
    }
}

impl MountConfig {
    pub fn with_fs_name(mut self, name: impl Into<String>) -> Self {
        self.fs_name = name.into();
        self
    }

    pub fn mount_options(&self) -> MountOptions {
        let mut opts = MountOptions::default();
        opts.fs_name(self.fs_name.as_str())
            .uid(self.uid)
            .gid(self.gid)
            .allow_other(self.allow_other);
        opts
    }
}
