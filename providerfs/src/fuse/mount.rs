//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::raw::{Filesystem, MountHandle, Session};

use crate::config::MountConfig;

/// Mount `fs` on an empty directory through fusermount3.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<F>(
    fs: F,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    F: Filesystem + Send + Sync + 'static,
{
    let mount_point = mount_point.as_ref();
    info!("mounting {} on {} (unprivileged)", config.fs_name, mount_point.display());
    Session::new(config.mount_options())
        .mount_with_unprivileged(fs, mount_point)
        .await
}

/// Mount `fs` directly; needs CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
pub async fn mount_privileged<F>(
    fs: F,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    F: Filesystem + Send + Sync + 'static,
{
    let mount_point = mount_point.as_ref();
    info!("mounting {} on {} (privileged)", config.fs_name, mount_point.display());
    Session::new(config.mount_options())
        .mount(fs, mount_point)
        .await
}

/// Picks the mount mode from `config.privileged`.
pub async fn mount<F>(
    fs: F,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    F: Filesystem + Send + Sync + 'static,
{
    if config.privileged {
        mount_privileged(fs, mount_point, config).await
    } else {
        mount_unprivileged(fs, mount_point, config).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<F>(
    _fs: F,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    F: Filesystem + Send + Sync + 'static,
{
    Err(unsupported())
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_privileged<F>(
    _fs: F,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    F: Filesystem + Send + Sync + 'static,
{
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    )
}
