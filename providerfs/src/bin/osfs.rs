// Mounts a host directory through the provider adapter.
//
// Mostly useful for exercising the adapter end to end:
//   osfs --base /srv/data /mnt/data

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use providerfs::fuse::mount::mount;
use providerfs::provider::osfs::OsFs;
use providerfs::{FuseAdapter, MountConfig, new_fuse_filesystem};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Expose a host directory through the provider adapter")]
struct Args {
    /// Directory to expose
    #[arg(long)]
    base: PathBuf,
    /// Path to mount point
    mountpoint: PathBuf,
    /// Enable debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Allow other users to access the mount
    #[arg(long, default_value_t = false)]
    allow_other: bool,
    /// Mount directly instead of through fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if !args.base.is_dir() {
        bail!("base {} is not a directory", args.base.display());
    }

    let config = MountConfig {
        allow_other: args.allow_other,
        privileged: args.privileged,
        ..MountConfig::default()
    }
    .with_fs_name(format!("osfs:{}", args.base.display()));

    let fs = FuseAdapter::with_ttl(new_fuse_filesystem(OsFs::new(&args.base)), config.attr_ttl);
    let mut mount_handle = mount(fs, &args.mountpoint, &config)
        .await
        .with_context(|| format!("failed to mount on {}", args.mountpoint.display()))?;

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("fuse session ended with an error")?,
        _ = signal::ctrl_c() => {
            log::info!("unmounting {}", args.mountpoint.display());
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}
