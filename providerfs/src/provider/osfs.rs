//! Host directory provider.
//!
//! Every provider path is resolved under a base directory. Paths that would
//! leave the base (through `..`) are reported as missing. Blocking syscalls
//! run on the tokio blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nix::fcntl::AtFlags;
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid, fchownat};

use super::{DirEntry, LinkReader, Linker, Metadata, ProviderFile, StorageProvider};

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = u32::try_from(nsecs).unwrap_or(0);
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nanos.into())
    }
}

fn timespec(time: SystemTime) -> TimeSpec {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => TimeSpec::from(after),
        Err(err) => {
            let before = err.duration();
            let mut secs = -(before.as_secs() as i64);
            let mut nsecs = i64::from(before.subsec_nanos());
            if nsecs > 0 {
                secs -= 1;
                nsecs = 1_000_000_000 - nsecs;
            }
            TimeSpec::new(secs as _, nsecs as _)
        }
    }
}

fn to_metadata(meta: &fs::Metadata) -> Metadata {
    Metadata {
        size: meta.size(),
        mode: meta.mode(),
        nlink: u32::try_from(meta.nlink()).unwrap_or(u32::MAX),
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
    }
}

/// A provider backed by a directory of the host filesystem.
#[derive(Clone, Debug)]
pub struct OsFs {
    base: PathBuf,
}

impl OsFs {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn real_path(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.base.clone();
        let mut depth = 0usize;
        for comp in Path::new(path).components() {
            match comp {
                Component::Normal(seg) => {
                    resolved.push(seg);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(io::Error::from_raw_os_error(libc::ENOENT));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl StorageProvider for OsFs {
    fn name(&self) -> String {
        format!("OsFs({})", self.base.display())
    }

    async fn stat(&self, path: &str) -> io::Result<Option<Metadata>> {
        let real = self.real_path(path)?;
        let meta = tokio::fs::symlink_metadata(real).await?;
        Ok(Some(to_metadata(&meta)))
    }

    // Attribute changes act on the entry itself and never follow a symlink out
    // of the base.
    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        let real = self.real_path(path)?;
        blocking(move || {
            let meta = fs::symlink_metadata(&real)?;
            if meta.file_type().is_symlink() {
                // link permissions are not used on Linux
                return Ok(());
            }
            fs::set_permissions(&real, fs::Permissions::from_mode(mode & 0o7777))
        })
        .await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        let real = self.real_path(path)?;
        blocking(move || {
            fchownat(
                None,
                real.as_path(),
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )
            .map_err(io::Error::from)
        })
        .await
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let real = self.real_path(path)?;
        blocking(move || {
            utimensat(
                None,
                real.as_path(),
                &timespec(atime),
                &timespec(mtime),
                UtimensatFlags::NoFollowSymlink,
            )
            .map_err(io::Error::from)
        })
        .await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let real = self.real_path(path)?;
        blocking(move || {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().mode(mode & 0o7777).create(&real)
        })
        .await
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let real = self.real_path(path)?;
        let meta = tokio::fs::symlink_metadata(&real).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir(real).await
        } else {
            tokio::fs::remove_file(real).await
        }
    }

    async fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        let old = self.real_path(old)?;
        let new = self.real_path(new)?;
        tokio::fs::rename(old, new).await
    }

    async fn open_file(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> io::Result<Box<dyn ProviderFile>> {
        let real = self.real_path(path)?;
        let file = blocking(move || {
            let flags = flags as i32;
            let access = flags & libc::O_ACCMODE;
            let mut opts = OpenOptions::new();
            opts.read(access == libc::O_RDONLY || access == libc::O_RDWR)
                .write(access == libc::O_WRONLY || access == libc::O_RDWR)
                .custom_flags(flags & !libc::O_ACCMODE)
                .mode(mode & 0o7777);
            opts.open(&real)
        })
        .await?;
        debug!("osfs: opened {path} flags={flags:#o}");
        Ok(Box::new(OsFile {
            file: Mutex::new(Some(Arc::new(file))),
        }))
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let real = self.real_path(path)?;
        let mut dir = tokio::fs::read_dir(real).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                mode: meta.mode(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn linker(&self) -> Option<&dyn Linker> {
        Some(self)
    }

    fn link_reader(&self) -> Option<&dyn LinkReader> {
        Some(self)
    }
}

#[async_trait]
impl Linker for OsFs {
    async fn symlink_if_possible(&self, old: &str, new: &str) -> io::Result<()> {
        let link = self.real_path(new)?;
        tokio::fs::symlink(old, link).await
    }
}

#[async_trait]
impl LinkReader for OsFs {
    async fn readlink_if_possible(&self, path: &str) -> io::Result<String> {
        let real = self.real_path(path)?;
        let target = tokio::fs::read_link(real).await?;
        if target.is_absolute() {
            if let Ok(inner) = target.strip_prefix(&self.base) {
                return Ok(Path::new("/").join(inner).to_string_lossy().into_owned());
            }
        }
        Ok(target.to_string_lossy().into_owned())
    }
}

/// Handle returned by [`OsFs::open_file`]. Closing drops the descriptor.
#[derive(Debug)]
pub struct OsFile {
    file: Mutex<Option<Arc<File>>>,
}

impl OsFile {
    fn file(&self) -> io::Result<Arc<File>> {
        self.file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

#[async_trait]
impl ProviderFile for OsFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = self.file()?;
        let len = buf.len();
        let data = blocking(move || {
            let mut tmp = vec![0u8; len];
            let n = file.read_at(&mut tmp, offset)?;
            tmp.truncate(n);
            Ok(tmp)
        })
        .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let file = self.file()?;
        let data = data.to_vec();
        blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
    }

    async fn truncate(&self, size: u64) -> io::Result<()> {
        let file = self.file()?;
        blocking(move || file.set_len(size)).await
    }

    async fn close(&self) -> io::Result<()> {
        let file = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        drop(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW_CREATE: u32 = (libc::O_RDWR | libc::O_CREAT) as u32;

    #[tokio::test]
    async fn create_write_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path());

        let file = fs.open_file("hello.txt", RW_CREATE, 0o640).await.unwrap();
        assert_eq!(file.write_at(b"abcdef", 0).await.unwrap(), 6);
        let mut buf = [0u8; 16];
        assert_eq!(file.read_at(&mut buf, 2).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"cdef");
        file.truncate(3).await.unwrap();
        file.close().await.unwrap();

        let meta = fs.stat("/hello.txt").await.unwrap().unwrap();
        assert_eq!(meta.size, 3);
        assert_eq!(meta.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(std::fs::read(tmp.path().join("hello.txt")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn paths_cannot_escape_base() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path().join("inner"));
        std::fs::create_dir(tmp.path().join("inner")).unwrap();
        std::fs::write(tmp.path().join("secret"), b"x").unwrap();

        let err = fs.stat("../secret").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(fs.stat("a/../../secret").await.is_err());
    }

    #[tokio::test]
    async fn directories_and_rename() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path());
        fs.mkdir("d", 0o755).await.unwrap();
        fs.open_file("d/b", RW_CREATE, 0o644).await.unwrap();
        fs.open_file("d/a", RW_CREATE, 0o644).await.unwrap();

        let names: Vec<_> = fs
            .read_dir("d")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        fs.rename("d/a", "d/c").await.unwrap();
        fs.remove("d/b").await.unwrap();
        fs.remove("d/c").await.unwrap();
        fs.remove("d").await.unwrap();
        assert!(!tmp.path().join("d").exists());
    }

    #[tokio::test]
    async fn symlink_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path());
        let linker = fs.linker().expect("osfs creates links");
        linker.symlink_if_possible("target.txt", "link").await.unwrap();
        let reader = fs.link_reader().expect("osfs reads links");
        assert_eq!(reader.readlink_if_possible("link").await.unwrap(), "target.txt");

        let meta = fs.stat("link").await.unwrap().unwrap();
        assert_eq!(meta.mode & libc::S_IFMT, libc::S_IFLNK);
    }

    #[tokio::test]
    async fn chmod_and_chtimes() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path());
        fs.open_file("f", RW_CREATE, 0o644).await.unwrap();
        fs.chmod("f", 0o600).await.unwrap();
        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs.chtimes("f", stamp, stamp).await.unwrap();

        let meta = fs.stat("f").await.unwrap().unwrap();
        assert_eq!(meta.mode & 0o7777, 0o600);
        assert_eq!(meta.mtime, stamp);
    }

    #[tokio::test]
    async fn attribute_changes_do_not_follow_links() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside");
        std::fs::write(&outside, b"x").unwrap();
        std::fs::set_permissions(&outside, fs::Permissions::from_mode(0o644)).unwrap();
        let before = std::fs::metadata(&outside).unwrap();

        let base = tmp.path().join("base");
        std::fs::create_dir(&base).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();
        let fs = OsFs::new(&base);

        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs.chtimes("link", stamp, stamp).await.unwrap();
        fs.chmod("link", 0o600).await.unwrap();
        fs.chown("link", before.uid(), before.gid()).await.unwrap();

        let after = std::fs::metadata(&outside).unwrap();
        assert_eq!(after.mode() & 0o7777, 0o644);
        assert_eq!(after.mtime(), before.mtime());
        let link = fs.stat("link").await.unwrap().unwrap();
        assert_eq!(link.mtime, stamp);
    }

    #[tokio::test]
    async fn chtimes_does_not_open_fifos() {
        let tmp = tempfile::tempdir().unwrap();
        nix::unistd::mkfifo(
            &tmp.path().join("pipe"),
            nix::sys::stat::Mode::from_bits_truncate(0o600),
        )
        .unwrap();
        let fs = OsFs::new(tmp.path());

        let stamp = UNIX_EPOCH + Duration::from_secs(42);
        tokio::time::timeout(Duration::from_secs(5), fs.chtimes("pipe", stamp, stamp))
            .await
            .expect("chtimes on a fifo returns")
            .unwrap();
        assert_eq!(fs.stat("pipe").await.unwrap().unwrap().mtime, stamp);
    }

    #[test]
    fn timespecs_before_epoch() {
        let ts = timespec(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!((ts.tv_sec(), ts.tv_nsec()), (-2, 500_000_000));
        let ts = timespec(UNIX_EPOCH + Duration::new(3, 7));
        assert_eq!((ts.tv_sec(), ts.tv_nsec()), (3, 7));
    }

    #[tokio::test]
    async fn closed_handle_is_bad_fd() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = OsFs::new(tmp.path());
        let file = fs.open_file("f", RW_CREATE, 0o644).await.unwrap();
        file.close().await.unwrap();
        let err = file.truncate(0).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn negative_timestamps() {
        assert_eq!(timestamp(-1, 0), UNIX_EPOCH - Duration::from_secs(1));
        assert_eq!(timestamp(2, 5), UNIX_EPOCH + Duration::new(2, 5));
    }
}
