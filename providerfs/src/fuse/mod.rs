//! FUSE bridge
//!
//! The kernel addresses files by inode number while [`PathFileSystem`] is
//! addressed by path. [`FuseAdapter`] sits in between and implements the
//! inode-based `rfuse3::raw::Filesystem`:
//!
//! - an inode table maps each inode to the path it was looked up under; the
//!   root is inode 1 and path `""`. Entries follow renames and go away on
//!   unlink/rmdir.
//! - a handle table maps file handle ids handed to the kernel onto the
//!   [`FuseFile`] returned by open/create until release.
//!
//! Submodules:
//! - `mount`: mounting helpers over `rfuse3::raw::Session`
pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::{FileType, SetAttr, Timestamp};

use crate::pathfs::{Attr, FuseFile, PathFileSystem};

pub const ROOT_INO: u64 = 1;

const MAX_WRITE: u32 = 1024 * 1024;

/// Inode reported in plain readdir for entries the kernel has not looked up.
const UNKNOWN_INO: u64 = 0xffff_ffff;

#[derive(Debug)]
struct InodeEntry {
    path: String,
    /// Lookups the kernel still holds; the entry goes away when it hits zero.
    nlookup: u64,
}

/// Inode numbers handed to the kernel and the paths behind them.
#[derive(Debug)]
struct InodeTable {
    entries: HashMap<u64, InodeEntry>,
    inodes: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.entries.insert(
            ROOT_INO,
            InodeEntry {
                path: String::new(),
                nlookup: 1,
            },
        );
        table.inodes.insert(String::new(), ROOT_INO);
        table
    }

    fn path(&self, ino: u64) -> Option<String> {
        self.entries.get(&ino).map(|entry| entry.path.clone())
    }

    fn get(&self, path: &str) -> Option<u64> {
        self.inodes.get(path).copied()
    }

    /// Returns the inode for `path`, allocating one on first sight, and counts
    /// one more kernel lookup against it.
    fn lookup(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.inodes.get(path) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.entries.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                nlookup: 1,
            },
        );
        self.inodes.insert(path.to_string(), ino);
        ino
    }

    /// Drops `nlookup` kernel references; the root is never dropped.
    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(entry) = self.entries.get_mut(&ino) else {
            return;
        };
        entry.nlookup = entry.nlookup.saturating_sub(nlookup);
        if entry.nlookup == 0 {
            if let Some(entry) = self.entries.remove(&ino) {
                if self.inodes.get(&entry.path) == Some(&ino) {
                    self.inodes.remove(&entry.path);
                }
            }
        }
    }

    fn remove(&mut self, path: &str) {
        if let Some(ino) = self.inodes.remove(path) {
            self.entries.remove(&ino);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Moves `old` and everything below it to `new`, replacing whatever `new`
    /// pointed at before.
    fn rename(&mut self, old: &str, new: &str) {
        let replaced: Vec<String> = self
            .inodes
            .keys()
            .filter(|path| in_subtree(new, path))
            .cloned()
            .collect();
        for path in replaced {
            self.remove(&path);
        }

        let moved: Vec<(String, u64)> = self
            .inodes
            .iter()
            .filter(|(path, _)| in_subtree(old, path))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.inodes.remove(&path);
            self.inodes.insert(renamed.clone(), ino);
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.path = renamed;
            }
        }
    }
}

fn in_subtree(root: &str, path: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn join(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    if parent.is_empty() {
        name.into_owned()
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: Timestamp::from(attr.atime),
        mtime: Timestamp::from(attr.mtime),
        ctime: Timestamp::from(attr.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(attr.ctime),
        kind: file_type(attr.mode),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: attr.blksize,
    }
}

fn to_system_time(ts: Timestamp) -> SystemTime {
    if ts.sec >= 0 {
        UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs()) + Duration::from_nanos(ts.nsec.into())
    }
}

/// Serves a [`PathFileSystem`] to the kernel.
pub struct FuseAdapter<F> {
    fs: F,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HashMap<u64, Arc<dyn FuseFile>>>,
    next_fh: AtomicU64,
    ttl: Duration,
}

impl<F: PathFileSystem> FuseAdapter<F> {
    pub fn new(fs: F) -> Self {
        Self::with_ttl(fs, Duration::from_secs(1))
    }

    /// `ttl` is how long the kernel may cache entries and attributes.
    pub fn with_ttl(fs: F, ttl: Duration) -> Self {
        Self {
            fs,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            ttl,
        }
    }

    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    fn inodes(&self) -> MutexGuard<'_, InodeTable> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn FuseFile>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes().path(ino).ok_or_else(|| libc::ENOENT.into())
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        Ok(join(&self.path_of(parent)?, name))
    }

    fn handle(&self, fh: u64) -> FuseResult<Arc<dyn FuseFile>> {
        self.handles()
            .get(&fh)
            .cloned()
            .ok_or_else(|| libc::EBADF.into())
    }

    fn store_handle(&self, file: Box<dyn FuseFile>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles().insert(fh, Arc::from(file));
        fh
    }

    async fn entry_for(&self, path: &str) -> FuseResult<ReplyEntry> {
        let attr = self.fs.get_attr(path).await?;
        let ino = self.inodes().lookup(path);
        Ok(ReplyEntry {
            ttl: self.ttl,
            attr: to_file_attr(ino, &attr),
            generation: 0,
        })
    }

    async fn attr_for(&self, ino: u64) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = self.fs.get_attr(&path).await?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: to_file_attr(ino, &attr),
        })
    }

    async fn lookup_child(&self, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.entry_for(&path).await
    }

    async fn apply_set_attr(
        &self,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        if let Some(mode) = set_attr.mode {
            self.fs.chmod(&path, mode & 0o7777).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            let current = self.fs.get_attr(&path).await?;
            let uid = set_attr.uid.unwrap_or(current.uid);
            let gid = set_attr.gid.unwrap_or(current.gid);
            self.fs.chown(&path, uid, gid).await?;
        }
        if let Some(size) = set_attr.size {
            match fh.map(|fh| self.handle(fh)).transpose()? {
                Some(file) => file.truncate(size).await?,
                None => self.fs.truncate(&path, size).await?,
            }
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let current = self.fs.get_attr(&path).await?;
            let atime = set_attr.atime.map_or(current.atime, to_system_time);
            let mtime = set_attr.mtime.map_or(current.mtime, to_system_time);
            self.fs.utimens(&path, Some(atime), Some(mtime)).await?;
        }
        self.attr_for(ino).await
    }

    async fn open_file(&self, ino: u64, flags: u32) -> FuseResult<u64> {
        let path = self.path_of(ino)?;
        let file = self.fs.open(&path, flags).await?;
        Ok(self.store_handle(file))
    }

    async fn create_file(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<(ReplyEntry, u64)> {
        let path = self.child_path(parent, name)?;
        let file = self.fs.create(&path, flags, mode & 0o7777).await?;
        match self.entry_for(&path).await {
            Ok(entry) => Ok((entry, self.store_handle(file))),
            Err(err) => {
                file.release().await;
                Err(err)
            }
        }
    }

    async fn read_file(&self, fh: u64, offset: u64, size: u32) -> FuseResult<Bytes> {
        let file = self.handle(fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read(&mut buf, offset).await?.len();
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write_file(&self, fh: u64, offset: u64, data: &[u8]) -> FuseResult<u32> {
        let file = self.handle(fh)?;
        Ok(file.write(data, offset).await?)
    }

    async fn release_file(&self, fh: u64) {
        let file = self.handles().remove(&fh);
        match file {
            Some(file) => file.release().await,
            None => warn!("release of unknown file handle {fh}"),
        }
    }

    async fn remove_child(&self, parent: u64, name: &OsStr, dir: bool) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        if dir {
            self.fs.rmdir(&path).await?;
        } else {
            self.fs.unlink(&path).await?;
        }
        self.inodes().remove(&path);
        Ok(())
    }

    async fn rename_child(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.fs.rename(&old, &new).await?;
        self.inodes().rename(&old, &new);
        Ok(())
    }

    /// Directory listing including `.` and `..`. Listing does not count as a
    /// lookup, so entries the kernel has not looked up carry [`UNKNOWN_INO`].
    async fn list_dir(&self, ino: u64) -> FuseResult<Vec<Listed>> {
        let path = self.path_of(ino)?;
        let entries = self.fs.open_dir(&path).await?;

        let parent = if ino == ROOT_INO {
            String::new()
        } else {
            parent_path(&path).to_string()
        };
        let inodes = self.inodes();
        let parent_ino = inodes.get(&parent).unwrap_or(UNKNOWN_INO);
        let mut all = Vec::with_capacity(entries.len() + 2);
        all.push(Listed {
            ino,
            mode: libc::S_IFDIR,
            name: OsString::from("."),
            path: path.clone(),
        });
        all.push(Listed {
            ino: parent_ino,
            mode: libc::S_IFDIR,
            name: OsString::from(".."),
            path: parent,
        });
        for entry in entries {
            let child = join(&path, OsStr::new(&entry.name));
            all.push(Listed {
                ino: inodes.get(&child).unwrap_or(UNKNOWN_INO),
                mode: entry.mode,
                name: OsString::from(entry.name),
                path: child,
            });
        }
        Ok(all)
    }
}

/// One row of [`FuseAdapter::list_dir`].
#[derive(Debug)]
struct Listed {
    ino: u64,
    mode: u32,
    name: OsString,
    path: String,
}

impl<F> Filesystem for FuseAdapter<F>
where
    F: PathFileSystem + 'static,
{
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        debug!("init {}", self.fs.name());
        let max_write = NonZeroU32::new(MAX_WRITE).unwrap_or(NonZeroU32::MIN);
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {
        debug!("destroy {}", self.fs.name());
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        self.lookup_child(parent, name).await
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes().forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        let mut table = self.inodes();
        for &(inode, nlookup) in inodes {
            table.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        self.attr_for(ino).await
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        self.apply_set_attr(ino, fh, set_attr).await
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let target = self.fs.readlink(&path).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.fs.symlink(&link.to_string_lossy(), &path).await?;
        self.entry_for(&path).await
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.fs.mkdir(&path, mode & !umask & 0o7777).await?;
        self.entry_for(&path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.remove_child(parent, name, false).await
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        self.remove_child(parent, name, true).await
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        self.rename_child(parent, name, new_parent, new_name).await
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let fh = self.open_file(ino, flags).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.read_file(fh, offset, size).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self.write_file(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.release_file(fh).await;
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        if !self.fs.get_attr(&path).await?.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let entries: Vec<FuseResult<DirectoryEntry>> = self
            .list_dir(ino)
            .await?
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, row)| {
                Ok(DirectoryEntry {
                    inode: row.ino,
                    kind: file_type(row.mode),
                    name: row.name,
                    offset: i as i64 + 1,
                })
            })
            .collect();
        Ok(ReplyDirectory {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let listing = self.list_dir(ino).await?;
        let mut entries = Vec::with_capacity(listing.len());
        for (i, row) in listing.into_iter().enumerate().skip(offset as usize) {
            // entries may vanish between listing and stat
            let Ok(attr) = self.fs.get_attr(&row.path).await else {
                continue;
            };
            // nodeid 0 keeps the kernel from taking a lookup reference; only
            // lookup/mkdir/create/symlink replies are counted
            entries.push(Ok(DirectoryEntryPlus {
                inode: row.ino,
                generation: 0,
                kind: file_type(attr.mode),
                name: row.name,
                offset: i as i64 + 1,
                attr: to_file_attr(0, &attr),
                entry_ttl: self.ttl,
                attr_ttl: self.ttl,
            }));
        }
        Ok(ReplyDirectoryPlus {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let (entry, fh) = self.create_file(parent, name, mode, flags).await?;
        Ok(ReplyCreated {
            ttl: entry.ttl,
            attr: entry.attr,
            generation: entry.generation,
            fh,
            flags: 0,
        })
    }

    // providers expose no capacity figures; report conservative constants
    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}
