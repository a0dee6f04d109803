//! In-memory provider.
//!
//! Entries live in one ordered map keyed by cleaned path, so a directory
//! listing is a range scan and comes back sorted by name. File contents are
//! shared between the map and every handle opened on them.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{DirEntry, Metadata, ProviderFile, StorageProvider, clean_path};

const BLOCK_SIZE: u32 = 4096;

/// Largest file the in-memory tree will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

#[derive(Debug)]
struct Node {
    mode: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    data: Vec<u8>,
}

impl Node {
    fn new(mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            data: Vec::new(),
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            size: if self.is_dir() { 0 } else { self.data.len() as u64 },
            mode: self.mode,
            nlink: if self.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

type NodeRef = Arc<RwLock<Node>>;

fn read_node(node: &NodeRef) -> RwLockReadGuard<'_, Node> {
    node.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_node(node: &NodeRef) -> RwLockWriteGuard<'_, Node> {
    node.write().unwrap_or_else(PoisonError::into_inner)
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Grows or shrinks `data` to `len` bytes, zero filling. Sizes past
/// [`MAX_FILE_SIZE`] are `EFBIG`; an allocation failure is `ENOSPC`.
fn resize_data(data: &mut Vec<u8>, len: u64) -> io::Result<()> {
    if len > MAX_FILE_SIZE {
        return Err(errno(libc::EFBIG));
    }
    let len = usize::try_from(len).map_err(|_| errno(libc::EFBIG))?;
    if len > data.len() {
        data.try_reserve_exact(len - data.len())
            .map_err(|_| errno(libc::ENOSPC))?;
    }
    data.resize(len, 0);
    Ok(())
}

fn parent_of(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

fn is_child(parent: &str, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if parent.is_empty() {
        return !path.contains('/');
    }
    path.strip_prefix(parent)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.contains('/'))
}

fn in_subtree(root: &str, path: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// A provider keeping the whole tree in memory. Has no link capability.
#[derive(Debug)]
pub struct MemFs {
    nodes: RwLock<BTreeMap<String, NodeRef>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Arc::new(RwLock::new(Node::new(libc::S_IFDIR | 0o755))),
        );
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn nodes(&self) -> RwLockReadGuard<'_, BTreeMap<String, NodeRef>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, NodeRef>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn node(&self, path: &str) -> io::Result<NodeRef> {
        self.nodes()
            .get(path)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn check_parent(nodes: &BTreeMap<String, NodeRef>, path: &str) -> io::Result<()> {
        if path.is_empty() {
            return Err(errno(libc::EEXIST));
        }
        let parent = nodes
            .get(parent_of(path))
            .ok_or_else(|| errno(libc::ENOENT))?;
        if !read_node(parent).is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(())
    }

    fn touch(&self, path: &str, f: impl FnOnce(&mut Node)) -> io::Result<()> {
        let node = self.node(&clean_path(path))?;
        let mut node = write_node(&node);
        f(&mut node);
        node.ctime = SystemTime::now();
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MemFs {
    fn name(&self) -> String {
        "MemFs".to_string()
    }

    async fn stat(&self, path: &str) -> io::Result<Option<Metadata>> {
        let node = self.node(&clean_path(path))?;
        Ok(Some(read_node(&node).metadata()))
    }

    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        self.touch(path, |node| {
            node.mode = (node.mode & libc::S_IFMT) | (mode & 0o7777);
        })
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        self.touch(path, |node| {
            node.uid = uid;
            node.gid = gid;
        })
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        self.touch(path, |node| {
            node.atime = atime;
            node.mtime = mtime;
        })
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        let path = clean_path(path);
        let mut nodes = self.nodes_mut();
        if nodes.contains_key(&path) {
            return Err(errno(libc::EEXIST));
        }
        Self::check_parent(&nodes, &path)?;
        nodes.insert(
            path,
            Arc::new(RwLock::new(Node::new(libc::S_IFDIR | (mode & 0o7777)))),
        );
        Ok(())
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        let path = clean_path(path);
        if path.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        let mut nodes = self.nodes_mut();
        let node = nodes.get(&path).ok_or_else(|| errno(libc::ENOENT))?;
        if read_node(node).is_dir() && nodes.keys().any(|key| is_child(&path, key)) {
            return Err(errno(libc::ENOTEMPTY));
        }
        nodes.remove(&path);
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        let old = clean_path(old);
        let new = clean_path(new);
        if old.is_empty() || new.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        if old == new {
            return Ok(());
        }
        if in_subtree(&old, &new) {
            return Err(errno(libc::EINVAL));
        }

        let mut nodes = self.nodes_mut();
        let source = nodes.get(&old).ok_or_else(|| errno(libc::ENOENT))?;
        let source_is_dir = read_node(source).is_dir();
        Self::check_parent(&nodes, &new)?;
        if let Some(target) = nodes.get(&new) {
            let target_is_dir = read_node(target).is_dir();
            match (source_is_dir, target_is_dir) {
                (false, true) => return Err(errno(libc::EISDIR)),
                (true, false) => return Err(errno(libc::ENOTDIR)),
                (true, true) if nodes.keys().any(|key| is_child(&new, key)) => {
                    return Err(errno(libc::ENOTEMPTY));
                }
                _ => {}
            }
            nodes.remove(&new);
        }

        let moved: Vec<String> = nodes
            .keys()
            .filter(|key| in_subtree(&old, key))
            .cloned()
            .collect();
        for key in moved {
            if let Some(node) = nodes.remove(&key) {
                let renamed = format!("{new}{}", &key[old.len()..]);
                nodes.insert(renamed, node);
            }
        }
        Ok(())
    }

    async fn open_file(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> io::Result<Box<dyn ProviderFile>> {
        let path = clean_path(path);
        let flags = flags as i32;
        let access = flags & libc::O_ACCMODE;
        let readable = access == libc::O_RDONLY || access == libc::O_RDWR;
        let writable = access == libc::O_WRONLY || access == libc::O_RDWR;

        let node = {
            let mut nodes = self.nodes_mut();
            match nodes.get(&path) {
                Some(_) if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 => {
                    return Err(errno(libc::EEXIST));
                }
                Some(node) => node.clone(),
                None if flags & libc::O_CREAT != 0 => {
                    Self::check_parent(&nodes, &path)?;
                    let node = Arc::new(RwLock::new(Node::new(libc::S_IFREG | (mode & 0o7777))));
                    nodes.insert(path, node.clone());
                    node
                }
                None => return Err(errno(libc::ENOENT)),
            }
        };

        {
            let mut inner = write_node(&node);
            if inner.is_dir() {
                if writable {
                    return Err(errno(libc::EISDIR));
                }
            } else if writable && flags & libc::O_TRUNC != 0 {
                inner.data.clear();
                inner.mtime = SystemTime::now();
            }
        }

        Ok(Box::new(MemFile {
            node,
            readable,
            writable,
            closed: AtomicBool::new(false),
        }))
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = clean_path(path);
        let nodes = self.nodes();
        let dir = nodes.get(&path).ok_or_else(|| errno(libc::ENOENT))?;
        if !read_node(dir).is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(nodes
            .iter()
            .filter(|(key, _)| is_child(&path, key))
            .map(|(key, node)| DirEntry {
                name: key.rsplit('/').next().unwrap_or(key).to_string(),
                mode: read_node(node).mode,
            })
            .collect())
    }
}

/// Handle returned by [`MemFs::open_file`].
#[derive(Debug)]
pub struct MemFile {
    node: NodeRef,
    readable: bool,
    writable: bool,
    closed: AtomicBool,
}

impl MemFile {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(errno(libc::EBADF));
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderFile for MemFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.check_open()?;
        if !self.readable {
            return Err(errno(libc::EBADF));
        }
        let node = read_node(&self.node);
        if node.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let len = node.data.len() as u64;
        if offset >= len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let start = offset as usize;
        let n = buf.len().min(node.data.len() - start);
        buf[..n].copy_from_slice(&node.data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.check_open()?;
        if !self.writable {
            return Err(errno(libc::EBADF));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| errno(libc::EFBIG))?;
        let mut node = write_node(&self.node);
        if (node.data.len() as u64) < end {
            resize_data(&mut node.data, end)?;
        }
        let start = offset as usize;
        node.data[start..start + data.len()].copy_from_slice(data);
        let now = SystemTime::now();
        node.mtime = now;
        node.ctime = now;
        Ok(data.len())
    }

    async fn truncate(&self, size: u64) -> io::Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(errno(libc::EINVAL));
        }
        let mut node = write_node(&self.node);
        resize_data(&mut node.data, size)?;
        let now = SystemTime::now();
        node.mtime = now;
        node.ctime = now;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(errno(libc::EBADF));
        }
        Ok(())
    }
}
