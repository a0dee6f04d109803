//! Scripted provider doubles for unit tests.
//!
//! Each double answers every call with the currently scripted error (if any)
//! and records what it was asked to do.

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::provider::{
    DirEntry, LinkReader, Linker, Metadata, ProviderFile, StorageProvider,
};

#[derive(Default)]
struct FileState {
    calls: Vec<String>,
    err: Option<ErrorKind>,
    read: Vec<u8>,
    written: Vec<u8>,
    truncated: Option<u64>,
    stall: bool,
    closes: usize,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedFile {
    state: Arc<Mutex<FileState>>,
}

impl ScriptedFile {
    pub(crate) fn fail_with(&self, kind: ErrorKind) {
        self.state.lock().unwrap().err = Some(kind);
    }

    pub(crate) fn succeed(&self) {
        self.state.lock().unwrap().err = None;
    }

    pub(crate) fn set_read(&self, data: &[u8]) {
        self.state.lock().unwrap().read = data.to_vec();
    }

    /// Makes every later `truncate` wait forever after recording the call.
    pub(crate) fn stall_truncate(&self) {
        self.state.lock().unwrap().stall = true;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn truncated(&self) -> Option<u64> {
        self.state.lock().unwrap().truncated
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl ProviderFile for ScriptedFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("read_at {} {offset}", buf.len()));
        if let Some(kind) = state.err {
            return Err(kind.into());
        }
        let n = buf.len().min(state.read.len());
        buf[..n].copy_from_slice(&state.read[..n]);
        Ok(n)
    }

    async fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("write_at {} {offset}", data.len()));
        if let Some(kind) = state.err {
            return Err(kind.into());
        }
        state.written = data.to_vec();
        Ok(data.len())
    }

    async fn truncate(&self, size: u64) -> io::Result<()> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("truncate {size}"));
            if let Some(kind) = state.err {
                return Err(kind.into());
            }
            state.stall
        };
        if stall {
            std::future::pending::<()>().await;
        }
        self.state.lock().unwrap().truncated = Some(size);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("close".to_string());
        state.closes += 1;
        match state.err {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct ProviderState {
    err: Option<ErrorKind>,
    stat: Option<Metadata>,
    entries: Vec<DirEntry>,
    link: String,
    calls: Vec<String>,
}

/// Provider double. Link capability is switched on and off at runtime.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    state: Mutex<ProviderState>,
    file: ScriptedFile,
    links: AtomicBool,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_with(&self, kind: ErrorKind) {
        self.state.lock().unwrap().err = Some(kind);
    }

    pub(crate) fn succeed(&self) {
        self.state.lock().unwrap().err = None;
    }

    pub(crate) fn set_stat(&self, meta: Option<Metadata>) {
        self.state.lock().unwrap().stat = meta;
    }

    pub(crate) fn set_entries(&self, entries: Vec<DirEntry>) {
        self.state.lock().unwrap().entries = entries;
    }

    pub(crate) fn set_link(&self, link: &str) {
        self.state.lock().unwrap().link = link.to_string();
    }

    pub(crate) fn enable_links(&self, enabled: bool) {
        self.links.store(enabled, Ordering::SeqCst);
    }

    /// Handle state shared with every file this provider opens.
    pub(crate) fn file(&self) -> &ScriptedFile {
        &self.file
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.err {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageProvider for ScriptedProvider {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn stat(&self, path: &str) -> io::Result<Option<Metadata>> {
        self.record(format!("stat {path}"))?;
        Ok(self.state.lock().unwrap().stat.clone())
    }

    async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        self.record(format!("chmod {path} {mode:o}"))
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> io::Result<()> {
        self.record(format!("chown {path} {uid} {gid}"))
    }

    async fn chtimes(&self, path: &str, _atime: SystemTime, _mtime: SystemTime) -> io::Result<()> {
        self.record(format!("chtimes {path}"))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.record(format!("mkdir {path} {mode:o}"))
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        self.record(format!("remove {path}"))
    }

    async fn rename(&self, old: &str, new: &str) -> io::Result<()> {
        self.record(format!("rename {old} {new}"))
    }

    async fn open_file(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> io::Result<Box<dyn ProviderFile>> {
        self.record(format!("open_file {path} {flags:o} {mode:o}"))?;
        Ok(Box::new(self.file.clone()))
    }

    async fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        self.record(format!("read_dir {path}"))?;
        Ok(self.state.lock().unwrap().entries.clone())
    }

    fn linker(&self) -> Option<&dyn Linker> {
        self.links.load(Ordering::SeqCst).then_some(self as &dyn Linker)
    }

    fn link_reader(&self) -> Option<&dyn LinkReader> {
        self.links.load(Ordering::SeqCst).then_some(self as &dyn LinkReader)
    }
}

#[async_trait]
impl Linker for ScriptedProvider {
    async fn symlink_if_possible(&self, old: &str, new: &str) -> io::Result<()> {
        self.record(format!("symlink {old} {new}"))
    }
}

#[async_trait]
impl LinkReader for ScriptedProvider {
    async fn readlink_if_possible(&self, path: &str) -> io::Result<String> {
        let res = self.record(format!("readlink {path}"));
        let link = self.state.lock().unwrap().link.clone();
        res.map(|()| link)
    }
}
