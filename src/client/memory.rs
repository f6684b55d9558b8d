//! In-memory driver
//!
//! A complete implementation of the client contract against a process-local
//! namespace. It backs the integration tests (with per-operation counters
//! and failure injection) and `--host memory` mounts for local
//! experimentation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{
    Account, Client, ClientError, ClientResult, CollEntry, EntryKind, ObjMetaChange, ObjStat,
    Session,
};

/// Per-operation RPC counters, for assertions in tests.
#[derive(Debug, Clone, Default)]
pub struct OpCounts {
    pub connects: usize,
    pub stats: usize,
    pub opens: usize,
    pub creates: usize,
    pub closes: usize,
    pub seeks: usize,
    pub reads: usize,
    pub writes: usize,
    pub coll_opens: usize,
    pub coll_reads: usize,
}

/// Switchable failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Every read RPC fails with a server error.
    FailAllReads,
    /// Reads fail on any descriptor that is not the earliest-opened live
    /// descriptor of its path. Exercises degraded paths where secondary
    /// descriptors on a file are unusable while the primary still works.
    FailSecondaryReads,
}

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    data: Vec<u8>,
    mode: u32,
    mtime: i64,
    ctime: i64,
    owner: String,
}

impl Node {
    fn collection(owner: &str) -> Self {
        let now = unix_now();
        Node {
            kind: EntryKind::Collection,
            data: Vec::new(),
            mode: 0o755,
            mtime: now,
            ctime: now,
            owner: owner.to_string(),
        }
    }

    fn data_object(owner: &str, data: Vec<u8>, mode: u32) -> Self {
        let now = unix_now();
        Node {
            kind: EntryKind::DataObject,
            data,
            mode,
            mtime: now,
            ctime: now,
            owner: owner.to_string(),
        }
    }

    fn stat(&self) -> ObjStat {
        ObjStat {
            kind: self.kind,
            size: self.data.len() as u64,
            mode: self.mode,
            mtime: self.mtime,
            ctime: self.ctime,
            owner: self.owner.clone(),
        }
    }
}

struct FdState {
    path: String,
    pos: i64,
}

struct CollIterState {
    entries: Vec<CollEntry>,
    cursor: usize,
}

struct ServerInner {
    nodes: BTreeMap<String, Node>,
    fds: HashMap<i32, FdState>,
    colls: HashMap<i32, CollIterState>,
    next_handle: i32,
    epoch: u64,
    counts: OpCounts,
    fault: Fault,
    password: Option<String>,
}

/// Shared in-memory namespace. Clones refer to the same server.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerInner>>,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::collection("rods"));
        Self {
            inner: Arc::new(Mutex::new(ServerInner {
                nodes,
                fds: HashMap::new(),
                colls: HashMap::new(),
                next_handle: 3,
                epoch: 0,
                counts: OpCounts::default(),
                fault: Fault::None,
                password: None,
            })),
        }
    }

    /// Require this password at connect time.
    pub fn set_password(&self, password: impl Into<String>) {
        self.inner.lock().password = Some(password.into());
    }

    /// Create a collection and all missing ancestors.
    pub fn mkdir_all(&self, path: &str) {
        let mut inner = self.inner.lock();
        Self::mkdir_all_locked(&mut inner, path);
    }

    fn mkdir_all_locked(inner: &mut ServerInner, path: &str) {
        let mut cur = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur.push('/');
            cur.push_str(part);
            inner
                .nodes
                .entry(cur.clone())
                .or_insert_with(|| Node::collection("rods"));
        }
    }

    /// Create a data object (and missing parent collections).
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut inner = self.inner.lock();
        let (dir, _) = super::split_path(path);
        Self::mkdir_all_locked(&mut inner, dir);
        inner
            .nodes
            .insert(path.to_string(), Node::data_object("rods", data.to_vec(), 0o644));
    }

    /// Contents of a data object, if present.
    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .nodes
            .get(path)
            .filter(|n| n.kind == EntryKind::DataObject)
            .map(|n| n.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    pub fn counts(&self) -> OpCounts {
        self.inner.lock().counts.clone()
    }

    pub fn reset_counts(&self) {
        self.inner.lock().counts = OpCounts::default();
    }

    pub fn set_fault(&self, fault: Fault) {
        self.inner.lock().fault = fault;
    }

    /// Drop every live session; their next call fails as disconnected.
    pub fn kill_sessions(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.fds.clear();
        inner.colls.clear();
    }

    /// Number of open data-object descriptors.
    pub fn open_descriptor_count(&self) -> usize {
        self.inner.lock().fds.len()
    }

    /// Current position of an open descriptor.
    pub fn descriptor_position(&self, fd: i32) -> Option<i64> {
        self.inner.lock().fds.get(&fd).map(|s| s.pos)
    }
}

/// Driver handing out sessions against a [`MemoryServer`].
pub struct MemoryClient {
    server: MemoryServer,
}

impl MemoryClient {
    pub fn new(server: MemoryServer) -> Self {
        Self { server }
    }
}

impl Client for MemoryClient {
    fn connect(&self, account: &Account) -> ClientResult<Arc<dyn Session>> {
        let epoch = {
            let mut inner = self.server.inner.lock();
            inner.counts.connects += 1;
            if let Some(expected) = &inner.password {
                if account.password.as_deref() != Some(expected.as_str()) {
                    return Err(ClientError::Authentication(format!(
                        "login rejected for {}#{}",
                        account.user, account.zone
                    )));
                }
            }
            inner.epoch
        };
        Ok(Arc::new(MemorySession {
            server: self.server.clone(),
            epoch,
            ticket: Mutex::new(account.ticket.clone()),
        }))
    }
}

struct MemorySession {
    server: MemoryServer,
    epoch: u64,
    ticket: Mutex<Option<String>>,
}

impl MemorySession {
    fn lock_alive(&self) -> ClientResult<parking_lot::MutexGuard<'_, ServerInner>> {
        let inner = self.server.inner.lock();
        if inner.epoch != self.epoch {
            return Err(ClientError::Disconnected);
        }
        Ok(inner)
    }
}

fn node_or_not_found<'a>(inner: &'a ServerInner, path: &str) -> ClientResult<&'a Node> {
    inner
        .nodes
        .get(path)
        .ok_or_else(|| ClientError::NotFound(path.to_string()))
}

/// The earliest-opened live descriptor of a path is the primary one.
fn is_secondary_fd(inner: &ServerInner, fd: i32) -> bool {
    let path = match inner.fds.get(&fd) {
        Some(s) => s.path.clone(),
        None => return false,
    };
    inner
        .fds
        .iter()
        .filter(|(_, s)| s.path == path)
        .map(|(id, _)| *id)
        .min()
        .map(|min_fd| fd != min_fd)
        .unwrap_or(false)
}

impl Session for MemorySession {
    fn set_session_ticket(&self, ticket: &str) -> ClientResult<()> {
        *self.ticket.lock() = Some(ticket.to_string());
        Ok(())
    }

    fn obj_stat(&self, path: &str) -> ClientResult<ObjStat> {
        let mut inner = self.lock_alive()?;
        inner.counts.stats += 1;
        node_or_not_found(&inner, path).map(Node::stat)
    }

    fn data_obj_open(&self, path: &str, flags: i32) -> ClientResult<i32> {
        let mut inner = self.lock_alive()?;
        inner.counts.opens += 1;
        {
            let node = node_or_not_found(&inner, path)?;
            if node.kind != EntryKind::DataObject {
                return Err(ClientError::InvalidArgument(format!(
                    "{} is a collection",
                    path
                )));
            }
        }
        if flags & libc::O_TRUNC != 0 {
            let now = unix_now();
            let node = inner.nodes.get_mut(path).unwrap();
            node.data.clear();
            node.mtime = now;
        }
        let fd = inner.next_handle;
        inner.next_handle += 1;
        inner.fds.insert(
            fd,
            FdState {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(fd)
    }

    fn data_obj_create(&self, path: &str, mode: u32) -> ClientResult<i32> {
        let mut inner = self.lock_alive()?;
        inner.counts.creates += 1;
        let (dir, _) = super::split_path(path);
        if !inner.nodes.contains_key(dir) {
            return Err(ClientError::NotFound(dir.to_string()));
        }
        inner
            .nodes
            .insert(path.to_string(), Node::data_object("rods", Vec::new(), mode));
        let fd = inner.next_handle;
        inner.next_handle += 1;
        inner.fds.insert(
            fd,
            FdState {
                path: path.to_string(),
                pos: 0,
            },
        );
        Ok(fd)
    }

    fn data_obj_close(&self, fd: i32) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        inner.counts.closes += 1;
        inner
            .fds
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| ClientError::InvalidArgument(format!("bad descriptor {}", fd)))
    }

    fn data_obj_lseek(&self, fd: i32, offset: i64) -> ClientResult<i64> {
        let mut inner = self.lock_alive()?;
        inner.counts.seeks += 1;
        if offset < 0 {
            return Err(ClientError::InvalidArgument("negative offset".into()));
        }
        let state = inner
            .fds
            .get_mut(&fd)
            .ok_or_else(|| ClientError::InvalidArgument(format!("bad descriptor {}", fd)))?;
        state.pos = offset;
        Ok(offset)
    }

    fn data_obj_read(&self, fd: i32, len: usize) -> ClientResult<Vec<u8>> {
        let mut inner = self.lock_alive()?;
        inner.counts.reads += 1;
        match inner.fault {
            Fault::FailAllReads => {
                return Err(ClientError::Protocol {
                    code: -2602000,
                    message: "injected read failure".into(),
                })
            }
            Fault::FailSecondaryReads if is_secondary_fd(&inner, fd) => {
                return Err(ClientError::Protocol {
                    code: -2602000,
                    message: "injected read failure".into(),
                })
            }
            _ => {}
        }
        let (path, pos) = {
            let state = inner
                .fds
                .get(&fd)
                .ok_or_else(|| ClientError::InvalidArgument(format!("bad descriptor {}", fd)))?;
            (state.path.clone(), state.pos)
        };
        let node = node_or_not_found(&inner, &path)?;
        let start = pos as usize;
        if start >= node.data.len() {
            // at or past end of file; the position does not move
            return Ok(Vec::new());
        }
        let end = (start + len).min(node.data.len());
        let chunk = node.data[start..end].to_vec();
        inner.fds.get_mut(&fd).unwrap().pos = end as i64;
        Ok(chunk)
    }

    fn data_obj_write(&self, fd: i32, data: &[u8]) -> ClientResult<usize> {
        let mut inner = self.lock_alive()?;
        inner.counts.writes += 1;
        let (path, pos) = {
            let state = inner
                .fds
                .get(&fd)
                .ok_or_else(|| ClientError::InvalidArgument(format!("bad descriptor {}", fd)))?;
            (state.path.clone(), state.pos as usize)
        };
        let now = unix_now();
        let node = inner
            .nodes
            .get_mut(&path)
            .ok_or_else(|| ClientError::NotFound(path.clone()))?;
        if node.data.len() < pos + data.len() {
            node.data.resize(pos + data.len(), 0);
        }
        node.data[pos..pos + data.len()].copy_from_slice(data);
        node.mtime = now;
        inner.fds.get_mut(&fd).unwrap().pos = (pos + data.len()) as i64;
        Ok(data.len())
    }

    fn data_obj_unlink(&self, path: &str) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        let node = node_or_not_found(&inner, path)?;
        if node.kind != EntryKind::DataObject {
            return Err(ClientError::InvalidArgument(format!(
                "{} is a collection",
                path
            )));
        }
        inner.nodes.remove(path);
        Ok(())
    }

    fn data_obj_rename(&self, from: &str, to: &str) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        let node = node_or_not_found(&inner, from)?.clone();
        if node.kind == EntryKind::Collection {
            let prefix = format!("{}/", from);
            let moved: Vec<(String, Node)> = inner
                .nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (old_key, child) in moved {
                let new_key = format!("{}{}", to, &old_key[from.len()..]);
                inner.nodes.remove(&old_key);
                inner.nodes.insert(new_key, child);
            }
        }
        inner.nodes.remove(from);
        inner.nodes.insert(to.to_string(), node);
        Ok(())
    }

    fn data_obj_truncate(&self, path: &str, size: u64) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        let now = unix_now();
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        node.data.resize(size as usize, 0);
        node.mtime = now;
        Ok(())
    }

    fn mod_obj_meta(&self, path: &str, change: &ObjMetaChange) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        let node = inner
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        if let Some(mode) = change.mode {
            node.mode = mode & 0o777;
        }
        if let Some(mtime) = change.mtime {
            node.mtime = mtime;
        }
        Ok(())
    }

    fn coll_open(&self, path: &str) -> ClientResult<i32> {
        let mut inner = self.lock_alive()?;
        inner.counts.coll_opens += 1;
        {
            let node = node_or_not_found(&inner, path)?;
            if node.kind != EntryKind::Collection {
                return Err(ClientError::InvalidArgument(format!(
                    "{} is a data object",
                    path
                )));
            }
        }
        let entries = collection_entries(&inner, path);
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.colls.insert(handle, CollIterState { entries, cursor: 0 });
        Ok(handle)
    }

    fn coll_read(&self, handle: i32) -> ClientResult<Option<CollEntry>> {
        let mut inner = self.lock_alive()?;
        inner.counts.coll_reads += 1;
        let iter = inner
            .colls
            .get_mut(&handle)
            .ok_or_else(|| ClientError::InvalidArgument(format!("bad handle {}", handle)))?;
        if iter.cursor >= iter.entries.len() {
            return Ok(None);
        }
        let entry = iter.entries[iter.cursor].clone();
        iter.cursor += 1;
        Ok(Some(entry))
    }

    fn coll_close(&self, handle: i32) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        inner
            .colls
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| ClientError::InvalidArgument(format!("bad handle {}", handle)))
    }

    fn coll_create(&self, path: &str) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        let (dir, _) = super::split_path(path);
        if !inner.nodes.contains_key(dir) {
            return Err(ClientError::NotFound(dir.to_string()));
        }
        inner.nodes.insert(path.to_string(), Node::collection("rods"));
        Ok(())
    }

    fn coll_remove(&self, path: &str) -> ClientResult<()> {
        let mut inner = self.lock_alive()?;
        {
            let node = node_or_not_found(&inner, path)?;
            if node.kind != EntryKind::Collection {
                return Err(ClientError::InvalidArgument(format!(
                    "{} is a data object",
                    path
                )));
            }
        }
        if !collection_entries(&inner, path).is_empty() {
            return Err(ClientError::Protocol {
                code: -821000,
                message: format!("collection {} not empty", path),
            });
        }
        inner.nodes.remove(path);
        Ok(())
    }

    fn disconnect(&self) -> ClientResult<()> {
        Ok(())
    }
}

fn collection_entries(inner: &ServerInner, path: &str) -> Vec<CollEntry> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    };
    inner
        .nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter(|(k, _)| !k[prefix.len()..].contains('/'))
        .map(|(k, v)| CollEntry {
            name: k[prefix.len()..].to_string(),
            stat: v.stat(),
        })
        .collect()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
