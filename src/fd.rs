/*!
 * File and directory handle registry
 *
 * Owns the mapping from handle identifiers to per-open-file remote state.
 * Identifiers increase monotonically and are never reused. The registry
 * caches no data; it knows how to open, reopen (after a reconnect) and
 * close remote descriptors, nothing more.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::conn::{Conn, ConnPool};
use crate::error::Result;
use crate::rpc::Rpc;

/// Mutable side of an open file: the remote descriptor and the last
/// observed file-pointer position. Whenever the handle lock is free the
/// pointer equals the descriptor's server-side position.
pub struct FileState {
    pub fd: i32,
    pub last_file_pointer: i64,
}

/// An open data object. RPC traffic for the handle is serialized by the
/// state lock.
pub struct FileHandle {
    id: u64,
    path: String,
    open_flags: i32,
    conn: Arc<Conn>,
    state: RwLock<FileState>,
}

impl FileHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn open_flags(&self) -> i32 {
        self.open_flags
    }

    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn is_readable(&self) -> bool {
        let acc = self.open_flags & libc::O_ACCMODE;
        acc == libc::O_RDONLY || acc == libc::O_RDWR
    }

    pub fn is_writable(&self) -> bool {
        let acc = self.open_flags & libc::O_ACCMODE;
        acc == libc::O_WRONLY || acc == libc::O_RDWR
    }

    pub fn remote_fd(&self) -> i32 {
        self.state.read().fd
    }

    pub fn last_file_pointer(&self) -> i64 {
        self.state.read().last_file_pointer
    }

    pub(crate) fn state(&self) -> &RwLock<FileState> {
        &self.state
    }
}

/// An open collection: a remote iterator, or a snapshot of pre-listed
/// entries served without a connection.
pub struct DirHandle {
    id: u64,
    path: String,
    conn: Option<Arc<Conn>>,
    iter_handle: Mutex<Option<i32>>,
    snapshot: RwLock<Option<Vec<String>>>,
}

impl DirHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn conn(&self) -> Option<&Arc<Conn>> {
        self.conn.as_ref()
    }

    pub fn iter_handle(&self) -> Option<i32> {
        *self.iter_handle.lock()
    }

    pub fn snapshot(&self) -> Option<Vec<String>> {
        self.snapshot.read().clone()
    }

    pub fn set_snapshot(&self, names: Vec<String>) {
        *self.snapshot.write() = Some(names);
    }
}

pub struct FdRegistry {
    pool: Arc<ConnPool>,
    rpc: Rpc,
    files: Mutex<HashMap<u64, Arc<FileHandle>>>,
    dirs: Mutex<HashMap<u64, Arc<DirHandle>>>,
    next_id: AtomicU64,
}

impl FdRegistry {
    pub fn new(pool: Arc<ConnPool>, rpc: Rpc) -> Self {
        Self {
            pool,
            rpc,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Open the data object on the given leased connection. The handle
    /// keeps the lease until `close`.
    pub fn open(&self, conn: &Arc<Conn>, path: &str, flags: i32) -> Result<Arc<FileHandle>> {
        let p = path.to_string();
        let fd = self
            .rpc
            .call_with_reconnect(&self.pool, conn, "dataObjOpen", move |s| {
                s.data_obj_open(&p, flags)
            })?;

        let handle = Arc::new(FileHandle {
            id: self.allocate_id(),
            path: path.to_string(),
            open_flags: flags,
            conn: conn.clone(),
            state: RwLock::new(FileState {
                fd,
                last_file_pointer: 0,
            }),
        });
        debug!("opened {} as handle {} (fd {})", path, handle.id, fd);
        self.files.lock().insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Re-issue the open on the handle's (reconnected) connection and
    /// restore the file-pointer position. Identifier and pointer survive.
    pub fn reopen(&self, handle: &FileHandle) -> Result<()> {
        let mut st = handle.state.write();
        self.reopen_locked(handle, &mut st)
    }

    /// `reopen` for callers already holding the handle's state lock.
    pub(crate) fn reopen_locked(&self, handle: &FileHandle, st: &mut FileState) -> Result<()> {
        let p = handle.path.clone();
        let flags = handle.open_flags;
        let fd = self
            .rpc
            .call(&handle.conn, "dataObjOpen", move |s| s.data_obj_open(&p, flags))?;
        st.fd = fd;
        if st.last_file_pointer > 0 {
            let off = st.last_file_pointer;
            self.rpc
                .call(&handle.conn, "dataObjLseek", move |s| s.data_obj_lseek(fd, off))?;
        }
        debug!("reopened handle {} (fd {})", handle.id, fd);
        Ok(())
    }

    /// Close the remote descriptor and return the connection lease.
    pub fn close(&self, handle: Arc<FileHandle>) -> Result<()> {
        self.files.lock().remove(&handle.id);
        let fd = handle.state.read().fd;
        let result = self
            .rpc
            .call(&handle.conn, "dataObjClose", move |s| s.data_obj_close(fd));
        self.pool.unuse(&handle.conn);
        debug!("closed handle {} ({})", handle.id, handle.path);
        result
    }

    /// Open a collection iterator on the given leased connection.
    pub fn dir_open(&self, conn: &Arc<Conn>, path: &str) -> Result<Arc<DirHandle>> {
        let p = path.to_string();
        let iter = self
            .rpc
            .call_with_reconnect(&self.pool, conn, "collOpen", move |s| s.coll_open(&p))?;

        let handle = Arc::new(DirHandle {
            id: self.allocate_id(),
            path: path.to_string(),
            conn: Some(conn.clone()),
            iter_handle: Mutex::new(Some(iter)),
            snapshot: RwLock::new(None),
        });
        self.dirs.lock().insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Open a collection from a fresh cached listing; no connection is
    /// leased and readdir is served locally.
    pub fn dir_open_cached(&self, path: &str, names: Vec<String>) -> Arc<DirHandle> {
        let handle = Arc::new(DirHandle {
            id: self.allocate_id(),
            path: path.to_string(),
            conn: None,
            iter_handle: Mutex::new(None),
            snapshot: RwLock::new(Some(names)),
        });
        self.dirs.lock().insert(handle.id, handle.clone());
        handle
    }

    pub fn dir_close(&self, handle: Arc<DirHandle>) -> Result<()> {
        self.dirs.lock().remove(&handle.id);
        let mut result = Ok(());
        if let (Some(conn), Some(iter)) = (&handle.conn, handle.iter_handle.lock().take()) {
            result = self
                .rpc
                .call(conn, "collClose", move |s| s.coll_close(iter));
        }
        if let Some(conn) = &handle.conn {
            self.pool.unuse(conn);
        }
        result
    }

    pub fn get_file(&self, id: u64) -> Option<Arc<FileHandle>> {
        self.files.lock().get(&id).cloned()
    }

    pub fn get_dir(&self, id: u64) -> Option<Arc<DirHandle>> {
        self.dirs.lock().get(&id).cloned()
    }

    pub fn open_file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Close every handle still registered. Used at unmount; by then the
    /// kernel has released everything, so leftovers indicate leaks.
    pub fn close_all(&self) {
        let files: Vec<Arc<FileHandle>> = self.files.lock().values().cloned().collect();
        for handle in files {
            warn!("handle {} ({}) still open at shutdown", handle.id, handle.path);
            let _ = self.close(handle);
        }
        let dirs: Vec<Arc<DirHandle>> = self.dirs.lock().values().cloned().collect();
        for handle in dirs {
            let _ = self.dir_close(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryClient, MemoryServer};
    use crate::client::Account;
    use crate::config::FsConfig;
    use crate::conn::ConnKind;

    fn test_registry() -> (MemoryServer, Arc<ConnPool>, FdRegistry) {
        let server = MemoryServer::new();
        server.add_file("/tempZone/home/rods/data.bin", b"0123456789");
        let client = Arc::new(MemoryClient::new(server.clone()));
        let account = Account::new("memory", "tempZone", "rods");
        let cfg = FsConfig::default();
        let pool = Arc::new(ConnPool::new(client, account, &cfg));
        let registry = FdRegistry::new(pool.clone(), Rpc::new(cfg.rpc_timeout_sec));
        (server, pool, registry)
    }

    #[test]
    fn test_open_close_releases_lease() {
        let (server, pool, registry) = test_registry();

        let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
        let handle = registry
            .open(&conn, "/tempZone/home/rods/data.bin", libc::O_RDONLY)
            .unwrap();
        assert!(handle.is_readable());
        assert!(!handle.is_writable());
        assert_eq!(registry.open_file_count(), 1);
        assert_eq!(server.open_descriptor_count(), 1);

        registry.close(handle).unwrap();
        assert_eq!(registry.open_file_count(), 0);
        assert_eq!(server.open_descriptor_count(), 0);
        assert_eq!(pool.report().inuse_file_io, 0);
    }

    #[test]
    fn test_identifiers_increase_and_never_repeat() {
        let (_server, pool, registry) = test_registry();

        let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
        let first = registry
            .open(&conn, "/tempZone/home/rods/data.bin", libc::O_RDONLY)
            .unwrap();
        let first_id = first.id();
        registry.close(first).unwrap();

        let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
        let second = registry
            .open(&conn, "/tempZone/home/rods/data.bin", libc::O_RDONLY)
            .unwrap();
        assert!(second.id() > first_id);
        registry.close(second).unwrap();
    }

    #[test]
    fn test_reopen_restores_position() {
        let (server, pool, registry) = test_registry();

        let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
        let handle = registry
            .open(&conn, "/tempZone/home/rods/data.bin", libc::O_RDONLY)
            .unwrap();
        {
            let mut st = handle.state().write();
            let fd = st.fd;
            conn.session().data_obj_lseek(fd, 4).unwrap();
            st.last_file_pointer = 4;
        }

        server.kill_sessions();
        pool.reconnect(&conn).unwrap();
        registry.reopen(&handle).unwrap();

        assert_eq!(handle.last_file_pointer(), 4);
        assert_eq!(server.descriptor_position(handle.remote_fd()), Some(4));
        registry.close(handle).unwrap();
    }

    #[test]
    fn test_dir_open_cached_needs_no_connection() {
        let (server, _pool, registry) = test_registry();
        let before = server.counts().coll_opens;

        let handle = registry.dir_open_cached(
            "/tempZone/home/rods",
            vec!["data.bin".to_string()],
        );
        assert_eq!(handle.snapshot().unwrap(), vec!["data.bin".to_string()]);
        assert_eq!(server.counts().coll_opens, before);
        registry.dir_close(handle).unwrap();
    }
}
