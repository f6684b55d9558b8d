/*!
 * Path-based filesystem core
 *
 * Ties the layers together: attribute and directory operations consult the
 * metadata cache and fall back to short-op connections; file I/O routes
 * through the preloader and the block buffer cache according to
 * configuration. The kernel-facing shim (`fuse`) translates inode callbacks
 * into these calls.
 */

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::buffered::BufferedFs;
use crate::client::{
    join_path, split_path, Account, Client, ClientResult, EntryKind, ObjMetaChange, ObjStat,
    Session,
};
use crate::config::FsConfig;
use crate::conn::{ConnKind, ConnPool, ConnReport};
use crate::error::{FsError, Result};
use crate::fd::FdRegistry;
use crate::metadata_cache::MetadataCache;
use crate::preload::PreloadFs;
use crate::rpc::Rpc;
use crate::timer::Timer;

/// Fabricated filesystem-level numbers for statfs; the server exposes no
/// capacity accounting.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub struct Vfs {
    cfg: FsConfig,
    account: Account,
    pool: Arc<ConnPool>,
    registry: Arc<FdRegistry>,
    mcache: Option<Arc<MetadataCache>>,
    buffered: Arc<BufferedFs>,
    preload: Option<PreloadFs>,
    rpc: Rpc,
    timer: Timer,
    timer_handlers: Mutex<Vec<u64>>,
}

impl Vfs {
    pub fn new(client: Arc<dyn Client>, account: Account, mut cfg: FsConfig) -> Self {
        cfg.normalize();

        let pool = Arc::new(ConnPool::new(client, account.clone(), &cfg));
        let rpc = Rpc::new(cfg.rpc_timeout_sec);
        let registry = Arc::new(FdRegistry::new(pool.clone(), rpc.clone()));
        let mcache = cfg
            .cache_metadata
            .then(|| Arc::new(MetadataCache::new(cfg.metadata_cache_timeout_sec)));
        let buffered = Arc::new(BufferedFs::new(
            pool.clone(),
            registry.clone(),
            mcache.clone(),
            &cfg,
        ));
        let preload = cfg.preload.then(|| PreloadFs::new(buffered.clone(), &cfg));

        Self {
            cfg,
            account,
            pool,
            registry,
            mcache,
            buffered,
            preload,
            rpc,
            timer: Timer::new(),
            timer_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &FsConfig {
        &self.cfg
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn metadata_cache(&self) -> Option<&Arc<MetadataCache>> {
        self.mcache.as_ref()
    }

    /// Connectivity probe against the configured endpoint.
    pub fn conn_test(&self) -> Result<()> {
        self.pool.test()
    }

    pub fn conn_report(&self) -> ConnReport {
        self.pool.report()
    }

    /// Start background maintenance. Called from the mount init callback
    /// so the tick thread never runs against a half-built mount.
    pub fn start(&self) {
        let mut handlers = self.timer_handlers.lock();
        if !handlers.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        handlers.push(self.timer.add_handler(Arc::new(move || pool.tick())));
        if let Some(mcache) = &self.mcache {
            let mcache = mcache.clone();
            handlers.push(self.timer.add_handler(Arc::new(move || mcache.tick())));
        }
        self.timer.start();
        debug!("background maintenance started");
    }

    /// Quiesce and tear down in reverse layer order; joins the timer and
    /// every outstanding prefetch worker.
    pub fn shutdown(&self) {
        if let Some(preload) = &self.preload {
            preload.destroy();
        }
        self.registry.close_all();
        if let Some(mcache) = &self.mcache {
            mcache.clear();
        }
        self.pool.close_all();
        self.timer.stop();
        let mut handlers = self.timer_handlers.lock();
        for id in handlers.drain(..) {
            self.timer.remove_handler(id);
        }
        debug!("filesystem core shut down");
    }

    /// One short, stateless remote call on a freshly leased connection.
    fn short_op<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Session) -> ClientResult<T> + Send + Sync + Clone + 'static,
    {
        let conn = self.pool.get_and_use(ConnKind::ShortOp)?;
        let result = self.rpc.call_with_reconnect(&self.pool, &conn, op, f);
        self.pool.unuse(&conn);
        result
    }

    pub fn getattr(&self, path: &str) -> Result<ObjStat> {
        self.buffered.get_attr(path)
    }

    /// Open a data object; returns the handle identifier the kernel keeps.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let handle = match &self.preload {
            Some(preload) => preload.open(path, flags)?,
            None => self.buffered.open(path, flags)?,
        };
        debug!("open {} flags {:#o} -> handle {}", path, flags, handle.id());
        Ok(handle.id())
    }

    pub fn read(&self, fh: u64, off: u64, size: usize) -> Result<Vec<u8>> {
        let handle = self
            .registry
            .get_file(fh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {}", fh)))?;
        if let Some(preload) = &self.preload {
            preload.read(&handle, off, size)
        } else if self.cfg.buffered_fs {
            self.buffered.read(&handle, off, size)
        } else {
            self.read_direct(&handle, off, size)
        }
    }

    /// Unbuffered read: position the descriptor and issue a single read.
    fn read_direct(
        &self,
        handle: &Arc<crate::fd::FileHandle>,
        off: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let mut st = handle.state().write();
        let target = off as i64;
        if st.last_file_pointer != target {
            let pos = self.buffered.fd_call(handle, &mut st, "dataObjLseek", move |s, fd| {
                s.data_obj_lseek(fd, target)
            })?;
            st.last_file_pointer = pos;
        }
        let data = self.buffered.fd_call(handle, &mut st, "dataObjRead", move |s, fd| {
            s.data_obj_read(fd, size)
        })?;
        st.last_file_pointer += data.len() as i64;
        Ok(data)
    }

    pub fn write(&self, fh: u64, off: u64, data: &[u8]) -> Result<usize> {
        let handle = self
            .registry
            .get_file(fh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {}", fh)))?;
        let written = self.buffered.write(&handle, off, data)?;
        if let Some(mcache) = &self.mcache {
            mcache.remove_stat(handle.path());
        }
        Ok(written)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self
            .registry
            .get_file(fh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {}", fh)))?;
        self.buffered.flush(&handle)
    }

    /// Data is line-of-sight on the server once the write RPC returns.
    pub fn fsync(&self, _fh: u64) -> Result<()> {
        Ok(())
    }

    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self
            .registry
            .get_file(fh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown handle {}", fh)))?;
        let path = handle.path().to_string();
        let written = handle.is_writable();

        let result = match &self.preload {
            Some(preload) => preload.close(handle),
            None => self.buffered.close(handle),
        };
        if written {
            if let Some(mcache) = &self.mcache {
                mcache.remove_stat(&path);
            }
        }
        result
    }

    /// Create an empty data object.
    pub fn create(&self, path: &str, mode: u32) -> Result<()> {
        let p = path.to_string();
        self.short_op("dataObjCreate", move |s| {
            let fd = s.data_obj_create(&p, mode)?;
            s.data_obj_close(fd)
        })?;
        if let Some(mcache) = &self.mcache {
            let (dir, name) = split_path(path);
            mcache.remove_stat(path);
            mcache.add_dir_entry_if_fresh(dir, name);
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.short_op("dataObjUnlink", move |s| s.data_obj_unlink(&p))?;
        if let Some(mcache) = &self.mcache {
            let (dir, name) = split_path(path);
            mcache.remove_stat(path);
            mcache.remove_dir_entry(dir, name);
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.short_op("collCreate", move |s| s.coll_create(&p))?;
        if let Some(mcache) = &self.mcache {
            let (dir, name) = split_path(path);
            mcache.remove_stat(path);
            mcache.add_dir_entry_if_fresh(dir, name);
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let p = path.to_string();
        self.short_op("collRemove", move |s| s.coll_remove(&p))?;
        if let Some(mcache) = &self.mcache {
            let (dir, name) = split_path(path);
            mcache.remove_stat(path);
            mcache.remove_dir(path);
            mcache.remove_dir_entry(dir, name);
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let f = from.to_string();
        let t = to.to_string();
        self.short_op("dataObjRename", move |s| s.data_obj_rename(&f, &t))?;
        if let Some(mcache) = &self.mcache {
            let (from_dir, from_name) = split_path(from);
            let (to_dir, to_name) = split_path(to);
            mcache.remove_stat(from);
            mcache.remove_stat(to);
            mcache.remove_dir(from);
            mcache.remove_dir(to);
            mcache.remove_dir_entry(from_dir, from_name);
            mcache.add_dir_entry_if_fresh(to_dir, to_name);
        }
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let p = path.to_string();
        self.short_op("dataObjTruncate", move |s| s.data_obj_truncate(&p, size))?;
        if let Some(mcache) = &self.mcache {
            mcache.remove_stat(path);
        }
        Ok(())
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let p = path.to_string();
        let change = ObjMetaChange {
            mode: Some(mode),
            ..Default::default()
        };
        self.short_op("modObjMeta", move |s| s.mod_obj_meta(&p, &change))?;
        if let Some(mcache) = &self.mcache {
            mcache.remove_stat(path);
        }
        Ok(())
    }

    /// Ownership lives with the catalog; accepted and ignored so that
    /// permission-preserving copies keep working.
    pub fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }

    pub fn utimens(&self, path: &str, mtime: Option<i64>) -> Result<()> {
        let p = path.to_string();
        let change = ObjMetaChange {
            mtime,
            ..Default::default()
        };
        self.short_op("modObjMeta", move |s| s.mod_obj_meta(&p, &change))?;
        if let Some(mcache) = &self.mcache {
            mcache.remove_stat(path);
        }
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            blocks: 1 << 30,
            bfree: 1 << 29,
            bavail: 1 << 29,
            files: 1 << 20,
            ffree: 1 << 19,
            bsize: self.cfg.block_size as u32,
            namelen: 255,
            frsize: self.cfg.block_size as u32,
        }
    }

    /// Open a collection; a fresh cached listing is served without a
    /// connection lease.
    pub fn opendir(&self, path: &str) -> Result<u64> {
        if let Some(mcache) = &self.mcache {
            if let Some(names) = mcache.get_dir(path) {
                debug!("opendir {} served from cache ({} entries)", path, names.len());
                return Ok(self.registry.dir_open_cached(path, names).id());
            }
        }
        let conn = self.pool.get_and_use(ConnKind::ShortOp)?;
        match self.registry.dir_open(&conn, path) {
            Ok(handle) => Ok(handle.id()),
            Err(e) => {
                self.pool.unuse(&conn);
                Err(e)
            }
        }
    }

    /// Full listing of an open collection as (name, kind) pairs. The first
    /// remote listing is snapshotted on the handle and feeds the metadata
    /// cache.
    pub fn readdir(&self, dh: u64) -> Result<Vec<(String, EntryKind)>> {
        let dir = self
            .registry
            .get_dir(dh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown dir handle {}", dh)))?;

        if let Some(names) = dir.snapshot() {
            let mut entries = Vec::with_capacity(names.len());
            for name in names {
                let kind = match self.getattr(&join_path(dir.path(), &name)) {
                    Ok(stat) => stat.kind,
                    // entry vanished between listing and stat
                    Err(FsError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                entries.push((name, kind));
            }
            return Ok(entries);
        }

        let conn = dir
            .conn()
            .ok_or_else(|| FsError::InvalidArgument("directory handle has no source".into()))?;
        let iter = dir
            .iter_handle()
            .ok_or_else(|| FsError::InvalidArgument("collection iterator closed".into()))?;

        let mut entries = Vec::new();
        let mut names = Vec::new();
        loop {
            let next = self.rpc.call(conn, "collRead", move |s| s.coll_read(iter))?;
            match next {
                Some(entry) => {
                    if let Some(mcache) = &self.mcache {
                        mcache.put_stat_child(dir.path(), &entry.name, &entry.stat);
                    }
                    names.push(entry.name.clone());
                    entries.push((entry.name, entry.stat.kind));
                }
                None => break,
            }
        }

        if let Some(mcache) = &self.mcache {
            mcache.put_dir(dir.path(), names.clone());
        }
        dir.set_snapshot(names);
        Ok(entries)
    }

    pub fn releasedir(&self, dh: u64) -> Result<()> {
        let dir = self
            .registry
            .get_dir(dh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown dir handle {}", dh)))?;
        self.registry.dir_close(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryClient, MemoryServer};

    fn test_vfs(cfg: FsConfig) -> (MemoryServer, Vfs) {
        let server = MemoryServer::new();
        server.mkdir_all("/tempZone/home/rods");
        let client = Arc::new(MemoryClient::new(server.clone()));
        let account = Account::new("memory", "tempZone", "rods");
        (server.clone(), Vfs::new(client, account, cfg))
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn test_open_read_release() {
        let cfg = FsConfig {
            block_size: 4096,
            ..Default::default()
        };
        let (server, vfs) = test_vfs(cfg);
        let content = patterned(9_000);
        server.add_file("/tempZone/home/rods/f.bin", &content);

        let fh = vfs.open("/tempZone/home/rods/f.bin", libc::O_RDONLY).unwrap();
        assert_eq!(vfs.read(fh, 0, 9_000).unwrap(), content);
        vfs.release(fh).unwrap();
        assert_eq!(server.open_descriptor_count(), 0);
    }

    #[test]
    fn test_read_routes_work_without_caching_layers() {
        let cfg = FsConfig {
            block_size: 4096,
            buffered_fs: false,
            preload: false,
            cache_metadata: false,
            ..Default::default()
        };
        let (server, vfs) = test_vfs(cfg);
        let content = patterned(5_000);
        server.add_file("/tempZone/home/rods/f.bin", &content);

        let fh = vfs.open("/tempZone/home/rods/f.bin", libc::O_RDONLY).unwrap();
        assert_eq!(vfs.read(fh, 1_000, 2_000).unwrap(), &content[1_000..3_000]);
        vfs.release(fh).unwrap();
    }

    #[test]
    fn test_create_write_getattr() {
        let (server, vfs) = test_vfs(FsConfig::default());

        vfs.create("/tempZone/home/rods/new.txt", 0o644).unwrap();
        let fh = vfs.open("/tempZone/home/rods/new.txt", libc::O_WRONLY).unwrap();
        vfs.write(fh, 0, b"payload").unwrap();
        vfs.release(fh).unwrap();

        let stat = vfs.getattr("/tempZone/home/rods/new.txt").unwrap();
        assert_eq!(stat.size, 7);
        assert_eq!(
            server.file_data("/tempZone/home/rods/new.txt").unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_mkdir_readdir_rmdir() {
        let (_server, vfs) = test_vfs(FsConfig::default());

        vfs.mkdir("/tempZone/home/rods/sub").unwrap();
        vfs.create("/tempZone/home/rods/sub/a.txt", 0o644).unwrap();

        let dh = vfs.opendir("/tempZone/home/rods/sub").unwrap();
        let entries = vfs.readdir(dh).unwrap();
        vfs.releasedir(dh).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a.txt");
        assert_eq!(entries[0].1, EntryKind::DataObject);

        vfs.unlink("/tempZone/home/rods/sub/a.txt").unwrap();
        vfs.rmdir("/tempZone/home/rods/sub").unwrap();
        assert!(matches!(
            vfs.getattr("/tempZone/home/rods/sub"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_second_opendir_is_served_from_cache() {
        let (server, vfs) = test_vfs(FsConfig::default());
        server.add_file("/tempZone/home/rods/a.txt", b"a");

        let dh = vfs.opendir("/tempZone/home/rods").unwrap();
        vfs.readdir(dh).unwrap();
        vfs.releasedir(dh).unwrap();
        let opens_after_first = server.counts().coll_opens;

        let dh = vfs.opendir("/tempZone/home/rods").unwrap();
        let entries = vfs.readdir(dh).unwrap();
        vfs.releasedir(dh).unwrap();
        assert_eq!(server.counts().coll_opens, opens_after_first);
        assert_eq!(entries[0].0, "a.txt");
    }

    #[test]
    fn test_rename_and_cache_invalidation() {
        let (server, vfs) = test_vfs(FsConfig::default());
        server.add_file("/tempZone/home/rods/old.txt", b"data");

        // warm the stat cache
        vfs.getattr("/tempZone/home/rods/old.txt").unwrap();

        vfs.rename("/tempZone/home/rods/old.txt", "/tempZone/home/rods/new.txt")
            .unwrap();
        assert!(matches!(
            vfs.getattr("/tempZone/home/rods/old.txt"),
            Err(FsError::NotFound(_))
        ));
        assert_eq!(vfs.getattr("/tempZone/home/rods/new.txt").unwrap().size, 4);
    }

    #[test]
    fn test_truncate_refreshes_attributes() {
        let (_server, vfs) = test_vfs(FsConfig::default());
        let path = "/tempZone/home/rods/t.bin";

        vfs.create(path, 0o644).unwrap();
        let fh = vfs.open(path, libc::O_WRONLY).unwrap();
        vfs.write(fh, 0, &patterned(100)).unwrap();
        vfs.release(fh).unwrap();
        assert_eq!(vfs.getattr(path).unwrap().size, 100);

        vfs.truncate(path, 10).unwrap();
        assert_eq!(vfs.getattr(path).unwrap().size, 10);
    }

    #[test]
    fn test_chmod_updates_mode() {
        let (_server, vfs) = test_vfs(FsConfig::default());
        let path = "/tempZone/home/rods/m.bin";
        vfs.create(path, 0o644).unwrap();

        vfs.chmod(path, 0o600).unwrap();
        assert_eq!(vfs.getattr(path).unwrap().mode, 0o600);
    }

    #[test]
    fn test_shutdown_quiesces() {
        crate::logging::init_test_logging();
        let (server, vfs) = test_vfs(FsConfig::default());
        server.add_file("/tempZone/home/rods/f.bin", &patterned(10_000));

        vfs.start();
        let fh = vfs.open("/tempZone/home/rods/f.bin", libc::O_RDONLY).unwrap();
        vfs.read(fh, 0, 1_000).unwrap();
        vfs.release(fh).unwrap();
        vfs.shutdown();
        assert_eq!(server.open_descriptor_count(), 0);
    }
}
