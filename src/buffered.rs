/*!
 * Block buffer cache
 *
 * Converts byte-range requests into block-aligned transfers over a file
 * handle. At most one block payload is resident per handle: a miss reads a
 * whole block remotely and leaves it resident, a hit consumes it. The
 * prefetcher relies on exactly that: its workers read blocks through
 * private handles to make them resident, and the foreground read consumes
 * them without touching the network.
 *
 * Writes pass straight through; `flush` is reserved for a future
 * write-back design.
 */

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::client::{ClientResult, ObjStat, Session};
use crate::config::FsConfig;
use crate::conn::{Conn, ConnKind, ConnPool};
use crate::error::{FsError, Result};
use crate::fd::{FdRegistry, FileHandle, FileState};
use crate::metadata_cache::MetadataCache;
use crate::rpc::Rpc;

struct CachedBlock {
    block_id: u64,
    data: Vec<u8>,
}

pub struct BufferedFs {
    pool: Arc<ConnPool>,
    registry: Arc<FdRegistry>,
    rpc: Rpc,
    mcache: Option<Arc<MetadataCache>>,
    block_size: usize,
    blocks: Mutex<HashMap<u64, CachedBlock>>,
}

impl BufferedFs {
    pub fn new(
        pool: Arc<ConnPool>,
        registry: Arc<FdRegistry>,
        mcache: Option<Arc<MetadataCache>>,
        cfg: &FsConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            rpc: Rpc::new(cfg.rpc_timeout_sec),
            mcache,
            block_size: cfg.block_size,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_id(&self, off: u64) -> u64 {
        off / self.block_size as u64
    }

    pub fn block_start(&self, block_id: u64) -> u64 {
        block_id * self.block_size as u64
    }

    pub fn in_block_offset(&self, off: u64) -> usize {
        (off % self.block_size as u64) as usize
    }

    /// Open a data object on a freshly leased file-io connection.
    pub fn open(&self, path: &str, flags: i32) -> Result<Arc<FileHandle>> {
        let conn = self.pool.get_and_use(ConnKind::FileIo)?;
        self.open_on(conn, path, flags)
    }

    /// Open without blocking at the connection cap; fails with
    /// resource-exhausted instead.
    pub fn try_open(&self, path: &str, flags: i32) -> Result<Arc<FileHandle>> {
        let conn = self.pool.try_get_and_use(ConnKind::FileIo)?;
        self.open_on(conn, path, flags)
    }

    fn open_on(&self, conn: Arc<Conn>, path: &str, flags: i32) -> Result<Arc<FileHandle>> {
        match self.registry.open(&conn, path, flags) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.pool.unuse(&conn);
                Err(e)
            }
        }
    }

    /// Close the handle, dropping any resident block.
    pub fn close(&self, handle: Arc<FileHandle>) -> Result<()> {
        self.blocks.lock().remove(&handle.id());
        self.registry.close(handle)
    }

    /// Nothing is ever pending with pass-through writes.
    pub fn flush(&self, _handle: &FileHandle) -> Result<()> {
        Ok(())
    }

    /// Attributes via the metadata cache, populated on miss.
    pub fn get_attr(&self, path: &str) -> Result<ObjStat> {
        if let Some(mcache) = &self.mcache {
            if let Some(stat) = mcache.get_stat(path) {
                return Ok(stat);
            }
        }

        let conn = self.pool.get_and_use(ConnKind::ShortOp)?;
        let p = path.to_string();
        let result = self
            .rpc
            .call_with_reconnect(&self.pool, &conn, "objStat", move |s| s.obj_stat(&p));
        self.pool.unuse(&conn);

        let stat = result?;
        if let Some(mcache) = &self.mcache {
            mcache.put_stat(path, &stat);
        }
        Ok(stat)
    }

    /// Read one whole block into `out` (which must hold a block). Returns
    /// the bytes produced: 0 at end of file, less than a block on the tail
    /// block. A resident matching block is consumed instead of reading
    /// remotely; otherwise the descriptor is positioned with an lseek when
    /// needed, one read RPC is issued and the payload is left resident.
    pub fn read_block(&self, handle: &FileHandle, block_id: u64, out: &mut [u8]) -> Result<usize> {
        if out.len() < self.block_size {
            return Err(FsError::InvalidArgument(format!(
                "block buffer too small: {} < {}",
                out.len(),
                self.block_size
            )));
        }

        {
            let mut blocks = self.blocks.lock();
            let hit = blocks
                .get(&handle.id())
                .map(|c| c.block_id == block_id)
                .unwrap_or(false);
            if hit {
                let cached = blocks.remove(&handle.id()).unwrap();
                out[..cached.data.len()].copy_from_slice(&cached.data);
                return Ok(cached.data.len());
            }
        }

        let mut st = handle.state().write();

        let start = self.block_start(block_id) as i64;
        if st.last_file_pointer != start {
            let pos = self.fd_call(handle, &mut st, "dataObjLseek", move |s, fd| {
                s.data_obj_lseek(fd, start)
            })?;
            st.last_file_pointer = pos;
        }

        let want = self.block_size;
        let data = self.fd_call(handle, &mut st, "dataObjRead", move |s, fd| {
            s.data_obj_read(fd, want)
        })?;
        st.last_file_pointer += data.len() as i64;
        drop(st);

        let produced = data.len();
        out[..produced].copy_from_slice(&data);
        self.blocks
            .lock()
            .insert(handle.id(), CachedBlock { block_id, data });
        Ok(produced)
    }

    /// Read an arbitrary byte range by splitting it into single-block
    /// reads, in order, never concurrently on the same handle. Stops early
    /// at end of file.
    pub fn read(&self, handle: &FileHandle, off: u64, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        let mut block_buf = vec![0u8; self.block_size];
        let mut cur = off;
        let mut remain = size;

        while remain > 0 {
            let in_block = self.in_block_offset(cur);
            let want = (self.block_size - in_block).min(remain);

            let produced = self.read_block(handle, self.block_id(cur), &mut block_buf)?;
            if produced <= in_block {
                break;
            }

            let avail = want.min(produced - in_block);
            out.extend_from_slice(&block_buf[in_block..in_block + avail]);
            cur += avail as u64;
            remain -= avail;

            if produced < self.block_size {
                break;
            }
        }
        Ok(out)
    }

    /// Pass-through write: position the descriptor when needed, then one
    /// write RPC. A resident block overlapping the written range is
    /// dropped.
    pub fn write(&self, handle: &FileHandle, off: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut st = handle.state().write();

        let target = off as i64;
        if st.last_file_pointer != target {
            let pos = self.fd_call(handle, &mut st, "dataObjLseek", move |s, fd| {
                s.data_obj_lseek(fd, target)
            })?;
            st.last_file_pointer = pos;
        }

        let payload = data.to_vec();
        let written = self.fd_call(handle, &mut st, "dataObjWrite", move |s, fd| {
            s.data_obj_write(fd, &payload)
        })?;
        st.last_file_pointer += written as i64;
        drop(st);

        {
            let mut blocks = self.blocks.lock();
            if let Some(cached) = blocks.get(&handle.id()) {
                let block_start = self.block_start(cached.block_id);
                let block_end = block_start + cached.data.len() as u64;
                if off < block_end && off + written as u64 > block_start {
                    blocks.remove(&handle.id());
                }
            }
        }
        Ok(written)
    }

    /// One descriptor-scoped remote call. On a recoverable failure the
    /// connection is re-established, the descriptor reopened at its last
    /// known position, and the call retried once.
    pub(crate) fn fd_call<T, F>(
        &self,
        handle: &FileHandle,
        st: &mut FileState,
        op: &'static str,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Session, i32) -> ClientResult<T> + Send + Sync + Clone + 'static,
    {
        let fd = st.fd;
        let first = {
            let g = f.clone();
            self.rpc.call(handle.conn(), op, move |s| g(s, fd))
        };
        match first {
            Err(e) if e.is_recoverable() => {
                warn!(
                    "{} failed on handle {} ({}); reconnecting and retrying",
                    op,
                    handle.id(),
                    e
                );
                self.pool.reconnect(handle.conn())?;
                self.registry.reopen_locked(handle, st)?;
                let fd = st.fd;
                self.rpc.call(handle.conn(), op, move |s| f(s, fd))
            }
            result => result,
        }
    }
}
