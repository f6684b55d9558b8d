/*!
 * Read-ahead preloader
 *
 * Every open file gets a slab of preload blocks. Each block owns a private
 * handle on the same path (its own server-side descriptor) and a worker
 * thread that reads the block through the buffer cache, leaving the
 * payload resident on that private handle. The foreground read then
 * consumes the resident block without a network round trip.
 *
 * Block lifecycle: init -> running -> (completed | task-failed), or
 * creation-failed when the worker cannot be spawned. Only a completed,
 * joined block may service a read; any other state makes the caller fall
 * back to a synchronous buffered read. Workers always run to completion;
 * a result is abandoned only after its thread has been joined.
 *
 * A completed block that falls out of the read-ahead window donates its
 * open descriptor to the next block launched, so steady sequential reads
 * do not keep opening fresh descriptors.
 */

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffered::BufferedFs;
use crate::config::FsConfig;
use crate::error::Result;
use crate::fd::FileHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PBlockStatus {
    Init,
    Running,
    Completed,
    TaskFailed,
    CreationFailed,
}

struct PBlockState {
    fd: Option<Arc<FileHandle>>,
    status: PBlockStatus,
    joined: bool,
}

struct PBlock {
    block_id: u64,
    state: RwLock<PBlockState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PBlock {
    fn new(block_id: u64, fd: Option<Arc<FileHandle>>) -> Arc<Self> {
        Arc::new(Self {
            block_id,
            state: RwLock::new(PBlockState {
                fd,
                status: PBlockStatus::Init,
                joined: false,
            }),
            worker: Mutex::new(None),
        })
    }
}

/// Wait for a block's worker, if it has not been joined yet.
fn join_worker(pblock: &PBlock) {
    let handle = pblock.worker.lock().take();
    if let Some(handle) = handle {
        let _ = handle.join();
        pblock.state.write().joined = true;
    }
}

/// Caps the number of workers simultaneously in `running` state per slab.
struct WorkerGate {
    permits: Mutex<usize>,
    freed: Condvar,
}

impl WorkerGate {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            freed: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>) -> PermitGuard {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.freed.wait(&mut permits);
        }
        *permits -= 1;
        PermitGuard { gate: self.clone() }
    }
}

struct PermitGuard {
    gate: Arc<WorkerGate>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        *self.gate.permits.lock() += 1;
        self.gate.freed.notify_one();
    }
}

/// Per-open-file set of preload blocks. The slab lock protects only the
/// list structure; blocks are independent.
struct Slab {
    path: String,
    blocks: RwLock<Vec<Arc<PBlock>>>,
    gate: Arc<WorkerGate>,
}

pub struct PreloadFs {
    buffered: Arc<BufferedFs>,
    num_blocks: usize,
    slabs: RwLock<std::collections::HashMap<u64, Arc<Slab>>>,
    num_threads: usize,
}

impl PreloadFs {
    pub fn new(buffered: Arc<BufferedFs>, cfg: &FsConfig) -> Self {
        Self {
            buffered,
            num_blocks: cfg.preload_num_blocks,
            num_threads: cfg.preload_num_threads,
            slabs: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Open the file and allocate its slab. Reading opens start the first
    /// `num_blocks` prefetches immediately.
    pub fn open(&self, path: &str, flags: i32) -> Result<Arc<FileHandle>> {
        let handle = self.buffered.open(path, flags)?;

        let slab = Arc::new(Slab {
            path: path.to_string(),
            blocks: RwLock::new(Vec::new()),
            gate: Arc::new(WorkerGate::new(self.num_threads)),
        });

        if handle.is_readable() {
            for block_id in 0..self.num_blocks as u64 {
                self.start_preload(&slab, block_id, None);
            }
        }

        self.slabs.write().insert(handle.id(), slab);
        Ok(handle)
    }

    /// Free the slab (joining every outstanding worker and closing every
    /// private handle), then close the file itself.
    pub fn close(&self, handle: Arc<FileHandle>) -> Result<()> {
        let slab = self.slabs.write().remove(&handle.id());
        if let Some(slab) = slab {
            self.free_slab(&slab);
        }
        self.buffered.close(handle)
    }

    /// Read a byte range, serving block-sized pieces from the slab where
    /// possible. Any block the slab cannot service sends the whole request
    /// down the synchronous buffered path.
    pub fn read(&self, handle: &Arc<FileHandle>, off: u64, size: usize) -> Result<Vec<u8>> {
        let slab = self.slabs.read().get(&handle.id()).cloned();
        let slab = match slab {
            Some(slab) => slab,
            None => return self.buffered.read(handle, off, size),
        };

        let block_size = self.buffered.block_size();
        let mut out = Vec::with_capacity(size);
        let mut block_buf = vec![0u8; block_size];
        let mut cur = off;
        let mut remain = size;

        while remain > 0 {
            let in_block = self.buffered.in_block_offset(cur);
            let want = (block_size - in_block).min(remain);

            let produced = match self.read_slab_block(&slab, self.buffered.block_id(cur), &mut block_buf) {
                Some(n) => n,
                None => {
                    debug!(
                        "prefetch miss on {} block {}; reading synchronously",
                        slab.path,
                        self.buffered.block_id(cur)
                    );
                    return self.buffered.read(handle, off, size);
                }
            };
            if produced <= in_block {
                break;
            }

            let avail = want.min(produced - in_block);
            out.extend_from_slice(&block_buf[in_block..in_block + avail]);
            cur += avail as u64;
            remain -= avail;

            if produced < block_size {
                break;
            }
        }
        Ok(out)
    }

    /// Drop every slab; joins all outstanding workers.
    pub fn destroy(&self) {
        let slabs: Vec<Arc<Slab>> = self.slabs.write().drain().map(|(_, s)| s).collect();
        for slab in slabs {
            self.free_slab(&slab);
        }
    }

    /// Service one block from the slab. `None` means the block is not in a
    /// servable state and the caller must read synchronously.
    fn read_slab_block(&self, slab: &Arc<Slab>, block_id: u64, out: &mut [u8]) -> Option<usize> {
        let window = self.num_blocks as u64;
        let mut present = false;
        let mut upcoming = vec![false; self.num_blocks];
        let mut recycle: Vec<Arc<PBlock>> = Vec::new();

        {
            let mut blocks = slab.blocks.write();

            let mut removed = Vec::new();
            blocks.retain(|pblock| {
                if pblock.block_id == block_id {
                    present = true;
                    true
                } else if pblock.block_id < block_id || pblock.block_id > block_id + window {
                    // passed by the reader, or far ahead of a backward seek
                    removed.push(pblock.clone());
                    false
                } else {
                    let slot = (pblock.block_id - block_id - 1) as usize;
                    if slot < upcoming.len() {
                        upcoming[slot] = true;
                    }
                    true
                }
            });

            for pblock in removed {
                join_worker(&pblock);
                let reusable = {
                    let st = pblock.state.read();
                    st.status == PBlockStatus::Completed && st.joined && st.fd.is_some()
                };
                if reusable {
                    recycle.push(pblock);
                } else {
                    debug!("dropping stale prefetch of {} block {}", slab.path, pblock.block_id);
                    self.free_pblock(&pblock);
                }
            }
        }

        if !present {
            let donated = self.take_recycled_fd(&mut recycle);
            self.start_preload(slab, block_id, donated);
        }

        let mut served = None;
        {
            let blocks = slab.blocks.read();
            if let Some(pblock) = blocks.iter().find(|p| p.block_id == block_id) {
                join_worker(pblock);
                let st = pblock.state.read();
                if st.status == PBlockStatus::Completed && st.joined {
                    if let Some(fd) = &st.fd {
                        match self.buffered.read_block(fd, block_id, out) {
                            Ok(n) => served = Some(n),
                            Err(e) => {
                                warn!(
                                    "prefetched block {} of {} unreadable: {}",
                                    block_id, slab.path, e
                                );
                            }
                        }
                    }
                }
            }
        }

        // keep the read-ahead window full
        for slot in 0..self.num_blocks {
            if !upcoming[slot] {
                let donated = self.take_recycled_fd(&mut recycle);
                self.start_preload(slab, block_id + 1 + slot as u64, donated);
            }
        }

        // leftover donors are closed
        for pblock in recycle {
            self.free_pblock(&pblock);
        }

        served
    }

    /// Launch a prefetch of one block, optionally adopting a donated
    /// descriptor instead of opening a fresh one.
    fn start_preload(&self, slab: &Arc<Slab>, block_id: u64, fd: Option<Arc<FileHandle>>) {
        debug!("prefetching {} block {}", slab.path, block_id);
        let pblock = PBlock::new(block_id, fd);

        let task = {
            let buffered = self.buffered.clone();
            let gate = slab.gate.clone();
            let pblock = pblock.clone();
            let path = slab.path.clone();
            move || preload_task(buffered, gate, pblock, path)
        };

        match thread::Builder::new()
            .name(format!("irodsfs-preload-{}", block_id))
            .spawn(task)
        {
            Ok(handle) => {
                *pblock.worker.lock() = Some(handle);
                slab.blocks.write().push(pblock);
            }
            Err(e) => {
                warn!(
                    "could not spawn prefetch worker for {} block {}: {}",
                    slab.path, block_id, e
                );
                pblock.state.write().status = PBlockStatus::CreationFailed;
                self.free_pblock(&pblock);
            }
        }
    }

    /// Transfer the descriptor out of a recycled block; the donor is
    /// consumed.
    fn take_recycled_fd(&self, recycle: &mut Vec<Arc<PBlock>>) -> Option<Arc<FileHandle>> {
        let donor = recycle.pop()?;
        let fd = donor.state.write().fd.take();
        fd
    }

    fn free_pblock(&self, pblock: &PBlock) {
        join_worker(pblock);
        let fd = pblock.state.write().fd.take();
        if let Some(fd) = fd {
            if let Err(e) = self.buffered.close(fd) {
                warn!("closing prefetch descriptor failed: {}", e);
            }
        }
    }

    fn free_slab(&self, slab: &Slab) {
        let blocks: Vec<Arc<PBlock>> = slab.blocks.write().drain(..).collect();
        for pblock in blocks {
            self.free_pblock(&pblock);
        }
    }
}

/// Worker body: make the block resident on the private handle. The scratch
/// copy is discarded; what matters is the payload left in the buffer cache
/// keyed by the private descriptor.
fn preload_task(buffered: Arc<BufferedFs>, gate: Arc<WorkerGate>, pblock: Arc<PBlock>, path: String) {
    let _permit = gate.acquire();
    pblock.state.write().status = PBlockStatus::Running;

    let fd = {
        let existing = pblock.state.read().fd.clone();
        match existing {
            // a descriptor donated by a recycled block is adopted as-is;
            // opening must not block at the connection cap, since the
            // foreground read joins this thread
            Some(fd) => fd,
            None => match buffered.try_open(&path, libc::O_RDONLY) {
                Ok(fd) => {
                    pblock.state.write().fd = Some(fd.clone());
                    fd
                }
                Err(e) => {
                    warn!("prefetch open of {} failed: {}", path, e);
                    pblock.state.write().status = PBlockStatus::TaskFailed;
                    return;
                }
            },
        }
    };

    let mut scratch = vec![0u8; buffered.block_size()];
    match buffered.read_block(&fd, pblock.block_id, &mut scratch) {
        Ok(n) => {
            debug!("prefetched {} block {} ({} bytes)", path, pblock.block_id, n);
            pblock.state.write().status = PBlockStatus::Completed;
        }
        Err(e) => {
            warn!("prefetch of {} block {} failed: {}", path, pblock.block_id, e);
            pblock.state.write().status = PBlockStatus::TaskFailed;
        }
    }
}
