/*!
 * Configuration structures and defaults for irodsfs
 *
 * Precedence is defaults, then `IRODSFS_*` environment variables, then
 * command-line flags (applied by the binary on top of `from_env`).
 */

use std::env;

use log::warn;

pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_CONN: usize = 10;
pub const DEFAULT_CONN_TIMEOUT_SEC: u64 = 5 * 60;
pub const DEFAULT_CONN_KEEPALIVE_SEC: u64 = 3 * 60;
pub const DEFAULT_CONN_CHECK_INTERVAL_SEC: u64 = 10;
pub const DEFAULT_RPC_TIMEOUT_SEC: u64 = 90;
pub const DEFAULT_PRELOAD_BLOCKS: usize = 3;
pub const DEFAULT_PRELOAD_THREADS: usize = 3;
pub const DEFAULT_METADATA_CACHE_TIMEOUT_SEC: u64 = 3 * 60;

pub const MAX_PRELOAD_BLOCKS: usize = 10;
pub const MAX_PRELOAD_THREADS: usize = 10;

/// Tunables for the I/O and caching pipeline.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Block buffer cache layer on reads/writes
    pub buffered_fs: bool,
    /// Read-ahead prefetch layer
    pub preload: bool,
    /// Attribute and directory-listing cache
    pub cache_metadata: bool,
    /// Maximum concurrent server connections
    pub max_conn: usize,
    /// Transfer block size in bytes
    pub block_size: usize,
    /// Share short-op connections between callers
    pub conn_reuse: bool,
    /// Idle close threshold
    pub conn_timeout_sec: u64,
    /// Idle keepalive threshold
    pub conn_keepalive_sec: u64,
    /// Reaper cadence
    pub conn_check_interval_sec: u64,
    /// Per-RPC deadline
    pub rpc_timeout_sec: u64,
    /// Prefetch workers per open file
    pub preload_num_threads: usize,
    /// Read-ahead depth in blocks
    pub preload_num_blocks: usize,
    /// TTL for attributes and listings
    pub metadata_cache_timeout_sec: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            buffered_fs: true,
            preload: true,
            cache_metadata: true,
            max_conn: DEFAULT_MAX_CONN,
            block_size: DEFAULT_BLOCK_SIZE,
            conn_reuse: false,
            conn_timeout_sec: DEFAULT_CONN_TIMEOUT_SEC,
            conn_keepalive_sec: DEFAULT_CONN_KEEPALIVE_SEC,
            conn_check_interval_sec: DEFAULT_CONN_CHECK_INTERVAL_SEC,
            rpc_timeout_sec: DEFAULT_RPC_TIMEOUT_SEC,
            preload_num_threads: DEFAULT_PRELOAD_THREADS,
            preload_num_blocks: DEFAULT_PRELOAD_BLOCKS,
            metadata_cache_timeout_sec: DEFAULT_METADATA_CACHE_TIMEOUT_SEC,
        }
    }
}

impl FsConfig {
    /// Defaults overlaid with the `IRODSFS_*` environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Overlay recognized `IRODSFS_*` variables onto this configuration.
    pub fn apply_env(&mut self) {
        if env_bool("IRODSFS_NOCACHE").unwrap_or(false) {
            self.buffered_fs = false;
            self.preload = false;
            self.cache_metadata = false;
        }
        if env_bool("IRODSFS_NOPRELOAD").unwrap_or(false) {
            self.preload = false;
        }
        if env_bool("IRODSFS_NOCACHEMETADATA").unwrap_or(false) {
            self.cache_metadata = false;
        }
        if let Some(v) = env_num("IRODSFS_MAXCONN") {
            self.max_conn = v as usize;
        }
        if let Some(v) = env_num("IRODSFS_BLOCKSIZE") {
            self.block_size = v as usize;
        }
        if let Some(v) = env_bool("IRODSFS_CONNREUSE") {
            self.conn_reuse = v;
        }
        if env_bool("IRODSFS_NOCONNREUSE").unwrap_or(false) {
            self.conn_reuse = false;
        }
        if let Some(v) = env_num("IRODSFS_CONNTIMEOUT") {
            self.conn_timeout_sec = v;
        }
        if let Some(v) = env_num("IRODSFS_CONNKEEPALIVE") {
            self.conn_keepalive_sec = v;
        }
        if let Some(v) = env_num("IRODSFS_CONNCHECKINTERVAL") {
            self.conn_check_interval_sec = v;
        }
        if let Some(v) = env_num("IRODSFS_APITIMEOUT") {
            self.rpc_timeout_sec = v;
        }
        if let Some(v) = env_num("IRODSFS_PRELOADTHREADS") {
            self.preload_num_threads = v as usize;
        }
        if let Some(v) = env_num("IRODSFS_PRELOADBLOCKS") {
            self.preload_num_blocks = v as usize;
        }
        if let Some(v) = env_num("IRODSFS_METADATACACHETIMEOUT") {
            self.metadata_cache_timeout_sec = v;
        }
    }

    /// Clamp values into their supported ranges. Call once after all
    /// overlays are applied.
    pub fn normalize(&mut self) {
        if self.max_conn == 0 {
            self.max_conn = 1;
        }
        if self.block_size == 0 {
            self.block_size = DEFAULT_BLOCK_SIZE;
        }
        if self.preload_num_blocks == 0 {
            self.preload_num_blocks = DEFAULT_PRELOAD_BLOCKS;
        }
        if self.preload_num_blocks > MAX_PRELOAD_BLOCKS {
            self.preload_num_blocks = MAX_PRELOAD_BLOCKS;
        }
        if self.preload_num_threads == 0 {
            self.preload_num_threads = DEFAULT_PRELOAD_THREADS;
        }
        if self.preload_num_threads > MAX_PRELOAD_THREADS {
            self.preload_num_threads = MAX_PRELOAD_THREADS;
        }
        // no point running more workers than blocks to fill
        if self.preload_num_threads > self.preload_num_blocks {
            self.preload_num_threads = self.preload_num_blocks;
        }
        // the prefetcher reads and serves through the block cache
        if !self.buffered_fs {
            self.preload = false;
        }
    }
}

/// Read a boolean environment variable ("true"/"false", "1"/"0").
pub fn env_bool(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        other => {
            warn!("ignoring {}: expected a boolean, got {:?}", name, other);
            None
        }
    }
}

/// Read a numeric environment variable.
pub fn env_num(name: &str) -> Option<u64> {
    let value = env::var(name).ok()?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("ignoring {}: expected a number, got {:?}", name, value);
            None
        }
    }
}

/// Read a string environment variable, ignoring empty values.
pub fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}
