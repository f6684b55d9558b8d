/*!
 * irodsfs - FUSE client for iRODS data grids
 *
 * Projects a remote object-storage namespace (data objects and collections)
 * as a POSIX directory tree, with:
 * - A pooled set of long-lived authenticated server connections
 * - Block-aligned transfers over raw remote read/write
 * - Read-ahead prefetch on background workers
 * - TTL-bounded attribute and directory-listing caching
 * - Timeout-wrapped remote calls with reconnect-and-retry
 */

pub mod buffered;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod fd;
pub mod fuse;
pub mod logging;
pub mod metadata_cache;
pub mod preload;
pub mod rpc;
pub mod timer;
pub mod vfs;

// Re-export commonly used types for convenience
pub use client::{Account, Client, ClientError, ClientRegistry, ObjStat, Session};
pub use config::FsConfig;
pub use error::{FsError, Result};
pub use vfs::Vfs;
