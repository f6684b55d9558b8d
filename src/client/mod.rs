//! Remote data-management client contract
//!
//! The filesystem core reaches the server exclusively through the `Client`
//! and `Session` traits below. A driver crate provides the wire protocol;
//! the in-memory driver in [`memory`] serves tests and local mounts.
//!
//! All calls are synchronous. Implementations must tolerate concurrent use
//! of one session from several threads: the connection pool serializes
//! mutating traffic, but keepalive probes and abandoned timed-out calls can
//! still overlap it.

pub mod memory;
pub mod registry;

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use registry::{ClientFactory, ClientRegistry};

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by a client driver.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The transport dropped underneath the session
    #[error("connection lost")]
    Disconnected,

    /// The server no longer recognizes the session
    #[error("session expired")]
    SessionExpired,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("server error {code}: {message}")]
    Protocol { code: i32, message: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether this error means the session is dead. The caller may
    /// reconnect and retry exactly once.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ClientError::Disconnected | ClientError::SessionExpired => true,
            ClientError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Login identity and namespace root for a mount.
#[derive(Debug, Clone)]
pub struct Account {
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub user: String,
    pub password: Option<String>,
    pub ticket: Option<String>,
    pub default_resource: Option<String>,
    /// Collection mounted as the filesystem root
    pub workdir: String,
}

impl Account {
    pub fn new(host: impl Into<String>, zone: impl Into<String>, user: impl Into<String>) -> Self {
        let zone = zone.into();
        let user = user.into();
        let workdir = format!("/{}/home/{}", zone, user);
        Self {
            host: host.into(),
            port: 1247,
            zone,
            user,
            password: None,
            ticket: None,
            default_resource: None,
            workdir,
        }
    }

    pub fn home_collection(&self) -> String {
        format!("/{}/home/{}", self.zone, self.user)
    }
}

/// Kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    DataObject,
    Collection,
}

/// Attributes of a data object or collection.
#[derive(Debug, Clone)]
pub struct ObjStat {
    pub kind: EntryKind,
    pub size: u64,
    /// Permission bits (no file-type bits)
    pub mode: u32,
    /// Seconds since the epoch
    pub mtime: i64,
    pub ctime: i64,
    pub owner: String,
}

impl ObjStat {
    pub fn is_collection(&self) -> bool {
        self.kind == EntryKind::Collection
    }
}

/// One entry produced by a collection iterator, attributes included.
#[derive(Debug, Clone)]
pub struct CollEntry {
    pub name: String,
    pub stat: ObjStat,
}

/// Attribute changes applied through the catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjMetaChange {
    pub mode: Option<u32>,
    pub mtime: Option<i64>,
}

/// A single authenticated session with the server.
///
/// Descriptors returned by `data_obj_open`/`coll_open` are scoped to the
/// session that produced them.
pub trait Session: Send + Sync {
    /// Attach a ticket to this session for ticket-based access.
    fn set_session_ticket(&self, ticket: &str) -> ClientResult<()>;

    fn obj_stat(&self, path: &str) -> ClientResult<ObjStat>;

    fn data_obj_open(&self, path: &str, flags: i32) -> ClientResult<i32>;
    fn data_obj_create(&self, path: &str, mode: u32) -> ClientResult<i32>;
    fn data_obj_close(&self, fd: i32) -> ClientResult<()>;
    /// Absolute seek; returns the new position.
    fn data_obj_lseek(&self, fd: i32, offset: i64) -> ClientResult<i64>;
    /// Read up to `len` bytes at the descriptor position. An empty buffer
    /// signals end of file.
    fn data_obj_read(&self, fd: i32, len: usize) -> ClientResult<Vec<u8>>;
    fn data_obj_write(&self, fd: i32, data: &[u8]) -> ClientResult<usize>;
    fn data_obj_unlink(&self, path: &str) -> ClientResult<()>;
    fn data_obj_rename(&self, from: &str, to: &str) -> ClientResult<()>;
    fn data_obj_truncate(&self, path: &str, size: u64) -> ClientResult<()>;
    fn mod_obj_meta(&self, path: &str, change: &ObjMetaChange) -> ClientResult<()>;

    fn coll_open(&self, path: &str) -> ClientResult<i32>;
    /// Next entry of an open collection iterator; `None` at the end.
    fn coll_read(&self, handle: i32) -> ClientResult<Option<CollEntry>>;
    fn coll_close(&self, handle: i32) -> ClientResult<()>;
    fn coll_create(&self, path: &str) -> ClientResult<()>;
    fn coll_remove(&self, path: &str) -> ClientResult<()>;

    fn disconnect(&self) -> ClientResult<()>;
}

/// A driver that can establish authenticated sessions.
pub trait Client: Send + Sync {
    fn connect(&self, account: &Account) -> ClientResult<Arc<dyn Session>>;
}

/// Split a path into its parent collection and final component.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// Join a collection path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
