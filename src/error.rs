/*!
 * Error types for irodsfs
 */

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Remote path does not exist
    #[error("no such path: {0}")]
    NotFound(String),

    /// Server refused the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Login or ticket rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The session to the server is gone; a reconnect may succeed
    #[error("connection to the server lost")]
    Disconnected,

    /// A remote call exceeded the configured deadline
    #[error("remote call '{op}' timed out after {timeout:?}")]
    RpcTimeout { op: &'static str, timeout: Duration },

    /// Server-side failure that is not otherwise classified
    #[error("server error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// Out of memory, threads, or connections in a non-blocking context
    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),
}

impl FsError {
    /// Whether a reconnect-and-retry is worth attempting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FsError::Disconnected)
    }

    /// Convert to a FUSE error code (libc errno).
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::PermissionDenied(_) | FsError::Authentication(_) => libc::EACCES,
            FsError::Disconnected | FsError::Protocol { .. } => libc::EIO,
            FsError::RpcTimeout { .. } => libc::ETIMEDOUT,
            FsError::ResourceExhausted(_) => libc::ENOMEM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotSupported(_) => libc::ENOSYS,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
        }
    }
}

impl From<ClientError> for FsError {
    fn from(e: ClientError) -> Self {
        if e.is_disconnect() {
            return FsError::Disconnected;
        }
        match e {
            ClientError::NotFound(p) => FsError::NotFound(p),
            ClientError::PermissionDenied(p) => FsError::PermissionDenied(p),
            ClientError::Authentication(m) => FsError::Authentication(m),
            ClientError::InvalidArgument(m) => FsError::InvalidArgument(m),
            ClientError::Protocol { code, message } => FsError::Protocol { code, message },
            ClientError::Io(e) => FsError::Protocol {
                code: e.raw_os_error().unwrap_or(0),
                message: e.to_string(),
            },
            // is_disconnect() covered these above
            ClientError::Disconnected | ClientError::SessionExpired => FsError::Disconnected,
        }
    }
}
