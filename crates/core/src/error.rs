use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for pool operations.
///
/// Enumeration errors inside a scan are local and degrade to empty
/// subtrees (or `AccessDenied` integrity issues); variants here cross the
/// public boundary only when a whole operation cannot proceed.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Validation failure: empty name, illegal characters, out-of-range level.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool or volume not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem error attributed to a path.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission failure on a specific path.
    #[error("access denied: {}", .0.display())]
    AccessDenied(PathBuf),

    /// The requested repair needs manual intervention.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Space pre-check failed for a drive removal.
    #[error("insufficient capacity: required {required} bytes, available {available} bytes")]
    CapacityExceeded { required: u64, available: u64 },
}

impl PoolError {
    /// Wraps an `io::Error` with the path it occurred on, promoting
    /// permission failures to `AccessDenied`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            PoolError::AccessDenied(path)
        } else {
            PoolError::Io { path, source }
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, PoolError::AccessDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
