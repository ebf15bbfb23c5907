//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested file does not exist.
    #[error("file not found: {}", path.display())]
    NotFound {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// The file exists and exclusive creation was requested.
    #[error("file already exists: {}", path.display())]
    AlreadyExists {
        /// The path that was looked up.
        path: PathBuf,
    },

    /// A write was attempted through a handle opened read-only.
    #[error("file handle is read-only")]
    ReadOnly,

    /// The file handle is closed.
    #[error("file handle is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if the error means the file does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true if the error means access was refused, either because
    /// of permissions or because the underlying store is read-only.
    #[must_use]
    pub fn is_access_denied(&self) -> bool {
        matches!(self.to_errno(), libc::EACCES | libc::EROFS | libc::EPERM)
    }

    /// Convert this error into a POSIX errno.
    ///
    /// OS errors keep their raw errno so callers see the underlying failure
    /// unchanged.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or_else(|| match err.kind() {
                io::ErrorKind::NotFound => libc::ENOENT,
                io::ErrorKind::PermissionDenied => libc::EACCES,
                io::ErrorKind::AlreadyExists => libc::EEXIST,
                io::ErrorKind::InvalidInput => libc::EINVAL,
                io::ErrorKind::UnexpectedEof => libc::EIO,
                _ => libc::EIO,
            }),
            Self::NotFound { .. } => libc::ENOENT,
            Self::AlreadyExists { .. } => libc::EEXIST,
            Self::ReadOnly => libc::EBADF,
            Self::Closed => libc::EBADF,
        }
    }
}
