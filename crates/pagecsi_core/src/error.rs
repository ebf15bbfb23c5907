//! Error types for the integrity layer.

use pagecsi_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for integrity-layer operations.
pub type CsiResult<T> = Result<T, CsiError>;

/// Errors that can occur in the integrity layer.
///
/// Every variant maps to a POSIX errno through [`CsiError::to_errno`].
/// Checksum and consistency failures all map to `EDOM` so they can be told
/// apart from ordinary I/O failures.
#[derive(Debug, Error)]
pub enum CsiError {
    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// A page's stored tag does not match the checksum of its bytes.
    #[error(
        "checksum error at page {page} ({len} bytes): computed {computed:08x}, stored {stored:08x}"
    )]
    ChecksumMismatch {
        /// Page index.
        page: u64,
        /// Number of bytes covered by the checksum.
        len: usize,
        /// Checksum computed from the data.
        computed: u32,
        /// Checksum found in the tag store.
        stored: u32,
    },

    /// Bytes read back from the data file differ from the caller's buffer.
    #[error("data mismatch with caller buffer at offset {offset} ({len} bytes)")]
    ByteMismatch {
        /// File offset of the first byte compared.
        offset: u64,
        /// Number of bytes compared.
        len: usize,
    },

    /// The data file ended before the expected number of bytes.
    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// File offset of the read.
        offset: u64,
        /// Bytes expected.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// Data file and tag store disagree in a way that cannot be recovered.
    #[error("inconsistent state: {message}")]
    Inconsistent {
        /// Description of the inconsistency.
        message: String,
    },

    /// The tag file header failed its self-check.
    #[error("corrupt tag file header: {message}")]
    CorruptHeader {
        /// Description of the corruption.
        message: String,
    },

    /// No tag file exists and missing tags are not allowed.
    #[error("tag file missing: {}", path.display())]
    MissingTags {
        /// The tag file path.
        path: PathBuf,
    },

    /// The tag store or file handle is not open.
    #[error("not open")]
    NotOpen,

    /// A modification was attempted through a read-only handle.
    #[error("handle is read-only")]
    ReadOnlyHandle,

    /// `pg_write` would extend a file whose tracked length is not page aligned.
    #[error("pg_write would extend past a non-page-aligned end of file")]
    PgExtendDisallowed,

    /// Access to the file was refused.
    #[error("access denied: {message}")]
    AccessDenied {
        /// Description of the refusal.
        message: String,
    },

    /// The path names a tag file, which is not directly accessible.
    #[error("path is a tag file: {}", path.display())]
    IsTagFile {
        /// The rejected path.
        path: PathBuf,
    },

    /// The operation would deadlock with another open handle.
    #[error("would deadlock: {}", path.display())]
    Deadlock {
        /// The file path.
        path: PathBuf,
    },

    /// Backing storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// An asynchronous job failed to run to completion.
    #[error("async job failed: {message}")]
    Aio {
        /// Description of the failure.
        message: String,
    },
}

impl CsiError {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an inconsistency error.
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::Inconsistent {
            message: message.into(),
        }
    }

    /// Creates a corrupt header error.
    pub fn corrupt_header(message: impl Into<String>) -> Self {
        Self::CorruptHeader {
            message: message.into(),
        }
    }

    /// Creates an access denied error.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates an async failure error.
    pub fn aio(message: impl Into<String>) -> Self {
        Self::Aio {
            message: message.into(),
        }
    }

    /// Returns true for checksum and consistency failures (`EDOM`).
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        self.to_errno() == libc::EDOM
    }

    /// Returns true if the underlying storage reported a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_not_found())
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; storage errors pass their own errno
    /// through unchanged.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument { .. } => libc::EINVAL,
            Self::ChecksumMismatch { .. }
            | Self::ByteMismatch { .. }
            | Self::ShortRead { .. }
            | Self::Inconsistent { .. }
            | Self::CorruptHeader { .. }
            | Self::MissingTags { .. } => libc::EDOM,
            Self::NotOpen | Self::ReadOnlyHandle => libc::EBADF,
            Self::PgExtendDisallowed => libc::ESPIPE,
            Self::AccessDenied { .. } => libc::EACCES,
            Self::IsTagFile { .. } => libc::ENOENT,
            Self::Deadlock { .. } => libc::EDEADLK,
            Self::Storage(err) => err.to_errno(),
            Self::Aio { .. } => libc::EIO,
        }
    }
}
