//! Storage backend trait definitions.

use crate::error::StorageResult;
use std::path::{Path, PathBuf};

/// How a file should be opened.
///
/// Mirrors the POSIX open flags the integrity layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Fail if the file already exists (requires `create`).
    pub exclusive: bool,
    /// Truncate the file to zero length on open.
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only access.
    #[must_use]
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    /// Write-only access.
    #[must_use]
    pub const fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    /// Read-write access.
    #[must_use]
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: false,
            exclusive: false,
            truncate: false,
        }
    }

    /// Sets whether to create the file if missing.
    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    /// Sets whether creation must be exclusive.
    #[must_use]
    pub const fn exclusive(mut self, value: bool) -> Self {
        self.exclusive = value;
        self
    }

    /// Sets whether to truncate on open.
    #[must_use]
    pub const fn truncate(mut self, value: bool) -> Self {
        self.truncate = value;
        self
    }

    /// Returns true if the handle would only permit reads.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        !self.write
    }
}

/// An open file supporting positional I/O.
///
/// Handles are shared between threads: every method takes `&self` and
/// implementations synchronize internally. Positional reads and writes do
/// not move any shared cursor.
///
/// # Invariants
///
/// - `read_at` may return fewer bytes than requested; zero means end of file
/// - `write_at` may write fewer bytes than requested but never zero for a
///   non-empty buffer unless it returns an error
/// - writing past the end of file zero-fills the gap
pub trait DataFile: Send + Sync {
    /// Reads into `buf` starting at `offset`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is read-only or an I/O error occurs.
    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<usize>;

    /// Returns the current length of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if the file is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Sets the length of the file, truncating or zero-extending it.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is read-only or an I/O error occurs.
    fn set_len(&self, len: u64) -> StorageResult<()>;

    /// Pushes buffered writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;
}

/// A store of named files.
///
/// Backends are **opaque byte stores**: they know nothing about tag files or
/// checksums. The integrity layer opens both data files and tag files
/// through the same backend.
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Opens the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file does not exist and `flags.create` is false
    /// - The file exists and `flags.exclusive` is set
    /// - An I/O error occurs
    fn open(&self, path: &Path, flags: OpenFlags) -> StorageResult<Box<dyn DataFile>>;

    /// Creates the directory at `path` and all of its parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_dir_all(&self, path: &Path) -> StorageResult<()>;

    /// Returns true if a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Returns the key of the file `path` names. Every spelling of one
    /// file's path yields the same key.
    fn canonical(&self, path: &Path) -> FileKey;
}

/// Identity of a file across backends and path spellings.
///
/// Files of the host file system share namespace [`FileKey::HOST`] and are
/// told apart by their canonical absolute path. Other backends use a
/// namespace of their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    /// Namespace the path is interpreted in.
    pub namespace: u64,
    /// Canonical path within the namespace.
    pub path: PathBuf,
}

impl FileKey {
    /// Namespace of the host file system.
    pub const HOST: u64 = 0;

    /// Creates a key in the host file system namespace.
    pub fn host(path: impl Into<PathBuf>) -> Self {
        Self {
            namespace: Self::HOST,
            path: path.into(),
        }
    }
}

/// Reads until `buf` is full or end of file, returning the bytes read.
///
/// # Errors
///
/// Returns the first error reported by the file.
pub fn read_fully(file: &dyn DataFile, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// Writes all of `buf`, reissuing short writes.
///
/// # Errors
///
/// Returns the first error reported by the file, or `WriteZero` if the
/// file stops accepting data.
pub fn write_fully(file: &dyn DataFile, buf: &[u8], offset: u64) -> StorageResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let n = file.write_at(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        done += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_builders() {
        let flags = OpenFlags::read_write().create(true).truncate(true);
        assert!(flags.read && flags.write && flags.create && flags.truncate);
        assert!(!flags.exclusive);
        assert!(OpenFlags::read_only().is_read_only());
        assert!(!OpenFlags::write_only().is_read_only());
    }
}
