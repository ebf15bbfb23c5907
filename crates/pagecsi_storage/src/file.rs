//! File-based storage backend for persistent storage.

use crate::backend::{DataFile, FileKey, OpenFlags, StorageBackend};
use crate::error::{StorageError, StorageResult};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};

/// A file-based storage backend rooted at a directory.
///
/// Paths handed to [`StorageBackend::open`] are interpreted relative to the
/// root, so `/data/a.root` and `data/a.root` name the same file.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Example
///
/// ```no_run
/// use pagecsi_storage::{FileBackend, OpenFlags, StorageBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::new("/srv/data");
/// let file = backend
///     .open(Path::new("run1/events.dat"), OpenFlags::read_write().create(true))
///     .unwrap();
/// file.write_at(b"persistent data", 0).unwrap();
/// file.sync().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Creates a backend serving files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a backend path to a path on the local file system.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let mut full = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => full.push(part),
                Component::ParentDir => {
                    if full != self.root {
                        full.pop();
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        full
    }
}

/// Canonicalizes the longest existing prefix of `full` and appends the
/// rest, so a path keeps its key once missing directories are created.
fn canonicalize_existing(full: &Path) -> PathBuf {
    let mut existing = full;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut out) = fs::canonicalize(existing) {
            out.extend(rest.iter().rev());
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return full.to_path_buf(),
        }
    }
}

impl StorageBackend for FileBackend {
    fn open(&self, path: &Path, flags: OpenFlags) -> StorageResult<Box<dyn DataFile>> {
        let full = self.resolve(path);
        let file = OpenOptions::new()
            .read(flags.read || !flags.write)
            .write(flags.write)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .truncate(flags.truncate)
            .open(&full)
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound {
                    path: path.to_path_buf(),
                },
                io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => StorageError::Io(err),
            })?;

        Ok(Box::new(LocalFile {
            path: full,
            file,
            writable: flags.write,
        }))
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        std::fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn canonical(&self, path: &Path) -> FileKey {
        FileKey::host(canonicalize_existing(&self.resolve(path)))
    }
}

/// An open file of a [`FileBackend`].
///
/// Reads and writes use positional I/O and do not serialize with each other.
#[derive(Debug)]
pub struct LocalFile {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl LocalFile {
    /// Returns the local path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StorageError::ReadOnly)
        }
    }
}

impl DataFile for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.file.read_at(buf, offset) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.file.write_at(buf, offset) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return Ok(other?),
            }
        }
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        self.check_writable()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        (&self.file).flush()?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
