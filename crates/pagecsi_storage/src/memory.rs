//! In-memory storage backend for testing.

use crate::backend::{DataFile, FileKey, OpenFlags, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// This backend stores all files in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Reproducing crash states by editing file contents directly
///
/// Handles opened on the same path share the same contents, like OS file
/// descriptors on one inode.
///
/// # Example
///
/// ```rust
/// use pagecsi_storage::{InMemoryBackend, OpenFlags, StorageBackend};
/// use std::path::Path;
///
/// let backend = InMemoryBackend::new();
/// let file = backend
///     .open(Path::new("/a.dat"), OpenFlags::read_write().create(true))
///     .unwrap();
/// file.write_at(b"test data", 0).unwrap();
/// assert_eq!(backend.contents(Path::new("/a.dat")).unwrap(), b"test data");
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    files: RwLock<HashMap<PathBuf, Arc<RwLock<Vec<u8>>>>>,
    dirs: RwLock<Vec<PathBuf>>,
    read_only: AtomicBool,
    namespace: u64,
}

// Namespace 0 belongs to the host file system.
static NEXT_NAMESPACE: AtomicU64 = AtomicU64::new(FileKey::HOST + 1);

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            files: RwLock::default(),
            dirs: RwLock::default(),
            read_only: AtomicBool::new(false),
            namespace: NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` as the full contents of `path`, creating it if needed.
    pub fn set_contents(&self, path: &Path, data: Vec<u8>) {
        let key = normalize(path);
        let mut files = self.files.write();
        match files.get(&key) {
            Some(existing) => *existing.write() = data,
            None => {
                files.insert(key, Arc::new(RwLock::new(data)));
            }
        }
    }

    /// Returns a copy of the contents of `path`, if it exists.
    #[must_use]
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .read()
            .get(&normalize(path))
            .map(|data| data.read().clone())
    }

    /// Removes `path`. Open handles keep their contents.
    pub fn remove(&self, path: &Path) -> bool {
        self.files.write().remove(&normalize(path)).is_some()
    }

    /// Returns all file paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.files.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns true if `create_dir_all` was called for `path` or a child.
    #[must_use]
    pub fn dir_exists(&self, path: &Path) -> bool {
        let key = normalize(path);
        self.dirs.read().iter().any(|dir| dir.starts_with(&key))
    }

    /// Makes the whole store refuse writable opens with `EROFS`.
    pub fn set_read_only(&self, value: bool) {
        self.read_only.store(value, Ordering::SeqCst);
    }
}

impl StorageBackend for InMemoryBackend {
    fn open(&self, path: &Path, flags: OpenFlags) -> StorageResult<Box<dyn DataFile>> {
        if flags.write && self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::from_raw_os_error(libc::EROFS)));
        }

        let key = normalize(path);
        let mut files = self.files.write();
        let data = match files.get(&key) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(StorageError::AlreadyExists {
                    path: path.to_path_buf(),
                });
            }
            Some(existing) => Arc::clone(existing),
            None if flags.create => {
                let data = Arc::new(RwLock::new(Vec::new()));
                files.insert(key, Arc::clone(&data));
                data
            }
            None => {
                return Err(StorageError::NotFound {
                    path: path.to_path_buf(),
                });
            }
        };
        drop(files);

        if flags.truncate && flags.write {
            data.write().clear();
        }

        Ok(Box::new(MemFile {
            data,
            writable: flags.write,
        }))
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.dirs.write().push(normalize(path));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(&normalize(path))
    }

    fn canonical(&self, path: &Path) -> FileKey {
        FileKey {
            namespace: self.namespace,
            path: normalize(path),
        }
    }
}

/// An open file of an [`InMemoryBackend`].
#[derive(Debug)]
pub struct MemFile {
    data: Arc<RwLock<Vec<u8>>>,
    writable: bool,
}

impl DataFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        let data = self.data.read();
        let size = data.len() as u64;
        if offset >= size {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        if !self.writable {
            return Err(StorageError::ReadOnly);
        }
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        if !self.writable {
            return Err(StorageError::ReadOnly);
        }
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
