//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores
//! and common file contents.

use pagecsi_core::{CsiConfig, CsiFile, CsiStore};
use pagecsi_storage::{FileBackend, InMemoryBackend, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: CsiStore,
    /// The in-memory backend, if memory-based.
    pub memory: Option<Arc<InMemoryBackend>>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self::memory_with(CsiConfig::default())
    }

    /// Creates a new in-memory test store with `config`.
    pub fn memory_with(config: CsiConfig) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        Self {
            store: CsiStore::new(backend.clone(), config),
            memory: Some(backend),
            temp_dir: None,
        }
    }

    /// Creates a new store over a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = FileBackend::new(temp_dir.path());
        Self {
            store: CsiStore::new(Arc::new(backend), CsiConfig::default()),
            memory: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the root directory if file-based, None if in-memory.
    pub fn root(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns the raw bytes of `path` from the in-memory backend.
    pub fn raw(&self, path: &Path) -> Option<Vec<u8>> {
        self.memory.as_ref()?.contents(path)
    }

    /// Replaces the raw bytes of `path` in the in-memory backend.
    pub fn set_raw(&self, path: &Path, data: Vec<u8>) {
        if let Some(memory) = &self.memory {
            memory.set_contents(path, data);
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = CsiStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Read-write flags that create the file if missing.
pub fn rw_create() -> OpenFlags {
    OpenFlags::read_write().create(true)
}

/// Deterministic non-repeating-per-page test bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i >> 8) as u8))
        .collect()
}

/// Runs a test with a temporary in-memory store.
///
/// # Example
///
/// ```rust
/// use pagecsi_testkit::{rw_create, with_temp_store};
/// use std::path::Path;
///
/// with_temp_store(|store| {
///     let file = store.open(Path::new("/f"), rw_create()).unwrap();
///     assert!(file.is_tracked());
/// });
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&CsiStore) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store.store)
}

/// Runs a test with a store over a temporary directory.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&CsiStore, &Path) -> R,
{
    let test_store = TestStore::file();
    let root = test_store
        .root()
        .expect("File store should have a root")
        .to_path_buf();
    f(&test_store.store, &root)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates `path` holding `len` bytes of [`pattern`] data, written
    /// through the store so that its tags are current.
    pub fn written_file(store: &CsiStore, path: &Path, len: usize, seed: u8) -> CsiFile {
        let file = store
            .open(path, rw_create())
            .expect("Failed to open file");
        file.write(&pattern(len, seed), 0)
            .expect("Failed to write file");
        file
    }

    /// Creates one written file per entry in `lens`, named `/file_<i>`.
    pub fn many_files(store: &CsiStore, lens: &[usize]) -> Vec<CsiFile> {
        lens.iter()
            .enumerate()
            .map(|(i, &len)| {
                let path = format!("/file_{i}");
                written_file(store, Path::new(&path), len, i as u8)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let test_store = TestStore::memory();
        let file = test_store.open(Path::new("/a"), rw_create()).unwrap();
        file.write(b"abc", 0).unwrap();
        assert_eq!(test_store.raw(Path::new("/a")).unwrap(), b"abc");
        assert!(test_store.raw(Path::new("/a.pgtags")).is_some());
    }

    #[test]
    fn test_file_store() {
        with_file_store(|store, root| {
            let file = scenarios::written_file(store, Path::new("f"), 9000, 3);
            file.close().unwrap();
            assert!(root.join("f.pgtags").exists());
        });
    }

    #[test]
    fn test_many_files_scenario() {
        with_temp_store(|store| {
            let files = scenarios::many_files(store, &[10, 5000, 8192]);
            assert_eq!(store.open_files(), 3);
            assert_eq!(files[1].len().unwrap(), 5000);
        });
    }

    #[test]
    fn test_pattern_pages_differ() {
        let data = pattern(8192, 0);
        assert_ne!(&data[..4096], &data[4096..]);
    }
}
