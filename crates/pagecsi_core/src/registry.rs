//! Process-wide registry of open page engines, keyed by canonical tag file.
//!
//! Every handle on the same data file shares one [`Pages`] instance, so that
//! range locks and tracked sizes are coherent between them. Files are
//! identified by their backend's [`FileKey`] for the tag file, so different
//! spellings of one path, and different stores over one file system, meet
//! in the same entry. An entry is reference counted; the last release
//! closes its engine.
//!
//! Lock order is entry state, then the map.

use crate::error::CsiResult;
use crate::pages::Pages;
use pagecsi_storage::FileKey;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::debug;

static REGISTRY: LazyLock<PageMap> = LazyLock::new(PageMap::new);

/// Returns the registry shared by every store in the process.
pub(crate) fn registry() -> &'static PageMap {
    &REGISTRY
}

/// One tag file's shared state.
#[derive(Debug)]
pub(crate) struct MapEntry {
    key: FileKey,
    // Backend path of the tag file, as the first opener spelled it.
    tag_path: PathBuf,
    // Changed only under the map lock.
    refs: AtomicUsize,
    pages: Mutex<Option<Arc<Pages>>>,
}

impl MapEntry {
    pub(crate) fn key(&self) -> &FileKey {
        &self.key
    }

    pub(crate) fn tag_path(&self) -> &Path {
        &self.tag_path
    }

    /// Locks the entry's engine slot.
    pub(crate) fn state(&self) -> MutexGuard<'_, Option<Arc<Pages>>> {
        self.pages.lock()
    }
}

/// Map of tag file key to shared engine.
#[derive(Debug, Default)]
pub(crate) struct PageMap {
    entries: Mutex<HashMap<FileKey, Arc<MapEntry>>>,
}

impl PageMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes a reference on the entry for `key`, creating it if needed with
    /// `tag_path` as the path to open the tag file by.
    pub(crate) fn acquire(&self, key: FileKey, tag_path: &Path) -> Arc<MapEntry> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key)
            .or_insert_with_key(|key| {
                Arc::new(MapEntry {
                    key: key.clone(),
                    tag_path: tag_path.to_path_buf(),
                    refs: AtomicUsize::new(0),
                    pages: Mutex::new(None),
                })
            })
            .clone();
        entry.refs.fetch_add(1, Ordering::SeqCst);
        entry
    }

    /// Drops a reference on `entry`. Returns true if it was the last one, in
    /// which case the entry has left the map and the caller, holding the
    /// entry state, must close the engine.
    pub(crate) fn release(&self, entry: &Arc<MapEntry>) -> bool {
        let mut entries = self.entries.lock();
        let left = entry.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 {
            if let Some(current) = entries.get(&entry.key) {
                if Arc::ptr_eq(current, entry) {
                    entries.remove(&entry.key);
                }
            }
        }
        left == 0
    }

    /// Releases `entry` while holding its `state`, closing the engine on the
    /// last reference.
    pub(crate) fn release_and_close(
        &self,
        entry: &Arc<MapEntry>,
        mut state: MutexGuard<'_, Option<Arc<Pages>>>,
    ) -> CsiResult<()> {
        if !self.release(entry) {
            return Ok(());
        }
        match state.take() {
            Some(pages) => {
                debug!(path = %entry.key.path.display(), "closing page engine");
                pages.close()
            }
            None => Ok(()),
        }
    }

    /// Number of tag files with open handles.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
