//! Benchmark utilities.

use pagecsi_core::{CsiConfig, CsiFile, CsiResult, CsiStore};
use pagecsi_storage::{InMemoryBackend, OpenFlags};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;

/// Generate random data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Opens a fresh in-memory store and a writable file in it.
pub fn memory_file(config: CsiConfig) -> CsiResult<(CsiStore, CsiFile)> {
    let store = CsiStore::new(Arc::new(InMemoryBackend::new()), config);
    let file = store.open(Path::new("/bench.dat"), OpenFlags::read_write().create(true))?;
    Ok((store, file))
}
