//! Crash and fault testing for the integrity layer.
//!
//! This module provides utilities for testing how data files and tag files
//! behave when a write fails part way or a crash leaves them out of step.
//!
//! ## Test Strategy
//!
//! 1. **Failed data write** - Tags were updated, the data was not
//! 2. **Failed tag write** - Nothing may change in the data file
//! 3. **Short tag file** - A crash lost the tail of the tag file
//! 4. **Corrupt tag** - A stored checksum no longer matches its page
//!
//! ## Usage
//!
//! ```rust
//! use pagecsi_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new();
//! harness.run_all_tests();
//! assert!(harness.all_passed(), "{}", harness.summary());
//! ```

use crate::fixtures::{pattern, rw_create};
use pagecsi_core::{CsiConfig, CsiError, CsiStore};
use pagecsi_storage::{
    DataFile, FileKey, InMemoryBackend, OpenFlags, StorageBackend, StorageError,
    StorageResult,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug)]
struct FaultState {
    target: parking_lot::Mutex<Option<PathBuf>>,
    fail_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    fail_set_len: AtomicBool,
    tripped: AtomicBool,
}

impl FaultState {
    fn applies_to(&self, path: &Path) -> bool {
        match &*self.target.lock() {
            Some(target) => target == path,
            None => true,
        }
    }

    fn simulated(&self, what: &str) -> StorageError {
        self.tripped.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated failure during {what}")))
    }
}

/// A storage backend wrapper that fails writes on demand.
///
/// Faults apply to every file opened through the backend, or only to the
/// file named with [`FaultyBackend::target`]. Files keep their contents in
/// the wrapped backend, so a test can inspect what reached "disk".
pub struct FaultyBackend {
    inner: Arc<dyn StorageBackend>,
    state: Arc<FaultState>,
}

impl FaultyBackend {
    /// Creates a new faulty backend wrapping an inner backend.
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            state: Arc::new(FaultState {
                target: parking_lot::Mutex::new(None),
                fail_after_bytes: AtomicUsize::new(usize::MAX),
                bytes_written: AtomicUsize::new(0),
                fail_set_len: AtomicBool::new(false),
                tripped: AtomicBool::new(false),
            }),
        }
    }

    /// Restricts faults to the file at `path`.
    pub fn target(&self, path: impl Into<PathBuf>) {
        *self.state.target.lock() = Some(path.into());
    }

    /// Fails writes once `bytes` more bytes have been written. A write that
    /// crosses the limit is applied partially.
    pub fn fail_after(&self, bytes: usize) {
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.fail_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether `set_len` should fail.
    pub fn set_fail_set_len(&self, fail: bool) {
        self.state.fail_set_len.store(fail, Ordering::SeqCst);
    }

    /// Clears all faults.
    pub fn reset(&self) {
        *self.state.target.lock() = None;
        self.state.fail_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.fail_set_len.store(false, Ordering::SeqCst);
        self.state.tripped.store(false, Ordering::SeqCst);
    }

    /// Returns whether a fault has fired.
    pub fn has_tripped(&self) -> bool {
        self.state.tripped.load(Ordering::SeqCst)
    }
}

impl StorageBackend for FaultyBackend {
    fn open(&self, path: &Path, flags: OpenFlags) -> StorageResult<Box<dyn DataFile>> {
        let inner = self.inner.open(path, flags)?;
        Ok(Box::new(FaultyFile {
            inner,
            path: path.to_path_buf(),
            state: Arc::clone(&self.state),
        }))
    }

    fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn canonical(&self, path: &Path) -> FileKey {
        self.inner.canonical(path)
    }
}

struct FaultyFile {
    inner: Box<dyn DataFile>,
    path: PathBuf,
    state: Arc<FaultState>,
}

impl DataFile for FaultyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        if !self.state.applies_to(&self.path) {
            return self.inner.write_at(buf, offset);
        }

        let current = self
            .state
            .bytes_written
            .fetch_add(buf.len(), Ordering::SeqCst);
        let threshold = self.state.fail_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.state.simulated("write"));
        }

        // Write what fits before the fault fires
        if current + buf.len() > threshold {
            let partial = threshold - current;
            if partial > 0 {
                let _ = self.inner.write_at(&buf[..partial], offset);
            }
            return Err(self.state.simulated("partial write"));
        }

        self.inner.write_at(buf, offset)
    }

    fn len(&self) -> StorageResult<u64> {
        self.inner.len()
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        if self.state.fail_set_len.load(Ordering::SeqCst) && self.state.applies_to(&self.path) {
            return Err(self.state.simulated("set_len"));
        }
        self.inner.set_len(len)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }
}

/// Cuts the raw file at `path` to `len` bytes.
pub fn truncate_raw(backend: &InMemoryBackend, path: &Path, len: usize) {
    if let Some(mut data) = backend.contents(path) {
        data.truncate(len);
        backend.set_contents(path, data);
    }
}

/// Flips every bit of the raw byte at `offset` in `path`.
pub fn flip_byte(backend: &InMemoryBackend, path: &Path, offset: usize) {
    if let Some(mut data) = backend.contents(path) {
        data[offset] ^= 0xFF;
        backend.set_contents(path, data);
    }
}

const DATA: &str = "/crash/data";

/// Test harness for crash and fault scenarios.
pub struct CrashRecoveryHarness {
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

struct Setup {
    memory: Arc<InMemoryBackend>,
    faulty: Arc<FaultyBackend>,
    store: CsiStore,
}

impl Setup {
    fn new() -> Self {
        let memory = Arc::new(InMemoryBackend::new());
        let faulty = Arc::new(FaultyBackend::new(memory.clone()));
        let store = CsiStore::new(faulty.clone(), CsiConfig::default());
        Self {
            memory,
            faulty,
            store,
        }
    }

    fn tag_path(&self) -> PathBuf {
        self.store.tag_path(Path::new(DATA))
    }
}

impl CrashRecoveryHarness {
    /// Creates a new crash recovery harness.
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
        }
    }

    fn record(
        &mut self,
        description: &str,
        outcome: Result<Result<(), String>, CsiError>,
    ) -> CrashRecoveryResult {
        let result = match outcome {
            Ok(Ok(())) => CrashRecoveryResult::pass(description),
            Ok(Err(why)) => CrashRecoveryResult::fail(description, &why),
            Err(err) => CrashRecoveryResult::fail(description, &err.to_string()),
        };
        self.results.push(result.clone());
        result
    }

    /// Tests that data written and closed reads back after reopening.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let setup = Setup::new();
            let data = pattern(10_000, 7);
            let file = setup.store.open(Path::new(DATA), rw_create())?;
            file.write(&data, 0)?;
            file.close()?;

            let file = setup.store.open(Path::new(DATA), OpenFlags::read_only())?;
            let mut buf = vec![0u8; data.len()];
            let n = file.read(&mut buf, 0)?;
            file.close()?;

            Ok(if n == data.len() && buf == data {
                Ok(())
            } else {
                Err(format!("read back {n} bytes that differ from what was written"))
            })
        })();
        self.record("Committed data survives reopen", outcome)
    }

    /// Tests that a failed append leaves earlier data readable and that
    /// repeating the write repairs the file.
    pub fn test_failed_append_recovers(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let setup = Setup::new();
            let base = pattern(8192, 1);
            let tail = pattern(100, 2);
            let file = setup.store.open(Path::new(DATA), rw_create())?;
            file.write(&base, 0)?;

            setup.faulty.target(DATA);
            setup.faulty.fail_after(0);
            if file.write(&tail, 8192).is_ok() {
                return Ok(Err("write succeeded despite the fault".to_string()));
            }
            setup.faulty.reset();

            let mut buf = vec![0u8; 8192];
            file.read(&mut buf, 0)?;
            if buf != base {
                return Ok(Err("committed pages changed".to_string()));
            }

            file.write(&tail, 8192)?;
            let mut all = vec![0u8; 8292];
            let n = file.read(&mut all, 0)?;
            file.close()?;
            Ok(if n == 8292 && all[8192..] == tail[..] {
                Ok(())
            } else {
                Err("repeated write did not repair the tail".to_string())
            })
        })();
        self.record("Failed append keeps committed data", outcome)
    }

    /// Tests that a write whose tag update fails never reaches the data file.
    pub fn test_failed_tag_update_keeps_data(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let setup = Setup::new();
            let base = pattern(5000, 3);
            let file = setup.store.open(Path::new(DATA), rw_create())?;
            file.write(&base, 0)?;

            setup.faulty.target(setup.tag_path());
            setup.faulty.fail_after(0);
            let failed = file.write(&pattern(5000, 4), 0).is_err();
            setup.faulty.reset();
            file.close()?;

            let on_disk = setup.memory.contents(Path::new(DATA)).unwrap_or_default();
            Ok(if !failed {
                Err("write succeeded despite the fault".to_string())
            } else if on_disk != base {
                Err("data file changed".to_string())
            } else {
                Ok(())
            })
        })();
        self.record("Failed tag update leaves data untouched", outcome)
    }

    /// Tests that a tag file cut short by a crash reduces the tracked length
    /// and that reads past it are refused.
    pub fn test_short_tag_file(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let setup = Setup::new();
            let file = setup.store.open(Path::new(DATA), rw_create())?;
            file.write(&pattern(3 * 4096, 5), 0)?;
            file.close()?;

            // Header plus the first tag
            truncate_raw(&setup.memory, &setup.tag_path(), 24);

            let file = setup.store.open(Path::new(DATA), OpenFlags::read_only())?;
            let mut first = vec![0u8; 4096];
            file.read(&mut first, 0)?;
            let mut all = vec![0u8; 3 * 4096];
            let refused = matches!(file.read(&mut all, 0), Err(err) if err.is_integrity_error());
            file.close()?;
            Ok(if refused {
                Ok(())
            } else {
                Err("read beyond the surviving tags was accepted".to_string())
            })
        })();
        self.record("Short tag file is detected", outcome)
    }

    /// Tests that a damaged tag fails verification.
    pub fn test_corrupt_tag(&mut self) -> CrashRecoveryResult {
        let outcome = (|| {
            let setup = Setup::new();
            let file = setup.store.open(Path::new(DATA), rw_create())?;
            file.write(&pattern(2 * 4096, 6), 0)?;
            file.close()?;

            // First byte of the second page's tag
            flip_byte(&setup.memory, &setup.tag_path(), 24);

            let file = setup.store.open(Path::new(DATA), OpenFlags::read_only())?;
            let mut buf = vec![0u8; 4096];
            let err = file.read(&mut buf, 4096).err();
            file.close()?;
            Ok(match err {
                Some(CsiError::ChecksumMismatch { page: 1, .. }) => Ok(()),
                other => Err(format!("expected a checksum error on page 1, got {other:?}")),
            })
        })();
        self.record("Corrupt tag is detected", outcome)
    }

    /// Runs all crash recovery tests.
    pub fn run_all_tests(&mut self) -> Vec<CrashRecoveryResult> {
        self.test_committed_data_survives();
        self.test_failed_append_recovers();
        self.test_failed_tag_update_keeps_data();
        self.test_short_tag_file();
        self.test_corrupt_tag();
        self.results.clone()
    }

    /// Returns a summary of all test results.
    pub fn summary(&self) -> String {
        let passed = self.results.iter().filter(|r| r.passed).count();
        let total = self.results.len();

        let mut summary = format!("Crash Recovery Tests: {passed}/{total} passed\n");
        for result in &self.results {
            let status = if result.passed { "✓" } else { "✗" };
            summary.push_str(&format!("  {status} {}", result.description));
            if let Some(err) = &result.error {
                summary.push_str(&format!(" ({err})"));
            }
            summary.push('\n');
        }
        summary
    }

    /// Returns whether all tests passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (Arc<InMemoryBackend>, FaultyBackend) {
        let memory = Arc::new(InMemoryBackend::new());
        let faulty = FaultyBackend::new(memory.clone());
        (memory, faulty)
    }

    #[test]
    fn test_faulty_backend_normal_operation() {
        let (memory, faulty) = backend();
        let file = faulty.open(Path::new("/a"), rw_create()).unwrap();
        file.write_at(b"hello", 0).unwrap();
        assert!(!faulty.has_tripped());
        assert_eq!(memory.contents(Path::new("/a")).unwrap(), b"hello");
    }

    #[test]
    fn test_faulty_backend_partial_write() {
        let (memory, faulty) = backend();
        let file = faulty.open(Path::new("/a"), rw_create()).unwrap();
        faulty.fail_after(3);
        assert!(file.write_at(b"hello", 0).is_err());
        assert!(faulty.has_tripped());
        assert_eq!(memory.contents(Path::new("/a")).unwrap(), b"hel");
        assert!(file.write_at(b"x", 10).is_err());
    }

    #[test]
    fn test_faulty_backend_target_only() {
        let (_, faulty) = backend();
        faulty.target("/b");
        faulty.fail_after(0);
        let a = faulty.open(Path::new("/a"), rw_create()).unwrap();
        let b = faulty.open(Path::new("/b"), rw_create()).unwrap();
        a.write_at(b"ok", 0).unwrap();
        assert!(b.write_at(b"no", 0).is_err());
    }

    #[test]
    fn test_faulty_backend_set_len() {
        let (_, faulty) = backend();
        let file = faulty.open(Path::new("/a"), rw_create()).unwrap();
        faulty.set_fail_set_len(true);
        assert!(file.set_len(10).is_err());
        faulty.reset();
        file.set_len(10).unwrap();
        assert_eq!(file.len().unwrap(), 10);
    }

    #[test]
    fn test_failed_truncate_reports_error() {
        let setup = Setup::new();
        let file = setup.store.open(Path::new(DATA), rw_create()).unwrap();
        file.write(&pattern(6000, 1), 0).unwrap();
        setup.faulty.set_fail_set_len(true);
        let err = file.ftruncate(100).unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_raw_helpers() {
        let memory = InMemoryBackend::new();
        memory.set_contents(Path::new("/x"), vec![1, 2, 3, 4]);
        flip_byte(&memory, Path::new("/x"), 1);
        truncate_raw(&memory, Path::new("/x"), 3);
        assert_eq!(memory.contents(Path::new("/x")).unwrap(), vec![1, 0xFD, 3]);
    }

    #[test]
    fn test_all_crash_recovery_scenarios() {
        let mut harness = CrashRecoveryHarness::new();
        harness.run_all_tests();
        assert_eq!(harness.results.len(), 5);
        assert!(harness.all_passed(), "{}", harness.summary());
    }
}
