//! Checksummed file handles.
//!
//! [`CsiStore`] wraps a [`StorageBackend`] and hands out [`CsiFile`] handles
//! whose reads are verified against, and whose writes update, the page tags
//! kept in a tag file beside each data file.

use crate::config::CsiConfig;
use crate::error::{CsiError, CsiResult};
use crate::pages::{end_of, Pages, PgOptions, RangeGuard, VerificationStatus};
use crate::registry::{registry, MapEntry};
use pagecsi_storage::{read_fully, write_fully, DataFile, FileKey, OpenFlags, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A store of data files with page checksums.
///
/// Cloning is cheap; clones share the backend and the set of open files.
#[derive(Clone)]
pub struct CsiStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    config: CsiConfig,
    // Handles this store holds per registry entry.
    held: Mutex<HashMap<FileKey, usize>>,
}

impl StoreInner {
    fn hold(&self, key: &FileKey) {
        *self.held.lock().entry(key.clone()).or_insert(0) += 1;
    }

    fn unhold(&self, key: &FileKey) {
        let mut held = self.held.lock();
        if let Some(count) = held.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                held.remove(key);
            }
        }
    }
}

impl std::fmt::Debug for CsiStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsiStore")
            .field("config", &self.inner.config)
            .field("open_files", &self.inner.held.lock().len())
            .finish_non_exhaustive()
    }
}

impl CsiStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn StorageBackend>, config: CsiConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                config,
                held: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &CsiConfig {
        &self.inner.config
    }

    /// Returns the tag file path for the data file at `path`.
    #[must_use]
    pub fn tag_path(&self, path: &Path) -> PathBuf {
        self.inner.config.tag_path(path)
    }

    /// Returns true if `path` names a tag file.
    #[must_use]
    pub fn is_tag_file(&self, path: &Path) -> bool {
        self.inner.config.is_tag_file(path)
    }

    /// Number of data files with open handles from this store.
    #[must_use]
    pub fn open_files(&self) -> usize {
        self.inner.held.lock().len()
    }

    /// Opens the data file at `path`.
    ///
    /// Write-only requests are opened read-write, since partial page writes
    /// need to read back the rest of the page. The first handle on a file
    /// opens its tag file; later handles share it.
    ///
    /// # Errors
    ///
    /// - `IsTagFile` (or `AccessDenied` with `create`) if `path` is a tag file.
    /// - `Deadlock` if `truncate` is requested while the file is open.
    /// - `AccessDenied` if a writable handle is requested and the tag file
    ///   could only be opened read-only.
    /// - `MissingTags` if the tag file is absent and required.
    /// - Any error opening the data or tag file.
    pub fn open(&self, path: &Path, flags: OpenFlags) -> CsiResult<CsiFile> {
        let config = &self.inner.config;
        if config.is_tag_file(path) {
            if flags.create {
                return Err(CsiError::access_denied(format!(
                    "cannot create tag file {}",
                    path.display()
                )));
            }
            return Err(CsiError::IsTagFile {
                path: path.to_path_buf(),
            });
        }

        let mut data_flags = flags;
        if data_flags.write {
            data_flags.read = true;
        }
        let read_only = !data_flags.write;

        let tag_path = config.tag_path(path);
        let page_map = registry();
        let entry = page_map.acquire(self.inner.backend.canonical(&tag_path), &tag_path);
        let mut state = entry.state();

        if flags.truncate && state.is_some() {
            page_map.release(&entry);
            return Err(CsiError::Deadlock {
                path: path.to_path_buf(),
            });
        }

        let data = match self.inner.backend.open(path, data_flags) {
            Ok(data) => data,
            Err(err) => {
                page_map.release(&entry);
                return Err(err.into());
            }
        };

        let pages = match &*state {
            Some(pages) => Arc::clone(pages),
            None => match self.open_pages(entry.tag_path(), data.as_ref(), flags, read_only) {
                Ok(pages) => {
                    *state = Some(Arc::clone(&pages));
                    pages
                }
                Err(err) => {
                    page_map.release(&entry);
                    return Err(err);
                }
            },
        };
        drop(state);

        self.inner.hold(entry.key());
        let file = CsiFile {
            inner: Some(Arc::new(FileInner {
                store: Arc::clone(&self.inner),
                entry,
                pages,
                data,
                read_only,
                path: path.to_path_buf(),
                #[cfg(feature = "aio")]
                aio: crate::aio::AioTracker::default(),
            })),
        };

        if file.pages()?.is_read_only() && !read_only {
            file.close()?;
            return Err(CsiError::access_denied(format!(
                "tag file for {} is read-only",
                path.display()
            )));
        }
        debug!(path = %path.display(), read_only, "opened file");
        Ok(file)
    }

    fn open_pages(
        &self,
        tag_path: &Path,
        data: &dyn DataFile,
        flags: OpenFlags,
        read_only: bool,
    ) -> CsiResult<Arc<Pages>> {
        let backend = self.inner.backend.as_ref();
        let config = &self.inner.config;

        let data_len = if flags.exclusive || flags.truncate {
            0
        } else {
            data.len()?
        };

        // The tag file is shared by all handles, so it is opened read-write
        // whatever this handle asked for.
        let mut tag_flags = OpenFlags::read_write().truncate(flags.truncate);
        if flags.create && data_len == 0 {
            tag_flags = tag_flags.create(true);
            if let Some(parent) = tag_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                backend.create_dir_all(parent)?;
            }
        }

        let pages = match Pages::open(backend, tag_path, data_len, tag_flags, config) {
            Err(err) if read_only && is_access_denied(&err) => {
                Pages::open(backend, tag_path, data_len, OpenFlags::read_only(), config)?
            }
            other => other?,
        };

        pages.basic_consistency_check(data);
        Ok(Arc::new(pages))
    }

    /// Truncates the data file at `path` to `len`, keeping its tags in step.
    ///
    /// # Errors
    ///
    /// As [`CsiStore::open`] and [`CsiFile::ftruncate`].
    pub fn truncate(&self, path: &Path, len: u64) -> CsiResult<()> {
        let file = self.open(path, OpenFlags::read_write())?;
        file.ftruncate(len)?;
        file.close()
    }
}

fn is_access_denied(err: &CsiError) -> bool {
    matches!(err, CsiError::Storage(err) if err.is_access_denied())
}

/// One chunk of a vectored read.
#[derive(Debug)]
pub struct ReadChunk<'a> {
    /// File offset.
    pub offset: u64,
    /// Destination buffer; its length is the number of bytes to read.
    pub buf: &'a mut [u8],
}

/// One chunk of a vectored write.
#[derive(Debug, Clone, Copy)]
pub struct WriteChunk<'a> {
    /// File offset.
    pub offset: u64,
    /// Bytes to write.
    pub buf: &'a [u8],
}

pub(crate) struct FileInner {
    store: Arc<StoreInner>,
    entry: Arc<MapEntry>,
    pub(crate) pages: Arc<Pages>,
    pub(crate) data: Box<dyn DataFile>,
    read_only: bool,
    path: PathBuf,
    #[cfg(feature = "aio")]
    pub(crate) aio: crate::aio::AioTracker,
}

impl FileInner {
    pub(crate) fn check_writable(&self) -> CsiResult<()> {
        if self.read_only {
            return Err(CsiError::ReadOnlyHandle);
        }
        Ok(())
    }

    /// Locks and reads `buf.len()` bytes at `offset`. Returns the guard and
    /// the number of bytes read.
    pub(crate) fn begin_read(&self, buf: &mut [u8], offset: u64) -> CsiResult<(RangeGuard, usize)> {
        let end = end_of(offset, buf.len())?;
        let guard = self.pages.lock_tracking_len(offset, end, true);
        let n = read_fully(self.data.as_ref(), buf, offset)?;
        Ok((guard, n))
    }

    /// Verifies bytes read by [`FileInner::begin_read`], then unlocks.
    pub(crate) fn finish_read(
        &self,
        guard: RangeGuard,
        buf: &[u8],
        offset: u64,
        requested: usize,
    ) -> CsiResult<()> {
        if requested == 0 {
            return Ok(());
        }
        self.pages
            .verify_range(self.data.as_ref(), buf, offset, &guard)
    }

    /// Reads like [`FileInner::begin_read`] and fetches the page checksums.
    pub(crate) fn finish_pg_read(
        &self,
        guard: RangeGuard,
        buf: &[u8],
        offset: u64,
        requested: usize,
        csvec: Option<&mut [u32]>,
        opts: PgOptions,
    ) -> CsiResult<()> {
        if requested == 0 {
            return Ok(());
        }
        self.pages
            .fetch_range(self.data.as_ref(), buf, offset, csvec, opts, &guard)
    }

    /// Locks and stores the tags for a write of `buf` at `offset`.
    pub(crate) fn begin_write(&self, buf: &[u8], offset: u64) -> CsiResult<RangeGuard> {
        self.check_writable()?;
        let end = end_of(offset, buf.len())?;
        let mut guard = self.pages.lock_tracking_len(offset, end, false);
        if let Err(err) = self
            .pages
            .update_range(self.data.as_ref(), buf, offset, &mut guard)
        {
            self.write_failed(&mut guard);
            return Err(err);
        }
        Ok(guard)
    }

    /// As [`FileInner::begin_write`], taking tags from `csvec`.
    pub(crate) fn begin_pg_write(
        &self,
        buf: &[u8],
        offset: u64,
        csvec: Option<&mut [u32]>,
        opts: PgOptions,
    ) -> CsiResult<RangeGuard> {
        self.check_writable()?;
        Pages::pg_write_prelock_check(buf, offset, csvec.as_deref(), opts)?;
        let end = end_of(offset, buf.len())?;
        let mut guard = self.pages.lock_tracking_len(offset, end, false);
        if let Err(err) = self
            .pages
            .store_range(self.data.as_ref(), buf, offset, csvec, opts, &mut guard)
        {
            self.write_failed(&mut guard);
            return Err(err);
        }
        Ok(guard)
    }

    /// Writes the data whose tags were stored by `begin_*write`, then unlocks.
    pub(crate) fn finish_write(&self, mut guard: RangeGuard, buf: &[u8], offset: u64) -> CsiResult<usize> {
        if let Err(err) = write_fully(self.data.as_ref(), buf, offset) {
            self.write_failed(&mut guard);
            return Err(err.into());
        }
        Ok(buf.len())
    }

    fn write_failed(&self, guard: &mut RangeGuard) {
        guard.release_all();
        if let Err(err) = self.resync_sizes() {
            warn!(path = %self.path.display(), error = %err, "could not resync sizes after failed write");
        }
    }

    /// Resets the tracked sizes to the data file's real length.
    pub(crate) fn resync_sizes(&self) -> CsiResult<()> {
        let _guard = self.pages.lock_tracking_len(0, u64::MAX, false);
        let len = self.data.len()?;
        self.pages.lock_reset_sizes(self.data.as_ref(), len)
    }
}

/// An open data file whose contents are checked against page checksums.
///
/// All methods take `&self`; a handle may be shared between threads. Closing
/// (or dropping) the last handle on a file closes its tag file.
pub struct CsiFile {
    inner: Option<Arc<FileInner>>,
}

impl std::fmt::Debug for CsiFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("CsiFile");
        if let Some(inner) = &self.inner {
            s.field("path", &inner.path)
                .field("read_only", &inner.read_only)
                .field("tracked", &inner.pages.is_tracked());
        }
        s.finish_non_exhaustive()
    }
}

impl CsiFile {
    pub(crate) fn inner(&self) -> CsiResult<&Arc<FileInner>> {
        self.inner.as_ref().ok_or(CsiError::NotOpen)
    }

    fn pages(&self) -> CsiResult<&Arc<Pages>> {
        Ok(&self.inner()?.pages)
    }

    /// Returns the data file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.as_ref().map_or(Path::new(""), |inner| &inner.path)
    }

    /// Returns true if the handle was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.as_ref().map_or(true, |inner| inner.read_only)
    }

    /// Returns true if the file has a tag file.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.pages.is_tracked())
    }

    /// Reads up to `buf.len()` bytes at `offset` and verifies them.
    ///
    /// Returns the number of bytes read, short only at end of file.
    ///
    /// # Errors
    ///
    /// Returns an `EDOM`-class error if verification fails.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> CsiResult<usize> {
        let inner = self.inner()?;
        let requested = buf.len();
        let (guard, n) = inner.begin_read(buf, offset)?;
        inner.finish_read(guard, &buf[..n], offset, requested)?;
        Ok(n)
    }

    /// Reads several chunks under one lock and verifies each.
    ///
    /// # Errors
    ///
    /// Returns `ShortRead` if a chunk lies beyond end of file, plus the
    /// errors of [`CsiFile::read`].
    pub fn read_v(&self, chunks: &mut [ReadChunk<'_>]) -> CsiResult<usize> {
        let inner = self.inner()?;
        let Some((start, end)) = span(chunks.iter().map(|c| (c.offset, c.buf.len())))? else {
            return Ok(0);
        };

        let guard = inner.pages.lock_tracking_len(start, end, true);
        let mut total = 0;
        for chunk in chunks.iter_mut() {
            let n = read_fully(inner.data.as_ref(), chunk.buf, chunk.offset)?;
            if n < chunk.buf.len() {
                return Err(CsiError::ShortRead {
                    offset: chunk.offset,
                    expected: chunk.buf.len(),
                    actual: n,
                });
            }
            total += n;
        }
        for chunk in chunks.iter().filter(|c| !c.buf.is_empty()) {
            inner
                .pages
                .verify_range(inner.data.as_ref(), &*chunk.buf, chunk.offset, &guard)?;
        }
        Ok(total)
    }

    /// Writes `buf` at `offset`, updating the tags first.
    ///
    /// On failure the tracked sizes are resynchronized with the data file.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyHandle` on a read-only handle, an `EDOM`-class error
    /// if a partly overwritten page fails verification, or any I/O error.
    pub fn write(&self, buf: &[u8], offset: u64) -> CsiResult<usize> {
        let inner = self.inner()?;
        let guard = inner.begin_write(buf, offset)?;
        inner.finish_write(guard, buf, offset)
    }

    /// Writes several chunks under one lock.
    ///
    /// Each chunk's data is written before the next chunk's tags are
    /// computed, so chunks sharing a page see each other's bytes.
    ///
    /// # Errors
    ///
    /// As [`CsiFile::write`].
    pub fn write_v(&self, chunks: &[WriteChunk<'_>]) -> CsiResult<usize> {
        let inner = self.inner()?;
        inner.check_writable()?;
        let Some((start, end)) = span(chunks.iter().map(|c| (c.offset, c.buf.len())))? else {
            return Ok(0);
        };

        let mut guard = inner.pages.lock_tracking_len(start, end, false);
        let mut total = 0;
        for chunk in chunks {
            if let Err(err) =
                inner
                    .pages
                    .update_range(inner.data.as_ref(), chunk.buf, chunk.offset, &mut guard)
            {
                inner.write_failed(&mut guard);
                return Err(err);
            }
            if let Err(err) = write_fully(inner.data.as_ref(), chunk.buf, chunk.offset) {
                inner.write_failed(&mut guard);
                return Err(err.into());
            }
            total += chunk.buf.len();
        }
        Ok(total)
    }

    /// Reads up to `buf.len()` bytes at `offset` and returns the checksums
    /// of the pages read in `csvec`. The first and last entries cover only
    /// the bytes read from their pages.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a short `csvec`, and with
    /// [`PgOptions::VERIFY`] the errors of [`CsiFile::read`].
    pub fn pg_read(
        &self,
        buf: &mut [u8],
        offset: u64,
        csvec: Option<&mut [u32]>,
        opts: PgOptions,
    ) -> CsiResult<usize> {
        let inner = self.inner()?;
        let requested = buf.len();
        let (guard, n) = inner.begin_read(buf, offset)?;
        inner.finish_pg_read(guard, &buf[..n], offset, requested, csvec, opts)?;
        Ok(n)
    }

    /// Writes `buf` at `offset` with caller-supplied page checksums.
    ///
    /// With [`PgOptions::VERIFY`] the checksums are checked against `buf`
    /// before anything is locked or written. With [`PgOptions::DO_CALC`]
    /// they are computed instead, and returned in `csvec` if given.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if verification fails, `PgExtendDisallowed`
    /// if configured to refuse extending a file with a partial last page,
    /// plus the errors of [`CsiFile::write`].
    pub fn pg_write(
        &self,
        buf: &[u8],
        offset: u64,
        csvec: Option<&mut [u32]>,
        opts: PgOptions,
    ) -> CsiResult<usize> {
        let inner = self.inner()?;
        let guard = inner.begin_pg_write(buf, offset, csvec, opts)?;
        inner.finish_write(guard, buf, offset)
    }

    /// Truncates or extends the file to `len`.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnlyHandle` on a read-only handle, an `EDOM`-class error
    /// if the page cut by `len` fails verification, or any I/O error.
    pub fn ftruncate(&self, len: u64) -> CsiResult<()> {
        let inner = self.inner()?;
        inner.check_writable()?;

        let mut guard = inner.pages.lock_tracking_len(len, u64::MAX, false);
        if let Err(err) = inner.pages.truncate(inner.data.as_ref(), len, &mut guard) {
            inner.write_failed(&mut guard);
            return Err(err);
        }
        if let Err(err) = inner.data.set_len(len) {
            inner.write_failed(&mut guard);
            return Err(err.into());
        }
        Ok(())
    }

    /// Returns the file length: the larger of the tracked and data lengths.
    ///
    /// # Errors
    ///
    /// Returns an error if an untracked file's length cannot be read.
    pub fn len(&self) -> CsiResult<u64> {
        let inner = self.inner()?;
        match inner.pages.tracked_sizes_get(false) {
            Ok(sizes) => Ok(sizes.tagged.max(sizes.data)),
            Err(_) => Ok(inner.data.len()?),
        }
    }

    /// Returns true if the file is empty.
    ///
    /// # Errors
    ///
    /// As [`CsiFile::len`].
    pub fn is_empty(&self) -> CsiResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Syncs tags and data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns the tag file error if both fail.
    pub fn fsync(&self) -> CsiResult<()> {
        let inner = self.inner()?;
        let tags = inner.pages.fsync();
        let data = inner.data.sync();
        tags?;
        Ok(data?)
    }

    /// Pushes buffered tag and data writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns the tag file error if both fail.
    pub fn flush(&self) -> CsiResult<()> {
        let inner = self.inner()?;
        let tags = inner.pages.flush();
        let data = inner.data.flush();
        tags?;
        Ok(data?)
    }

    /// Returns whether the file's tags are verified.
    #[must_use]
    pub fn verification_status(&self) -> VerificationStatus {
        self.inner
            .as_ref()
            .map_or(VerificationStatus::Untracked, |inner| {
                inner.pages.verification_status()
            })
    }

    /// Resets the tracked sizes to the data file's real length and repairs
    /// the last page tag if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the data length cannot be read or the tag file
    /// cannot be reconciled.
    pub fn resync_sizes(&self) -> CsiResult<()> {
        self.inner()?.resync_sizes()
    }

    /// Closes the handle, waiting for its async operations to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if this was the last handle and closing the tag file
    /// failed.
    pub fn close(mut self) -> CsiResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> CsiResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };

        #[cfg(feature = "aio")]
        inner.aio.wait_idle();

        inner.store.unhold(inner.entry.key());
        let state = inner.entry.state();
        registry().release_and_close(&inner.entry, state)
    }
}

impl Drop for CsiFile {
    fn drop(&mut self) {
        let path = self.path().to_path_buf();
        if let Err(err) = self.close_inner() {
            warn!(path = %path.display(), error = %err, "error closing file");
        }
    }
}

/// Returns the byte span covering all `(offset, len)` pairs, or `None` for
/// an empty list.
fn span(chunks: impl Iterator<Item = (u64, usize)>) -> CsiResult<Option<(u64, u64)>> {
    let mut span: Option<(u64, u64)> = None;
    for (offset, len) in chunks {
        let end = end_of(offset, len)?;
        span = Some(match span {
            Some((start, stop)) => (start.min(offset), stop.max(end)),
            None => (offset, end),
        });
    }
    Ok(span)
}
