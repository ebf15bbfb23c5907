//! Page checksum engine.
//!
//! [`Pages`] translates byte-range reads, writes and truncations of a data
//! file into page-tag operations on its [`TagFile`], and serializes them with
//! page-range locks. Every request is classified as:
//!
//! - **aligned**: it starts on a page boundary and ends on one, or at the
//!   tracked length. Tags are computed directly from the caller's buffer.
//! - **unaligned**: a first or last page is only partly covered. The rest of
//!   that page is read back from the data file, checked against its stored
//!   tag, and the new tag is assembled with the CRC algebra in [`crate::crc`].
//!
//! The engine never owns the data file; callers pass it to every operation
//! while holding a [`RangeGuard`] from [`Pages::lock_tracking_len`].

mod aligned;
mod consistency;
mod unaligned;

use crate::config::CsiConfig;
use crate::crc::{calc_pages, crc32c, PAGE_SIZE, PAGE_SIZE_U64};
use crate::error::{CsiError, CsiResult};
use crate::ranges::{RangeLock, RangeLockManager};
use crate::tagstore::TagFile;
use pagecsi_storage::{read_fully, DataFile, OpenFlags, StorageBackend};
use parking_lot::{Condvar, Mutex};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Maximum number of tags read or written in one tag file call.
pub(crate) const TAG_BATCH: usize = 1024;

/// Options for `pg_read` / `pg_write`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PgOptions(u8);

impl PgOptions {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Verify data against checksums.
    pub const VERIFY: Self = Self(0x1);
    /// Calculate checksums from the data instead of trusting supplied ones.
    pub const DO_CALC: Self = Self(0x2);

    /// Returns true if all options in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PgOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Whether a file's tags were verified or derived from written data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    /// The file has no tag file.
    Untracked,
    /// Every tag was supplied or checked independently of the data.
    Verified,
    /// Some tags were computed from data as it was written.
    Unverified,
}

/// Snapshot of the tracked length pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedSizes {
    /// Length covered by tags. Authoritative for checksums.
    pub tagged: u64,
    /// Last known length of the data file.
    pub data: u64,
}

#[derive(Debug, Clone, Copy)]
struct PageOptions {
    fill_holes: bool,
    loose_write: bool,
    disable_pg_extend: bool,
}

/// Page of `offset`.
#[inline]
pub(crate) const fn page_of(offset: u64) -> u64 {
    offset / PAGE_SIZE_U64
}

/// Offset of `offset` within its page.
#[inline]
pub(crate) const fn page_off(offset: u64) -> usize {
    (offset % PAGE_SIZE_U64) as usize
}

/// Number of tags covering `len` bytes starting at `offset`.
#[inline]
pub(crate) const fn tags_spanned(offset: u64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (page_of(offset + len as u64 - 1) - page_of(offset) + 1) as usize
}

/// Reads exactly `buf.len()` bytes at `offset`.
pub(crate) fn read_full(fd: &dyn DataFile, buf: &mut [u8], offset: u64) -> CsiResult<()> {
    let n = read_fully(fd, buf, offset)?;
    if n < buf.len() {
        return Err(CsiError::ShortRead {
            offset,
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(())
}

/// Reads up to a page at `offset`, stopping at end of file or once at least
/// `target` bytes arrived (when `target` is non-zero).
pub(crate) fn read_max(
    fd: &dyn DataFile,
    buf: &mut [u8; PAGE_SIZE],
    offset: u64,
    target: usize,
) -> CsiResult<usize> {
    let mut done = 0;
    while done < PAGE_SIZE {
        let n = fd.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
        if target > 0 && done >= target {
            break;
        }
    }
    Ok(done)
}

fn check_csvec(csvec: Option<&[u32]>, offset: u64, len: usize) -> CsiResult<()> {
    if let Some(cs) = csvec {
        let need = tags_spanned(offset, len);
        if cs.len() < need {
            return Err(CsiError::invalid_argument(format!(
                "checksum vector holds {} entries, {need} needed",
                cs.len()
            )));
        }
    }
    Ok(())
}

pub(crate) fn end_of(offset: u64, len: usize) -> CsiResult<u64> {
    offset
        .checked_add(len as u64)
        .ok_or_else(|| CsiError::invalid_argument("range end overflows"))
}

/// Checksum engine for one data file, shared by all its open handles.
pub struct Pages {
    path: PathBuf,
    tags: Option<TagFile>,
    options: PageOptions,
    read_only: bool,
    ranges: Arc<RangeLockManager>,
    range_add: Mutex<()>,
    size_slot: Mutex<bool>,
    size_released: Condvar,
    loose: AtomicBool,
    check_last_pg: AtomicBool,
    last_pg_for_loose: AtomicU64,
}

impl std::fmt::Debug for Pages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pages")
            .field("path", &self.path)
            .field("tracked", &self.tags.is_some())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Pages {
    /// Opens the tag file at `tag_path` for a data file of length `data_len`.
    ///
    /// If the tag file does not exist and the configuration allows missing
    /// tags, the file is opened untracked.
    ///
    /// # Errors
    ///
    /// Returns `MissingTags` if the tag file is absent and not allowed to
    /// be, or any error from opening the tag file.
    pub fn open(
        backend: &dyn StorageBackend,
        tag_path: &Path,
        data_len: u64,
        flags: OpenFlags,
        config: &CsiConfig,
    ) -> CsiResult<Self> {
        let options = PageOptions {
            fill_holes: config.fill_holes,
            loose_write: config.loose_write,
            disable_pg_extend: config.disable_pg_extend,
        };

        let tags = match TagFile::open(backend, tag_path, data_len, flags) {
            Ok(tags) => Some(tags),
            Err(err) if err.is_not_found() => {
                if !config.allow_missing_tags {
                    warn!(path = %tag_path.display(), "could not open tag file");
                    return Err(CsiError::MissingTags {
                        path: tag_path.to_path_buf(),
                    });
                }
                info!(path = %tag_path.display(), "opening with missing tag file");
                None
            }
            Err(err) => return Err(err),
        };

        let loose = match &tags {
            Some(t) if data_len == 0 && t.tracked_len() == 0 => false,
            _ => options.loose_write,
        };

        Ok(Self {
            path: tag_path.to_path_buf(),
            tags,
            options,
            read_only: flags.is_read_only(),
            ranges: RangeLockManager::new(),
            range_add: Mutex::new(()),
            size_slot: Mutex::new(false),
            size_released: Condvar::new(),
            loose: AtomicBool::new(loose),
            check_last_pg: AtomicBool::new(false),
            last_pg_for_loose: AtomicU64::new(0),
        })
    }

    /// Returns the tag file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the file has a tag file.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.tags.is_some()
    }

    /// Returns true if the tag file was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn tags(&self) -> CsiResult<&TagFile> {
        self.tags.as_ref().ok_or_else(|| CsiError::MissingTags {
            path: self.path.clone(),
        })
    }

    fn is_loose(&self) -> bool {
        self.loose.load(Ordering::SeqCst)
    }

    /// Closes the tag file.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file was already closed.
    pub fn close(&self) -> CsiResult<()> {
        match &self.tags {
            Some(tags) => tags.close(),
            None => Ok(()),
        }
    }

    /// Pushes buffered tag writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file is closed or the flush fails.
    pub fn flush(&self) -> CsiResult<()> {
        match &self.tags {
            Some(tags) => tags.flush(),
            None => Ok(()),
        }
    }

    /// Syncs the tag file to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file is closed or the sync fails.
    pub fn fsync(&self) -> CsiResult<()> {
        match &self.tags {
            Some(tags) => tags.fsync(),
            None => Ok(()),
        }
    }

    /// Returns whether the stored tags are verified.
    #[must_use]
    pub fn verification_status(&self) -> VerificationStatus {
        match &self.tags {
            None => VerificationStatus::Untracked,
            Some(tags) => {
                let _sizes = self.size_slot.lock();
                if tags.is_verified() {
                    VerificationStatus::Verified
                } else {
                    VerificationStatus::Unverified
                }
            }
        }
    }

    // --- tracked sizes -------------------------------------------------

    /// Returns the tracked sizes, first waiting for any writer holding the
    /// size slot. With `for_update` the slot is checked out to the caller
    /// until [`Pages::tracked_size_release`].
    ///
    /// # Errors
    ///
    /// Returns `MissingTags` if the file is untracked.
    pub fn tracked_sizes_get(&self, for_update: bool) -> CsiResult<TrackedSizes> {
        let tags = self.tags()?;
        let mut checked_out = self.size_slot.lock();
        while *checked_out {
            self.size_released.wait(&mut checked_out);
        }
        let sizes = TrackedSizes {
            tagged: tags.tracked_len(),
            data: tags.data_len(),
        };
        if for_update {
            *checked_out = true;
        }
        Ok(sizes)
    }

    /// Returns the size slot checked out by `tracked_sizes_get(true)`.
    pub fn tracked_size_release(&self) {
        let mut checked_out = self.size_slot.lock();
        debug_assert!(*checked_out, "size slot released while not held");
        *checked_out = false;
        self.size_released.notify_all();
    }

    /// Sets the tracked length under the size lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag header cannot be written.
    pub fn lock_set_tracked_size(&self, len: u64) -> CsiResult<()> {
        let tags = self.tags()?;
        let _sizes = self.size_slot.lock();
        tags.set_tracked_size(len)
    }

    /// Resets the sizes to the data file's real length `len`, re-enables
    /// loose-write mode as configured and runs the consistency check.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file cannot be reconciled.
    pub fn lock_reset_sizes(&self, fd: &dyn DataFile, len: u64) -> CsiResult<()> {
        let Some(tags) = &self.tags else {
            return Ok(());
        };
        let _sizes = self.size_slot.lock();
        let ret = tags.reset_sizes(len);
        self.loose.store(self.options.loose_write, Ordering::SeqCst);
        self.basic_consistency_check(fd);
        ret
    }

    /// Truncates the tag file under the size lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file cannot be resized.
    pub fn lock_truncate_size(&self, len: u64, data_too: bool) -> CsiResult<()> {
        let tags = self.tags()?;
        let _sizes = self.size_slot.lock();
        tags.truncate(len, data_too)
    }

    /// Clears the verified flag under the size lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag header cannot be written.
    pub fn lock_make_unverified(&self) -> CsiResult<()> {
        let tags = self.tags()?;
        let _sizes = self.size_slot.lock();
        tags.set_unverified()
    }

    // --- locking -------------------------------------------------------

    /// Locks the pages of the byte range `start..end` and snapshots the
    /// tracked sizes into the returned guard.
    ///
    /// Read locks are shared, write locks exclusive. The locked range starts
    /// no later than the tracked length's page so that a write beyond the
    /// end of file serializes with the update of the last partial page. A
    /// write ending beyond the tracked length keeps the size slot checked out
    /// until [`RangeGuard::unlock_tracking_len`] or the guard is dropped.
    ///
    /// Blocks until conflicting ranges are released. Untracked files and
    /// empty ranges get an inert guard.
    #[must_use]
    pub fn lock_tracking_len(self: &Arc<Self>, start: u64, end: u64, read_only: bool) -> RangeGuard {
        if self.tags.is_none() || start >= end {
            return RangeGuard::inert();
        }

        let guard = {
            let _adding = self.range_add.lock();
            let sizes = match self.tracked_sizes_get(!read_only) {
                Ok(sizes) => sizes,
                Err(_) => return RangeGuard::inert(),
            };

            let p1 = page_of(start.min(sizes.tagged));
            let mut p2 = page_of(end);
            if page_off(end) == 0 {
                p2 -= 1;
            }

            let release_now = !read_only && end <= sizes.tagged;
            let lock = self.ranges.add_range(p1, p2, !read_only);
            if release_now {
                self.tracked_size_release();
            }

            RangeGuard {
                pages: Some(Arc::clone(self)),
                lock: Some(lock),
                sizes,
                holds_size_slot: !read_only && !release_now,
            }
        };

        if let Some(lock) = &guard.lock {
            lock.wait();
        }
        guard
    }

    // --- read path -----------------------------------------------------

    /// Verifies `buf`, just read from the data file at `offset`, against the
    /// stored tags.
    ///
    /// # Errors
    ///
    /// Returns `EDOM`-class errors if a checksum mismatches, the read is
    /// empty before the tracked length, or extends beyond it.
    pub fn verify_range(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        guard: &RangeGuard,
    ) -> CsiResult<()> {
        self.fetch_range(fd, buf, offset, None, PgOptions::VERIFY, guard)
    }

    /// Returns in `csvec` the checksums of the pages covering `buf`, just
    /// read from the data file at `offset`, and verifies the data against
    /// them if `opts` contains [`PgOptions::VERIFY`].
    ///
    /// Entries for partly covered pages are adjusted to cover only the
    /// requested bytes.
    ///
    /// # Errors
    ///
    /// As [`Pages::verify_range`], plus `InvalidArgument` for a short
    /// `csvec`.
    pub fn fetch_range(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        csvec: Option<&mut [u32]>,
        opts: PgOptions,
        guard: &RangeGuard,
    ) -> CsiResult<()> {
        check_csvec(csvec.as_deref(), offset, buf.len())?;
        let end = end_of(offset, buf.len())?;

        if self.tags.is_none() {
            if let Some(cs) = csvec {
                Self::pg_do_calc(buf, offset, cs);
            }
            return Ok(());
        }

        let sizes = guard.tracked_sizes();
        let tracked = sizes.tagged;

        if offset >= tracked && buf.is_empty() {
            return Ok(());
        }

        if buf.is_empty() {
            warn!(path = %self.path.display(), "read of zero bytes before tracked length, file may be truncated");
            return Err(CsiError::inconsistent(format!(
                "zero-length read at {offset} before tracked length {tracked}"
            )));
        }

        if end > tracked {
            warn!(
                path = %self.path.display(),
                beyond = end - tracked,
                "read extends beyond tracked length"
            );
            return Err(CsiError::inconsistent(format!(
                "read of {} bytes at {offset} extends beyond tracked length {tracked}",
                buf.len()
            )));
        }

        let verify = opts.contains(PgOptions::VERIFY);
        if csvec.is_none() && !verify {
            return Ok(());
        }

        if page_off(offset) != 0 || (end != tracked && buf.len() % PAGE_SIZE != 0) {
            self.fetch_range_unaligned(fd, buf, offset, sizes, csvec, verify)
        } else {
            self.fetch_range_aligned(buf, offset, csvec, verify)
        }
    }

    // --- write path ----------------------------------------------------

    /// Stores tags for `buf`, about to be written to the data file at
    /// `offset`. Marks the store unverified.
    ///
    /// # Errors
    ///
    /// Returns `EDOM`-class errors if existing data in a partly overwritten
    /// page fails its checksum, or any tag file error.
    pub fn update_range(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        guard: &mut RangeGuard,
    ) -> CsiResult<()> {
        let end = end_of(offset, buf.len())?;
        if buf.is_empty() || self.tags.is_none() {
            return Ok(());
        }

        self.lock_make_unverified()?;

        let sizes = guard.tracked_sizes();
        if end > sizes.tagged {
            self.lock_set_tracked_size(end)?;
            guard.extended_to(end);
            guard.unlock_tracking_len();
        }

        if Self::store_is_unaligned(offset, end, buf.len(), sizes.tagged) {
            self.store_range_unaligned(fd, buf, offset, sizes, None)
        } else {
            self.store_range_aligned(buf, offset, sizes, None)
        }
    }

    /// Stores tags for `buf`, about to be written to the data file at
    /// `offset`, taking them from `csvec` when given.
    ///
    /// With [`PgOptions::DO_CALC`] and a `csvec`, the vector is first filled
    /// with checksums computed from `buf`. Without any vector and without
    /// `DO_CALC` the store is marked unverified.
    ///
    /// # Errors
    ///
    /// Returns `PgExtendDisallowed` when extension past a non-aligned end
    /// of file is disabled, plus the errors of [`Pages::update_range`].
    pub fn store_range(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        mut csvec: Option<&mut [u32]>,
        opts: PgOptions,
        guard: &mut RangeGuard,
    ) -> CsiResult<()> {
        check_csvec(csvec.as_deref(), offset, buf.len())?;
        let end = end_of(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        let do_calc = opts.contains(PgOptions::DO_CALC);
        if self.tags.is_none() {
            if let (Some(cs), true) = (csvec, do_calc) {
                Self::pg_do_calc(buf, offset, cs);
            }
            return Ok(());
        }

        let sizes = guard.tracked_sizes();
        let tracked = sizes.tagged;

        if self.options.disable_pg_extend && page_off(tracked) != 0 && end > tracked {
            return Err(CsiError::PgExtendDisallowed);
        }

        if do_calc {
            if let Some(cs) = csvec.as_deref_mut() {
                Self::pg_do_calc(buf, offset, cs);
            }
        }

        if csvec.is_none() && !do_calc {
            self.lock_make_unverified()?;
        }

        if end > tracked {
            self.lock_set_tracked_size(end)?;
            guard.extended_to(end);
            guard.unlock_tracking_len();
        }

        let csvec = csvec.as_deref();
        if Self::store_is_unaligned(offset, end, buf.len(), tracked) {
            self.store_range_unaligned(fd, buf, offset, sizes, csvec)
        } else {
            self.store_range_aligned(buf, offset, sizes, csvec)
        }
    }

    fn store_is_unaligned(offset: u64, end: u64, len: usize, tracked: u64) -> bool {
        page_off(offset) != 0
            || (end < tracked && len % PAGE_SIZE != 0)
            || (page_off(tracked) != 0 && offset > tracked)
    }

    /// Fills `csvec` with the checksums of `buf` as it would lie in the file
    /// at `offset`: the first entry covers up to the first page boundary.
    pub fn pg_do_calc(buf: &[u8], offset: u64, csvec: &mut [u32]) {
        let p_off = page_off(offset);
        if p_off == 0 {
            calc_pages(buf, csvec);
            return;
        }
        let head = (PAGE_SIZE - p_off).min(buf.len());
        csvec[0] = crc32c(&buf[..head]);
        if head < buf.len() {
            calc_pages(&buf[head..], &mut csvec[1..]);
        }
    }

    /// Checks a caller-supplied checksum vector against `buf` before any
    /// lock is taken. Only done when `opts` contains [`PgOptions::VERIFY`].
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` for the first disagreeing page, or
    /// `InvalidArgument` for a short vector.
    pub fn pg_write_prelock_check(
        buf: &[u8],
        offset: u64,
        csvec: Option<&[u32]>,
        opts: PgOptions,
    ) -> CsiResult<()> {
        let Some(cs) = csvec else {
            return Ok(());
        };
        if !opts.contains(PgOptions::VERIFY) {
            return Ok(());
        }
        check_csvec(Some(cs), offset, buf.len())?;

        let mut computed = vec![0u32; tags_spanned(offset, buf.len())];
        Self::pg_do_calc(buf, offset, &mut computed);
        let first = page_of(offset);
        let p_off = page_off(offset);

        for (i, (&calc, &given)) in computed.iter().zip(cs).enumerate() {
            if calc != given {
                let head = if p_off > 0 { PAGE_SIZE - p_off } else { PAGE_SIZE };
                let start = if i == 0 { 0 } else { head + (i - 1) * PAGE_SIZE };
                let len = (if i == 0 { head } else { PAGE_SIZE }).min(buf.len() - start);
                return Err(CsiError::ChecksumMismatch {
                    page: first + i as u64,
                    len,
                    computed: calc,
                    stored: given,
                });
            }
        }
        Ok(())
    }

    // --- truncate ------------------------------------------------------

    /// Adjusts the tags for a truncation of the data file to `len`.
    ///
    /// Growing fills the hole. When `len` falls inside a page, that page's
    /// remaining bytes are read, verified against its tag and re-tagged.
    /// The tracked length is updated last.
    ///
    /// # Errors
    ///
    /// Returns `EDOM`-class errors if the cut page fails its checksum, or
    /// any tag file error.
    pub fn truncate(&self, fd: &dyn DataFile, len: u64, guard: &mut RangeGuard) -> CsiResult<()> {
        let Some(tags) = &self.tags else {
            return Ok(());
        };

        let sizes = guard.tracked_sizes();
        let tracked = sizes.tagged;
        let p_until = page_of(len);
        let p_off = page_off(len);

        if len > tracked {
            self.update_range_hole_until_page(p_until, sizes, true)
                .inspect_err(|err| warn!(error = %err, "error updating tags for holes"))?;
        }

        if len != tracked && p_off != 0 {
            let tracked_page = page_of(tracked);
            let tracked_off = page_off(tracked);
            let to_read = match (len > tracked, p_until == tracked_page) {
                (_, true) => tracked_off,
                (true, false) => 0,
                (false, false) => PAGE_SIZE,
            };

            let mut b = [0u8; PAGE_SIZE];
            if to_read > 0 {
                self.read_page(fd, &mut b[..to_read], p_until)?;
                let computed = crc32c(&b[..to_read]);
                let stored = self.read_tag(tags, p_until)?;
                if computed != stored {
                    return Err(self.mismatch(p_until, to_read, computed, stored, ""));
                }
            }
            self.write_tags(tags, &[crc32c(&b[..p_off])], p_until)?;
        }

        self.lock_truncate_size(len, true)?;
        guard.unlock_tracking_len();
        Ok(())
    }

    // --- shared helpers ------------------------------------------------

    fn read_tags(&self, tags: &TagFile, buf: &mut [u32], page: u64) -> CsiResult<()> {
        tags.read_tags(buf, page).inspect_err(|err| {
            warn!(path = %self.path.display(), page, count = buf.len(), error = %err, "error reading tags");
        })
    }

    fn read_tag(&self, tags: &TagFile, page: u64) -> CsiResult<u32> {
        let mut tag = [0u32; 1];
        self.read_tags(tags, &mut tag, page)?;
        Ok(tag[0])
    }

    fn write_tags(&self, tags: &TagFile, buf: &[u32], page: u64) -> CsiResult<()> {
        tags.write_tags(buf, page).inspect_err(|err| {
            warn!(path = %self.path.display(), page, count = buf.len(), error = %err, "error writing tags");
        })
    }

    fn read_page(&self, fd: &dyn DataFile, buf: &mut [u8], page: u64) -> CsiResult<()> {
        read_full(fd, buf, page * PAGE_SIZE_U64).inspect_err(|err| {
            warn!(path = %self.path.display(), page, len = buf.len(), error = %err, "error reading page");
        })
    }

    fn mismatch(&self, page: u64, len: usize, computed: u32, stored: u32, context: &str) -> CsiError {
        warn!(
            path = %self.path.display(),
            page,
            len,
            computed = %format!("{computed:08x}"),
            stored = %format!("{stored:08x}"),
            context,
            "checksum error"
        );
        CsiError::ChecksumMismatch {
            page,
            len,
            computed,
            stored,
        }
    }
}

/// Holds a page-range lock and, for writes that may extend the file, the
/// size slot. Dropping it releases the size slot, then the range.
#[derive(Debug)]
#[must_use = "the range is unlocked as soon as the guard is dropped"]
pub struct RangeGuard {
    pages: Option<Arc<Pages>>,
    lock: Option<RangeLock>,
    sizes: TrackedSizes,
    holds_size_slot: bool,
}

impl RangeGuard {
    /// A guard that locks nothing.
    pub(crate) fn inert() -> Self {
        Self {
            pages: None,
            lock: None,
            sizes: TrackedSizes::default(),
            holds_size_slot: false,
        }
    }

    /// Returns the tracked sizes seen when the lock was taken, raised by any
    /// extension made under this guard.
    #[must_use]
    pub fn tracked_sizes(&self) -> TrackedSizes {
        self.sizes
    }

    /// Returns true if a page range is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Returns true if the size slot is held.
    #[must_use]
    pub fn holds_size_slot(&self) -> bool {
        self.holds_size_slot
    }

    /// Records that the tracked length grew to `end` while the range is held,
    /// so later updates under the same guard see the new length.
    pub(crate) fn extended_to(&mut self, end: u64) {
        self.sizes.tagged = self.sizes.tagged.max(end);
        self.sizes.data = self.sizes.data.max(end);
    }

    /// Releases the size slot, if held, keeping the page range.
    pub fn unlock_tracking_len(&mut self) {
        if self.holds_size_slot {
            self.holds_size_slot = false;
            if let Some(pages) = &self.pages {
                pages.tracked_size_release();
            }
        }
    }

    /// Releases the size slot and the page range.
    pub fn release_all(&mut self) {
        self.unlock_tracking_len();
        self.lock = None;
    }
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests;
