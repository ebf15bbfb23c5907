//! Tag updates and fetches for partly covered pages.
//!
//! A write that covers only part of a page must fold the bytes it does not
//! cover into the page's new tag. Those bytes are read back from the data
//! file and checked against the page's current tag first, so every partial
//! overwrite doubles as a verification of the untouched bytes.
//!
//! # Loose writes
//!
//! Data and tags are written separately, so a crash can leave a page whose
//! data was updated and whose tag was not, or the reverse. In loose-write
//! mode a mismatch on a partial page is retried against the states such a
//! crash can leave, in this order:
//!
//! 1. the bytes on disk up to the expected length match the tag after all;
//! 2. the bytes on disk up to their real length match the tag;
//! 3. the bytes on disk with the pending write applied match the tag.
//!
//! This is a heuristic, not a proof: it accepts exactly these states and
//! reports anything else as corruption. The append variant runs at most once
//! per open or resync, for the page that was last at that time.

use super::{page_of, page_off, read_max, Pages, TrackedSizes, TAG_BATCH};
use crate::crc::{
    combine, crc32c, crc32c_append, crc_zero_page, extend_with_zero, split1, split2, PAGE_SIZE,
    PAGE_SIZE_U64,
};
use crate::error::{CsiError, CsiResult};
use pagecsi_storage::DataFile;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Folds the caller's bytes into `crc`, from the supplied checksum if any.
fn with_data(crc: u32, data: &[u8], supplied: Option<u32>) -> u32 {
    match supplied {
        Some(cs) => combine(crc, cs, data.len()),
        None => crc32c_append(crc, data),
    }
}

impl Pages {
    /// Writes tags for the pages between the tracked length and page `until`
    /// (exclusive), which the data file holds as implied zeros.
    ///
    /// A partial last tracked page has its tag zero-extended to a full page.
    /// That is only allowed when `allow_partial_tail` is set.
    pub(super) fn update_range_hole_until_page(
        &self,
        until: u64,
        sizes: TrackedSizes,
        allow_partial_tail: bool,
    ) -> CsiResult<()> {
        let tags = self.tags()?;
        let tracked_page = page_of(sizes.tagged);
        if until <= tracked_page {
            return Ok(());
        }
        let tracked_off = page_off(sizes.tagged);

        if tracked_off > 0 {
            if !allow_partial_tail {
                warn!(path = %self.path.display(), "unexpected partially filled last page");
                return Err(CsiError::inconsistent("unexpected partially filled last page"));
            }
            // A mismatch here is only found by a later read.
            let prev = self.read_tag(tags, tracked_page)?;
            let extended = extend_with_zero(prev, PAGE_SIZE - tracked_off);
            self.write_tags(tags, &[extended], tracked_page)?;
        }

        if !self.options.fill_holes {
            return Ok(());
        }

        let first_empty = tracked_page + u64::from(tracked_off > 0);
        let zeros = vec![crc_zero_page(); TAG_BATCH];
        let mut page = first_empty;
        while page < until {
            let count = ((until - page) as usize).min(TAG_BATCH);
            self.write_tags(tags, &zeros[..count], page)?;
            page += count as u64;
        }
        Ok(())
    }

    /// Stores tags for a write that partly covers its first or last page,
    /// or starts beyond a non-aligned tracked length.
    pub(super) fn store_range_unaligned(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        sizes: TrackedSizes,
        csvec: Option<&[u32]>,
    ) -> CsiResult<()> {
        let tags = self.tags()?;
        let tracked = sizes.tagged;
        let p1 = page_of(offset);

        if offset > tracked {
            self.update_range_hole_until_page(p1, sizes, true)
                .inspect_err(|err| warn!(error = %err, "error updating tags for holes"))?;
        }

        let len = buf.len();
        let end = offset + len as u64;
        let p1_off = page_off(offset);
        let p2_off = page_off(end);

        let mut pre = None;
        if p1_off > 0 || len < PAGE_SIZE {
            let first_len = (PAGE_SIZE - p1_off).min(len);
            pre = Some(self.store_preblock(
                fd,
                &buf[..first_len],
                offset,
                tracked,
                csvec.map(|cs| cs[0]),
            )?);
        }

        let next_page = if pre.is_some() { p1 + 1 } else { p1 };
        let next_off = if pre.is_some() { PAGE_SIZE - p1_off } else { 0 };

        if len <= next_off {
            if let Some(tag) = pre {
                self.write_tags(tags, &[tag], p1)?;
            }
            return Ok(());
        }

        let rest = &buf[next_off..];
        let rest_cs = match csvec {
            Some(cs) if pre.is_some() => Some(&cs[1..]),
            other => other,
        };

        if p2_off == 0 || end >= tracked {
            self.apply_sequential_aligned_modify(rest, next_page, rest_cs, pre, None)
                .inspect_err(|err| warn!(error = %err, "error updating tags"))?;
            return Ok(());
        }

        let last = self.store_postblock(fd, rest, offset + next_off as u64, tracked, rest_cs)?;
        self.apply_sequential_aligned_modify(rest, next_page, rest_cs, pre, Some(last))
            .inspect_err(|err| warn!(error = %err, "error updating tags"))?;
        Ok(())
    }

    /// Computes the new tag of the first page of a write, where `data` is
    /// the part of the write that falls in that page.
    fn store_preblock(
        &self,
        fd: &dyn DataFile,
        data: &[u8],
        offset: u64,
        tracked: u64,
        supplied: Option<u32>,
    ) -> CsiResult<u32> {
        let tags = self.tags()?;
        let p1 = page_of(offset);
        let p1_off = page_off(offset);
        let tracked_page = page_of(tracked);
        let tracked_off = page_off(tracked);

        if p1 > tracked_page {
            return Ok(with_data(extend_with_zero(0, p1_off), data, supplied));
        }

        if p1 == tracked_page && p1_off >= tracked_off {
            let stored = if tracked_off > 0 {
                self.read_tag(tags, p1)?
            } else {
                0
            };

            let check_now = self.is_loose()
                && p1 == self.last_pg_for_loose.load(Ordering::SeqCst)
                && self.check_last_pg.swap(false, Ordering::SeqCst);

            let prefix = if check_now {
                self.loose_append_prefix(fd, data, p1, p1_off, tracked_off, stored)?
            } else {
                extend_with_zero(stored, p1_off - tracked_off)
            };
            return Ok(with_data(prefix, data, supplied));
        }

        let bavail = if p1 == tracked_page {
            tracked_off
        } else {
            PAGE_SIZE
        };
        debug_assert!(p1_off < bavail);

        let stored = self.read_tag(tags, p1)?;
        let mut b = [0u8; PAGE_SIZE];

        if self.is_loose() {
            self.loose_overwrite_check(fd, &mut b, data, p1, p1_off, bavail, stored)?;
        } else {
            self.read_page(fd, &mut b[..bavail], p1)?;
            let computed = crc32c(&b[..bavail]);
            if computed != stored {
                return Err(self.mismatch(p1, bavail, computed, stored, "overwrite"));
            }
        }

        let mut crc = with_data(crc32c(&b[..p1_off]), data, supplied);
        let covered = p1_off + data.len();
        if covered < bavail {
            let tail = crc32c(&b[covered..bavail]);
            crc = combine(crc, tail, bavail - covered);
        }
        Ok(crc)
    }

    /// Loose-write check for an append into the last tracked page. Returns
    /// the checksum of the page up to `p1_off` as found on disk.
    fn loose_append_prefix(
        &self,
        fd: &dyn DataFile,
        data: &[u8],
        p1: u64,
        p1_off: usize,
        tracked_off: usize,
        stored: u32,
    ) -> CsiResult<u32> {
        let path = self.path.display();
        let at = p1 * PAGE_SIZE_U64;
        let mut b = [0u8; PAGE_SIZE];

        let rlen = read_max(fd, &mut b, at, tracked_off).inspect_err(|err| {
            warn!(%path, page = p1, error = %err, "error reading page (append)");
        })?;

        let mut crc_x = crc32c(&b[..tracked_off]);
        let prefix = crc32c_append(crc_x, &b[tracked_off..p1_off]);

        if rlen == tracked_off && (tracked_off == 0 || crc_x == stored) {
            return Ok(prefix);
        }

        if (tracked_off > 0 || p1_off == 0) && rlen <= p1_off + data.len() {
            if tracked_off == 0 {
                warn!(%path, offset = at, rlen, "recovered page with no tag (append)");
                return Ok(prefix);
            }
            warn!(%path, page = p1, len = tracked_off, "checksum error, loose match, still trying");

            if rlen != tracked_off && rlen > 0 {
                crc_x = crc32c(&b[..rlen]);
                if crc_x == stored {
                    warn!(%path, offset = at + p1_off as u64, "recovered page (append)");
                    return Ok(prefix);
                }
                warn!(%path, page = p1, len = rlen, "checksum error, loose match, still trying");
            }

            b[p1_off..p1_off + data.len()].copy_from_slice(data);
            crc_x = crc32c(&b[..p1_off + data.len()]);
            if crc_x == stored {
                warn!(%path, offset = at + p1_off as u64, "recovered matching write (append)");
                return Ok(prefix);
            }
            return Err(self.mismatch(p1, p1_off + data.len(), crc_x, stored, "append"));
        }

        if tracked_off == 0 {
            warn!(%path, offset = at, p1_off, rlen, "unexpected content in page (append)");
        }
        Err(self.mismatch(p1, tracked_off, crc_x, stored, "append"))
    }

    /// Loose-write check for a partial overwrite of existing page data.
    /// Leaves the page as read from disk in `b`, zero padded.
    #[allow(clippy::too_many_arguments)]
    fn loose_overwrite_check(
        &self,
        fd: &dyn DataFile,
        b: &mut [u8; PAGE_SIZE],
        data: &[u8],
        p1: u64,
        p1_off: usize,
        bavail: usize,
        stored: u32,
    ) -> CsiResult<()> {
        let path = self.path.display();
        let at = p1 * PAGE_SIZE_U64;

        let rlen = read_max(fd, b, at, bavail).inspect_err(|err| {
            warn!(%path, page = p1, error = %err, "error reading page (overwrite)");
        })?;

        let mut crc = crc32c(&b[..bavail]);
        if rlen == bavail && crc == stored {
            return Ok(());
        }

        // Bytes past the write and before `bavail` are not rewritten, so a
        // short page cannot be made up with implied zeros there.
        let covered = p1_off + data.len();
        let rmin = if covered < bavail { bavail } else { 0 };
        if rlen < rmin || rlen > bavail {
            return Err(self.mismatch(p1, bavail, crc, stored, "overwrite"));
        }

        if crc == stored {
            warn!(%path, offset = at, "recovered page (overwrite)");
            return Ok(());
        }
        warn!(%path, page = p1, len = bavail, "checksum error, loose match, still trying");

        if rlen != bavail && rlen > 0 {
            crc = crc32c(&b[..rlen]);
            if crc == stored {
                warn!(%path, offset = at, "recovered page (2) (overwrite)");
                return Ok(());
            }
            warn!(%path, page = p1, len = rlen, "checksum error, loose match, still trying");
        }

        b[p1_off..covered].copy_from_slice(data);
        let vl = bavail.max(covered);
        crc = crc32c(&b[..vl]);
        if crc == stored {
            warn!(%path, offset = at + p1_off as u64, "recovered matching write (overwrite)");
            return Ok(());
        }
        Err(self.mismatch(p1, vl, crc, stored, "overwrite"))
    }

    /// Computes the new tag of the last page of a write that ends inside
    /// existing data. `data` starts on a page boundary at `offset`.
    fn store_postblock(
        &self,
        fd: &dyn DataFile,
        data: &[u8],
        offset: u64,
        tracked: u64,
        supplied: Option<&[u32]>,
    ) -> CsiResult<u32> {
        let tags = self.tags()?;
        let len = data.len();
        let end = offset + len as u64;
        let p2 = page_of(end);
        let p2_off = page_off(end);
        debug_assert!(p2_off != 0);

        let bavail = if p2 == page_of(tracked) {
            page_off(tracked)
        } else {
            PAGE_SIZE
        };
        let bremain = bavail.saturating_sub(p2_off);
        debug_assert!(bremain > 0);

        let stored = self.read_tag(tags, p2)?;
        let mut b = [0u8; PAGE_SIZE];
        self.read_page(fd, &mut b[..bavail], p2)?;

        let head = match supplied {
            Some(cs) => cs[(len - 1) / PAGE_SIZE],
            None => crc32c(&data[len - p2_off..]),
        };
        let crc = combine(head, crc32c(&b[p2_off..bavail]), bremain);
        let prev = crc32c(&b[..bavail]);

        if stored != prev {
            if self.is_loose() && crc != prev {
                warn!(path = %self.path.display(), page = p2, len = bavail, "checksum error, loose match, still trying");
                if crc == stored {
                    warn!(path = %self.path.display(), offset = p2 * PAGE_SIZE_U64, "recovered matching write");
                    return Ok(crc);
                }
                return Err(self.mismatch(p2, bavail, crc, stored, ""));
            }
            return Err(self.mismatch(p2, bavail, prev, stored, ""));
        }
        Ok(crc)
    }

    /// Fetches (and optionally verifies) tags for a read that starts inside
    /// a page, or ends inside a page before the tracked length.
    pub(super) fn fetch_range_unaligned(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        sizes: TrackedSizes,
        csvec: Option<&mut [u32]>,
        verify: bool,
    ) -> CsiResult<()> {
        let tags = self.tags()?;
        let len = buf.len();
        let end = offset + len as u64;
        let p1 = page_of(offset);
        let p1_off = page_off(offset);
        let p2 = page_of(end);
        let p2_off = page_off(end);
        let ntags = (p2 - p1) as usize + usize::from(p2_off > 0);

        let returning = csvec.is_some();
        let mut local;
        let tbuf: &mut [u32] = match csvec {
            Some(cs) => &mut cs[..ntags],
            None => {
                local = vec![0u32; ntags];
                &mut local
            }
        };
        self.read_tags(tags, tbuf, p1)?;

        if p1_off > 0 || len < PAGE_SIZE {
            self.fetch_preblock(fd, buf, offset, sizes.tagged, tbuf, returning, verify)?;
        }

        let first_full = if p1_off != 0 { p1 + 1 } else { p1 };
        if first_full < p2 && verify {
            let skip = if p1_off != 0 { PAGE_SIZE - p1_off } else { 0 };
            let count = (p2 - first_full) as usize;
            let tidx = (first_full - p1) as usize;
            self.verify_pages(
                &buf[skip..skip + count * PAGE_SIZE],
                first_full,
                &tbuf[tidx..tidx + count],
            )?;
        }

        if p2 > p1 && p2_off > 0 {
            let tidx = (p2 - p1) as usize;
            self.fetch_postblock(fd, buf, offset, sizes.tagged, &mut tbuf[tidx], returning, verify)?;
        }
        Ok(())
    }

    /// Handles a first page of a read that is only partly wanted or short.
    #[allow(clippy::too_many_arguments)]
    fn fetch_preblock(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        tracked: u64,
        tbuf: &mut [u32],
        returning: bool,
        verify: bool,
    ) -> CsiResult<()> {
        let p1 = page_of(offset);
        let p1_off = page_off(offset);
        let bavail = (tracked - p1 * PAGE_SIZE_U64).min(PAGE_SIZE_U64) as usize;
        let bcommon = (bavail - p1_off).min(buf.len());

        let mut b = [0u8; PAGE_SIZE];
        let whole: &[u8] = if bavail > bcommon {
            self.read_page(fd, &mut b[..bavail], p1)?;
            if verify && buf[..bcommon] != b[p1_off..p1_off + bcommon] {
                return Err(self.byte_mismatch(&buf[..bcommon], &b[p1_off..], offset, bavail));
            }
            &b[..bavail]
        } else {
            &buf[..bavail]
        };

        if verify {
            let computed = crc32c(whole);
            if computed != tbuf[0] {
                return Err(self.mismatch(p1, bavail, computed, tbuf[0], ""));
            }
        }

        if bavail > bcommon && returning {
            tbuf[0] = if verify {
                crc32c(&b[p1_off..p1_off + bcommon])
            } else {
                let before = crc32c(&b[..p1_off]);
                let tag = split2(tbuf[0], before, bavail - p1_off);
                let after_len = bavail - p1_off - bcommon;
                let after = crc32c(&b[p1_off + bcommon..bavail]);
                split1(tag, after, after_len)
            };
        }
        Ok(())
    }

    /// Handles a last page of a read that is only partly wanted.
    #[allow(clippy::too_many_arguments)]
    fn fetch_postblock(
        &self,
        fd: &dyn DataFile,
        buf: &[u8],
        offset: u64,
        tracked: u64,
        tag: &mut u32,
        returning: bool,
        verify: bool,
    ) -> CsiResult<()> {
        let len = buf.len();
        let end = offset + len as u64;
        let p2 = page_of(end);
        let p2_off = page_off(end);
        let bavail = (tracked - p2 * PAGE_SIZE_U64).min(PAGE_SIZE_U64) as usize;
        let bremain = bavail.saturating_sub(p2_off);
        let user = &buf[len - p2_off..];

        let mut b = [0u8; PAGE_SIZE];
        let whole: &[u8] = if bremain > 0 {
            self.read_page(fd, &mut b[..bavail], p2)?;
            if verify && user != &b[..p2_off] {
                return Err(self.byte_mismatch(user, &b, p2 * PAGE_SIZE_U64, bavail));
            }
            &b[..bavail]
        } else {
            user
        };

        if verify {
            let computed = crc32c(whole);
            if computed != *tag {
                return Err(self.mismatch(p2, bavail, computed, *tag, ""));
            }
        }

        if returning && bremain > 0 {
            *tag = if verify {
                crc32c(&b[..p2_off])
            } else {
                split1(*tag, crc32c(&b[p2_off..bavail]), bremain)
            };
        }
        Ok(())
    }

    /// Reports bytes read back from the data file that differ from the
    /// caller's buffer. `user` starts at file offset `at`.
    fn byte_mismatch(&self, user: &[u8], disk: &[u8], at: u64, bavail: usize) -> CsiError {
        let bad = user
            .iter()
            .zip(disk)
            .position(|(u, d)| u != d)
            .unwrap_or(0);
        warn!(
            path = %self.path.display(),
            offset = at + bad as u64,
            len = bavail,
            user = user.get(bad).copied().unwrap_or_default(),
            disk = disk.get(bad).copied().unwrap_or_default(),
            "data mismatch with caller buffer"
        );
        CsiError::ByteMismatch {
            offset: at + bad as u64,
            len: user.len(),
        }
    }
}
