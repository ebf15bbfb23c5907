//! Page-aligned tag updates and fetches.

use super::{page_of, page_off, Pages, TrackedSizes, TAG_BATCH};
use crate::crc::{crc32c, PAGE_SIZE};
use crate::error::{CsiError, CsiResult};
use tracing::warn;

impl Pages {
    /// Writes tags for `buf`, which starts at page `start_page`.
    ///
    /// Tags come from `csvec` when given, else are computed. `pre` is
    /// written for the page before `start_page`; `last` replaces the tag of
    /// the final, partial page of `buf`. Returns the number of tags written.
    pub(super) fn apply_sequential_aligned_modify(
        &self,
        buf: &[u8],
        start_page: u64,
        csvec: Option<&[u32]>,
        pre: Option<u32>,
        last: Option<u32>,
    ) -> CsiResult<u64> {
        if last.is_some() && buf.len() % PAGE_SIZE == 0 {
            return Err(CsiError::invalid_argument(
                "last page tag given for a buffer ending on a page boundary",
            ));
        }
        if pre.is_some() && start_page == 0 {
            return Err(CsiError::invalid_argument(
                "previous page tag given for a buffer starting at page 0",
            ));
        }
        let tags = self.tags()?;

        let mut next = if pre.is_some() { start_page - 1 } else { start_page };
        let mut written = 0u64;
        let mut batch = Vec::with_capacity(TAG_BATCH);
        batch.extend(pre);

        for (i, chunk) in buf.chunks(PAGE_SIZE).enumerate() {
            let tag = match (last, csvec) {
                (Some(last), _) if chunk.len() < PAGE_SIZE => last,
                (_, Some(cs)) => cs[i],
                _ => crc32c(chunk),
            };
            batch.push(tag);

            if batch.len() == TAG_BATCH {
                self.write_tags(tags, &batch, next)?;
                next += batch.len() as u64;
                written += batch.len() as u64;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.write_tags(tags, &batch, next)?;
            written += batch.len() as u64;
        }
        Ok(written)
    }

    /// Compares the checksum of each page-sized chunk of `data` with
    /// `tags`, the stored tags starting at page `first_page`.
    pub(super) fn verify_pages(&self, data: &[u8], first_page: u64, tags: &[u32]) -> CsiResult<()> {
        for (i, (chunk, &stored)) in data.chunks(PAGE_SIZE).zip(tags).enumerate() {
            let computed = crc32c(chunk);
            if computed != stored {
                return Err(self.mismatch(first_page + i as u64, chunk.len(), computed, stored, ""));
            }
        }
        Ok(())
    }

    /// Fetches (and optionally verifies) tags for a read that starts on a
    /// page boundary and ends on one or at the tracked length.
    pub(super) fn fetch_range_aligned(
        &self,
        buf: &[u8],
        offset: u64,
        csvec: Option<&mut [u32]>,
        verify: bool,
    ) -> CsiResult<()> {
        let tags = self.tags()?;
        let end = offset + buf.len() as u64;
        let p1 = page_of(offset);
        let nfull = (page_of(end) - p1) as usize;
        let ntags = nfull + usize::from(page_off(end) > 0);

        if let Some(cs) = csvec {
            let out = &mut cs[..ntags];
            self.read_tags(tags, out, p1)?;
            if verify {
                self.verify_pages(buf, p1, out)?;
            }
            return Ok(());
        }

        let mut batch = vec![0u32; TAG_BATCH.min(ntags)];
        let mut done = 0;
        while done < ntags {
            let count = (ntags - done).min(TAG_BATCH);
            let page = p1 + done as u64;
            self.read_tags(tags, &mut batch[..count], page)?;
            if verify {
                let start = done * PAGE_SIZE;
                let stop = (start + count * PAGE_SIZE).min(buf.len());
                self.verify_pages(&buf[start..stop], page, &batch[..count])?;
            }
            done += count;
        }
        Ok(())
    }

    /// Stores tags for a write that starts on a page boundary and ends on one
    /// or at or beyond the tracked length.
    pub(super) fn store_range_aligned(
        &self,
        buf: &[u8],
        offset: u64,
        sizes: TrackedSizes,
        csvec: Option<&[u32]>,
    ) -> CsiResult<()> {
        let p1 = page_of(offset);

        if offset > sizes.tagged {
            self.update_range_hole_until_page(p1, sizes, false)
                .inspect_err(|err| warn!(error = %err, "error updating tags for holes"))?;
        }

        self.apply_sequential_aligned_modify(buf, p1, csvec, None, None)
            .inspect_err(|err| warn!(error = %err, "error updating tags"))?;
        Ok(())
    }
}
