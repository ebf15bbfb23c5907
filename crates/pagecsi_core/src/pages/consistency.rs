//! Repair of the last-page tag after a crash or a failed write.
//!
//! When the data file and the tracked length disagree on the number of
//! pages, the tag of the boundary page may have been written for either
//! length. The check rewrites it to the form later operations expect and
//! otherwise only logs. It never fails the open.

use super::{page_off, read_max, Pages};
use crate::crc::{crc32c, PAGE_SIZE, PAGE_SIZE_U64};
use pagecsi_storage::DataFile;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Index of the last page of a `size`-byte file and the bytes used in it.
fn last_page(size: u64) -> (u64, usize) {
    if size == 0 {
        return (0, 0);
    }
    let used = match page_off(size) {
        0 => PAGE_SIZE,
        off => off,
    };
    ((size - 1) / PAGE_SIZE_U64, used)
}

impl Pages {
    /// Checks the boundary page tag against the data file and repairs it.
    ///
    /// Only runs for writable handles in loose-write mode. Also arms the
    /// one-time append check for the current last page.
    pub(crate) fn basic_consistency_check(&self, fd: &dyn DataFile) {
        if !self.is_loose() || self.read_only {
            return;
        }
        let Some(tags) = &self.tags else {
            return;
        };

        let tag_size = tags.tracked_len();
        let data_size = tags.data_len();
        let (tag_lp, tag_len) = last_page(tag_size);
        let (data_lp, data_len) = last_page(data_size);

        self.last_pg_for_loose.store(tag_lp, Ordering::SeqCst);
        self.check_last_pg.store(true, Ordering::SeqCst);

        let path = self.path.display();
        let mut b = [0u8; PAGE_SIZE];

        if data_size > 0 && tag_lp > data_lp {
            // The data file ends inside a page the tags consider full.
            if read_max(fd, &mut b, data_lp * PAGE_SIZE_U64, 0)
                .inspect_err(|err| warn!(%path, page = data_lp, error = %err, "error reading page"))
                .is_err()
            {
                return;
            }
            let data_crc = crc32c(&b[..data_len]);
            let data_crc_z = crc32c(&b);
            let Ok(stored) = self.read_tag(tags, data_lp) else {
                return;
            };

            if stored == data_crc_z {
                return;
            }
            if stored == data_crc {
                warn!(%path, offset = data_lp * PAGE_SIZE_U64, "resetting tag for page to zero-extended");
                let _ = self.write_tags(tags, &[data_crc_z], data_lp);
                return;
            }
            warn!(
                %path,
                page = data_lp,
                len = data_len,
                computed = %format!("{data_crc:08x}"),
                stored = %format!("{stored:08x}"),
                "checksum error (ignoring)"
            );
        } else if tag_size > 0 && tag_lp < data_lp {
            // The data file has pages beyond the tracked length. The last
            // tracked page must be tagged for its tracked bytes only.
            if read_max(fd, &mut b, tag_lp * PAGE_SIZE_U64, 0)
                .inspect_err(|err| warn!(%path, page = tag_lp, error = %err, "error reading page"))
                .is_err()
            {
                return;
            }
            let tag_crc = crc32c(&b[..tag_len]);
            let tag_crc_z = crc32c(&b);
            let ext_is_zero = b[tag_len..].iter().all(|&x| x == 0);
            let Ok(stored) = self.read_tag(tags, tag_lp) else {
                return;
            };

            if stored == tag_crc {
                return;
            }
            if stored == tag_crc_z && ext_is_zero {
                warn!(%path, offset = tag_lp * PAGE_SIZE_U64, "resetting tag for page to not zero-extended");
                let _ = self.write_tags(tags, &[tag_crc], tag_lp);
                return;
            }
            warn!(
                %path,
                page = tag_lp,
                len = tag_len,
                computed = %format!("{tag_crc:08x}"),
                stored = %format!("{stored:08x}"),
                ext_is_zero,
                "checksum error (ignoring)"
            );
        }
    }
}
