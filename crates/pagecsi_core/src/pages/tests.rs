use super::*;
use crate::crc::{combine, crc_zero_page};
use pagecsi_storage::{write_fully, InMemoryBackend};
use std::thread;

const DATA: &str = "/data";
const TAGS: &str = "/data.pgtags";

fn rw() -> OpenFlags {
    OpenFlags::read_write().create(true)
}

struct Fixture {
    backend: InMemoryBackend,
    data: Box<dyn DataFile>,
    pages: Arc<Pages>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(&CsiConfig::default())
    }

    fn with_config(config: &CsiConfig) -> Self {
        let backend = InMemoryBackend::new();
        let data = backend.open(Path::new(DATA), rw()).unwrap();
        let pages = Pages::open(&backend, Path::new(TAGS), 0, rw(), config).unwrap();
        Self {
            backend,
            data,
            pages: Arc::new(pages),
        }
    }

    /// Reopens the engine over the current contents, as after a restart.
    fn reopen(&mut self, config: &CsiConfig) {
        self.pages.close().unwrap();
        let len = self.data.len().unwrap();
        let pages = Pages::open(&self.backend, Path::new(TAGS), len, rw(), config).unwrap();
        pages.basic_consistency_check(self.data.as_ref());
        self.pages = Arc::new(pages);
    }

    fn write(&self, offset: u64, buf: &[u8]) -> CsiResult<()> {
        write_with(&self.pages, self.data.as_ref(), offset, buf)
    }

    fn read(&self, offset: u64, len: usize) -> CsiResult<Vec<u8>> {
        let guard = self
            .pages
            .lock_tracking_len(offset, offset + len as u64, true);
        let mut buf = vec![0u8; len];
        let n = read_fully(self.data.as_ref(), &mut buf, offset)?;
        buf.truncate(n);
        self.pages
            .verify_range(self.data.as_ref(), &buf, offset, &guard)?;
        Ok(buf)
    }

    fn truncate(&self, len: u64) -> CsiResult<()> {
        let mut guard = self.pages.lock_tracking_len(len, u64::MAX, false);
        self.pages.truncate(self.data.as_ref(), len, &mut guard)?;
        self.data.set_len(len)?;
        Ok(())
    }

    fn tag(&self, page: u64) -> u32 {
        self.pages.tags().unwrap().read_tag(page).unwrap()
    }

    fn set_tag(&self, page: u64, tag: u32) {
        self.pages.tags().unwrap().write_tags(&[tag], page).unwrap();
    }

    fn contents(&self) -> Vec<u8> {
        self.backend.contents(Path::new(DATA)).unwrap()
    }

    fn tracked(&self) -> u64 {
        self.pages.tracked_sizes_get(false).unwrap().tagged
    }
}

fn write_with(pages: &Arc<Pages>, fd: &dyn DataFile, offset: u64, buf: &[u8]) -> CsiResult<()> {
    let mut guard = pages.lock_tracking_len(offset, offset + buf.len() as u64, false);
    pages.update_range(fd, buf, offset, &mut guard)?;
    write_fully(fd, buf, offset)?;
    Ok(())
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[test]
fn unaligned_write_into_empty_file() {
    let fx = Fixture::new();
    let buf = pattern(10_000, 1);
    fx.write(2000, &buf).unwrap();

    assert_eq!(fx.tracked(), 12_000);
    let contents = fx.contents();
    assert_eq!(contents.len(), 12_000);
    assert_eq!(fx.tag(0), crc32c(&contents[..4096]));
    assert_eq!(fx.tag(1), crc32c(&contents[4096..8192]));
    assert_eq!(fx.tag(2), crc32c(&contents[8192..]));

    let back = fx.read(0, 12_000).unwrap();
    assert_eq!(&back[2000..], &buf[..]);
    assert_eq!(
        fx.pages.verification_status(),
        VerificationStatus::Unverified
    );
}

#[test]
fn truncate_to_zero_then_rewrite() {
    let fx = Fixture::new();
    fx.write(0, &pattern(9000, 2)).unwrap();
    fx.truncate(0).unwrap();
    assert_eq!(fx.tracked(), 0);
    assert_eq!(
        fx.pages.verification_status(),
        VerificationStatus::Verified
    );

    let buf = pattern(5000, 3);
    fx.write(0, &buf).unwrap();
    assert_eq!(fx.tag(0), crc32c(&buf[..4096]));
    assert_eq!(fx.tag(1), crc32c(&buf[4096..]));
    assert_eq!(fx.read(0, 5000).unwrap(), buf);
}

#[test]
fn write_past_end_fills_hole_with_zero_page_tags() {
    let fx = Fixture::new();
    fx.write(0, &pattern(100, 4)).unwrap();
    fx.write(3 * 4096 + 5, b"0123456789").unwrap();

    let contents = fx.contents();
    assert_eq!(fx.tracked(), 3 * 4096 + 15);
    assert_eq!(fx.tag(0), crc32c(&contents[..4096]));
    assert_eq!(fx.tag(1), crc_zero_page());
    assert_eq!(fx.tag(2), crc_zero_page());
    assert_eq!(fx.tag(3), crc32c(&contents[3 * 4096..]));
    fx.read(0, contents.len()).unwrap();
}

#[test]
fn hole_without_fill_leaves_tags_for_later_writes() {
    let fx = Fixture::with_config(&CsiConfig::default().fill_holes(false));
    fx.write(0, &pattern(100, 5)).unwrap();
    fx.write(2 * 4096, &pattern(4096, 6)).unwrap();

    let contents = fx.contents();
    assert_eq!(fx.tag(0), crc32c(&contents[..4096]));
    assert_eq!(fx.tag(1), 0);
    assert_eq!(fx.tag(2), crc32c(&contents[2 * 4096..]));
}

#[test]
fn flipped_byte_fails_verification() {
    let fx = Fixture::new();
    fx.write(0, &pattern(8192, 7)).unwrap();

    let mut contents = fx.contents();
    contents[5000] ^= 0x01;
    fx.backend.set_contents(Path::new(DATA), contents);

    let err = fx.read(0, 8192).unwrap_err();
    assert!(matches!(err, CsiError::ChecksumMismatch { page: 1, .. }));
    assert_eq!(err.to_errno(), libc::EDOM);

    // The first page is untouched.
    fx.read(0, 4096).unwrap();
}

#[test]
fn partial_overwrite_checks_existing_bytes() {
    let fx = Fixture::new();
    fx.write(0, &pattern(8192, 8)).unwrap();

    let mut contents = fx.contents();
    contents[10] ^= 0xff;
    fx.backend.set_contents(Path::new(DATA), contents);

    let err = fx.write(100, b"abc").unwrap_err();
    assert!(err.is_integrity_error());
}

#[test]
fn partial_overwrite_inside_data() {
    let fx = Fixture::new();
    let mut expect = pattern(3 * 4096, 9);
    fx.write(0, &expect).unwrap();

    let patch = pattern(5000, 10);
    fx.write(3000, &patch).unwrap();
    expect[3000..8000].copy_from_slice(&patch);

    assert_eq!(fx.contents(), expect);
    for page in 0..3u64 {
        let at = page as usize * 4096;
        assert_eq!(fx.tag(page), crc32c(&expect[at..at + 4096]));
    }
    assert_eq!(fx.read(1000, 9000).unwrap(), &expect[1000..10_000]);
}

#[test]
fn read_beyond_tracked_length_is_inconsistent() {
    let fx = Fixture::new();
    fx.write(0, &pattern(1000, 11)).unwrap();
    fx.data.set_len(2000).unwrap();

    let err = fx.read(0, 2000).unwrap_err();
    assert!(matches!(err, CsiError::Inconsistent { .. }));
}

#[test]
fn fetch_adjusts_partial_page_checksums() {
    let fx = Fixture::new();
    let data = pattern(3 * 4096, 12);
    fx.write(0, &data).unwrap();

    let guard = fx.pages.lock_tracking_len(100, 5100, true);
    let buf = &data[100..5100];
    for opts in [PgOptions::NONE, PgOptions::VERIFY] {
        let mut cs = [0u32; 2];
        fx.pages
            .fetch_range(fx.data.as_ref(), buf, 100, Some(&mut cs[..]), opts, &guard)
            .unwrap();
        assert_eq!(cs[0], crc32c(&data[100..4096]));
        assert_eq!(cs[1], crc32c(&data[4096..5100]));
    }

    let mut cs = [0u32; 1];
    fx.pages
        .fetch_range(
            fx.data.as_ref(),
            &data[9000..9500],
            9000,
            Some(&mut cs[..]),
            PgOptions::NONE,
            &guard,
        )
        .unwrap();
    assert_eq!(cs[0], crc32c(&data[9000..9500]));
}

#[test]
fn fetch_detects_caller_buffer_mismatch() {
    let fx = Fixture::new();
    let data = pattern(8192, 13);
    fx.write(0, &data).unwrap();

    let guard = fx.pages.lock_tracking_len(10, 110, true);
    let mut buf = data[10..110].to_vec();
    buf[3] ^= 1;
    let err = fx
        .pages
        .fetch_range(fx.data.as_ref(), &buf, 10, None, PgOptions::VERIFY, &guard)
        .unwrap_err();
    assert!(matches!(err, CsiError::ByteMismatch { offset: 13, .. }));
}

#[test]
fn fetch_rejects_short_checksum_vector() {
    let fx = Fixture::new();
    fx.write(0, &pattern(8192, 14)).unwrap();
    let guard = fx.pages.lock_tracking_len(0, 8192, true);
    let mut cs = [0u32; 1];
    let err = fx
        .pages
        .fetch_range(
            fx.data.as_ref(),
            &pattern(8192, 14),
            0,
            Some(&mut cs[..]),
            PgOptions::NONE,
            &guard,
        )
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EINVAL);
}

#[test]
fn pg_do_calc_splits_at_page_boundaries() {
    let buf = pattern(6000, 15);
    let mut cs = [0u32; 3];
    Pages::pg_do_calc(&buf, 4000, &mut cs);
    assert_eq!(cs[0], crc32c(&buf[..96]));
    assert_eq!(cs[1], crc32c(&buf[96..4192]));
    assert_eq!(cs[2], crc32c(&buf[4192..]));
    assert_eq!(combine(cs[0], cs[1], 4096), crc32c(&buf[..4192]));
}

#[test]
fn prelock_check_reports_bad_page() {
    let buf = pattern(9000, 16);
    let mut cs = [0u32; 3];
    Pages::pg_do_calc(&buf, 0, &mut cs);
    Pages::pg_write_prelock_check(&buf, 0, Some(&cs[..]), PgOptions::VERIFY).unwrap();

    cs[2] ^= 1;
    Pages::pg_write_prelock_check(&buf, 0, Some(&cs[..]), PgOptions::NONE).unwrap();
    let err = Pages::pg_write_prelock_check(&buf, 0, Some(&cs[..]), PgOptions::VERIFY).unwrap_err();
    assert!(matches!(
        err,
        CsiError::ChecksumMismatch {
            page: 2,
            len: 808,
            ..
        }
    ));
}

#[test]
fn store_with_supplied_checksums_stays_verified() {
    let fx = Fixture::new();
    let buf = pattern(10_000, 17);
    let mut cs = [0u32; 3];
    Pages::pg_do_calc(&buf, 0, &mut cs);

    let mut guard = fx.pages.lock_tracking_len(0, 10_000, false);
    fx.pages
        .store_range(fx.data.as_ref(), &buf, 0, Some(&mut cs[..]), PgOptions::NONE, &mut guard)
        .unwrap();
    write_fully(fx.data.as_ref(), &buf, 0).unwrap();
    drop(guard);

    assert_eq!(fx.pages.verification_status(), VerificationStatus::Verified);
    assert_eq!(fx.tag(2), crc32c(&buf[8192..]));
    fx.read(0, 10_000).unwrap();
}

#[test]
fn store_with_do_calc_fills_vector() {
    let fx = Fixture::new();
    let buf = pattern(5000, 18);
    let mut cs = [0u32; 2];
    let mut guard = fx.pages.lock_tracking_len(0, 5000, false);
    fx.pages
        .store_range(
            fx.data.as_ref(),
            &buf,
            0,
            Some(&mut cs[..]),
            PgOptions::DO_CALC,
            &mut guard,
        )
        .unwrap();
    assert_eq!(cs, [crc32c(&buf[..4096]), crc32c(&buf[4096..])]);
}

#[test]
fn pg_extend_past_unaligned_end_can_be_disabled() {
    let fx = Fixture::with_config(&CsiConfig::default().disable_pg_extend(true));
    fx.write(0, &pattern(100, 19)).unwrap();

    let buf = pattern(10, 20);
    let mut guard = fx.pages.lock_tracking_len(100, 110, false);
    let err = fx
        .pages
        .store_range(fx.data.as_ref(), &buf, 100, None, PgOptions::NONE, &mut guard)
        .unwrap_err();
    assert!(matches!(err, CsiError::PgExtendDisallowed));
    assert_eq!(err.to_errno(), libc::ESPIPE);
}

#[test]
fn truncate_shrink_inside_page() {
    let fx = Fixture::new();
    let data = pattern(10_000, 21);
    fx.write(0, &data).unwrap();
    fx.truncate(5000).unwrap();

    assert_eq!(fx.tracked(), 5000);
    assert_eq!(fx.tag(1), crc32c(&data[4096..5000]));
    assert_eq!(fx.read(0, 5000).unwrap(), &data[..5000]);
}

#[test]
fn truncate_grow_fills_hole() {
    let fx = Fixture::new();
    let data = pattern(100, 22);
    fx.write(0, &data).unwrap();
    fx.truncate(10_000).unwrap();

    assert_eq!(fx.tracked(), 10_000);
    assert_eq!(fx.tag(1), crc_zero_page());
    assert_eq!(fx.tag(2), crc32c(&[0u8; 1808]));
    let back = fx.read(0, 10_000).unwrap();
    assert_eq!(&back[..100], &data[..]);
    assert!(back[100..].iter().all(|&b| b == 0));
}

#[test]
fn truncate_detects_corrupt_cut_page() {
    let fx = Fixture::new();
    fx.write(0, &pattern(10_000, 23)).unwrap();
    let mut contents = fx.contents();
    contents[4100] ^= 1;
    fx.backend.set_contents(Path::new(DATA), contents);

    assert!(fx.truncate(5000).unwrap_err().is_integrity_error());
}

#[test]
fn loose_append_recovers_unrecorded_length() {
    let mut fx = Fixture::new();
    let data = pattern(120, 24);
    fx.write(0, &data[..100]).unwrap();

    // Tag and data of a 20-byte append reached disk, the header did not.
    write_fully(fx.data.as_ref(), &data[100..], 100).unwrap();
    fx.set_tag(0, crc32c(&data));
    fx.reopen(&CsiConfig::default());
    assert_eq!(fx.tracked(), 100);
    assert!(fx.pages.is_loose());

    fx.write(100, &data[100..]).unwrap();
    assert_eq!(fx.tag(0), crc32c(&data));
    assert_eq!(fx.read(0, 120).unwrap(), data);
}

#[test]
fn loose_append_recovers_missing_data() {
    let mut fx = Fixture::new();
    let data = pattern(120, 25);
    fx.write(0, &data[..100]).unwrap();

    // Only the tag of a 20-byte append reached disk.
    fx.set_tag(0, crc32c(&data));
    fx.reopen(&CsiConfig::default());

    fx.write(100, &data[100..]).unwrap();
    assert_eq!(fx.read(0, 120).unwrap(), data);
}

#[test]
fn strict_append_does_not_recover() {
    let mut fx = Fixture::new();
    let data = pattern(120, 26);
    fx.write(0, &data[..100]).unwrap();
    fx.set_tag(0, crc32c(&data));
    fx.reopen(&CsiConfig::default().loose_write(false));
    assert!(!fx.pages.is_loose());

    fx.write(100, &data[100..]).unwrap();
    assert!(fx.read(0, 120).unwrap_err().is_integrity_error());
}

#[test]
fn loose_overwrite_recovers_pending_write() {
    let mut fx = Fixture::new();
    let mut data = pattern(8192, 27);
    fx.write(0, &data).unwrap();

    // The tag of an overwrite reached disk, its data did not.
    let patch = pattern(50, 28);
    let mut page = data[..4096].to_vec();
    page[1000..1050].copy_from_slice(&patch);
    fx.set_tag(0, crc32c(&page));
    fx.reopen(&CsiConfig::default());

    fx.write(1000, &patch).unwrap();
    data[1000..1050].copy_from_slice(&patch);
    assert_eq!(fx.read(0, 8192).unwrap(), data);
}

#[test]
fn strict_overwrite_rejects_pending_write() {
    let mut fx = Fixture::new();
    let data = pattern(8192, 32);
    fx.write(0, &data).unwrap();

    let patch = pattern(50, 33);
    let mut page = data[..4096].to_vec();
    page[1000..1050].copy_from_slice(&patch);
    fx.set_tag(0, crc32c(&page));
    fx.reopen(&CsiConfig::default().loose_write(false));

    assert!(fx.write(1000, &patch).unwrap_err().is_integrity_error());
}

#[test]
fn consistency_check_unextends_last_tracked_tag() {
    let mut fx = Fixture::new();
    let data = pattern(100, 29);
    fx.write(0, &data).unwrap();

    // Tag zero-extended for a hole whose header update was lost.
    let mut page = vec![0u8; 4096];
    page[..100].copy_from_slice(&data);
    fx.set_tag(0, crc32c(&page));
    fx.data.set_len(5000).unwrap();
    fx.reopen(&CsiConfig::default());

    assert_eq!(fx.tag(0), crc32c(&data));
}

#[test]
fn consistency_check_extends_data_boundary_tag() {
    let mut fx = Fixture::new();
    let data = pattern(100, 30);
    fx.write(0, &data).unwrap();

    // Tracked length raised past the data without the tags catching up.
    fx.pages.lock_set_tracked_size(5000).unwrap();
    fx.set_tag(1, crc_zero_page());
    fx.reopen(&CsiConfig::default());

    let mut page = vec![0u8; 4096];
    page[..100].copy_from_slice(&data);
    assert_eq!(fx.tag(0), crc32c(&page));
}

#[test]
fn untracked_pages_compute_checksums_only() {
    let backend = InMemoryBackend::new();
    let data = backend.open(Path::new(DATA), rw()).unwrap();
    let config = CsiConfig::default();
    let pages = Arc::new(
        Pages::open(&backend, Path::new(TAGS), 0, OpenFlags::read_write(), &config).unwrap(),
    );
    assert!(!pages.is_tracked());
    assert_eq!(pages.verification_status(), VerificationStatus::Untracked);

    let guard = pages.lock_tracking_len(0, 10, true);
    assert!(!guard.is_locked());
    let mut cs = [0u32; 1];
    pages
        .fetch_range(data.as_ref(), b"0123456789", 0, Some(&mut cs[..]), PgOptions::VERIFY, &guard)
        .unwrap();
    assert_eq!(cs[0], crc32c(b"0123456789"));
}

#[test]
fn missing_tags_rejected_when_required() {
    let backend = InMemoryBackend::new();
    let config = CsiConfig::default().allow_missing_tags(false);
    let err = Pages::open(&backend, Path::new(TAGS), 0, OpenFlags::read_write(), &config)
        .unwrap_err();
    assert!(matches!(err, CsiError::MissingTags { .. }));
}

#[test]
fn write_guard_holds_size_slot_until_extended() {
    let fx = Fixture::new();
    fx.write(0, &pattern(100, 31)).unwrap();

    let inside = fx.pages.lock_tracking_len(0, 50, false);
    assert!(!inside.holds_size_slot());
    drop(inside);

    let mut beyond = fx.pages.lock_tracking_len(50, 500, false);
    assert!(beyond.holds_size_slot());
    beyond.unlock_tracking_len();
    assert!(!beyond.holds_size_slot());
    assert!(beyond.is_locked());
}

#[test]
fn concurrent_writers_keep_tags_consistent() {
    let fx = Fixture::new();
    let chunk = 5000usize;
    let writers = 8;

    thread::scope(|s| {
        for i in 0..writers {
            let pages = &fx.pages;
            let fd = fx.data.as_ref();
            s.spawn(move || {
                let buf = pattern(chunk, i as u8);
                write_with(pages, fd, (i * chunk) as u64, &buf).unwrap();
            });
        }
    });

    let total = writers * chunk;
    assert_eq!(fx.tracked(), total as u64);
    let back = fx.read(0, total).unwrap();
    for i in 0..writers {
        assert_eq!(&back[i * chunk..(i + 1) * chunk], &pattern(chunk, i as u8)[..]);
    }
}

#[test]
fn updates_under_one_guard_see_earlier_extension() {
    let fx = Fixture::new();
    let (a, b) = (pattern(3000, 40), pattern(5000, 41));
    let fd = fx.data.as_ref();

    let mut guard = fx.pages.lock_tracking_len(0, 8000, false);
    fx.pages.update_range(fd, &a, 0, &mut guard).unwrap();
    write_fully(fd, &a, 0).unwrap();
    assert_eq!(guard.tracked_sizes().tagged, 3000);

    fx.pages.update_range(fd, &b, 3000, &mut guard).unwrap();
    write_fully(fd, &b, 3000).unwrap();
    assert_eq!(guard.tracked_sizes().tagged, 8000);
    drop(guard);

    let contents = fx.contents();
    assert_eq!(fx.tag(0), crc32c(&contents[..PAGE_SIZE]));
    assert_eq!(fx.tag(1), crc32c(&contents[PAGE_SIZE..]));
    assert_eq!(fx.read(0, 8000).unwrap(), [a, b].concat());
}

mod hole_fill {
    use super::*;
    use crate::crc::pages_for;
    use proptest::prelude::*;

    fn all_tags(fx: &Fixture) -> Vec<u32> {
        let mut tags = vec![0u32; pages_for(fx.tracked()) as usize];
        fx.pages.tags().unwrap().read_tags(&mut tags, 0).unwrap();
        tags
    }

    fn extend(fx: &Fixture, to: u64, by_write: bool) {
        if by_write {
            fx.write(to - 1, &[0xa5]).unwrap();
        } else {
            fx.truncate(to).unwrap();
        }
    }

    fn with_base(base: usize) -> Fixture {
        let fx = Fixture::new();
        if base > 0 {
            fx.write(0, &pattern(base, 42)).unwrap();
        }
        fx
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn extend_truncate_extend_matches_single_extend(
            base in 0usize..3 * PAGE_SIZE,
            gap in 1u64..4 * PAGE_SIZE_U64,
            by_write in any::<bool>(),
        ) {
            let to = base as u64 + gap;

            let once = with_base(base);
            extend(&once, to, by_write);

            let twice = with_base(base);
            extend(&twice, to, by_write);
            twice.truncate(base as u64).unwrap();
            extend(&twice, to, by_write);

            prop_assert_eq!(twice.tracked(), to);
            prop_assert_eq!(once.tracked(), to);
            prop_assert_eq!(twice.contents(), once.contents());
            prop_assert_eq!(all_tags(&twice), all_tags(&once));
            prop_assert!(twice.read(0, to as usize).is_ok());
        }
    }
}
