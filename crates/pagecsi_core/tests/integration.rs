//! Integration tests for checksummed files over the storage backends.

use pagecsi_core::crc::{calc_pages, crc32c};
use pagecsi_core::tagstore::{HEADER_SIZE, MAGIC};
use pagecsi_core::{
    CsiConfig, CsiError, CsiStore, PgOptions, ReadChunk, TagHeader, VerificationStatus,
    WriteChunk, PAGE_SIZE,
};
use pagecsi_storage::{FileBackend, InMemoryBackend, OpenFlags, StorageBackend};
use std::path::Path;
use std::sync::Arc;

const DATA: &str = "/dir/data.bin";
const TAGS: &str = "/dir/data.bin.pgtags";

fn rw_create() -> OpenFlags {
    OpenFlags::read_write().create(true)
}

fn memory_store(config: CsiConfig) -> (Arc<InMemoryBackend>, CsiStore) {
    let backend = Arc::new(InMemoryBackend::new());
    let store = CsiStore::new(backend.clone(), config);
    (backend, store)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed) ^ ((i >> 9) as u8))
        .collect()
}

fn write_and_close(store: &CsiStore, data: &[u8]) {
    let file = store.open(Path::new(DATA), rw_create()).unwrap();
    file.write(data, 0).unwrap();
    file.close().unwrap();
}

#[test]
fn file_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsiStore::new(Arc::new(FileBackend::new(dir.path())), CsiConfig::default());
    let data = pattern(3 * PAGE_SIZE + 17, 1);

    let file = store.open(Path::new("b.dat"), rw_create()).unwrap();
    file.write(&data, 0).unwrap();
    file.fsync().unwrap();
    file.close().unwrap();
    assert!(dir.path().join("b.dat.pgtags").exists());

    let file = store
        .open(Path::new("b.dat"), OpenFlags::read_only())
        .unwrap();
    let mut buf = vec![0u8; data.len()];
    let mut csvec = vec![0u32; 4];
    let n = file
        .pg_read(&mut buf, 0, Some(&mut csvec[..]), PgOptions::VERIFY)
        .unwrap();
    assert_eq!(n, data.len());
    assert_eq!(buf, data);

    let mut expected = vec![0u32; 4];
    calc_pages(&data, &mut expected);
    assert_eq!(csvec, expected);
}

#[test]
fn handles_share_one_tag_file() {
    let (_, store) = memory_store(CsiConfig::default());
    let a = store.open(Path::new(DATA), rw_create()).unwrap();
    let b = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap();
    assert_eq!(store.open_files(), 1);

    a.write(&pattern(5000, 2), 0).unwrap();
    let mut buf = vec![0u8; 5000];
    assert_eq!(b.read(&mut buf, 0).unwrap(), 5000);
    assert_eq!(b.len().unwrap(), 5000);

    a.close().unwrap();
    assert_eq!(store.open_files(), 1);
    drop(b);
    assert_eq!(store.open_files(), 0);
}

#[test]
fn path_spellings_share_one_engine() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsiStore::new(Arc::new(FileBackend::new(dir.path())), CsiConfig::default());
    let (a, b) = (pattern(100, 30), pattern(100, 31));

    let first = store.open(Path::new("/d.bin"), rw_create()).unwrap();
    let second = store.open(Path::new("d.bin"), rw_create()).unwrap();
    let third = store.open(Path::new("./x/../d.bin"), OpenFlags::read_only()).unwrap();
    assert_eq!(store.open_files(), 1);

    first.write(&a, 0).unwrap();
    second.write(&b, 100).unwrap();

    let mut buf = vec![0u8; 200];
    assert_eq!(first.read(&mut buf, 0).unwrap(), 200);
    assert_eq!(&buf[..100], &a[..]);
    assert_eq!(&buf[100..], &b[..]);
    assert_eq!(third.len().unwrap(), 200);

    drop((first, second, third));
    assert_eq!(store.open_files(), 0);
}

#[test]
fn stores_over_one_directory_share_engines() {
    let dir = tempfile::tempdir().unwrap();
    let outer = CsiStore::new(Arc::new(FileBackend::new(dir.path())), CsiConfig::default());
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let inner = CsiStore::new(
        Arc::new(FileBackend::new(dir.path().join("sub"))),
        CsiConfig::default(),
    );

    let a = outer.open(Path::new("sub/f"), rw_create()).unwrap();
    a.write(&pattern(5000, 32), 0).unwrap();

    // Truncating a file another store has open would deadlock.
    let err = inner
        .open(Path::new("f"), OpenFlags::read_write().truncate(true))
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EDEADLK);
    assert_eq!(inner.open_files(), 0);

    let b = inner.open(Path::new("/f"), OpenFlags::read_write()).unwrap();
    b.write(&pattern(100, 33), 5000).unwrap();
    assert_eq!(a.len().unwrap(), 5100);

    let mut buf = vec![0u8; 5100];
    assert_eq!(a.read(&mut buf, 0).unwrap(), 5100);
    assert_eq!(&buf[5000..], &pattern(100, 33)[..]);
}

#[test]
fn memory_path_spellings_share_one_engine() {
    let (_, store) = memory_store(CsiConfig::default());
    let first = store.open(Path::new("/dir/data.bin"), rw_create()).unwrap();
    let second = store
        .open(Path::new("dir/./data.bin"), OpenFlags::read_write())
        .unwrap();
    assert_eq!(store.open_files(), 1);

    first.write(&pattern(3000, 34), 0).unwrap();
    second.write(&pattern(3000, 35), 3000).unwrap();
    let mut buf = vec![0u8; 6000];
    assert_eq!(first.read(&mut buf, 0).unwrap(), 6000);
    assert_eq!(&buf[3000..], &pattern(3000, 35)[..]);
}

#[test]
fn tag_files_are_not_directly_accessible() {
    let (_, store) = memory_store(CsiConfig::default());
    write_and_close(&store, b"abc");

    let err = store.open(Path::new(TAGS), OpenFlags::read_only()).unwrap_err();
    assert!(matches!(err, CsiError::IsTagFile { .. }));
    assert_eq!(err.to_errno(), libc::ENOENT);

    let err = store.open(Path::new(TAGS), rw_create()).unwrap_err();
    assert_eq!(err.to_errno(), libc::EACCES);
}

#[test]
fn truncating_open_file_would_deadlock() {
    let (_, store) = memory_store(CsiConfig::default());
    let _open = store.open(Path::new(DATA), rw_create()).unwrap();

    let err = store
        .open(Path::new(DATA), OpenFlags::read_write().truncate(true))
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EDEADLK);
    assert_eq!(store.open_files(), 1);
}

#[test]
fn read_only_tag_file_refuses_writers() {
    let (backend, store) = memory_store(CsiConfig::default());
    write_and_close(&store, &pattern(6000, 3));

    backend.set_read_only(true);
    let reader = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; 6000];
    assert_eq!(reader.read(&mut buf, 0).unwrap(), 6000);

    // The shared tag file stays read-only while the reader holds it.
    backend.set_read_only(false);
    let err = store.open(Path::new(DATA), OpenFlags::read_write()).unwrap_err();
    assert_eq!(err.to_errno(), libc::EACCES);

    drop(reader);
    let writer = store.open(Path::new(DATA), OpenFlags::read_write()).unwrap();
    writer.write(b"x", 0).unwrap();
}

#[test]
fn write_through_read_only_handle_is_refused() {
    let (_, store) = memory_store(CsiConfig::default());
    write_and_close(&store, b"abc");

    let file = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap();
    assert!(file.is_read_only());
    let err = file.write(b"z", 0).unwrap_err();
    assert_eq!(err.to_errno(), libc::EBADF);
    assert_eq!(file.ftruncate(0).unwrap_err().to_errno(), libc::EBADF);
}

#[test]
fn missing_tags_open_untracked_when_allowed() {
    let (backend, store) = memory_store(CsiConfig::default());
    let data = pattern(5000, 4);
    backend.set_contents(Path::new(DATA), data.clone());

    let file = store.open(Path::new(DATA), OpenFlags::read_write()).unwrap();
    assert!(!file.is_tracked());
    assert_eq!(file.verification_status(), VerificationStatus::Untracked);

    let mut buf = vec![0u8; 5000];
    let mut csvec = vec![0u32; 2];
    file.pg_read(&mut buf, 0, Some(&mut csvec[..]), PgOptions::VERIFY)
        .unwrap();
    assert_eq!(buf, data);
    assert_eq!(csvec[1], crc32c(&data[PAGE_SIZE..]));

    file.write(b"untracked", 10).unwrap();
    assert!(!backend.exists(Path::new(TAGS)));
}

#[test]
fn missing_tags_rejected_when_required() {
    let (backend, store) = memory_store(CsiConfig::default().allow_missing_tags(false));
    backend.set_contents(Path::new(DATA), vec![1u8; 100]);

    let err = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap_err();
    assert!(matches!(err, CsiError::MissingTags { .. }));
    assert_eq!(err.to_errno(), libc::EDOM);
    assert_eq!(store.open_files(), 0);
}

#[test]
fn corrupt_header_fails_open() {
    let (backend, store) = memory_store(CsiConfig::default());
    write_and_close(&store, &pattern(100, 5));

    let mut raw = backend.contents(Path::new(TAGS)).unwrap();
    raw[6] ^= 0x40;
    backend.set_contents(Path::new(TAGS), raw);

    let err = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap_err();
    assert!(matches!(err, CsiError::CorruptHeader { .. }));
    assert!(err.is_integrity_error());
}

#[test]
fn byte_swapped_tag_file_is_used_in_place() {
    let (backend, store) = memory_store(CsiConfig::default());
    let data = pattern(5000, 6);
    write_and_close(&store, &data);

    // Rewrite the tag file as a host of the other byte order would have.
    let raw = backend.contents(Path::new(TAGS)).unwrap();
    let header = TagHeader::decode(raw[..20].try_into().unwrap())
        .unwrap()
        .unwrap();
    let mut swapped = TagHeader {
        swapped: true,
        ..header
    }
    .encode()
    .to_vec();
    for tag in raw[HEADER_SIZE as usize..].chunks_exact(4) {
        swapped.extend(tag.iter().rev());
    }
    backend.set_contents(Path::new(TAGS), swapped);

    let file = store.open(Path::new(DATA), OpenFlags::read_write()).unwrap();
    let mut buf = vec![0u8; 5000];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 5000);
    assert_eq!(buf, data);

    let tail = pattern(100, 7);
    file.write(&tail, 5000).unwrap();
    file.close().unwrap();

    let raw = backend.contents(Path::new(TAGS)).unwrap();
    assert_eq!(&raw[..4], &MAGIC.swap_bytes().to_ne_bytes());
    let page1 = u32::from_ne_bytes(raw[24..28].try_into().unwrap()).swap_bytes();
    let mut expected = data[PAGE_SIZE..].to_vec();
    expected.extend_from_slice(&tail);
    assert_eq!(page1, crc32c(&expected));
}

#[test]
fn vectored_io_round_trip() {
    let (_, store) = memory_store(CsiConfig::default());
    let file = store.open(Path::new(DATA), rw_create()).unwrap();
    let (a, b) = (pattern(3000, 8), pattern(5000, 9));

    let written = file
        .write_v(&[
            WriteChunk { offset: 0, buf: &a },
            WriteChunk {
                offset: 3000,
                buf: &b,
            },
        ])
        .unwrap();
    assert_eq!(written, 8000);

    let (mut ra, mut rb) = (vec![0u8; 100], vec![0u8; 4096]);
    let read = file
        .read_v(&mut [
            ReadChunk {
                offset: 2950,
                buf: &mut ra,
            },
            ReadChunk {
                offset: 3904,
                buf: &mut rb,
            },
        ])
        .unwrap();
    assert_eq!(read, 4196);
    assert_eq!(&ra[..50], &a[2950..]);
    assert_eq!(&ra[50..], &b[..50]);
    assert_eq!(&rb[..], &b[904..5000]);

    let mut past = vec![0u8; 10];
    let err = file
        .read_v(&mut [ReadChunk {
            offset: 7995,
            buf: &mut past,
        }])
        .unwrap_err();
    assert!(matches!(err, CsiError::ShortRead { actual: 5, .. }));
}

fn assert_reads_back(store: &CsiStore, expected: &[u8]) {
    let file = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; expected.len()];
    let mut csvec = vec![0u32; expected.len().div_ceil(PAGE_SIZE)];
    let n = file
        .pg_read(&mut buf, 0, Some(&mut csvec[..]), PgOptions::VERIFY)
        .unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(buf, expected);

    let mut tags = vec![0u32; csvec.len()];
    calc_pages(expected, &mut tags);
    assert_eq!(csvec, tags);
}

#[test]
fn write_v_chunks_sharing_a_page() {
    let (_, store) = memory_store(CsiConfig::default());
    let (a, b) = (pattern(3000, 20), pattern(5000, 21));

    let file = store.open(Path::new(DATA), rw_create()).unwrap();
    file.write_v(&[
        WriteChunk { offset: 0, buf: &a },
        WriteChunk {
            offset: 3000,
            buf: &b,
        },
    ])
    .unwrap();
    drop(file);

    let mut expected = a.clone();
    expected.extend_from_slice(&b);
    assert_reads_back(&store, &expected);
}

#[test]
fn write_v_out_of_order_chunks_on_empty_file() {
    let (_, store) = memory_store(CsiConfig::default());
    let (a, b) = (pattern(3000, 22), pattern(5000, 23));

    let file = store.open(Path::new(DATA), rw_create()).unwrap();
    file.write_v(&[
        WriteChunk {
            offset: 3000,
            buf: &b,
        },
        WriteChunk { offset: 0, buf: &a },
    ])
    .unwrap();
    drop(file);

    let mut expected = a.clone();
    expected.extend_from_slice(&b);
    assert_reads_back(&store, &expected);
}

#[test]
fn write_v_past_end_of_file() {
    let (_, store) = memory_store(CsiConfig::default());
    let head = pattern(1000, 24);
    write_and_close(&store, &head);

    let (a, b, c) = (pattern(1000, 25), pattern(2000, 26), pattern(100, 27));
    let file = store.open(Path::new(DATA), OpenFlags::read_write()).unwrap();
    let written = file
        .write_v(&[
            WriteChunk {
                offset: 6000,
                buf: &a,
            },
            WriteChunk {
                offset: 7000,
                buf: &b,
            },
            WriteChunk {
                offset: 9000,
                buf: &c,
            },
        ])
        .unwrap();
    assert_eq!(written, 3100);
    assert_eq!(file.len().unwrap(), 9100);
    drop(file);

    let mut expected = head.clone();
    expected.resize(6000, 0);
    expected.extend_from_slice(&a);
    expected.extend_from_slice(&b);
    expected.extend_from_slice(&c);
    assert_reads_back(&store, &expected);
}

#[test]
fn pg_write_with_bad_checksums_changes_nothing() {
    let (backend, store) = memory_store(CsiConfig::default());
    let file = store.open(Path::new(DATA), rw_create()).unwrap();
    let data = pattern(2 * PAGE_SIZE, 10);

    let mut csvec = vec![0u32; 2];
    calc_pages(&data, &mut csvec);
    csvec[1] ^= 1;
    let err = file
        .pg_write(&data, 0, Some(&mut csvec[..]), PgOptions::VERIFY)
        .unwrap_err();
    assert!(matches!(err, CsiError::ChecksumMismatch { page: 1, .. }));
    assert_eq!(backend.contents(Path::new(DATA)).unwrap(), Vec::<u8>::new());
    assert_eq!(file.len().unwrap(), 0);

    csvec[1] ^= 1;
    file.pg_write(&data, 0, Some(&mut csvec[..]), PgOptions::VERIFY)
        .unwrap();
    assert_eq!(file.verification_status(), VerificationStatus::Verified);
}

#[test]
fn store_truncate_keeps_tags_in_step() {
    let (backend, store) = memory_store(CsiConfig::default());
    let data = pattern(3 * PAGE_SIZE, 11);
    write_and_close(&store, &data);

    store.truncate(Path::new(DATA), 5000).unwrap();
    assert_eq!(backend.contents(Path::new(DATA)).unwrap().len(), 5000);
    assert_eq!(
        backend.contents(Path::new(TAGS)).unwrap().len(),
        HEADER_SIZE as usize + 8
    );

    let file = store.open(Path::new(DATA), OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; 6000];
    assert_eq!(file.read(&mut buf, 0).unwrap(), 5000);
    assert_eq!(&buf[..5000], &data[..5000]);
}

#[test]
fn tag_prefix_mirrors_data_tree() {
    let (backend, store) = memory_store(CsiConfig::default().tag_prefix("/tags"));
    let file = store.open(Path::new("/x/y.dat"), rw_create()).unwrap();
    file.write(b"prefixed", 0).unwrap();
    file.close().unwrap();

    assert!(backend.exists(Path::new("/tags/x/y.dat.pgtags")));
    assert!(backend.dir_exists(Path::new("/tags/x")));
    assert!(store.is_tag_file(Path::new("/tags/x/y.dat.pgtags")));
    assert!(!store.is_tag_file(Path::new("/x/y.dat")));
}

#[test]
fn exclusive_create_starts_verified() {
    let (_, store) = memory_store(CsiConfig::default());
    let file = store
        .open(Path::new(DATA), rw_create().exclusive(true))
        .unwrap();
    assert_eq!(file.verification_status(), VerificationStatus::Verified);
    assert!(file.is_empty().unwrap());

    file.write(b"derived", 0).unwrap();
    assert_eq!(file.verification_status(), VerificationStatus::Unverified);
    drop(file);

    let err = store
        .open(Path::new(DATA), rw_create().exclusive(true))
        .unwrap_err();
    assert_eq!(err.to_errno(), libc::EEXIST);
}
