//! Persistent per-page checksum store.
//!
//! Each data file has a companion tag file holding one CRC32C per page.
//!
//! # File Format
//!
//! ```text
//! ┌──────────┬─────────────────┬───────────┬───────────────┐
//! │ magic(4) │ tracked_len(8)  │ flags(4)  │ header_crc(4) │
//! ├──────────┴─────────────────┴───────────┴───────────────┤
//! │ tag[0](4) │ tag[1](4) │ ...                            │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! - `magic`: byte-order marker, written in the creating host's order
//! - `tracked_len`: length in bytes of the data covered by tags
//! - `flags`: bit 0 set while every tag was verified rather than derived
//!   from written data
//! - `header_crc`: CRC32C of the preceding 16 bytes
//!
//! Every field and every tag uses the byte order of the magic. Files written
//! on a host of the other endianness are read and updated in their own
//! order, never rewritten.

use crate::crc::{crc32c, pages_for, PAGE_SIZE_U64};
use crate::error::{CsiError, CsiResult};
use pagecsi_storage::{read_fully, write_fully, DataFile, OpenFlags, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the tag file header in bytes.
pub const HEADER_SIZE: u64 = 20;

/// Size of one stored tag in bytes.
pub const TAG_SIZE: u64 = 4;

/// Byte-order marker at the start of every tag file.
pub const MAGIC: u32 = 0x3054_4452;

/// Header flag: all tags are independently verified.
pub const FLAG_VERIFIED: u32 = 0x1;

/// Returns the expected tag file length for a tracked data length.
#[must_use]
pub const fn expected_file_len(tracked_len: u64) -> u64 {
    HEADER_SIZE + TAG_SIZE * pages_for(tracked_len)
}

/// A decoded tag file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHeader {
    /// Whether the file's byte order differs from the host's.
    pub swapped: bool,
    /// Tracked data length in bytes.
    pub tracked_len: u64,
    /// Header flags.
    pub flags: u32,
}

impl TagHeader {
    /// Returns true if the verified flag is set.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        self.flags & FLAG_VERIFIED != 0
    }

    /// Encodes the header in its byte order.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let (magic, tracked, flags) = if self.swapped {
            (
                MAGIC.swap_bytes(),
                self.tracked_len.swap_bytes(),
                self.flags.swap_bytes(),
            )
        } else {
            (MAGIC, self.tracked_len, self.flags)
        };

        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&magic.to_ne_bytes());
        buf[4..12].copy_from_slice(&tracked.to_ne_bytes());
        buf[12..16].copy_from_slice(&flags.to_ne_bytes());
        let crc = crc32c(&buf[0..16]);
        let crc = if self.swapped { crc.swap_bytes() } else { crc };
        buf[16..20].copy_from_slice(&crc.to_ne_bytes());
        buf
    }

    /// Decodes a header.
    ///
    /// Returns `Ok(None)` if the magic is not recognized in either byte
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `CorruptHeader` if the magic matches but the header
    /// checksum does not.
    pub fn decode(buf: &[u8; HEADER_SIZE as usize]) -> CsiResult<Option<Self>> {
        let u32_at = |at: usize| u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let swapped = match u32_at(0) {
            m if m == MAGIC => false,
            m if m == MAGIC.swap_bytes() => true,
            _ => return Ok(None),
        };
        let fix32 = |v: u32| if swapped { v.swap_bytes() } else { v };

        let mut tracked = [0u8; 8];
        tracked.copy_from_slice(&buf[4..12]);
        let tracked = u64::from_ne_bytes(tracked);
        let tracked_len = if swapped { tracked.swap_bytes() } else { tracked };

        let stored_crc = fix32(u32_at(16));
        let computed = crc32c(&buf[0..16]);
        if stored_crc != computed {
            return Err(CsiError::corrupt_header(format!(
                "header checksum {computed:08x} does not match stored {stored_crc:08x}"
            )));
        }

        Ok(Some(Self {
            swapped,
            tracked_len,
            flags: fix32(u32_at(12)),
        }))
    }
}

/// Reads and decodes the header of an open tag file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the header is corrupt.
pub fn read_header(file: &dyn DataFile) -> CsiResult<Option<TagHeader>> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    if read_fully(file, &mut buf, 0)? < buf.len() {
        return Ok(None);
    }
    TagHeader::decode(&buf)
}

struct OpenTags {
    file: Box<dyn DataFile>,
    writable: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sizes {
    header: TagHeader,
    data_len: u64,
}

/// An open tag file.
///
/// Tag I/O may run concurrently from many threads. Size and header updates
/// are serialized internally; callers coordinate them with the page engine's
/// own size lock.
pub struct TagFile {
    path: PathBuf,
    handle: RwLock<Option<OpenTags>>,
    sizes: Mutex<Sizes>,
}

impl std::fmt::Debug for TagFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagFile")
            .field("path", &self.path)
            .field("sizes", &*self.sizes.lock())
            .finish_non_exhaustive()
    }
}

impl TagFile {
    /// Opens or initializes the tag file at `path`.
    ///
    /// A file without a recognizable header gets a fresh one with tracked
    /// length zero, marked verified only when `data_len` is zero. Sizes are
    /// then reconciled with [`TagFile::reset_sizes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, its header is corrupt,
    /// or the header cannot be written.
    pub fn open(
        backend: &dyn StorageBackend,
        path: &Path,
        data_len: u64,
        flags: OpenFlags,
    ) -> CsiResult<Self> {
        let file = backend.open(path, flags)?;
        let header = match read_header(file.as_ref())? {
            Some(header) => header,
            None => {
                let header = TagHeader {
                    swapped: false,
                    tracked_len: 0,
                    flags: if data_len == 0 { FLAG_VERIFIED } else { 0 },
                };
                if flags.write {
                    write_fully(file.as_ref(), &header.encode(), 0)?;
                }
                debug!(path = %path.display(), "initialized tag file header");
                header
            }
        };

        let tags = Self {
            path: path.to_path_buf(),
            handle: RwLock::new(Some(OpenTags {
                file,
                writable: flags.write,
            })),
            sizes: Mutex::new(Sizes { header, data_len }),
        };
        tags.reset_sizes(data_len)?;
        Ok(tags)
    }

    /// Returns the tag file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<T>(&self, f: impl FnOnce(&OpenTags) -> CsiResult<T>) -> CsiResult<T> {
        let handle = self.handle.read();
        let open = handle.as_ref().ok_or(CsiError::NotOpen)?;
        f(open)
    }

    fn write_header(&self, header: &TagHeader) -> CsiResult<()> {
        self.with_file(|open| {
            write_fully(open.file.as_ref(), &header.encode(), 0)?;
            Ok(())
        })
    }

    /// Reconciles the tracked length with the tag file's real size and sets
    /// the data length to `data_len`.
    ///
    /// A tag file shorter than the tracked length implies (for example after
    /// a crash) reduces the tracked length to what its complete tags cover.
    /// A longer one is truncated.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag file cannot be resized or its header
    /// cannot be written.
    pub fn reset_sizes(&self, data_len: u64) -> CsiResult<()> {
        let mut sizes = self.sizes.lock();
        let (actual, writable) = self.with_file(|open| Ok((open.file.len()?, open.writable)))?;
        let expected = expected_file_len(sizes.header.tracked_len);

        if actual < expected {
            let complete = actual.saturating_sub(HEADER_SIZE) / TAG_SIZE;
            let tracked = sizes.header.tracked_len.min(complete * PAGE_SIZE_U64);
            warn!(
                path = %self.path.display(),
                old = sizes.header.tracked_len,
                new = tracked,
                "tag file shorter than expected, reducing tracked length"
            );
            sizes.header.tracked_len = tracked;
            if writable {
                self.write_header(&sizes.header)?;
            }
        } else if actual > expected && writable {
            self.with_file(|open| Ok(open.file.set_len(expected)?))?;
        }

        sizes.data_len = data_len;
        Ok(())
    }

    /// Returns the tracked length.
    #[must_use]
    pub fn tracked_len(&self) -> u64 {
        self.sizes.lock().header.tracked_len
    }

    /// Returns the last known data file length.
    #[must_use]
    pub fn data_len(&self) -> u64 {
        self.sizes.lock().data_len
    }

    /// Returns the current header.
    #[must_use]
    pub fn header(&self) -> TagHeader {
        self.sizes.lock().header
    }

    /// Returns true if the header's byte order differs from the host's.
    #[must_use]
    pub fn is_swapped(&self) -> bool {
        self.sizes.lock().header.swapped
    }

    /// Sets the tracked length, raising the data length if it is smaller.
    ///
    /// The header is rewritten only when the tracked length changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn set_tracked_size(&self, len: u64) -> CsiResult<()> {
        let mut sizes = self.sizes.lock();
        if len > sizes.data_len {
            sizes.data_len = len;
        }
        if len != sizes.header.tracked_len {
            let mut header = sizes.header;
            header.tracked_len = len;
            self.write_header(&header)?;
            sizes.header = header;
        }
        Ok(())
    }

    /// Resizes the tag file to hold tags for `len` bytes and sets the tracked
    /// length, and the data length too if `data_too`.
    ///
    /// Truncating to zero marks the store verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized or the header written.
    pub fn truncate(&self, len: u64, data_too: bool) -> CsiResult<()> {
        let mut sizes = self.sizes.lock();
        self.with_file(|open| Ok(open.file.set_len(expected_file_len(len))?))?;

        let mut header = sizes.header;
        if len == 0 {
            header.flags |= FLAG_VERIFIED;
        }
        header.tracked_len = len;
        self.write_header(&header)?;
        sizes.header = header;
        if data_too {
            sizes.data_len = len;
        }
        Ok(())
    }

    /// Returns true if the verified flag is set.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.sizes.lock().header.is_verified()
    }

    /// Clears the verified flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn set_unverified(&self) -> CsiResult<()> {
        let mut sizes = self.sizes.lock();
        if sizes.header.is_verified() {
            let mut header = sizes.header;
            header.flags &= !FLAG_VERIFIED;
            self.write_header(&header)?;
            sizes.header = header;
        }
        Ok(())
    }

    /// Reads `buf.len()` tags starting at page `page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed, the read fails, or the tag
    /// file ends before the requested tags.
    pub fn read_tags(&self, buf: &mut [u32], page: u64) -> CsiResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let swapped = self.is_swapped();
        let offset = HEADER_SIZE + TAG_SIZE * page;
        let mut raw = vec![0u8; buf.len() * TAG_SIZE as usize];

        let n = self.with_file(|open| Ok(read_fully(open.file.as_ref(), &mut raw, offset)?))?;
        if n < raw.len() {
            return Err(CsiError::ShortRead {
                offset,
                expected: raw.len(),
                actual: n,
            });
        }

        for (tag, bytes) in buf.iter_mut().zip(raw.chunks_exact(TAG_SIZE as usize)) {
            let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            *tag = if swapped { v.swap_bytes() } else { v };
        }
        Ok(())
    }

    /// Reads the tag of a single page.
    ///
    /// # Errors
    ///
    /// As [`TagFile::read_tags`].
    pub fn read_tag(&self, page: u64) -> CsiResult<u32> {
        let mut tag = [0u32; 1];
        self.read_tags(&mut tag, page)?;
        Ok(tag[0])
    }

    /// Writes `tags` starting at page `page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the write fails.
    pub fn write_tags(&self, tags: &[u32], page: u64) -> CsiResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let swapped = self.is_swapped();
        let raw: Vec<u8> = tags
            .iter()
            .flat_map(|&tag| {
                let tag = if swapped { tag.swap_bytes() } else { tag };
                tag.to_ne_bytes()
            })
            .collect();

        self.with_file(|open| {
            write_fully(open.file.as_ref(), &raw, HEADER_SIZE + TAG_SIZE * page)?;
            Ok(())
        })
    }

    /// Pushes buffered tag writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the flush fails.
    pub fn flush(&self) -> CsiResult<()> {
        self.with_file(|open| Ok(open.file.flush()?))
    }

    /// Syncs the tag file to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the sync fails.
    pub fn fsync(&self) -> CsiResult<()> {
        self.with_file(|open| Ok(open.file.sync()?))
    }

    /// Closes the tag file. Later operations fail with `NotOpen`.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if already closed.
    pub fn close(&self) -> CsiResult<()> {
        let open = self.handle.write().take().ok_or(CsiError::NotOpen)?;
        if open.writable {
            open.file.flush()?;
        }
        debug!(path = %self.path.display(), "closed tag file");
        Ok(())
    }

    /// Returns true until [`TagFile::close`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }
}
