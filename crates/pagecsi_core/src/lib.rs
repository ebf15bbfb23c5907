//! # pagecsi Core
//!
//! Page-checksum integrity layer over a [`pagecsi_storage`] backend.
//!
//! Every data file is divided into 4 KiB pages. A companion tag file holds
//! one CRC32C per page, and every read and write through a [`CsiFile`] is
//! checked against or reflected into those tags.
//!
//! This crate provides:
//! - CRC32C algebra for combining and splitting page checksums ([`crc`])
//! - The tag file format ([`tagstore`])
//! - Page-range locks ([`ranges`])
//! - The page engine that maps byte ranges to tag updates ([`pages`])
//! - Checksummed file handles with an optional async adapter
//!
//! ## Example
//!
//! ```rust
//! use pagecsi_core::{CsiConfig, CsiStore, VerificationStatus};
//! use pagecsi_storage::{InMemoryBackend, OpenFlags};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let store = CsiStore::new(Arc::new(InMemoryBackend::new()), CsiConfig::default());
//! let file = store
//!     .open(Path::new("/data.bin"), OpenFlags::read_write().create(true))
//!     .unwrap();
//!
//! file.write(b"hello world", 0).unwrap();
//! let mut buf = [0u8; 11];
//! assert_eq!(file.read(&mut buf, 0).unwrap(), 11);
//! assert_eq!(&buf, b"hello world");
//! assert_eq!(file.verification_status(), VerificationStatus::Unverified);
//! file.close().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crc;
pub mod error;
pub mod pages;
pub mod ranges;
pub mod tagstore;

#[cfg(feature = "aio")]
mod aio;
mod file;
mod registry;

pub use config::{CsiConfig, DEFAULT_TAG_SUFFIX};
pub use crc::{PAGE_SIZE, PAGE_SIZE_U64};
pub use error::{CsiError, CsiResult};
pub use file::{CsiFile, CsiStore, ReadChunk, WriteChunk};
pub use pages::{Pages, PgOptions, RangeGuard, TrackedSizes, VerificationStatus};
pub use ranges::{RangeLock, RangeLockManager};
pub use tagstore::{TagFile, TagHeader};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
