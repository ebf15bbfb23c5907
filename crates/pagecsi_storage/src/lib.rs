//! # pagecsi Storage
//!
//! Backing-store traits and implementations for the pagecsi integrity layer.
//!
//! This crate provides the lowest-level storage abstraction. Backends are
//! **opaque byte stores** - they do not interpret the data they store.
//! Data files and their companion tag files are both opened through the
//! same [`StorageBackend`].
//!
//! ## Design Principles
//!
//! - Files support positional I/O (`read_at`, `write_at`, `set_len`)
//! - No knowledge of tag files, pages or checksums
//! - Must be `Send + Sync` for concurrent access
//! - Errors carry enough information to recover a POSIX errno
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and crash-state reproduction
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use pagecsi_storage::{read_fully, InMemoryBackend, OpenFlags, StorageBackend};
//! use std::path::Path;
//!
//! let backend = InMemoryBackend::new();
//! let file = backend
//!     .open(Path::new("/data.bin"), OpenFlags::read_write().create(true))
//!     .unwrap();
//! file.write_at(b"hello world", 0).unwrap();
//!
//! let mut buf = [0u8; 11];
//! read_fully(file.as_ref(), &mut buf, 0).unwrap();
//! assert_eq!(&buf, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{read_fully, write_fully, DataFile, FileKey, OpenFlags, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, LocalFile};
pub use memory::{InMemoryBackend, MemFile};
