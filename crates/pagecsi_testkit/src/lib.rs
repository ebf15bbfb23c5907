//! # pagecsi Testkit
//!
//! Test utilities for the pagecsi integrity layer.
//!
//! This crate provides:
//! - Store fixtures over in-memory and on-disk backends
//! - Property-based test generators using proptest
//! - A fault-injecting storage backend and crash-state helpers
//! - Stress testing utilities
//! - CRC32C and tag header test vectors
//!
//! ## Usage
//!
//! ```rust
//! use pagecsi_testkit::prelude::*;
//!
//! with_temp_store(|store| {
//!     let file = store.open(Path::new("/f"), rw_create()).unwrap();
//!     file.write(&pattern(5000, 1), 0).unwrap();
//!     assert_eq!(file.len().unwrap(), 5000);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use crate::vectors::*;
    pub use std::path::Path;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
pub use vectors::*;
