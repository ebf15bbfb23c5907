//! Property-based test generators using proptest.
//!
//! Provides strategies for generating file operations that straddle page
//! boundaries, and a plain in-memory model to check them against.

use pagecsi_core::{CsiFile, CsiResult, PAGE_SIZE};
use proptest::prelude::*;

/// Largest offset generated, three pages in.
pub const MAX_OFFSET: u64 = 3 * PAGE_SIZE as u64;

/// Largest write generated.
pub const MAX_WRITE: usize = 2 * PAGE_SIZE + 100;

/// Strategy for offsets, biased towards page boundaries.
pub fn offset_strategy() -> impl Strategy<Value = u64> {
    let page = PAGE_SIZE as u64;
    prop_oneof![
        2 => 0..MAX_OFFSET,
        1 => (0..3u64, -2i64..=2).prop_map(move |(p, delta)| {
            (p * page).saturating_add_signed(delta)
        }),
    ]
}

/// Strategy for write payloads.
pub fn write_data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 1..MAX_WRITE),
        1 => Just(vec![0u8; PAGE_SIZE]),
    ]
}

/// A single operation on an open file.
#[derive(Debug, Clone)]
pub enum IoOperation {
    /// Write bytes
    Write {
        /// File offset
        offset: u64,
        /// Bytes to write
        data: Vec<u8>,
    },
    /// Read and verify bytes
    Read {
        /// File offset
        offset: u64,
        /// Bytes to read
        len: usize,
    },
    /// Change the file length
    Truncate {
        /// New length
        len: u64,
    },
}

/// Strategy for file operations.
pub fn io_operation_strategy() -> impl Strategy<Value = IoOperation> {
    prop_oneof![
        4 => (offset_strategy(), write_data_strategy())
            .prop_map(|(offset, data)| IoOperation::Write { offset, data }),
        3 => (offset_strategy(), 1..MAX_WRITE)
            .prop_map(|(offset, len)| IoOperation::Read { offset, len }),
        1 => offset_strategy().prop_map(|len| IoOperation::Truncate { len }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<IoOperation>> {
    prop::collection::vec(io_operation_strategy(), min_ops..max_ops)
}

/// The expected contents of a file after a series of operations.
#[derive(Debug, Clone, Default)]
pub struct ShadowFile {
    data: Vec<u8>,
}

impl ShadowFile {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the modelled contents.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Applies a write, zero-filling any hole.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
    }

    /// Applies a truncation.
    pub fn truncate(&mut self, len: u64) {
        self.data.resize(len as usize, 0);
    }

    /// Returns the bytes a read of `len` at `offset` should see.
    pub fn read(&self, offset: u64, len: usize) -> &[u8] {
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }
}

/// Applies `op` to both `file` and `shadow`. Reads are compared against the
/// model; a difference is reported as `Ok(false)`.
///
/// # Errors
///
/// Returns any error the file reports.
pub fn apply_operation(file: &CsiFile, shadow: &mut ShadowFile, op: &IoOperation) -> CsiResult<bool> {
    match op {
        IoOperation::Write { offset, data } => {
            file.write(data, *offset)?;
            shadow.write(*offset, data);
        }
        IoOperation::Read { offset, len } => {
            let mut buf = vec![0u8; *len];
            let n = file.read(&mut buf, *offset)?;
            return Ok(&buf[..n] == shadow.read(*offset, *len));
        }
        IoOperation::Truncate { len } => {
            file.ftruncate(*len)?;
            shadow.truncate(*len);
        }
    }
    Ok(true)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
