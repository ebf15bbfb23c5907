//! Verify command implementation.

use pagecsi_core::{CsiConfig, CsiError, CsiFile, CsiStore, PgOptions, PAGE_SIZE};
use pagecsi_storage::OpenFlags;
use std::path::Path;
use std::sync::Arc;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of bytes checked.
    pub bytes_checked: u64,
    /// Number of pages checked.
    pub pages_checked: u64,
    /// Pages that failed verification.
    pub bad_pages: Vec<u64>,
    /// Whether the file has a tag file.
    pub tracked: bool,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no page failed verification.
    pub fn is_ok(&self) -> bool {
        self.bad_pages.is_empty() && self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(
    path: &Path,
    config: CsiConfig,
    chunk_pages: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying {}", path.display());
    println!();

    let result = verify(path, config, chunk_pages)?;
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

/// Reads the whole file through a read-only handle, checking every page
/// against its stored tag.
pub fn verify(
    path: &Path,
    config: CsiConfig,
    chunk_pages: usize,
) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    if chunk_pages == 0 {
        return Err("chunk size must be at least one page".into());
    }

    let (backend, name) = super::backend_for(path)?;
    let store = CsiStore::new(Arc::new(backend), config);
    let file = store.open(&name, OpenFlags::read_only())?;

    let mut result = VerifyResult {
        tracked: file.is_tracked(),
        ..VerifyResult::default()
    };
    let len = file.len()?;
    let mut buf = vec![0u8; chunk_pages * PAGE_SIZE];
    let mut offset = 0u64;

    while offset < len {
        let want = usize::try_from(len - offset).map_or(buf.len(), |rest| rest.min(buf.len()));
        match file.pg_read(&mut buf[..want], offset, None, PgOptions::VERIFY) {
            Ok(0) => {
                result.errors.push(format!("unexpected end of file at {offset}"));
                break;
            }
            Ok(n) => {
                result.bytes_checked += n as u64;
                result.pages_checked += n.div_ceil(PAGE_SIZE) as u64;
            }
            Err(err) if err.is_integrity_error() => {
                tracing::debug!(offset, error = %err, "chunk failed verification");
                check_pages(&file, &mut buf[..want], offset, &mut result)?;
            }
            Err(err) => return Err(err.into()),
        }
        offset += want as u64;
    }

    file.close()?;
    Ok(result)
}

/// Re-reads a failed chunk one page at a time to find the bad pages.
fn check_pages(
    file: &CsiFile,
    chunk: &mut [u8],
    offset: u64,
    result: &mut VerifyResult,
) -> Result<(), CsiError> {
    let mut page_offset = offset;
    for page in chunk.chunks_mut(PAGE_SIZE) {
        let page_index = page_offset / PAGE_SIZE as u64;
        match file.pg_read(page, page_offset, None, PgOptions::VERIFY) {
            Ok(n) => result.bytes_checked += n as u64,
            Err(err) if err.is_integrity_error() => {
                tracing::warn!(page = page_index, error = %err, "page failed verification");
                result.bad_pages.push(page_index);
                result.errors.push(err.to_string());
            }
            Err(err) => return Err(err),
        }
        result.pages_checked += 1;
        page_offset += page.len() as u64;
    }
    Ok(())
}

fn print_result(result: &VerifyResult) {
    if !result.tracked {
        println!("  ! no tag file, checksums were computed but not verified");
    }
    println!("  Bytes checked: {}", result.bytes_checked);
    println!("  Pages checked: {}", result.pages_checked);
    println!("  Bad pages:     {}", result.bad_pages.len());

    if !result.errors.is_empty() {
        println!("  Errors:");
        for (i, err) in result.errors.iter().take(10).enumerate() {
            println!("    {}. {}", i + 1, err);
        }
        if result.errors.len() > 10 {
            println!("    ... and {} more", result.errors.len() - 10);
        }
    }
}
