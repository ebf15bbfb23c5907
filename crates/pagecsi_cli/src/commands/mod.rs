//! CLI command implementations.

pub mod inspect;
pub mod verify;

use pagecsi_storage::FileBackend;
use std::path::{Path, PathBuf};

/// Returns a backend rooted at the directory holding `path`, and the file's
/// name within it.
pub(crate) fn backend_for(path: &Path) -> Result<(FileBackend, PathBuf), Box<dyn std::error::Error>> {
    let name = path
        .file_name()
        .ok_or_else(|| format!("{} does not name a file", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((FileBackend::new(dir), PathBuf::from(name)))
}
