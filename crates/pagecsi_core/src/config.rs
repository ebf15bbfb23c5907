//! Integrity layer configuration.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Default suffix appended to a data file path to name its tag file.
pub const DEFAULT_TAG_SUFFIX: &str = ".pgtags";

/// Configuration for a [`crate::CsiStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiConfig {
    /// Whether tags for pages inside holes are written as checksums of zeros.
    pub fill_holes: bool,

    /// Whether a data file without a tag file may be opened untracked.
    pub allow_missing_tags: bool,

    /// Whether `pg_write` may not extend a file whose tracked length is not
    /// page aligned.
    pub disable_pg_extend: bool,

    /// Whether to tolerate the data/tag mismatches a crash can leave behind.
    pub loose_write: bool,

    /// Suffix appended to a data file path to form its tag file path.
    pub tag_suffix: String,

    /// Directory under which tag files are kept, mirroring the data tree.
    pub tag_prefix: Option<PathBuf>,
}

impl Default for CsiConfig {
    fn default() -> Self {
        Self {
            fill_holes: true,
            allow_missing_tags: true,
            disable_pg_extend: false,
            loose_write: true,
            tag_suffix: DEFAULT_TAG_SUFFIX.to_string(),
            tag_prefix: None,
        }
    }
}

impl CsiConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether holes get zero-fill tags.
    #[must_use]
    pub const fn fill_holes(mut self, value: bool) -> Self {
        self.fill_holes = value;
        self
    }

    /// Sets whether missing tag files are tolerated.
    #[must_use]
    pub const fn allow_missing_tags(mut self, value: bool) -> Self {
        self.allow_missing_tags = value;
        self
    }

    /// Sets whether `pg_write` past a non-aligned end of file is refused.
    #[must_use]
    pub const fn disable_pg_extend(mut self, value: bool) -> Self {
        self.disable_pg_extend = value;
        self
    }

    /// Sets whether loose-write recovery is enabled.
    #[must_use]
    pub const fn loose_write(mut self, value: bool) -> Self {
        self.loose_write = value;
        self
    }

    /// Sets the tag file suffix.
    #[must_use]
    pub fn tag_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.tag_suffix = suffix.into();
        self
    }

    /// Sets the directory tag files are kept under.
    #[must_use]
    pub fn tag_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.tag_prefix = Some(prefix.into());
        self
    }

    /// Returns the tag file path for a data file path.
    #[must_use]
    pub fn tag_path(&self, data_path: &Path) -> PathBuf {
        let base = match &self.tag_prefix {
            Some(prefix) => {
                let mut full = prefix.clone();
                for component in data_path.components() {
                    if let Component::Normal(part) = component {
                        full.push(part);
                    }
                }
                full
            }
            None => data_path.to_path_buf(),
        };
        let mut name = OsString::from(base);
        name.push(&self.tag_suffix);
        PathBuf::from(name)
    }

    /// Returns true if `path` names a tag file rather than a data file.
    #[must_use]
    pub fn is_tag_file(&self, path: &Path) -> bool {
        if let Some(prefix) = &self.tag_prefix {
            let normal = |p: &Path| -> Vec<OsString> {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part.to_os_string()),
                        _ => None,
                    })
                    .collect()
            };
            let prefix = normal(prefix);
            return normal(path).starts_with(&prefix);
        }
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(&self.tag_suffix))
    }
}
