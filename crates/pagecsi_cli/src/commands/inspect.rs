//! Inspect command implementation.

use pagecsi_core::crc::pages_for;
use pagecsi_core::tagstore::{expected_file_len, read_header, TagFile};
use pagecsi_core::CsiConfig;
use pagecsi_storage::{FileBackend, OpenFlags, StorageBackend};
use std::path::Path;

/// Tag file inspection result.
#[derive(Debug)]
pub struct InspectResult {
    /// Data file path.
    pub path: String,
    /// Tag file path.
    pub tag_path: String,
    /// Data file size in bytes, if it exists.
    pub data_size: Option<u64>,
    /// Tag file size in bytes.
    pub tag_file_size: u64,
    /// Tag file size the tracked length implies.
    pub expected_tag_file_size: u64,
    /// Tracked length from the header.
    pub tracked_len: u64,
    /// Whether the header uses the other byte order.
    pub swapped: bool,
    /// Whether the verified flag is set.
    pub verified: bool,
    /// Page tags (if requested).
    pub tags: Option<Vec<u32>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, config: &CsiConfig, show_tags: bool) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, config, show_tags)?;
    print_text_output(&result);
    Ok(())
}

/// Reads the header (and optionally the tags) of the tag file for `path`.
pub fn inspect(
    path: &Path,
    config: &CsiConfig,
    show_tags: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let (backend, name) = super::backend_for(path)?;
    let tag_name = config.tag_path(&name);

    if !backend.exists(&tag_name) {
        return Err(format!("No tag file found for {}", path.display()).into());
    }

    let data_size = if backend.exists(&name) {
        Some(backend.open(&name, OpenFlags::read_only())?.len()?)
    } else {
        None
    };

    let raw = backend.open(&tag_name, OpenFlags::read_only())?;
    let tag_file_size = raw.len()?;
    let header = read_header(raw.as_ref())?
        .ok_or_else(|| format!("{} has no tag file header", tag_name.display()))?;
    drop(raw);

    let tags = if show_tags {
        let file = TagFile::open(
            &backend,
            &tag_name,
            data_size.unwrap_or(0),
            OpenFlags::read_only(),
        )?;
        let mut tags = vec![0u32; pages_for(file.tracked_len()) as usize];
        file.read_tags(&mut tags, 0)?;
        file.close()?;
        Some(tags)
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        tag_path: backend.resolve(&tag_name).display().to_string(),
        data_size,
        tag_file_size,
        expected_tag_file_size: expected_file_len(header.tracked_len),
        tracked_len: header.tracked_len,
        swapped: header.swapped,
        verified: header.is_verified(),
        tags,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("pagecsi Tag File Inspection");
    println!("===========================");
    println!();
    println!("Data file: {}", result.path);
    println!("Tag file:  {}", result.tag_path);
    println!();
    println!("Header:");
    println!(
        "  Byte order:     {}",
        if result.swapped { "swapped" } else { "native" }
    );
    println!("  Tracked length: {}", format_size(result.tracked_len));
    println!("  Pages:          {}", pages_for(result.tracked_len));
    println!(
        "  Verified:       {}",
        if result.verified { "yes" } else { "no" }
    );
    println!();
    println!("Sizes:");
    match result.data_size {
        Some(size) => println!("  Data file:     {}", format_size(size)),
        None => println!("  Data file:     missing"),
    }
    println!(
        "  Tag file:      {} (expected {})",
        result.tag_file_size, result.expected_tag_file_size
    );

    if result.data_size.is_some_and(|size| size != result.tracked_len) {
        println!();
        println!("  ! data file length differs from tracked length");
    }
    if result.tag_file_size != result.expected_tag_file_size {
        println!("  ! tag file length differs from expected length");
    }

    if let Some(tags) = &result.tags {
        println!();
        println!("Tags:");
        for (page, tag) in tags.iter().enumerate() {
            println!("  [{page:>8}] {tag:08x}");
        }
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
