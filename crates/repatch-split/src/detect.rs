//! Split archive detection

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use zip::ZipArchive;

/// Container extensions that are always split archives
pub const SPLIT_EXTENSIONS: [&str; 3] = ["apks", "apkm", "xapk"];

/// Extension of a module entry inside a split archive
pub const MODULE_EXTENSION: &str = ".apk";

/// `true` if `file` is a multi-module split archive
///
/// Missing files are not split. Known container extensions always are.
/// Anything else is split iff it opens as a zip with a non-directory entry
/// ending in `.apk`; unreadable files are not split.
#[must_use]
pub fn is_split_archive(file: &Path) -> bool {
    if !file.exists() {
        return false;
    }

    let extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if extension.is_some_and(|ext| SPLIT_EXTENSIONS.contains(&ext.as_str())) {
        return true;
    }

    match has_module_entries(file) {
        Ok(found) => found,
        Err(err) => {
            tracing::debug!("{} is not a readable archive: {}", file.display(), err);
            false
        }
    }
}

/// `true` if `name` is a module entry
#[must_use]
pub fn is_module_entry(name: &str) -> bool {
    !name.ends_with('/') && name.to_ascii_lowercase().ends_with(MODULE_EXTENSION)
}

fn has_module_entries(file: &Path) -> Result<bool, zip::result::ZipError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(file)?))?;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if !entry.is_dir() && is_module_entry(entry.name()) {
            return Ok(true);
        }
    }
    Ok(false)
}
