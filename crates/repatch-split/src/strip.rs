//! Native library stripping

use crate::abi::{native_lib_abi, normalize_abi};
use crate::error::SplitError;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use zip::{ZipArchive, ZipWriter};

/// Remove `lib/<abi>/` entries for architectures outside `supported`
///
/// Rewrites `archive` in place and returns the number of removed entries.
/// Architecture names match regardless of case and of `-`/`_`. An empty
/// `supported` list leaves the archive untouched.
///
/// # Errors
/// Archive or filesystem failure.
pub fn strip_native_libs(archive: &Path, supported: &[String]) -> Result<usize, SplitError> {
    if supported.is_empty() {
        tracing::warn!("No supported architectures known, keeping all native libraries");
        return Ok(0);
    }
    let supported: BTreeSet<String> = supported.iter().map(|abi| normalize_abi(abi)).collect();
    let keep = |name: &str| native_lib_abi(name).map_or(true, |abi| supported.contains(&normalize_abi(abi)));

    let mut source = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let removed = source.file_names().filter(|name| !keep(name)).count();
    if removed == 0 {
        return Ok(0);
    }

    let staging = archive.with_extension("strip.tmp");
    {
        let mut writer = ZipWriter::new(File::create(&staging)?);
        for index in 0..source.len() {
            let entry = source.by_index_raw(index)?;
            if keep(entry.name()) {
                writer.raw_copy_file(entry)?;
            }
        }
        writer.finish()?;
    }
    std::fs::rename(&staging, archive)?;
    tracing::info!("Stripped {} native library entries from {}", removed, archive.display());
    Ok(removed)
}
