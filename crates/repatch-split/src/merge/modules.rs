//! Module merger
//!
//! Loads the `*.apk` modules of a directory and merges them into a single
//! archive, base module first. The first module to provide an entry wins.
//! Signature files are dropped since the merged output is re-signed.

use crate::error::MergeError;
use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use zip::write::ZipWriter;
use zip::ZipArchive;

const BASE_MODULE: &str = "base.apk";
const RESOURCE_TABLE: &str = "resources.arsc";

/// One module file
#[derive(Debug, Clone)]
pub struct Module {
    /// File name, always ending in `.apk`
    pub name: String,
    /// Location on disk
    pub path: PathBuf,
    resource_table_size: u64,
}

/// Modules of one split set with a resolved base
#[derive(Debug, Clone)]
pub struct ModuleSet {
    modules: Vec<Module>,
    base: usize,
}

/// Outcome of a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Modules merged, in order
    pub merged: Vec<String>,
    /// Modules skipped
    pub skipped: Vec<String>,
    /// Entries written
    pub entries: usize,
}

impl ModuleSet {
    /// Load every module in `dir`, sorted by file name
    ///
    /// # Errors
    /// [`MergeError::NoModules`] for an empty directory,
    /// [`MergeError::InvalidModule`] for an unreadable module.
    pub fn load(dir: &Path, log: &mut dyn FnMut(&str)) -> Result<Self, MergeError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
            })
            .collect();
        paths.sort();

        let mut modules = Vec::with_capacity(paths.len());
        for path in paths {
            let name = display_name(&path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
            log(&format!("Loading: {name}"));
            let resource_table_size = resource_table_size(&path).map_err(|source| MergeError::InvalidModule {
                name: name.clone(),
                source,
            })?;
            modules.push(Module {
                name,
                path,
                resource_table_size,
            });
        }

        if modules.is_empty() {
            return Err(MergeError::NoModules(dir.to_path_buf()));
        }
        let base = find_base(&modules);
        Ok(Self { modules, base })
    }

    /// The base module
    #[must_use]
    pub fn base(&self) -> &Module {
        &self.modules[self.base]
    }

    /// Modules in merge order: base first, then the rest in load order
    pub fn ordered(&self) -> impl Iterator<Item = &Module> {
        std::iter::once(&self.modules[self.base]).chain(
            self.modules
                .iter()
                .enumerate()
                .filter(move |(i, _)| *i != self.base)
                .map(|(_, module)| module),
        )
    }

    /// Module names in merge order
    #[must_use]
    pub fn order(&self) -> Vec<String> {
        self.ordered().map(|module| module.name.clone()).collect()
    }

    /// Merge into `output`, skipping non-base modules named in `skip`
    ///
    /// `skip` matches case-insensitively; `.apk` is implied.
    ///
    /// # Errors
    /// Archive or filesystem failure.
    pub fn merge(&self, output: &Path, skip: &BTreeSet<String>, log: &mut dyn FnMut(&str)) -> Result<MergeSummary, MergeError> {
        let skip: HashSet<String> = skip.iter().map(|name| display_name(name).to_ascii_lowercase()).collect();
        let mut writer = ZipWriter::new(File::create(output)?);
        let mut seen = HashSet::new();
        let mut summary = MergeSummary::default();

        for (position, module) in self.ordered().enumerate() {
            let is_base = position == 0;
            if !is_base && skip.contains(&module.name.to_ascii_lowercase()) {
                log(&format!("Skipping {}", module.name));
                summary.skipped.push(module.name.clone());
                continue;
            }

            log(&format!("Merging {}", module.name));
            let mut archive = ZipArchive::new(BufReader::new(File::open(&module.path)?)).map_err(|source| {
                MergeError::InvalidModule {
                    name: module.name.clone(),
                    source,
                }
            })?;
            for index in 0..archive.len() {
                let entry = archive.by_index_raw(index)?;
                let name = entry.name().to_string();
                if entry.is_dir() || is_signature_entry(&name) || !seen.insert(name.clone()) {
                    continue;
                }
                writer.raw_copy_file(entry)?;
                log(&format!("Added: {name}"));
                summary.entries += 1;
            }
            summary.merged.push(module.name.clone());
        }

        writer.finish()?;
        log(&format!(
            "Merged {} modules ({} entries) into {}",
            summary.merged.len(),
            summary.entries,
            output.display()
        ));
        Ok(summary)
    }
}

/// Force a module name to end in `.apk`
#[must_use]
pub fn display_name(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".apk") {
        name.to_string()
    } else {
        format!("{name}.apk")
    }
}

/// `true` for `META-INF/` signature material
#[must_use]
pub fn is_signature_entry(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let Some(file) = upper.strip_prefix("META-INF/") else {
        return false;
    };
    file == "MANIFEST.MF"
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| file.ends_with(ext) && !file.contains('/'))
}

fn find_base(modules: &[Module]) -> usize {
    if let Some(index) = modules
        .iter()
        .position(|module| module.name.eq_ignore_ascii_case(BASE_MODULE))
    {
        return index;
    }
    let largest = modules
        .iter()
        .enumerate()
        .filter(|(_, module)| module.resource_table_size > 0)
        .max_by_key(|(i, module)| (module.resource_table_size, std::cmp::Reverse(*i)));
    largest.map_or(0, |(index, _)| index)
}

fn resource_table_size(path: &Path) -> Result<u64, zip::result::ZipError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let size = match archive.by_name(RESOURCE_TABLE) {
        Ok(entry) => entry.size(),
        Err(zip::result::ZipError::FileNotFound) => 0,
        Err(err) => return Err(err),
    };
    Ok(size)
}
