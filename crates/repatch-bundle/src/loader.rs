//! Bundle loading
//!
//! A bundle is a zip archive holding at least one non-empty executable
//! payload (`*.dex`) and a `patches.json` catalog. Any structural problem is
//! reported as [`BundleError::CorruptBundle`].

use crate::catalog::{Catalog, CatalogOperation, CatalogPatch, CATALOG_ENTRY, PAYLOAD_EXTENSION};
use crate::error::BundleError;
use crate::patch::{Operation, Patch};
use crate::selection::{PatchOptions, PatchSelection};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::ZipArchive;

type Archive = ZipArchive<BufReader<File>>;

/// A configured bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSource {
    /// Caller-chosen id, used by selections and options
    pub id: String,
    /// Bundle archive
    pub path: PathBuf,
}

impl BundleSource {
    /// Create a bundle source
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Load every patch of a single bundle
///
/// # Errors
/// [`BundleError::CorruptBundle`] when the archive is unreadable, a payload is
/// missing or empty, the catalog is malformed, or loading yields anything
/// other than exactly one payload group.
pub fn load_bundle(path: &Path) -> Result<Vec<Patch>, BundleError> {
    let mut groups = load_groups(&[path])?;
    if groups.len() != 1 {
        return Err(BundleError::corrupt(
            path,
            format!("unexpected bundle load result ({} payload groups)", groups.len()),
        ));
    }
    let (_, patches) = groups
        .pop()
        .ok_or_else(|| BundleError::corrupt(path, "unexpected bundle load result"))?;
    Ok(patches)
}

/// Load payload groups keyed by source file
///
/// A bundle whose catalog declares no patches yields no group.
///
/// # Errors
/// [`BundleError::CorruptBundle`] for the first invalid bundle.
pub fn load_groups(paths: &[&Path]) -> Result<IndexMap<PathBuf, Vec<Patch>>, BundleError> {
    let mut groups = IndexMap::new();
    for path in paths {
        if let Some(patches) = read_group(path)? {
            groups.insert(path.to_path_buf(), patches);
        }
    }
    Ok(groups)
}

/// Load `bundles` and keep, per bundle id, the patches compatible with `package`
///
/// # Errors
/// The first bundle that fails to load.
pub fn patches(bundles: &[BundleSource], package: &str) -> Result<IndexMap<String, Vec<Patch>>, BundleError> {
    let mut by_bundle = IndexMap::new();
    for bundle in bundles {
        let compatible: Vec<Patch> = load_bundle(&bundle.path)?
            .into_iter()
            .filter(|patch| patch.is_compatible_with(package))
            .collect();
        tracing::debug!("Bundle {}: {} patches compatible with {}", bundle.id, compatible.len(), package);
        by_bundle.insert(bundle.id.clone(), compatible);
    }
    Ok(by_bundle)
}

/// Resolve a selection into the ordered patch list, applying option values
///
/// Bundles keep their configured order; patches keep catalog order.
///
/// # Errors
/// - [`BundleError::UnknownBundle`] for a selection or option naming an unloaded bundle
/// - [`BundleError::UnknownPatch`] for a name the bundle does not provide
/// - [`BundleError::UnknownOption`] for an undeclared option key
pub fn resolve_selection(
    loaded: IndexMap<String, Vec<Patch>>,
    selection: &PatchSelection,
    options: &PatchOptions,
) -> Result<Vec<Patch>, BundleError> {
    for bundle in selection.bundle_ids() {
        let Some(available) = loaded.get(bundle) else {
            return Err(BundleError::UnknownBundle(bundle.to_string()));
        };
        if let Some(names) = selection.for_bundle(bundle) {
            for name in names {
                if !available.iter().any(|patch| patch.name() == name.as_str()) {
                    return Err(BundleError::UnknownPatch {
                        bundle: bundle.to_string(),
                        name: name.clone(),
                    });
                }
            }
        }
    }

    let mut resolved = Vec::new();
    for (bundle, patches) in loaded {
        let Some(names) = selection.for_bundle(&bundle) else {
            continue;
        };
        let bundle_options = options.for_bundle(&bundle);
        if let Some(bundle_options) = bundle_options {
            for patch in bundle_options.keys() {
                if !patches.iter().any(|candidate| candidate.name() == patch.as_str()) {
                    return Err(BundleError::UnknownPatch {
                        bundle: bundle.clone(),
                        name: patch.clone(),
                    });
                }
            }
        }

        for mut patch in patches {
            if !names.contains(patch.name()) {
                continue;
            }
            if let Some(values) = bundle_options.and_then(|opts| opts.get(patch.name())) {
                for (key, value) in values {
                    patch.set_option(key, value.clone())?;
                }
            }
            resolved.push(patch);
        }
    }
    Ok(resolved)
}

fn read_group(path: &Path) -> Result<Option<Vec<Patch>>, BundleError> {
    let file = File::open(path).map_err(|err| BundleError::corrupt(path, format!("cannot open: {err}")))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|err| BundleError::corrupt(path, format!("not a readable archive: {err}")))?;

    validate_payloads(path, &mut archive)?;
    let catalog = read_catalog(path, &mut archive)?;
    if catalog.patches.is_empty() {
        tracing::warn!("Bundle {} declares no patches", path.display());
        return Ok(None);
    }

    let mut seen = HashSet::new();
    let mut patches = Vec::with_capacity(catalog.patches.len());
    for entry in catalog.patches {
        if !seen.insert(entry.name.clone()) {
            return Err(BundleError::corrupt(path, format!("duplicate patch name \"{}\"", entry.name)));
        }
        patches.push(build_patch(path, &mut archive, entry)?);
    }
    tracing::info!("Loaded {} patches from {}", patches.len(), path.display());
    Ok(Some(patches))
}

fn validate_payloads(path: &Path, archive: &mut Archive) -> Result<(), BundleError> {
    let mut payloads = 0usize;
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|err| BundleError::corrupt(path, format!("unreadable entry #{index}: {err}")))?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(PAYLOAD_EXTENSION) {
            continue;
        }
        if entry.size() == 0 {
            return Err(BundleError::corrupt(path, format!("payload {} is empty", entry.name())));
        }
        payloads += 1;
    }
    if payloads == 0 {
        return Err(BundleError::corrupt(path, "no executable payload entries"));
    }
    Ok(())
}

fn read_catalog(path: &Path, archive: &mut Archive) -> Result<Catalog, BundleError> {
    let mut entry = archive
        .by_name(CATALOG_ENTRY)
        .map_err(|_| BundleError::corrupt(path, format!("missing {CATALOG_ENTRY}")))?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|err| BundleError::corrupt(path, format!("cannot read {CATALOG_ENTRY}: {err}")))?;
    serde_json::from_str(&text)
        .map_err(|err| BundleError::corrupt(path, format!("malformed {CATALOG_ENTRY}: {err}")))
}

fn read_payload(path: &Path, archive: &mut Archive, name: &str) -> Result<Vec<u8>, BundleError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| BundleError::corrupt(path, format!("missing payload {name}")))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|err| BundleError::corrupt(path, format!("cannot read payload {name}: {err}")))?;
    Ok(data)
}

fn build_patch(path: &Path, archive: &mut Archive, entry: CatalogPatch) -> Result<Patch, BundleError> {
    let name = entry.name.clone();
    let mut patch = Patch::new(entry.name)
        .with_description(entry.description)
        .with_use_by_default(entry.use_by_default)
        .with_compatible_packages(entry.compatible_packages);
    for option in entry.options {
        patch = patch.with_option(option);
    }

    for operation in entry.operations {
        let operation = match operation {
            CatalogOperation::ReplaceText { entry, find, replace } => Operation::ReplaceText { entry, find, replace },
            CatalogOperation::ReplaceHex { entry, find, replace } => {
                let decode = |field: &str, text: &str| {
                    hex::decode(text).map_err(|err| {
                        BundleError::corrupt(path, format!("{name}: invalid hex in {field} of {entry}: {err}"))
                    })
                };
                Operation::ReplaceBytes {
                    find: decode("find", &find)?,
                    replace: decode("replace", &replace)?,
                    entry,
                }
            }
            CatalogOperation::PutText { entry, content } => Operation::PutText { entry, content },
            CatalogOperation::WriteEntry { entry, payload } => Operation::WriteEntry {
                data: Arc::new(read_payload(path, archive, &payload)?),
                entry,
            },
            CatalogOperation::RemoveEntry { entry } => Operation::RemoveEntry { entry },
        };
        patch = patch.with_operation(operation);
    }
    Ok(patch)
}
