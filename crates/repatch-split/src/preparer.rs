//! Split package preparation
//!
//! Turns a multi-module split archive into a single merged package:
//!
//! - extraction of every `*.apk` entry into a private working directory
//! - merge planning, including architecture-based module exclusion and
//!   optional skipping of locale and density splits the device does not use
//! - merging through the [`MergeEngine`] fallback chain
//! - optional native library stripping of the merged result
//!
//! Plain packages pass through untouched.

use crate::abi::{host_supported_abis, should_exclude, tokens};
use crate::detect::{is_module_entry, is_split_archive};
use crate::error::SplitError;
use crate::merge::{LineSink, MergeEngine, MergeRequest};
use crate::qualifiers::DeviceProfile;
use crate::strip::strip_native_libs;
use parking_lot::Mutex;
use repatch_core::{EventSink, ProgressEvent, StepId};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::ZipArchive;

/// Marker for sub-steps that will not run
pub const SKIPPED_PREFIX: &str = "[skipped] ";

/// Default parent directory name prefix of downloaded packages
pub const DEFAULT_DOWNLOADS_MARKER: &str = "downloaded-apps";

const EXTRACT_STEP: &str = "Extracting split APKs";
const WRITE_STEP: &str = "Writing merged APK";
const STRIP_STEP: &str = "Stripping native libraries";
const FINALIZE_STEP: &str = "Finalizing merged APK";

/// Preparation settings
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Drop modules and native libraries for unsupported architectures
    pub strip_native_libs: bool,
    /// Architectures to keep, best first
    pub supported_abis: Vec<String>,
    /// Sources under a directory starting with this name get the merged result written back
    pub downloads_marker: Option<String>,
    /// Leave out configuration splits `device` does not need
    pub skip_unneeded_splits: bool,
    /// Locale and density the output is meant for
    pub device: DeviceProfile,
    /// Merge strategies
    pub engine: MergeEngine,
}

impl PrepareOptions {
    /// Enable or disable native library stripping
    #[inline]
    #[must_use]
    pub fn with_strip_native_libs(mut self, strip: bool) -> Self {
        self.strip_native_libs = strip;
        self
    }

    /// Override the supported architectures
    #[inline]
    #[must_use]
    pub fn with_supported_abis(mut self, abis: Vec<String>) -> Self {
        self.supported_abis = abis;
        self
    }

    /// Override the downloads marker; `None` disables persisting
    #[inline]
    #[must_use]
    pub fn with_downloads_marker(mut self, marker: Option<String>) -> Self {
        self.downloads_marker = marker;
        self
    }

    /// Enable or disable skipping of unneeded configuration splits
    #[inline]
    #[must_use]
    pub fn with_skip_unneeded_splits(mut self, skip: bool) -> Self {
        self.skip_unneeded_splits = skip;
        self
    }

    /// Target device profile
    #[inline]
    #[must_use]
    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = device;
        self
    }

    /// Use `engine` for merging
    #[inline]
    #[must_use]
    pub fn with_engine(mut self, engine: MergeEngine) -> Self {
        self.engine = engine;
        self
    }
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            strip_native_libs: false,
            supported_abis: host_supported_abis(),
            downloads_marker: Some(DEFAULT_DOWNLOADS_MARKER.to_string()),
            skip_unneeded_splits: false,
            device: DeviceProfile::from_env(),
            engine: MergeEngine::default(),
        }
    }
}

/// Removes a working directory once
///
/// Runs at most one removal, whether called explicitly or on drop.
#[derive(Debug, Default)]
pub struct Cleanup {
    dir: Mutex<Option<PathBuf>>,
}

impl Cleanup {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir: Mutex::new(Some(dir)),
        }
    }

    fn noop() -> Self {
        Self::default()
    }

    /// Remove the directory; later calls do nothing
    pub fn run(&self) {
        let Some(dir) = self.dir.lock().take() else {
            return;
        };
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!("Removed working directory {}", dir.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!("Failed to remove {}: {}", dir.display(), err),
        }
    }

    /// `true` once the directory has been removed (or there never was one)
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.dir.lock().is_none()
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        self.run();
    }
}

/// Outcome of [`prepare_if_needed`]
#[derive(Debug)]
pub struct PreparationResult {
    /// Package to patch
    pub file: PathBuf,
    /// `true` if `file` was produced by merging
    pub merged: bool,
    cleanup: Cleanup,
}

impl PreparationResult {
    fn unchanged(file: &Path) -> Self {
        Self {
            file: file.to_path_buf(),
            merged: false,
            cleanup: Cleanup::noop(),
        }
    }

    /// Remove the working directory; idempotent
    pub fn cleanup(&self) {
        self.cleanup.run();
    }

    /// `true` once cleanup has run
    #[must_use]
    pub fn is_cleaned_up(&self) -> bool {
        self.cleanup.is_done()
    }
}

/// Merge `source` into a single package when it is a split archive
///
/// Progress goes to `sink` under [`StepId::PrepareSplitPackage`]. On error
/// the working directory is removed before the error is returned.
///
/// # Errors
/// [`SplitError::NoModules`] for an archive without modules, otherwise any
/// extraction, merge or strip failure.
pub async fn prepare_if_needed(
    source: &Path,
    workspace: &Path,
    options: &PrepareOptions,
    sink: &EventSink,
) -> Result<PreparationResult, SplitError> {
    if !is_split_archive(source) {
        return Ok(PreparationResult::unchanged(source));
    }

    let work_dir = workspace.join(format!("split-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::create_dir_all(&work_dir).await?;
    let cleanup = Cleanup::new(work_dir.clone());
    tracing::info!("Preparing split package {}", source.display());

    match merge_split(source, &work_dir, options, sink).await {
        Ok(file) => {
            tracing::info!("Split package merged to {}", file.display());
            Ok(PreparationResult {
                file,
                merged: true,
                cleanup,
            })
        }
        Err(err) => {
            cleanup.run();
            Err(err)
        }
    }
}

async fn merge_split(
    source: &Path,
    work_dir: &Path,
    options: &PrepareOptions,
    sink: &EventSink,
) -> Result<PathBuf, SplitError> {
    let step = StepId::PrepareSplitPackage;
    let modules_dir = work_dir.join("modules");
    tokio::fs::create_dir_all(&modules_dir).await?;

    sink.emit(ProgressEvent::message(step, EXTRACT_STEP));
    let extracted = blocking({
        let source = source.to_path_buf();
        let modules_dir = modules_dir.clone();
        move || extract_modules(&source, &modules_dir)
    })
    .await?;
    if extracted.is_empty() {
        return Err(SplitError::NoModules(source.to_path_buf()));
    }

    let mut order = options.engine.list_merge_order(&modules_dir).await;
    if order.is_empty() {
        tracing::debug!("Using extraction order for {}", source.display());
        order = extracted;
    }

    let mut skip = if options.strip_native_libs {
        excluded_modules(&order, &options.supported_abis)
    } else {
        BTreeSet::new()
    };
    for name in &skip {
        tracing::info!("Skipping split module {} (unsupported architecture)", name);
    }
    if options.skip_unneeded_splits {
        for name in order.iter().filter(|name| options.device.is_unneeded(name)) {
            if skip.insert(name.clone()) {
                tracing::info!("Skipping split module {} (unused locale or density)", name);
            }
        }
    }
    sink.emit(ProgressEvent::sub_steps(
        step,
        sub_steps(&order, &skip, options.strip_native_libs),
    ));

    let stem = source
        .file_stem()
        .map_or_else(|| "split".into(), |stem| stem.to_string_lossy());
    let output = work_dir.join(format!("{stem}-merged.apk"));

    let request = MergeRequest {
        modules_dir,
        output: output.clone(),
        skip,
    };
    options.engine.merge(&request, Some(line_sink(sink))).await?;
    sink.emit(ProgressEvent::message(step, WRITE_STEP));

    if options.strip_native_libs {
        sink.emit(ProgressEvent::message(step, STRIP_STEP));
        let supported = options.supported_abis.clone();
        let target = output.clone();
        blocking(move || strip_native_libs(&target, &supported)).await?;
    }

    sink.emit(ProgressEvent::message(step, FINALIZE_STEP));
    if let Some(marker) = &options.downloads_marker {
        persist_if_downloaded(source, &output, marker).await;
    }
    Ok(output)
}

/// Module names excluded for `supported` architectures
#[must_use]
pub fn excluded_modules(order: &[String], supported: &[String]) -> BTreeSet<String> {
    let supported = tokens(supported.iter().map(String::as_str));
    order
        .iter()
        .filter(|name| should_exclude(name, &supported))
        .cloned()
        .collect()
}

/// Sub-step titles for a merge plan
///
/// Skipped modules are listed first with [`SKIPPED_PREFIX`].
#[must_use]
pub fn sub_steps(order: &[String], skip: &BTreeSet<String>, strip: bool) -> Vec<String> {
    let mut steps = vec![EXTRACT_STEP.to_string()];
    steps.extend(
        order
            .iter()
            .filter(|name| skip.contains(*name))
            .map(|name| format!("{SKIPPED_PREFIX}Merging {name}")),
    );
    steps.extend(
        order
            .iter()
            .filter(|name| !skip.contains(*name))
            .map(|name| format!("Merging {name}")),
    );
    steps.push(WRITE_STEP.to_string());
    if strip {
        steps.push(STRIP_STEP.to_string());
    }
    steps.push(FINALIZE_STEP.to_string());
    steps
}

/// Move `from` to `to`, copying when a rename is not possible
///
/// # Errors
/// Filesystem failure of both the rename and the copy.
pub async fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::debug!("Rename {} failed ({}), copying", from.display(), err);
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

fn line_sink(sink: &EventSink) -> LineSink {
    let sink = sink.clone();
    Arc::new(move |line: &str| sink.emit(ProgressEvent::message(StepId::PrepareSplitPackage, line)))
}

fn extract_modules(source: &Path, modules_dir: &Path) -> Result<Vec<String>, SplitError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(source)?))?;
    let mut names = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() || !is_module_entry(entry.name()) {
            continue;
        }
        let name = entry
            .name()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let mut out = File::create(modules_dir.join(&name))?;
        std::io::copy(&mut entry, &mut out)?;
        tracing::debug!("Extracted {}", name);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

async fn persist_if_downloaded(source: &Path, merged: &Path, marker: &str) {
    let downloaded = source
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .is_some_and(|name| name.to_string_lossy().starts_with(marker));
    if !downloaded {
        return;
    }
    match tokio::fs::copy(merged, source).await {
        Ok(_) => tracing::info!("Cached merged package over {}", source.display()),
        Err(err) => tracing::warn!("Failed to cache merged package at {}: {}", source.display(), err),
    }
}

async fn blocking<T, F>(work: F) -> Result<T, SplitError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SplitError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|join| SplitError::Io(std::io::Error::other(join)))?
}
