//! Patch session
//!
//! Reads the prepared input once, applies the patch list with ordered
//! progress and writes the result. Output goes to a private working
//! directory first and is only moved to the final path once complete.

use crate::engine::{self, Execution};
use crate::error::RuntimeError;
use repatch_bundle::{Entries, Patch};
use repatch_core::{run_step, EventSink, PatchProgress, ProgressEvent, StepId};
use repatch_split::{relocate, strip_native_libs};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WRITE_ENTRIES: &str = "Writing patched entries";
const STRIP_LIBS: &str = "Stripping native libraries";
const MOVE_OUTPUT: &str = "Moving output";

/// Result file inside the working directory
pub const RESULT_FILE: &str = "result.apk";

/// One patch session over a prepared input
#[derive(Debug)]
pub struct PatchSession {
    input: PathBuf,
    work_dir: PathBuf,
    entries: Entries,
    sink: EventSink,
}

impl PatchSession {
    /// Read `input` into memory
    ///
    /// # Errors
    /// The input is not a readable archive.
    pub async fn open(input: &Path, cache_dir: &Path, sink: EventSink) -> Result<Self, RuntimeError> {
        let work_dir = cache_dir.join(format!("patcher-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&work_dir).await?;

        let path = input.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || read_entries(&path))
            .await
            .map_err(|join| RuntimeError::Io(std::io::Error::other(join)))?;
        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                remove_work_dir(&work_dir);
                return Err(err);
            }
        };
        tracing::info!("Read {} entries from {}", entries.len(), input.display());

        Ok(Self {
            input: input.to_path_buf(),
            work_dir,
            entries,
            sink,
        })
    }

    /// Number of entries read from the input
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Apply `patches` and write the result to `output`
    ///
    /// `strip_abis` strips native libraries outside the given architectures
    /// from the written result.
    ///
    /// # Errors
    /// [`RuntimeError::PatchFailed`] when any patch fails (no output is
    /// written), otherwise archive or filesystem failures.
    pub async fn run(
        &mut self,
        output: &Path,
        patches: Vec<Patch>,
        strip_abis: Option<Vec<String>>,
    ) -> Result<(), RuntimeError> {
        let entries = std::mem::take(&mut self.entries);
        tracing::info!("Applying {} patches to {}", patches.len(), self.input.display());
        let patched = run_step(
            StepId::ExecutePatches,
            &self.sink,
            execute_patches(&self.sink, patches, entries),
        )
        .await?;

        run_step(
            StepId::WriteOutput,
            &self.sink,
            write_output(&self.sink, &self.work_dir, patched, output, strip_abis),
        )
        .await
    }
}

impl Drop for PatchSession {
    fn drop(&mut self) {
        remove_work_dir(&self.work_dir);
    }
}

async fn execute_patches(sink: &EventSink, patches: Vec<Patch>, entries: Entries) -> Result<Entries, RuntimeError> {
    let names = patches.iter().map(|patch| patch.name().to_string()).collect();
    let mut progress = PatchProgress::begin(names, sink.clone());

    let Execution {
        mut notifications,
        result,
    } = engine::execute(patches, entries);
    while let Some(notification) = notifications.recv().await {
        progress.record(notification.index, notification.outcome)?;
    }

    let patched = result
        .await
        .map_err(|join| RuntimeError::Io(std::io::Error::other(join)))?
        .ok_or(RuntimeError::Cancelled)?;
    progress.finish();
    Ok(patched)
}

async fn write_output(
    sink: &EventSink,
    work_dir: &Path,
    entries: Entries,
    output: &Path,
    strip_abis: Option<Vec<String>>,
) -> Result<(), RuntimeError> {
    let step = StepId::WriteOutput;
    let mut sub_steps = vec![WRITE_ENTRIES.to_string()];
    if strip_abis.is_some() {
        sub_steps.push(STRIP_LIBS.to_string());
    }
    sub_steps.push(MOVE_OUTPUT.to_string());
    sink.emit(ProgressEvent::sub_steps(step, sub_steps));

    sink.emit(ProgressEvent::message(step, WRITE_ENTRIES));
    let result = work_dir.join(RESULT_FILE);
    let total = entries.len() as u64;
    let target = result.clone();
    tokio::task::spawn_blocking(move || write_entries(&target, &entries))
        .await
        .map_err(|join| RuntimeError::Io(std::io::Error::other(join)))??;
    sink.emit(ProgressEvent::counted(step, total, total, format!("Wrote {total} entries")));

    if let Some(abis) = strip_abis {
        sink.emit(ProgressEvent::message(step, STRIP_LIBS));
        let target = result.clone();
        tokio::task::spawn_blocking(move || strip_native_libs(&target, &abis))
            .await
            .map_err(|join| RuntimeError::Io(std::io::Error::other(join)))??;
    }

    sink.emit(ProgressEvent::message(step, MOVE_OUTPUT));
    relocate(&result, output).await?;
    tracing::info!("Patched package saved to {}", output.display());
    Ok(())
}

fn read_entries(path: &Path) -> Result<Entries, RuntimeError> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let mut entries = Entries::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
        entry.read_to_end(&mut data)?;
        entries.insert(entry.name().to_string(), data);
    }
    Ok(entries)
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), RuntimeError> {
    let mut writer = ZipWriter::new(File::create(path)?);
    for (name, data) in entries {
        let method = if stored_uncompressed(name) {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        writer.start_file(name.as_str(), SimpleFileOptions::default().compression_method(method))?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

fn stored_uncompressed(name: &str) -> bool {
    name == "resources.arsc" || name.ends_with(".so")
}

fn remove_work_dir(dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(dir) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove {}: {}", dir.display(), err);
        }
    }
}
