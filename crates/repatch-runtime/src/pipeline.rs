//! Full patch pipeline
//!
//! `LoadPatches → PrepareSplitPackage → ReadInput → ExecutePatches → WriteOutput`.
//! Runs identically inside a worker process and in-process.

use crate::error::RuntimeError;
use crate::params::WorkerParameters;
use crate::session::PatchSession;
use repatch_bundle::{patches, resolve_selection, Patch};
use repatch_core::{run_step, EventSink, StepId};
use repatch_split::{is_split_archive, prepare_if_needed, PreparationResult};

/// Run one patch session end to end
///
/// Preparation cleanup runs whether the session succeeds or fails, and on
/// drop when the returned future is cancelled.
///
/// # Errors
/// The first failing step's error; a matching `Failed` event has been emitted.
pub async fn run_pipeline(parameters: &WorkerParameters, sink: &EventSink) -> Result<(), RuntimeError> {
    let patch_list = run_step(StepId::LoadPatches, sink, load_patches(parameters)).await?;

    let preparation = prepare(parameters, sink).await?;
    let outcome = run_session(parameters, &preparation, patch_list, sink).await;
    preparation.cleanup();
    outcome
}

async fn load_patches(parameters: &WorkerParameters) -> Result<Vec<Patch>, RuntimeError> {
    let bundles = parameters.bundles.clone();
    let package = parameters.package_name.clone();
    let loaded = tokio::task::spawn_blocking(move || patches(&bundles, &package))
        .await
        .map_err(|join| RuntimeError::Io(std::io::Error::other(join)))??;
    let ordered = resolve_selection(loaded, &parameters.selection, &parameters.options)?;
    tracing::info!("Loaded {} patches for {}", ordered.len(), parameters.package_name);
    Ok(ordered)
}

async fn prepare(parameters: &WorkerParameters, sink: &EventSink) -> Result<PreparationResult, RuntimeError> {
    let options = parameters.prepare_options();
    let prepare = async {
        prepare_if_needed(&parameters.input, &parameters.cache_dir, &options, sink)
            .await
            .map_err(RuntimeError::from)
    };
    if is_split_archive(&parameters.input) {
        run_step(StepId::PrepareSplitPackage, sink, prepare).await
    } else {
        prepare.await
    }
}

async fn run_session(
    parameters: &WorkerParameters,
    preparation: &PreparationResult,
    patch_list: Vec<Patch>,
    sink: &EventSink,
) -> Result<(), RuntimeError> {
    let mut session = run_step(
        StepId::ReadInput,
        sink,
        PatchSession::open(&preparation.file, &parameters.cache_dir, sink.clone()),
    )
    .await?;

    // Split inputs were stripped during preparation.
    let strip_abis = (parameters.strip_native_libs && !preparation.merged).then(|| parameters.supported_abis.clone());
    session.run(&parameters.output, patch_list, strip_abis).await
}
