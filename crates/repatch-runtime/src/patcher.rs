//! Runtime selection and compatibility fallback
//!
//! [`Patcher`] is what callers use: it picks the configured runtime, retries a
//! worker that exited abnormally in-process on hosts where the worker is
//! known to be unreliable, and turns the final failure into a `Failed` event.

use crate::config::{FallbackPolicy, RepatchConfig, RuntimeMode};
use crate::error::RuntimeError;
use crate::in_process::InProcessRuntime;
use crate::params::WorkerParameters;
use crate::process::ProcessRuntime;
use crate::runtime::Runtime;
use repatch_core::{EventSink, Fallback, ProgressEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const OS_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Runs patch sessions on the configured runtime
pub struct Patcher {
    config: RepatchConfig,
    primary: Arc<dyn Runtime>,
    fallback: Option<Arc<dyn Runtime>>,
    kernel_major: Option<u32>,
}

impl std::fmt::Debug for Patcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patcher")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|runtime| runtime.name()))
            .field("kernel_major", &self.kernel_major)
            .finish_non_exhaustive()
    }
}

impl Patcher {
    /// Patcher for `config`
    ///
    /// # Errors
    /// The worker binary cannot be located in process mode.
    pub fn from_config(config: RepatchConfig) -> Result<Self, RuntimeError> {
        let primary: Arc<dyn Runtime> = match config.runtime.mode {
            RuntimeMode::Process => Arc::new(ProcessRuntime::from_config(&config)?),
            RuntimeMode::InProcess => Arc::new(InProcessRuntime::new()),
        };
        let fallback: Option<Arc<dyn Runtime>> = match config.runtime.mode {
            RuntimeMode::Process => Some(Arc::new(InProcessRuntime::new())),
            RuntimeMode::InProcess => None,
        };
        Ok(Self::new(config, primary, fallback))
    }

    /// Patcher over explicit runtimes
    #[must_use]
    pub fn new(config: RepatchConfig, primary: Arc<dyn Runtime>, fallback: Option<Arc<dyn Runtime>>) -> Self {
        Self {
            config,
            primary,
            fallback,
            kernel_major: kernel_major(),
        }
    }

    /// Override the detected kernel major version
    #[inline]
    #[must_use]
    pub fn with_kernel_major(mut self, major: Option<u32>) -> Self {
        self.kernel_major = major;
        self
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RepatchConfig {
        &self.config
    }

    /// Session parameters with the configured cache and split handling
    #[must_use]
    pub fn parameters(&self, package_name: &str, input: &Path, output: &Path) -> WorkerParameters {
        let runtime = &self.config.runtime;
        let memory_limit = self
            .config
            .memory_policy()
            .effective(runtime.memory_limit_mb, runtime.aggressive_memory);
        let mut parameters = WorkerParameters::new(package_name, input, output, self.config.cache_dir())
            .with_native_libs(self.config.patching.strip_native_libs, self.config.supported_abis())
            .with_downloads_marker(self.config.patching.downloads_marker.clone())
            .with_unneeded_splits(
                self.config.patching.skip_unneeded_splits,
                self.config.patching.locales.clone(),
                self.config.patching.density.clone(),
            )
            .with_worker_memory(memory_limit, runtime.heap_shim.clone());
        if let Ok(classpath) = std::env::current_exe() {
            parameters = parameters.with_classpath(classpath);
        }
        if let Some(worker) = self.merge_worker() {
            parameters = parameters.with_merge_worker(worker);
        }
        parameters
    }

    /// `true` when a worker exit failure is retried in-process
    #[must_use]
    pub fn falls_back(&self) -> bool {
        if self.fallback.is_none() {
            return false;
        }
        match self.config.runtime.fallback {
            FallbackPolicy::Always => true,
            FallbackPolicy::Never => false,
            FallbackPolicy::Auto => self
                .kernel_major
                .is_some_and(|major| major < self.config.runtime.legacy_kernel_below),
        }
    }

    /// Run one session
    ///
    /// # Errors
    /// The error of the last runtime attempted; a `Failed` event without a
    /// step has been emitted for it.
    pub async fn patch(&self, parameters: WorkerParameters, sink: EventSink) -> Result<(), RuntimeError> {
        tracing::info!(
            "Patching {} on the {} runtime",
            parameters.input.display(),
            self.primary.name()
        );

        let mut chain = Fallback::new().attempt(self.primary.name(), {
            let runtime = self.primary.clone();
            let (parameters, sink) = (parameters.clone(), sink.clone());
            move || async move { runtime.execute(parameters, sink).await }
        });
        if let Some(fallback) = self.fallback.clone().filter(|_| self.falls_back()) {
            let (parameters, sink) = (parameters, sink.clone());
            chain = chain.attempt(fallback.name(), move || async move { fallback.execute(parameters, sink).await });
        }

        let outcome = chain
            .run_while(
                |err: &RuntimeError| err.exit_code().is_some(),
                |strategy, err| tracing::warn!("{} runtime failed ({}), retrying in-process", strategy, err),
            )
            .await;

        outcome.map_err(|failures| {
            let err = failures.into_last().unwrap_or(RuntimeError::Cancelled);
            tracing::error!("Patching failed: {}", err);
            sink.emit(ProgressEvent::failed(None, err.to_remote()));
            err
        })
    }

    /// Cancel the running session, if any
    pub fn cancel(&self) {
        self.primary.cancel();
        if let Some(fallback) = &self.fallback {
            fallback.cancel();
        }
    }

    fn merge_worker(&self) -> Option<PathBuf> {
        self.config.worker_binary().ok().filter(|path| path.is_file())
    }
}

/// Major version of the running kernel
#[must_use]
pub fn kernel_major() -> Option<u32> {
    std::fs::read_to_string(OS_RELEASE_PATH)
        .ok()
        .and_then(|release| parse_kernel_major(&release))
}

/// Leading number of a release string such as `5.15.0-91-generic`
#[must_use]
pub fn parse_kernel_major(release: &str) -> Option<u32> {
    let release = release.trim();
    let end = release
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(release.len());
    release[..end].parse().ok()
}
