//! Merge engine
//!
//! Merging runs through an ordered list of [`MergeStrategy`]s. The usual
//! setup tries the cheap in-process merger first and retries in a separate
//! worker process when that fails.

mod capture;
mod entry;
mod in_process;
mod modules;
mod subprocess;

pub use capture::{should_forward, LineSink, OutputCapture, MAX_LINE_CHARS, MAX_OUTPUT_LINES};
pub use entry::{run_merge_entry, ACTION_LIST, ACTION_MERGE, MERGE_ENTRY, ORDER_PREFIX};
pub use in_process::InProcessMerge;
pub use modules::{display_name, is_signature_entry, MergeSummary, Module, ModuleSet};
pub use subprocess::SubprocessMerge;

use crate::error::MergeError;
use async_trait::async_trait;
use repatch_core::{Fallback, FallbackError};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What to merge and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Directory holding the extracted modules
    pub modules_dir: PathBuf,
    /// Merged archive to create
    pub output: PathBuf,
    /// Module names to leave out (never the base)
    pub skip: BTreeSet<String>,
}

/// One way of running the module merger
#[async_trait]
pub trait MergeStrategy: Send + Sync + fmt::Debug {
    /// Strategy name used in logs and errors
    fn name(&self) -> &'static str;

    /// Merge order the merger would use, base first
    async fn list_order(&self, modules_dir: &Path) -> Result<Vec<String>, MergeError>;

    /// Merge the modules of `request`
    async fn merge(&self, request: &MergeRequest, on_line: Option<LineSink>) -> Result<(), MergeError>;
}

/// Ordered strategies with fallback
#[derive(Debug, Clone)]
pub struct MergeEngine {
    strategies: Vec<Arc<dyn MergeStrategy>>,
}

impl MergeEngine {
    /// Engine over explicit strategies, tried in order
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn MergeStrategy>>) -> Self {
        Self { strategies }
    }

    /// In-process merging only
    #[must_use]
    pub fn in_process() -> Self {
        Self::new(vec![Arc::new(InProcessMerge)])
    }

    /// In-process merging, retried via `subprocess`
    #[must_use]
    pub fn with_subprocess(subprocess: SubprocessMerge) -> Self {
        Self::new(vec![Arc::new(InProcessMerge), Arc::new(subprocess)])
    }

    /// Strategy names in attempt order
    #[must_use]
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Merge, falling back across strategies
    ///
    /// # Errors
    /// Every strategy's failure when all of them fail.
    pub async fn merge(&self, request: &MergeRequest, on_line: Option<LineSink>) -> Result<(), FallbackError<MergeError>> {
        let names = self.strategy_names();
        let mut chain = Fallback::new();
        for strategy in &self.strategies {
            let strategy = strategy.clone();
            let request = request.clone();
            let on_line = on_line.clone();
            chain = chain.attempt(strategy.name(), move || async move { strategy.merge(&request, on_line).await });
        }

        let notify = on_line.clone();
        let mut attempt = 0usize;
        chain
            .run_while(
                |_| true,
                move |name, err| {
                    attempt += 1;
                    let next = names.get(attempt).copied().unwrap_or("next strategy");
                    tracing::warn!("Merge {} failed: {}", name, err);
                    if let Some(notify) = &notify {
                        notify(&format!("merge {name} failed, retrying via {next}"));
                    }
                },
            )
            .await
    }

    /// Merge order, or an empty list when every strategy fails
    pub async fn list_merge_order(&self, modules_dir: &Path) -> Vec<String> {
        let mut chain = Fallback::new();
        for strategy in &self.strategies {
            let strategy = strategy.clone();
            let dir = modules_dir.to_path_buf();
            chain = chain.attempt(strategy.name(), move || async move { strategy.list_order(&dir).await });
        }
        match chain.run().await {
            Ok(order) => order,
            Err(err) => {
                tracing::warn!("Unable to resolve merge order: {}", err);
                Vec::new()
            }
        }
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::in_process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Scripted {
        name: &'static str,
        result: Result<Vec<String>, String>,
    }

    #[async_trait]
    impl MergeStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn list_order(&self, _modules_dir: &Path) -> Result<Vec<String>, MergeError> {
            self.result.clone().map_err(MergeError::Failed)
        }

        async fn merge(&self, _request: &MergeRequest, _on_line: Option<LineSink>) -> Result<(), MergeError> {
            self.result.clone().map(|_| ()).map_err(MergeError::Failed)
        }
    }

    fn engine(first: Result<Vec<String>, String>, second: Result<Vec<String>, String>) -> MergeEngine {
        MergeEngine::new(vec![
            Arc::new(Scripted {
                name: "in-process",
                result: first,
            }),
            Arc::new(Scripted {
                name: "subprocess",
                result: second,
            }),
        ])
    }

    fn request() -> MergeRequest {
        MergeRequest {
            modules_dir: PathBuf::from("/tmp/modules"),
            output: PathBuf::from("/tmp/out.apk"),
            skip: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn retry_is_announced_on_the_line_sink() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let on_line: LineSink = Arc::new(move |line: &str| sink.lock().push(line.to_string()));

        engine(Err("X".into()), Ok(Vec::new()))
            .merge(&request(), Some(on_line))
            .await
            .unwrap();

        assert_eq!(
            *lines.lock(),
            vec!["merge in-process failed, retrying via subprocess".to_string()]
        );
    }

    #[tokio::test]
    async fn total_failure_concatenates_causes() {
        let err = engine(Err("X".into()), Err("Y".into()))
            .merge(&request(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "in-process failed: X. subprocess failed: Y");
    }

    #[tokio::test]
    async fn list_order_falls_back_then_gives_up_quietly() {
        let order = engine(Err("X".into()), Ok(vec!["base.apk".into()]))
            .list_merge_order(Path::new("/tmp/modules"))
            .await;
        assert_eq!(order, vec!["base.apk".to_string()]);

        let order = engine(Err("X".into()), Err("Y".into()))
            .list_merge_order(Path::new("/tmp/modules"))
            .await;
        assert!(order.is_empty());
    }
}
