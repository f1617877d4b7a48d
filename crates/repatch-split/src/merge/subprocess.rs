//! Merger running in a separate worker process

use super::capture::{LineSink, OutputCapture};
use super::entry::{ACTION_LIST, ACTION_MERGE, MERGE_ENTRY, ORDER_PREFIX};
use super::{MergeRequest, MergeStrategy};
use crate::error::MergeError;
use async_trait::async_trait;
use repatch_core::{exit_code, WorkerLaunch};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Spawns the worker binary with the merge entry
#[derive(Debug, Clone)]
pub struct SubprocessMerge {
    program: PathBuf,
    tmp_dir: PathBuf,
    classpath: Option<PathBuf>,
    heap_limit_mb: Option<u64>,
    heap_shim: Option<PathBuf>,
}

impl SubprocessMerge {
    /// Merge via `program`, using `tmp_dir` as its temporary directory
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            tmp_dir: tmp_dir.into(),
            classpath: None,
            heap_limit_mb: None,
            heap_shim: None,
        }
    }

    /// Classpath handed to the worker
    #[inline]
    #[must_use]
    pub fn with_classpath(mut self, classpath: impl Into<PathBuf>) -> Self {
        self.classpath = Some(classpath.into());
        self
    }

    /// Heap limit, enforced through `shim` when present
    #[inline]
    #[must_use]
    pub fn with_heap_limit(mut self, limit_mb: u64, shim: Option<PathBuf>) -> Self {
        self.heap_limit_mb = Some(limit_mb);
        self.heap_shim = shim;
        self
    }

    /// Worker command line for `action`, before the action arguments
    #[must_use]
    pub fn launch(&self, action: &str) -> WorkerLaunch {
        let mut launch = WorkerLaunch::new(&self.program, MERGE_ENTRY)
            .with_tmp_dir(&self.tmp_dir)
            .with_nice_name(format!("repatch:{MERGE_ENTRY}"))
            .arg(action);
        if let Some(classpath) = &self.classpath {
            launch = launch.with_classpath(classpath);
        }
        if let Some(limit) = self.heap_limit_mb {
            launch = launch.with_heap_limit(limit, self.heap_shim.clone());
        }
        launch
    }

    async fn run(&self, launch: WorkerLaunch, capture: &OutputCapture) -> Result<(), MergeError> {
        let mut child = launch.command().spawn()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            capture.record(&line);
        }

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }
        Err(MergeError::Failed(
            capture.failure_message(&format!("merge process failed ({})", exit_code(status))),
        ))
    }
}

#[async_trait]
impl MergeStrategy for SubprocessMerge {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn list_order(&self, modules_dir: &Path) -> Result<Vec<String>, MergeError> {
        let capture = OutputCapture::new(None);
        self.run(self.launch(ACTION_LIST).arg(modules_dir), &capture).await?;
        let order = capture
            .tail()
            .lines()
            .filter_map(|line| line.strip_prefix(ORDER_PREFIX))
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        Ok(order)
    }

    async fn merge(&self, request: &MergeRequest, on_line: Option<LineSink>) -> Result<(), MergeError> {
        let skip = request.skip.iter().cloned().collect::<Vec<_>>().join(",");
        let launch = self
            .launch(ACTION_MERGE)
            .arg(&request.modules_dir)
            .arg(&request.output)
            .arg(skip);
        let capture = OutputCapture::new(on_line);
        self.run(launch, &capture).await
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("Merge process output closed: {}", err);
                break;
            }
        }
    }
}
