//! Step identifiers, progress events and the remote error record
//!
//! Every stage of a patch session is identified by a [`StepId`]. For a fixed
//! step a consumer observes `Started → Progress* → Completed | Failed`.
//! Events and errors are plain serde records so they survive the host/worker
//! process boundary without shared type definitions.

use crate::events::EventSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Instant;

/// Identifier of a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    /// Loading patch bundles and resolving the selection
    LoadPatches,
    /// Normalizing a split package into a single package
    PrepareSplitPackage,
    /// Reading the input package
    ReadInput,
    /// Executing the ordered patch list
    ExecutePatches,
    /// Executing one patch, by 0-based index in caller order
    ExecutePatch(usize),
    /// Writing the output package
    WriteOutput,
    /// Signing the output package (performed outside this workspace)
    SignOutput,
}

impl StepId {
    /// Patch index carried by [`StepId::ExecutePatch`]
    #[inline]
    #[must_use]
    pub fn patch_index(&self) -> Option<usize> {
        match self {
            Self::ExecutePatch(index) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadPatches => f.write_str("load patches"),
            Self::PrepareSplitPackage => f.write_str("prepare split package"),
            Self::ReadInput => f.write_str("read input"),
            Self::ExecutePatches => f.write_str("execute patches"),
            Self::ExecutePatch(index) => write!(f, "execute patch #{index}"),
            Self::WriteOutput => f.write_str("write output"),
            Self::SignOutput => f.write_str("sign output"),
        }
    }
}

/// Progress notification emitted by a patch session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A step began
    Started {
        /// Step that began
        step: StepId,
    },
    /// Intermediate progress for a running step
    Progress {
        /// Step reporting progress
        step: StepId,
        /// Human-readable status line
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Units done
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<u64>,
        /// Units expected
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        /// Sub-step titles published for this step
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_steps: Option<Vec<String>>,
    },
    /// A step finished successfully
    Completed {
        /// Step that finished
        step: StepId,
    },
    /// A step, or the session as a whole when `step` is absent, failed
    Failed {
        /// Failing step
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<StepId>,
        /// Failure record
        error: RemoteError,
    },
}

impl ProgressEvent {
    /// `Started(step)`
    #[inline]
    #[must_use]
    pub fn started(step: StepId) -> Self {
        Self::Started { step }
    }

    /// `Completed(step)`
    #[inline]
    #[must_use]
    pub fn completed(step: StepId) -> Self {
        Self::Completed { step }
    }

    /// `Failed(step, error)`
    #[inline]
    #[must_use]
    pub fn failed(step: Option<StepId>, error: RemoteError) -> Self {
        Self::Failed { step, error }
    }

    /// Progress carrying only a status message
    #[must_use]
    pub fn message(step: StepId, message: impl Into<String>) -> Self {
        Self::Progress {
            step,
            message: Some(message.into()),
            current: None,
            total: None,
            sub_steps: None,
        }
    }

    /// Progress with a `current / total` counter
    #[must_use]
    pub fn counted(step: StepId, current: u64, total: u64, message: impl Into<String>) -> Self {
        Self::Progress {
            step,
            message: Some(message.into()),
            current: Some(current),
            total: Some(total),
            sub_steps: None,
        }
    }

    /// Progress publishing the sub-step titles of a step
    #[must_use]
    pub fn sub_steps(step: StepId, titles: Vec<String>) -> Self {
        Self::Progress {
            step,
            message: None,
            current: None,
            total: None,
            sub_steps: Some(titles),
        }
    }

    /// Step this event refers to, if any
    #[must_use]
    pub fn step(&self) -> Option<StepId> {
        match self {
            Self::Started { step } | Self::Progress { step, .. } | Self::Completed { step } => {
                Some(*step)
            }
            Self::Failed { step, .. } => *step,
        }
    }

    /// `true` for `Completed` and `Failed`
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Serializable failure record
///
/// Carries the failure across the process boundary as plain strings: the
/// error's type name, its message and a rendered cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Type name of the original error
    #[serde(rename = "type")]
    pub error_type: String,
    /// Top-level message
    #[serde(default)]
    pub message: Option<String>,
    /// Rendered error with its cause chain
    pub stack_trace: String,
}

impl RemoteError {
    /// Create a record from parts
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        let error_type = error_type.into();
        let message = message.into();
        let stack_trace = format!("{error_type}: {message}");
        Self {
            error_type,
            message: Some(message),
            stack_trace,
        }
    }

    /// Capture an error value, naming it after its static type
    #[must_use]
    pub fn capture<E: std::error::Error + 'static>(err: &E) -> Self {
        Self::from_error(std::any::type_name::<E>(), err)
    }

    /// Capture an error value under an explicit type name
    #[must_use]
    pub fn from_error<E: std::error::Error + ?Sized>(error_type: &str, err: &E) -> Self {
        let message = err.to_string();
        let mut stack_trace = format!("{error_type}: {message}");
        let mut source = err.source();
        while let Some(cause) = source {
            stack_trace.push_str("\nCaused by: ");
            stack_trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            error_type: error_type.to_string(),
            message: Some(message),
            stack_trace,
        }
    }

    /// Append a diagnostic section to the stack trace
    #[must_use]
    pub fn with_section(mut self, title: &str, body: &str) -> Self {
        if !body.is_empty() {
            self.stack_trace = format!("{}\n\n{title}:\n{body}", self.stack_trace);
        }
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.error_type, message),
            None => f.write_str(&self.error_type),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Run `work` as pipeline step `step`
///
/// Emits `Started`, then `Completed` or `Failed(step, error)`. The error is
/// returned unchanged to the caller.
pub async fn run_step<T, E, F>(step: StepId, sink: &EventSink, work: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    sink.emit(ProgressEvent::started(step));
    let started = Instant::now();
    let result = work.await;
    let elapsed = started.elapsed();

    match &result {
        Ok(_) => {
            tracing::debug!("Step {} completed in {}ms", step, elapsed.as_millis());
            sink.emit(ProgressEvent::completed(step));
        }
        Err(err) => {
            tracing::error!("Step {} failed after {}ms: {}", step, elapsed.as_millis(), err);
            sink.emit(ProgressEvent::failed(Some(step), RemoteError::capture(err)));
        }
    }
    result
}
