//! repatch core
//!
//! Building blocks shared by the host, the worker and the split preparer:
//! - [`StepId`] / [`ProgressEvent`] / [`RemoteError`]: the step model
//! - [`PatchProgress`]: reconciles out-of-order patch notifications
//! - [`MemoryPolicy`]: worker memory budget computation
//! - [`Fallback`]: ordered strategy fallback with aggregated failures
//! - [`EventSink`]: where events go
//! - [`launch`]: worker process launch shape and exit-code interpretation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod events;
pub mod fallback;
pub mod launch;
pub mod memory;
pub mod progress;
pub mod reconcile;

pub use events::{EventLog, EventSink};
pub use fallback::{AttemptFailure, Fallback, FallbackError};
pub use launch::{exit_code, is_out_of_memory, WorkerLaunch, OOM_EXIT_CODE};
pub use memory::{MemoryPolicy, FALLBACK_DEFAULT_MB, MIN_BUDGET_MB};
pub use progress::{run_step, ProgressEvent, RemoteError, StepId};
pub use reconcile::{PatchFailure, PatchProgress};
