//! repatch runtime
//!
//! Runs patch sessions and isolates them from the caller:
//! - [`PatchSession`] / [`run_pipeline`]: the patch pipeline itself
//! - [`ProcessRuntime`]: the pipeline in a worker process bounded by a memory budget
//! - [`InProcessRuntime`]: the pipeline in the current process
//! - [`Patcher`]: runtime selection with the in-process compatibility fallback
//! - [`RepatchConfig`]: `repatch.toml`
//!
//! The `repatch` binary is the command line; `repatch-worker` hosts the
//! worker entries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod logging;
pub mod protocol;
pub mod worker;

mod error;
mod in_process;
mod params;
mod patcher;
mod pipeline;
mod process;
mod runtime;
mod session;

pub use config::{FallbackPolicy, PatchingConfig, RepatchConfig, RuntimeConfig, RuntimeMode};
pub use error::{ProtocolError, RuntimeError};
pub use in_process::InProcessRuntime;
pub use params::WorkerParameters;
pub use patcher::{kernel_major, parse_kernel_major, Patcher};
pub use pipeline::run_pipeline;
pub use process::{relay_messages, ProcessRuntime, WorkerHandle, HANDSHAKE_TIMEOUT, PATCHER_ENTRY};
pub use runtime::{Runtime, SessionGuard, SessionSlot};
pub use session::{PatchSession, RESULT_FILE};

/// Build id compiled into this binary; host and worker must agree on it
pub const BUILD_ID: &str = env!("REPATCH_BUILD_ID");
