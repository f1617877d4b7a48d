//! Error types for the patch runtime
//!
//! Errors fall into three groups:
//! - pipeline failures (bundle loading, split preparation, patch execution)
//! - worker lifecycle failures (handshake, stale build, exit code, remote failure)
//! - host-side misuse (concurrent sessions, bad configuration)

use repatch_bundle::BundleError;
use repatch_core::{is_out_of_memory, PatchFailure, RemoteError};
use repatch_split::SplitError;
use std::time::Duration;

/// Wire protocol failure
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Connection I/O failed
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame was not valid JSON for the expected message
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A well-formed message arrived at the wrong time
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Loading or selecting patches failed
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Split preparation failed
    #[error("split preparation failed: {0}")]
    Split(#[from] SplitError),

    /// A patch failed; the session produced no output
    #[error(transparent)]
    PatchFailed(#[from] PatchFailure),

    /// Worker did not connect in time
    #[error("worker did not connect within {}s", .0.as_secs())]
    WorkerHandshakeTimeout(Duration),

    /// Worker runs code from another build
    #[error("worker is running outdated code (build {actual}, expected {expected})")]
    StaleWorkerBuild {
        /// Host build id
        expected: String,
        /// Worker build id
        actual: String,
    },

    /// Worker exited with a non-zero code
    #[error("{}", process_exit_message(*.0))]
    ProcessExit(i32),

    /// Worker reported a failure while patching
    #[error("worker failed: {0}")]
    RemoteFailure(RemoteError),

    /// Wire protocol failure
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Another session is running on this runtime
    #[error("a patch session is already running")]
    SessionActive,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Session was cancelled
    #[error("patching was cancelled")]
    Cancelled,

    /// Archive read/write failure
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Exit code for [`RuntimeError::ProcessExit`]
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ProcessExit(code) => Some(*code),
            _ => None,
        }
    }

    /// Serializable form for the progress stream
    #[must_use]
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::RemoteFailure(remote) => remote.clone(),
            Self::PatchFailed(failure) => failure.error.clone(),
            other => RemoteError::from_error(other.kind(), other),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Bundle(_) => "BundleError",
            Self::Split(_) => "SplitError",
            Self::PatchFailed(_) => "PatchFailed",
            Self::WorkerHandshakeTimeout(_) => "WorkerHandshakeTimeout",
            Self::StaleWorkerBuild { .. } => "StaleWorkerBuild",
            Self::ProcessExit(_) => "ProcessExit",
            Self::RemoteFailure(_) => "RemoteFailure",
            Self::Protocol(_) => "ProtocolError",
            Self::SessionActive => "SessionActive",
            Self::Config(_) => "ConfigError",
            Self::Cancelled => "Cancelled",
            Self::Zip(_) => "ZipError",
            Self::Io(_) => "IoError",
        }
    }
}

fn process_exit_message(code: i32) -> String {
    if is_out_of_memory(code) {
        format!("process exited with nonzero exit code {code} (out of memory)")
    } else {
        format!("process exited with nonzero exit code {code}")
    }
}
