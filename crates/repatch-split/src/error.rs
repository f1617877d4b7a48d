//! Error types for split preparation and merging

use repatch_core::FallbackError;
use std::path::PathBuf;

/// Split package preparation errors
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// Archive contained no module entries
    #[error("split archive {} does not contain any APK entries", .0.display())]
    NoModules(PathBuf),

    /// Every merge strategy failed
    #[error("merge failed: {0}")]
    Merge(#[from] FallbackError<MergeError>),

    /// Archive read/write failure
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single merge attempt
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Module directory has no modules
    #[error("no modules found in {}", .0.display())]
    NoModules(PathBuf),

    /// A module could not be opened as an archive
    #[error("module {name} is not a readable archive: {source}")]
    InvalidModule {
        /// Module file name
        name: String,
        /// Archive error
        #[source]
        source: zip::result::ZipError,
    },

    /// Attempt failed; carries the captured output tail
    #[error("{0}")]
    Failed(String),

    /// Archive read/write failure
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
