//! Error types for bundle loading and patch execution

use std::path::PathBuf;

/// Bundle loading and selection errors
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Archive unreadable, payload missing or empty, catalog malformed
    #[error("patch bundle {} is corrupted or incomplete: {reason}", path.display())]
    CorruptBundle {
        /// Bundle file
        path: PathBuf,
        /// What was wrong
        reason: String,
    },

    /// Selection references a bundle that is not configured
    #[error("patch bundle \"{0}\" is not configured")]
    UnknownBundle(String),

    /// Selection references a patch the bundle does not provide
    #[error("patch with name \"{name}\" does not exist in bundle \"{bundle}\"")]
    UnknownPatch {
        /// Bundle id
        bundle: String,
        /// Patch name
        name: String,
    },

    /// Option key not declared by the patch
    #[error("patch \"{patch}\" has no option \"{key}\"")]
    UnknownOption {
        /// Patch name
        patch: String,
        /// Option key
        key: String,
    },
}

impl BundleError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptBundle {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of one patch operation against a package
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Operation targets an entry the package does not contain
    #[error("entry not found: {0}")]
    MissingEntry(String),

    /// Search pattern absent from the entry
    #[error("pattern not found in {entry}: {pattern}")]
    PatternNotFound {
        /// Package entry
        entry: String,
        /// Pattern as written in the catalog
        pattern: String,
    },

    /// Text operation on an entry that is not UTF-8
    #[error("entry is not valid UTF-8: {0}")]
    NotText(String),

    /// Placeholder references an option without value or default
    #[error("option \"{0}\" has no value")]
    MissingOption(String),
}
