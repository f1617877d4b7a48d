//! Split package handling
//!
//! Detects multi-module split archives, merges their modules into one
//! package and strips native code for unsupported architectures.

pub mod abi;
pub mod merge;
pub mod qualifiers;

mod detect;
mod error;
mod preparer;
mod strip;

pub use detect::{is_module_entry, is_split_archive, MODULE_EXTENSION, SPLIT_EXTENSIONS};
pub use error::{MergeError, SplitError};
pub use qualifiers::DeviceProfile;
pub use merge::{InProcessMerge, MergeEngine, MergeRequest, MergeStrategy, SubprocessMerge};
pub use preparer::{
    excluded_modules, prepare_if_needed, relocate, sub_steps, Cleanup, PreparationResult, PrepareOptions,
    DEFAULT_DOWNLOADS_MARKER, SKIPPED_PREFIX,
};
pub use strip::strip_native_libs;
