//! repatch bundles
//!
//! Loading and validation of patch bundles, compatibility filtering, and the
//! fixed operation vocabulary patches are written in.
//!
//! # Core Concepts
//!
//! - [`load_bundle`]: validate an archive and decode its catalog
//! - [`patches`]: per-bundle patches compatible with a target package
//! - [`resolve_selection`]: ordered, option-applied patch list for a session
//! - [`Patch`] / [`Operation`]: what runs against package entries

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
mod error;
mod loader;
mod patch;
mod selection;

pub use catalog::{CATALOG_ENTRY, PAYLOAD_EXTENSION};
pub use error::{BundleError, PatchError};
pub use loader::{load_bundle, load_groups, patches, resolve_selection, BundleSource};
pub use patch::{CompatiblePackage, Entries, Operation, Patch, PatchOption};
pub use selection::{PatchOptions, PatchSelection};
