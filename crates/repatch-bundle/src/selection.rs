//! Caller choices: which patches to run and with which option values

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Bundle id → selected patch names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSelection {
    bundles: IndexMap<String, BTreeSet<String>>,
}

impl PatchSelection {
    /// Empty selection
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select `patch` from `bundle`
    #[must_use]
    pub fn with(mut self, bundle: impl Into<String>, patch: impl Into<String>) -> Self {
        self.select(bundle, patch);
        self
    }

    /// Select `patch` from `bundle` in place
    pub fn select(&mut self, bundle: impl Into<String>, patch: impl Into<String>) {
        self.bundles.entry(bundle.into()).or_default().insert(patch.into());
    }

    /// Selected names for `bundle`
    #[must_use]
    pub fn for_bundle(&self, bundle: &str) -> Option<&BTreeSet<String>> {
        self.bundles.get(bundle)
    }

    /// Bundle ids with at least one entry
    pub fn bundle_ids(&self) -> impl Iterator<Item = &str> {
        self.bundles.keys().map(String::as_str)
    }

    /// Total number of selected names
    #[must_use]
    pub fn len(&self) -> usize {
        self.bundles.values().map(BTreeSet::len).sum()
    }

    /// `true` when nothing is selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bundle id → patch name → option key → value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchOptions {
    bundles: IndexMap<String, IndexMap<String, IndexMap<String, Value>>>,
}

impl PatchOptions {
    /// No option values
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one option value
    pub fn set(
        &mut self,
        bundle: impl Into<String>,
        patch: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) {
        self.bundles
            .entry(bundle.into())
            .or_default()
            .entry(patch.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Builder form of [`PatchOptions::set`]
    #[must_use]
    pub fn with(
        mut self,
        bundle: impl Into<String>,
        patch: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.set(bundle, patch, key, value);
        self
    }

    /// Values for every patch of `bundle`
    #[must_use]
    pub fn for_bundle(&self, bundle: &str) -> Option<&IndexMap<String, IndexMap<String, Value>>> {
        self.bundles.get(bundle)
    }
}
