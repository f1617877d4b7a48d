//! Patch model and operation execution
//!
//! A [`Patch`] is an ordered list of [`Operation`]s over package entries.
//! Option values are set by the caller before execution and substituted into
//! `${key}` placeholders.

use crate::error::{BundleError, PatchError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Package contents keyed by entry name, in archive order
pub type Entries = IndexMap<String, Vec<u8>>;

/// Package a patch declares compatibility with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatiblePackage {
    /// Package name
    pub name: String,
    /// Supported versions; absent means any version
    #[serde(default)]
    pub versions: Option<BTreeSet<String>>,
}

/// Option declared by a patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOption {
    /// Option key
    pub key: String,
    /// Display title
    #[serde(default)]
    pub title: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Whether execution requires a value
    #[serde(default)]
    pub required: bool,
    /// Default value
    #[serde(default)]
    pub default: Option<Value>,
}

/// Single transformation step
#[derive(Debug, Clone)]
pub enum Operation {
    /// Replace every occurrence of `find` in a UTF-8 entry
    ReplaceText {
        /// Package entry
        entry: String,
        /// Text to find
        find: String,
        /// Replacement template
        replace: String,
    },
    /// Replace every occurrence of a byte pattern
    ReplaceBytes {
        /// Package entry
        entry: String,
        /// Bytes to find
        find: Vec<u8>,
        /// Replacement bytes
        replace: Vec<u8>,
    },
    /// Create or overwrite an entry with text
    PutText {
        /// Package entry
        entry: String,
        /// Content template
        content: String,
    },
    /// Create or overwrite an entry with a bundle payload
    WriteEntry {
        /// Package entry
        entry: String,
        /// Payload bytes resolved at load time
        data: Arc<Vec<u8>>,
    },
    /// Remove an entry, or every entry under a `dir/` prefix
    RemoveEntry {
        /// Entry name or prefix
        entry: String,
    },
}

/// Loaded patch
#[derive(Debug, Clone)]
pub struct Patch {
    name: String,
    description: Option<String>,
    use_by_default: bool,
    compatible_packages: Option<Vec<CompatiblePackage>>,
    options: IndexMap<String, PatchOption>,
    values: HashMap<String, Value>,
    operations: Vec<Operation>,
}

impl Patch {
    /// Create a patch with no compatibility restriction
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            use_by_default: true,
            compatible_packages: None,
            options: IndexMap::new(),
            values: HashMap::new(),
            operations: Vec::new(),
        }
    }

    /// Set the description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Set whether the patch is selected by default
    #[inline]
    #[must_use]
    pub fn with_use_by_default(mut self, use_by_default: bool) -> Self {
        self.use_by_default = use_by_default;
        self
    }

    /// Restrict compatibility
    #[inline]
    #[must_use]
    pub fn with_compatible_packages(mut self, packages: Option<Vec<CompatiblePackage>>) -> Self {
        self.compatible_packages = packages;
        self
    }

    /// Declare an option
    #[inline]
    #[must_use]
    pub fn with_option(mut self, option: PatchOption) -> Self {
        self.options.insert(option.key.clone(), option);
        self
    }

    /// Append an operation
    #[inline]
    #[must_use]
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Patch name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if any
    #[inline]
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Selected unless the user opts out
    #[inline]
    #[must_use]
    pub fn use_by_default(&self) -> bool {
        self.use_by_default
    }

    /// Compatibility list; `None` means universal
    #[inline]
    #[must_use]
    pub fn compatible_packages(&self) -> Option<&[CompatiblePackage]> {
        self.compatible_packages.as_deref()
    }

    /// Declared options
    pub fn options(&self) -> impl Iterator<Item = &PatchOption> {
        self.options.values()
    }

    /// Operations in execution order
    #[inline]
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// `true` if the compatibility list is absent or names `package`
    #[must_use]
    pub fn is_compatible_with(&self, package: &str) -> bool {
        match &self.compatible_packages {
            None => true,
            Some(packages) => packages.iter().any(|candidate| candidate.name == package),
        }
    }

    /// `true` if compatible with `package` at `version`
    #[must_use]
    pub fn supports(&self, package: &str, version: Option<&str>) -> bool {
        match &self.compatible_packages {
            None => true,
            Some(packages) => packages.iter().any(|candidate| {
                candidate.name == package
                    && match (&candidate.versions, version) {
                        (None, _) | (Some(_), None) => true,
                        (Some(versions), Some(version)) => versions.contains(version),
                    }
            }),
        }
    }

    /// Set an option value
    ///
    /// # Errors
    /// [`BundleError::UnknownOption`] when the key is not declared.
    pub fn set_option(&mut self, key: &str, value: Value) -> Result<(), BundleError> {
        if !self.options.contains_key(key) {
            return Err(BundleError::UnknownOption {
                patch: self.name.clone(),
                key: key.to_string(),
            });
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Current value of an option, falling back to its default
    #[must_use]
    pub fn option_value(&self, key: &str) -> Option<&Value> {
        self.values
            .get(key)
            .or_else(|| self.options.get(key).and_then(|option| option.default.as_ref()))
    }

    /// Apply every operation to `entries`
    ///
    /// # Errors
    /// Returns the first failing operation's error; `entries` may be partially
    /// modified.
    pub fn apply(&self, entries: &mut Entries) -> Result<(), PatchError> {
        for option in self.options.values() {
            if option.required && self.option_value(&option.key).is_none() {
                return Err(PatchError::MissingOption(option.key.clone()));
            }
        }

        for operation in &self.operations {
            self.apply_operation(operation, entries)?;
        }
        Ok(())
    }

    fn apply_operation(&self, operation: &Operation, entries: &mut Entries) -> Result<(), PatchError> {
        match operation {
            Operation::ReplaceText { entry, find, replace } => {
                let replacement = self.render(replace)?;
                let bytes = entries
                    .get_mut(entry)
                    .ok_or_else(|| PatchError::MissingEntry(entry.clone()))?;
                let text = std::str::from_utf8(bytes).map_err(|_| PatchError::NotText(entry.clone()))?;
                if !text.contains(find.as_str()) {
                    return Err(PatchError::PatternNotFound {
                        entry: entry.clone(),
                        pattern: find.clone(),
                    });
                }
                *bytes = text.replace(find.as_str(), &replacement).into_bytes();
            }
            Operation::ReplaceBytes { entry, find, replace } => {
                let bytes = entries
                    .get_mut(entry)
                    .ok_or_else(|| PatchError::MissingEntry(entry.clone()))?;
                let replaced = replace_bytes(bytes, find, replace).ok_or_else(|| {
                    PatchError::PatternNotFound {
                        entry: entry.clone(),
                        pattern: hex::encode(find),
                    }
                })?;
                *bytes = replaced;
            }
            Operation::PutText { entry, content } => {
                let content = self.render(content)?;
                entries.insert(entry.clone(), content.into_bytes());
            }
            Operation::WriteEntry { entry, data } => {
                entries.insert(entry.clone(), data.as_ref().clone());
            }
            Operation::RemoveEntry { entry } => {
                if entry.ends_with('/') {
                    entries.retain(|name, _| !name.starts_with(entry.as_str()));
                } else if entries.shift_remove(entry).is_none() {
                    return Err(PatchError::MissingEntry(entry.clone()));
                }
            }
        }
        Ok(())
    }

    fn render(&self, template: &str) -> Result<String, PatchError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let key = &after[..end];
            let value = self
                .option_value(key)
                .ok_or_else(|| PatchError::MissingOption(key.to_string()))?;
            match value {
                Value::String(text) => out.push_str(text),
                other => out.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn replace_bytes(haystack: &[u8], find: &[u8], replace: &[u8]) -> Option<Vec<u8>> {
    if find.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut found = false;
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(find) {
            out.extend_from_slice(replace);
            i += find.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    found.then_some(out)
}
