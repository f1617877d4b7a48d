//! repatch configuration (`repatch.toml`)
//!
//! Two sections:
//! - `[runtime]`: where and how patching runs (worker process or in-process,
//!   memory budget, fallback policy)
//! - `[patching]`: cache location and split/native-library handling
//!
//! Missing fields use defaults; a missing file is all defaults.

use crate::error::RuntimeError;
use repatch_core::{MemoryPolicy, FALLBACK_DEFAULT_MB};
use repatch_split::abi::host_supported_abis;
use repatch_split::DEFAULT_DOWNLOADS_MARKER;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "REPATCH_CONFIG";

/// Worker binary looked up next to the running executable
pub const WORKER_BINARY: &str = "repatch-worker";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepatchConfig {
    /// Runtime selection and limits
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Patching behaviour
    #[serde(default)]
    pub patching: PatchingConfig,
}

/// Where patching runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    /// Separate worker process bounded by the memory budget
    #[default]
    Process,
    /// Current process
    InProcess,
}

impl fmt::Display for RuntimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::InProcess => write!(f, "in-process"),
        }
    }
}

/// When a failed worker run is retried in-process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    /// Only on hosts known to be affected
    #[default]
    Auto,
    /// After any worker exit failure
    Always,
    /// Never
    Never,
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Runtime used for patching
    pub mode: RuntimeMode,
    /// Requested worker memory budget (MB)
    pub memory_limit_mb: u64,
    /// Use the whole device budget instead of `memory_limit_mb`
    pub aggressive_memory: bool,
    /// Device budget override (MB); read from the host when absent
    pub max_budget_mb: Option<u64>,
    /// In-process retry policy
    pub fallback: FallbackPolicy,
    /// Kernels with a lower major version count as affected under `auto`
    pub legacy_kernel_below: u32,
    /// Worker binary; defaults to `repatch-worker` beside the running executable
    pub worker_binary: Option<PathBuf>,
    /// Preload library enforcing the heap limit
    pub heap_shim: Option<PathBuf>,
    /// Worker connect timeout
    pub handshake_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            memory_limit_mb: FALLBACK_DEFAULT_MB,
            aggressive_memory: false,
            max_budget_mb: None,
            fallback: FallbackPolicy::default(),
            legacy_kernel_below: 4,
            worker_binary: None,
            heap_shim: None,
            handshake_timeout_secs: 10,
        }
    }
}

/// `[patching]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PatchingConfig {
    /// Working directory for sessions and sockets
    pub cache_dir: Option<PathBuf>,
    /// Drop native code for unsupported architectures
    pub strip_native_libs: bool,
    /// Supported architectures; host architectures when absent
    pub supported_abis: Option<Vec<String>>,
    /// Parent-directory prefix marking downloaded packages
    pub downloads_marker: Option<String>,
    /// Leave out locale and density splits the device does not use
    pub skip_unneeded_splits: bool,
    /// Device locales; the host locale when empty
    pub locales: Vec<String>,
    /// Device screen density qualifier (`xxhdpi`, …)
    pub density: Option<String>,
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            strip_native_libs: false,
            supported_abis: None,
            downloads_marker: Some(DEFAULT_DOWNLOADS_MARKER.to_string()),
            skip_unneeded_splits: false,
            locales: Vec::new(),
            density: None,
        }
    }
}

impl RepatchConfig {
    /// Parse TOML text
    ///
    /// # Errors
    /// [`RuntimeError::Config`] for invalid TOML or unknown fields.
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        toml::from_str(text).map_err(|err| RuntimeError::Config(err.to_string()))
    }

    /// Read a config file
    ///
    /// # Errors
    /// [`RuntimeError::Config`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| RuntimeError::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Config from `explicit`, else `$REPATCH_CONFIG`, else defaults
    ///
    /// # Errors
    /// See [`RepatchConfig::load`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, RuntimeError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    /// Select the runtime
    #[inline]
    #[must_use]
    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.runtime.mode = mode;
        self
    }

    /// Set the requested memory budget
    #[inline]
    #[must_use]
    pub fn with_memory_limit(mut self, limit_mb: u64) -> Self {
        self.runtime.memory_limit_mb = limit_mb;
        self
    }

    /// Set the cache directory
    #[inline]
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.patching.cache_dir = Some(dir.into());
        self
    }

    /// Enable native library stripping
    #[inline]
    #[must_use]
    pub fn with_strip_native_libs(mut self, strip: bool) -> Self {
        self.patching.strip_native_libs = strip;
        self
    }

    /// Enable skipping of unneeded configuration splits
    #[inline]
    #[must_use]
    pub fn with_skip_unneeded_splits(mut self, skip: bool) -> Self {
        self.patching.skip_unneeded_splits = skip;
        self
    }

    /// Set the worker binary
    #[inline]
    #[must_use]
    pub fn with_worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime.worker_binary = Some(path.into());
        self
    }

    /// Memory policy from the override or the host memory
    #[must_use]
    pub fn memory_policy(&self) -> MemoryPolicy {
        self.runtime
            .max_budget_mb
            .map_or_else(MemoryPolicy::detect, MemoryPolicy::new)
    }

    /// Cache directory, `$TMPDIR/repatch` by default
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.patching
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("repatch"))
    }

    /// Supported architectures
    #[must_use]
    pub fn supported_abis(&self) -> Vec<String> {
        self.patching
            .supported_abis
            .clone()
            .unwrap_or_else(host_supported_abis)
    }

    /// Worker connect timeout
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.handshake_timeout_secs)
    }

    /// Worker binary path
    ///
    /// # Errors
    /// [`RuntimeError::Config`] if no path is configured and the running
    /// executable cannot be located.
    pub fn worker_binary(&self) -> Result<PathBuf, RuntimeError> {
        if let Some(path) = &self.runtime.worker_binary {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|err| RuntimeError::Config(format!("cannot locate running executable: {err}")))?;
        let dir = exe
            .parent()
            .ok_or_else(|| RuntimeError::Config(format!("{} has no parent directory", exe.display())))?;
        Ok(dir.join(WORKER_BINARY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(RepatchConfig::from_toml_str("").unwrap(), RepatchConfig::default());
    }

    #[test]
    fn parses_both_sections() {
        let config = RepatchConfig::from_toml_str(
            r#"
            [runtime]
            mode = "in-process"
            memory_limit_mb = 1024
            fallback = "never"
            max_budget_mb = 2048

            [patching]
            strip_native_libs = true
            supported_abis = ["arm64-v8a"]
            skip_unneeded_splits = true
            locales = ["en-US"]
            density = "xxhdpi"
            "#,
        )
        .unwrap();

        assert_eq!(config.runtime.mode, RuntimeMode::InProcess);
        assert_eq!(config.runtime.memory_limit_mb, 1024);
        assert_eq!(config.runtime.fallback, FallbackPolicy::Never);
        assert_eq!(config.runtime.handshake_timeout_secs, 10);
        assert_eq!(config.memory_policy().max_budget(), 2048);
        assert_eq!(config.supported_abis(), vec!["arm64-v8a".to_string()]);
        assert_eq!(config.patching.downloads_marker.as_deref(), Some("downloaded-apps"));
        assert!(config.patching.skip_unneeded_splits);
        assert_eq!(config.patching.locales, vec!["en-US".to_string()]);
        assert_eq!(config.patching.density.as_deref(), Some("xxhdpi"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = RepatchConfig::from_toml_str("[runtime]\nturbo = true\n").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)), "{err}");
    }

    #[test]
    fn configured_worker_binary_wins() {
        let config = RepatchConfig::default().with_worker_binary("/opt/repatch/worker");
        assert_eq!(config.worker_binary().unwrap(), PathBuf::from("/opt/repatch/worker"));
    }
}
