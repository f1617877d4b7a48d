//! Patch session parameters

use repatch_bundle::{BundleSource, PatchOptions, PatchSelection};
use repatch_split::{DeviceProfile, MergeEngine, PrepareOptions, SubprocessMerge};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything a runtime needs to run one patch session
///
/// Serializable so it can be handed to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerParameters {
    /// Package the patches must be compatible with
    pub package_name: String,
    /// Input package (plain or split)
    pub input: PathBuf,
    /// Final output path
    pub output: PathBuf,
    /// Session working directory
    pub cache_dir: PathBuf,
    /// Patch bundles, in configured order
    pub bundles: Vec<BundleSource>,
    /// Selected patches per bundle
    pub selection: PatchSelection,
    /// Option values per bundle and patch
    #[serde(default)]
    pub options: PatchOptions,
    /// Drop native code for unsupported architectures
    #[serde(default)]
    pub strip_native_libs: bool,
    /// Supported architectures
    #[serde(default)]
    pub supported_abis: Vec<String>,
    /// Parent-directory prefix of downloaded packages
    #[serde(default)]
    pub downloads_marker: Option<String>,
    /// Leave out locale and density splits the device does not use
    #[serde(default)]
    pub skip_unneeded_splits: bool,
    /// Device locales; the worker's locale environment when empty
    #[serde(default)]
    pub locales: Vec<String>,
    /// Device screen density qualifier
    #[serde(default)]
    pub density: Option<String>,
    /// Worker binary for subprocess merging; in-process only when absent
    #[serde(default)]
    pub merge_worker: Option<PathBuf>,
    /// Memory limit of the merge worker (MB)
    #[serde(default)]
    pub merge_memory_mb: Option<u64>,
    /// Preload library enforcing the merge worker heap limit
    #[serde(default)]
    pub heap_shim: Option<PathBuf>,
    /// Classpath exported to the merge worker
    #[serde(default)]
    pub classpath: Option<PathBuf>,
}

impl WorkerParameters {
    /// Parameters with no bundles or selection
    #[must_use]
    pub fn new(
        package_name: impl Into<String>,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            input: input.into(),
            output: output.into(),
            cache_dir: cache_dir.into(),
            bundles: Vec::new(),
            selection: PatchSelection::new(),
            options: PatchOptions::new(),
            strip_native_libs: false,
            supported_abis: Vec::new(),
            downloads_marker: None,
            skip_unneeded_splits: false,
            locales: Vec::new(),
            density: None,
            merge_worker: None,
            merge_memory_mb: None,
            heap_shim: None,
            classpath: None,
        }
    }

    /// Add a bundle
    #[inline]
    #[must_use]
    pub fn with_bundle(mut self, bundle: BundleSource) -> Self {
        self.bundles.push(bundle);
        self
    }

    /// Set the selection
    #[inline]
    #[must_use]
    pub fn with_selection(mut self, selection: PatchSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Set option values
    #[inline]
    #[must_use]
    pub fn with_options(mut self, options: PatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable native library stripping for `abis`
    #[inline]
    #[must_use]
    pub fn with_native_libs(mut self, strip: bool, abis: Vec<String>) -> Self {
        self.strip_native_libs = strip;
        self.supported_abis = abis;
        self
    }

    /// Set the downloads marker
    #[inline]
    #[must_use]
    pub fn with_downloads_marker(mut self, marker: Option<String>) -> Self {
        self.downloads_marker = marker;
        self
    }

    /// Skip configuration splits unused by a device with `locales` and `density`
    #[inline]
    #[must_use]
    pub fn with_unneeded_splits(mut self, skip: bool, locales: Vec<String>, density: Option<String>) -> Self {
        self.skip_unneeded_splits = skip;
        self.locales = locales;
        self.density = density;
        self
    }

    /// Retry failed merges through `worker`
    #[inline]
    #[must_use]
    pub fn with_merge_worker(mut self, worker: impl Into<PathBuf>) -> Self {
        self.merge_worker = Some(worker.into());
        self
    }

    /// Bound the merge worker to `limit_mb`, enforced through `shim`
    #[inline]
    #[must_use]
    pub fn with_worker_memory(mut self, limit_mb: u64, shim: Option<PathBuf>) -> Self {
        self.merge_memory_mb = Some(limit_mb);
        self.heap_shim = shim;
        self
    }

    /// Classpath for the merge worker
    #[inline]
    #[must_use]
    pub fn with_classpath(mut self, classpath: impl Into<PathBuf>) -> Self {
        self.classpath = Some(classpath.into());
        self
    }

    /// Subprocess merge strategy, when a merge worker is set
    #[must_use]
    pub fn subprocess_merge(&self) -> Option<SubprocessMerge> {
        let worker = self.merge_worker.as_ref()?;
        let mut merge = SubprocessMerge::new(worker, &self.cache_dir);
        if let Some(classpath) = &self.classpath {
            merge = merge.with_classpath(classpath);
        }
        if let Some(limit) = self.merge_memory_mb {
            merge = merge.with_heap_limit(limit, self.heap_shim.clone());
        }
        Some(merge)
    }

    /// Target device for split skipping
    #[must_use]
    pub fn device_profile(&self) -> DeviceProfile {
        if self.locales.is_empty() && self.density.is_none() {
            return DeviceProfile::from_env();
        }
        DeviceProfile::new(self.locales.iter().map(String::as_str), self.density.as_deref())
    }

    /// Split preparation settings derived from these parameters
    #[must_use]
    pub fn prepare_options(&self) -> PrepareOptions {
        let engine = self
            .subprocess_merge()
            .map_or_else(MergeEngine::in_process, MergeEngine::with_subprocess);
        PrepareOptions::default()
            .with_strip_native_libs(self.strip_native_libs)
            .with_supported_abis(self.supported_abis.clone())
            .with_downloads_marker(self.downloads_marker.clone())
            .with_skip_unneeded_splits(self.skip_unneeded_splits)
            .with_device(self.device_profile())
            .with_engine(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repatch_split::merge::ACTION_LIST;
    use std::ffi::OsString;

    #[test]
    fn merge_worker_inherits_memory_and_classpath() {
        let parameters = WorkerParameters::new("com.example.app", "/in.apks", "/out.apk", "/cache")
            .with_merge_worker("/opt/repatch-worker")
            .with_worker_memory(900, Some(PathBuf::from("/opt/libheap.so")))
            .with_classpath("/opt/repatch");

        let envs = parameters.subprocess_merge().unwrap().launch(ACTION_LIST).envs();
        assert!(envs.contains(&("CLASSPATH", OsString::from("/opt/repatch"))));
        assert!(envs.contains(&("LD_PRELOAD", OsString::from("/opt/libheap.so"))));
        assert!(envs.contains(&("REPATCH_HEAP_SIZE", OsString::from("900M"))));
    }

    #[test]
    fn explicit_device_profile() {
        let parameters = WorkerParameters::new("com.example.app", "/in.apks", "/out.apk", "/cache").with_unneeded_splits(
            true,
            vec!["de".to_string()],
            Some("hdpi".to_string()),
        );
        let options = parameters.prepare_options();
        assert!(options.skip_unneeded_splits);
        assert_eq!(options.device, DeviceProfile::new(["de"], Some("hdpi")));
        assert!(options.device.is_unneeded("split_config.fr.apk"));
    }

    #[test]
    fn no_merge_worker_means_no_subprocess() {
        let parameters = WorkerParameters::new("com.example.app", "/in.apks", "/out.apk", "/cache")
            .with_worker_memory(900, None);
        assert!(parameters.subprocess_merge().is_none());
    }
}
