//! Worker process launch shape
//!
//! Both the patch worker and the merge subprocess are started as
//! `<program> -Drepatch.tmpdir=<dir> / --nice-name=<label> <entry> <args...>`
//! with optional heap-limit overrides in the environment.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

/// Property naming the worker's temporary directory
pub const TMPDIR_PROPERTY: &str = "repatch.tmpdir";

/// Classpath variable pointing the worker at the host executable
pub const CLASSPATH_ENV: &str = "CLASSPATH";

/// Preload variable for the heap-override shim
pub const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Heap growth limit variable
pub const HEAP_GROWTH_LIMIT_ENV: &str = "REPATCH_HEAP_GROWTH_LIMIT";

/// Heap size variable
pub const HEAP_SIZE_ENV: &str = "REPATCH_HEAP_SIZE";

/// Exit code of a worker aborted for running out of memory
pub const OOM_EXIT_CODE: i32 = 134;

/// Description of a worker launch
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    program: PathBuf,
    entry: String,
    tmp_dir: PathBuf,
    nice_name: String,
    args: Vec<OsString>,
    classpath: Option<PathBuf>,
    heap_limit_mb: Option<u64>,
    heap_shim: Option<PathBuf>,
}

impl WorkerLaunch {
    /// Launch `program` running `entry`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        let entry = entry.into();
        Self {
            program: program.into(),
            nice_name: format!("repatch:{entry}"),
            entry,
            tmp_dir: std::env::temp_dir(),
            args: Vec::new(),
            classpath: None,
            heap_limit_mb: None,
            heap_shim: None,
        }
    }

    /// Temporary directory handed to the worker
    #[inline]
    #[must_use]
    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    /// Process label
    #[inline]
    #[must_use]
    pub fn with_nice_name(mut self, name: impl Into<String>) -> Self {
        self.nice_name = name.into();
        self
    }

    /// Append an entry argument
    #[inline]
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Classpath value
    #[inline]
    #[must_use]
    pub fn with_classpath(mut self, path: impl Into<PathBuf>) -> Self {
        self.classpath = Some(path.into());
        self
    }

    /// Heap limit in MB, applied through `shim` when one is available
    #[inline]
    #[must_use]
    pub fn with_heap_limit(mut self, limit_mb: u64, shim: Option<PathBuf>) -> Self {
        self.heap_limit_mb = Some(limit_mb);
        self.heap_shim = shim;
        self
    }

    /// Program to execute
    #[inline]
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument vector after the program
    #[must_use]
    pub fn argv(&self) -> Vec<OsString> {
        let mut tmp = OsString::from(format!("-D{TMPDIR_PROPERTY}="));
        tmp.push(self.tmp_dir.as_os_str());

        let mut argv = vec![
            tmp,
            OsString::from("/"),
            OsString::from(format!("--nice-name={}", self.nice_name)),
            OsString::from(&self.entry),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Environment overrides
    ///
    /// The heap variables are only set together with the shim that enforces them.
    #[must_use]
    pub fn envs(&self) -> Vec<(&'static str, OsString)> {
        let mut envs = Vec::new();
        if let Some(classpath) = &self.classpath {
            envs.push((CLASSPATH_ENV, classpath.as_os_str().to_owned()));
        }
        if let (Some(limit), Some(shim)) = (self.heap_limit_mb, &self.heap_shim) {
            let value = OsString::from(heap_value(limit));
            envs.push((PRELOAD_ENV, shim.as_os_str().to_owned()));
            envs.push((HEAP_GROWTH_LIMIT_ENV, value.clone()));
            envs.push((HEAP_SIZE_ENV, value));
        }
        envs
    }

    /// Tokio command with piped stdio, killed when dropped
    #[must_use]
    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(self.argv())
            .envs(self.envs())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// `"<N>M"`
#[must_use]
pub fn heap_value(limit_mb: u64) -> String {
    format!("{limit_mb}M")
}

/// Exit code of a finished process; termination by signal maps to `128 + signal`
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// `true` if an exit code denotes an out-of-memory abort
#[inline]
#[must_use]
pub fn is_out_of_memory(code: i32) -> bool {
    code == OOM_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn argv_shape() {
        let launch = WorkerLaunch::new("/opt/repatch-worker", "patcher")
            .with_tmp_dir("/cache")
            .with_nice_name("com.example:Patcher")
            .arg("/cache/worker.sock");

        assert_eq!(
            launch.argv(),
            vec![
                OsString::from("-Drepatch.tmpdir=/cache"),
                OsString::from("/"),
                OsString::from("--nice-name=com.example:Patcher"),
                OsString::from("patcher"),
                OsString::from("/cache/worker.sock"),
            ]
        );
    }

    #[test]
    fn heap_env_requires_shim() {
        let without = WorkerLaunch::new("w", "merge").with_heap_limit(700, None);
        assert!(without.envs().is_empty());

        let with = WorkerLaunch::new("w", "merge")
            .with_classpath("/opt/repatch")
            .with_heap_limit(700, Some(PathBuf::from("/opt/libheap.so")));
        let names: Vec<_> = with.envs().into_iter().map(|(name, value)| (name, value.into_string().unwrap())).collect();
        assert_eq!(
            names,
            vec![
                (CLASSPATH_ENV, "/opt/repatch".to_string()),
                (PRELOAD_ENV, "/opt/libheap.so".to_string()),
                (HEAP_GROWTH_LIMIT_ENV, "700M".to_string()),
                (HEAP_SIZE_ENV, "700M".to_string()),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn signal_maps_to_128_plus() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(6)), OOM_EXIT_CODE);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert!(is_out_of_memory(exit_code(ExitStatus::from_raw(6))));
    }
}
