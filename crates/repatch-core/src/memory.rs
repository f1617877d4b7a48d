//! Worker memory budget policy
//!
//! Pure functions of the device's maximum budget. All values are megabytes.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lowest budget ever handed to a worker
pub const MIN_BUDGET_MB: u64 = 200;

/// Budget assumed when the device capability cannot be determined
pub const FALLBACK_DEFAULT_MB: u64 = 700;

const MEMINFO_PATH: &str = "/proc/meminfo";

/// Memory budget policy bound to a device capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPolicy {
    max_budget_mb: u64,
}

impl MemoryPolicy {
    /// Policy for an explicit maximum budget
    #[inline]
    #[must_use]
    pub fn new(max_budget_mb: u64) -> Self {
        Self { max_budget_mb }
    }

    /// Detect from the host: half of total memory, or [`FALLBACK_DEFAULT_MB`]
    #[must_use]
    pub fn detect() -> Self {
        Self::new(read_max_budget(Path::new(MEMINFO_PATH)))
    }

    /// Maximum budget the device grants a single process
    #[inline]
    #[must_use]
    pub fn max_budget(&self) -> u64 {
        self.max_budget_mb
    }

    /// `min(max(FALLBACK_DEFAULT, round(0.8 × max)), max)`
    #[must_use]
    pub fn recommended(&self) -> u64 {
        let scaled = self.max_budget_mb.saturating_mul(8).saturating_add(5) / 10;
        scaled.max(FALLBACK_DEFAULT_MB).min(self.max_budget_mb)
    }

    /// Clamp a request into `[MIN_BUDGET, min(recommended, max)]`
    #[must_use]
    pub fn auto_scale(&self, requested: u64) -> u64 {
        let upper = self.recommended().min(self.max_budget_mb).max(MIN_BUDGET_MB);
        requested.clamp(MIN_BUDGET_MB, upper)
    }

    /// Clamp a request into `[MIN_BUDGET, max]`
    #[must_use]
    pub fn clamp(&self, requested: u64) -> u64 {
        requested.clamp(MIN_BUDGET_MB, self.max_budget_mb.max(MIN_BUDGET_MB))
    }

    /// Budget for a worker launch; aggressive mode asks for the device maximum
    #[must_use]
    pub fn effective(&self, requested: u64, aggressive: bool) -> u64 {
        if aggressive {
            self.clamp(self.max_budget_mb)
        } else {
            self.clamp(requested)
        }
    }
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::new(FALLBACK_DEFAULT_MB)
    }
}

fn read_max_budget(meminfo: &Path) -> u64 {
    match std::fs::read_to_string(meminfo) {
        Ok(text) => match parse_mem_total_kb(&text) {
            Some(kb) if kb > 0 => (kb / 1024 / 2).max(1),
            _ => {
                tracing::warn!("No MemTotal in {}, assuming {}MB", meminfo.display(), FALLBACK_DEFAULT_MB);
                FALLBACK_DEFAULT_MB
            }
        },
        Err(err) => {
            tracing::debug!("Cannot read {}: {}", meminfo.display(), err);
            FALLBACK_DEFAULT_MB
        }
    }
}

fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}
