//! Native architecture tokens and module exclusion

use once_cell::sync::Lazy;
use std::collections::BTreeSet;

/// Architectures a module name may refer to
pub const KNOWN_ABIS: [&str; 5] = ["armeabi", "armeabi-v7a", "arm64-v8a", "x86", "x86_64"];

static KNOWN_TOKENS: Lazy<BTreeSet<String>> = Lazy::new(|| tokens(KNOWN_ABIS.iter().copied()));

/// Lowercased names plus their `-`/`_` swapped variants
#[must_use]
pub fn tokens<'a>(abis: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    for abi in abis {
        let lower = abi.to_ascii_lowercase();
        set.insert(lower.replace('-', "_"));
        set.insert(lower.replace('_', "-"));
        set.insert(lower);
    }
    set
}

/// Canonical spelling of an architecture name: lowercase, `-` separated
#[must_use]
pub fn normalize_abi(abi: &str) -> String {
    abi.to_ascii_lowercase().replace('_', "-")
}

/// Architectures the running host executes natively, best first
#[must_use]
pub fn host_supported_abis() -> Vec<String> {
    let abis: &[&str] = match std::env::consts::ARCH {
        "aarch64" => &["arm64-v8a", "armeabi-v7a", "armeabi"],
        "arm" => &["armeabi-v7a", "armeabi"],
        "x86_64" => &["x86_64", "x86"],
        "x86" => &["x86"],
        _ => &[],
    };
    abis.iter().map(ToString::to_string).collect()
}

/// `true` if a module targets only architectures outside `supported`
///
/// A module is excluded when its lowercased name contains a known token and
/// no supported token. Names without any architecture token are never
/// excluded.
#[must_use]
pub fn should_exclude(module_name: &str, supported: &BTreeSet<String>) -> bool {
    let lower = module_name.to_ascii_lowercase();
    let mentions_known = KNOWN_TOKENS.iter().any(|token| lower.contains(token.as_str()));
    if !mentions_known {
        return false;
    }
    !supported.iter().any(|token| lower.contains(token.as_str()))
}

/// Architecture directory of a `lib/<abi>/...` entry
#[must_use]
pub fn native_lib_abi(entry: &str) -> Option<&str> {
    let rest = entry.strip_prefix("lib/")?;
    let (abi, file) = rest.split_once('/')?;
    (!abi.is_empty() && !file.is_empty()).then_some(abi)
}
