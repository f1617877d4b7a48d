//! Configuration split qualifiers
//!
//! Configuration splits are named `split_config.<qualifier>[.<qualifier>…].apk`
//! (or `config.<qualifier>…`). A split whose qualifiers are all locale or
//! screen-density qualifiers, none of which the target device uses, is not
//! needed for a working package.

use std::collections::BTreeSet;

/// Screen density qualifiers, lowest first
pub const DENSITY_QUALIFIERS: [&str; 7] = ["ldpi", "mdpi", "tvdpi", "hdpi", "xhdpi", "xxhdpi", "xxxhdpi"];

/// Locale and density of the device the output is meant for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    locales: BTreeSet<String>,
    density: Option<String>,
}

impl DeviceProfile {
    /// Profile for `locales` (`en`, `en-US`, `pt_BR`, …) and an optional density qualifier
    #[must_use]
    pub fn new<'a>(locales: impl IntoIterator<Item = &'a str>, density: Option<&str>) -> Self {
        Self {
            locales: locale_tokens(locales),
            density: density
                .map(str::to_ascii_lowercase)
                .filter(|density| DENSITY_QUALIFIERS.contains(&density.as_str())),
        }
    }

    /// Profile from the host locale environment, without a density
    #[must_use]
    pub fn from_env() -> Self {
        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.is_empty());
        let locale = locale.as_deref().map(|value| value.split(['.', '@']).next().unwrap_or(value));
        Self::new(locale.filter(|value| *value != "C" && *value != "POSIX"), None)
    }

    /// `true` if the split named `module_name` can be left out
    ///
    /// Unknown qualifiers, architecture qualifiers and modules without
    /// qualifiers are always needed. Locale splits are only judged when the
    /// profile has locales, density splits only when it has a density.
    #[must_use]
    pub fn is_unneeded(&self, module_name: &str) -> bool {
        let qualifiers = split_qualifiers(module_name);
        if qualifiers.is_empty() {
            return false;
        }
        qualifiers.iter().all(|qualifier| match classify(qualifier) {
            Qualifier::Density => self.density.as_deref().is_some_and(|density| density != qualifier.as_str()),
            Qualifier::Locale(token) => !self.locales.is_empty() && !self.locales.contains(&token),
            Qualifier::Other => false,
        })
    }
}

enum Qualifier {
    Density,
    Locale(String),
    Other,
}

fn classify(qualifier: &str) -> Qualifier {
    if DENSITY_QUALIFIERS.contains(&qualifier) {
        return Qualifier::Density;
    }
    parse_locale(qualifier).map_or(Qualifier::Other, Qualifier::Locale)
}

/// Qualifiers of a configuration split name, lowercased
#[must_use]
pub fn split_qualifiers(module_name: &str) -> Vec<String> {
    let lower = module_name.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);
    let stem = file.strip_suffix(".apk").unwrap_or(file);
    let start = stem
        .find("split_config.")
        .map(|index| index + "split_config.".len())
        .or_else(|| stem.find("config.").map(|index| index + "config.".len()));
    let Some(start) = start else {
        return Vec::new();
    };
    stem[start..]
        .split('.')
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Locale token of a qualifier: `en`, or `en_rus` for a regional variant
///
/// `None` when the qualifier does not look like a locale.
#[must_use]
pub fn parse_locale(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase().replace('-', "_");
    let mut parts = lower.split('_').filter(|part| !part.is_empty());
    let language = parts.next()?;
    if !(2..=3).contains(&language.len()) || !language.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let region = parts.next().and_then(|region| {
        let region = region.strip_prefix('r').filter(|rest| rest.len() >= 2).unwrap_or(region);
        ((2..=3).contains(&region.len()) && region.chars().all(|c| c.is_ascii_alphanumeric())).then_some(region)
    });
    Some(match region {
        Some(region) => format!("{language}_r{region}"),
        None => language.to_string(),
    })
}

/// Language and language-region tokens for a list of locales
#[must_use]
pub fn locale_tokens<'a>(locales: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for locale in locales {
        if let Some(token) = parse_locale(locale) {
            if let Some((language, _)) = token.split_once('_') {
                tokens.insert(language.to_string());
            }
            tokens.insert(token);
        }
    }
    tokens
}
