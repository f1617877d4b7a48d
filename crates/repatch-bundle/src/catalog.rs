//! On-disk catalog format (`patches.json`)

use crate::patch::{CompatiblePackage, PatchOption};
use serde::{Deserialize, Serialize};

/// Name of the catalog entry inside a bundle archive
pub const CATALOG_ENTRY: &str = "patches.json";

/// Extension of executable code payload entries
pub const PAYLOAD_EXTENSION: &str = ".dex";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Catalog {
    pub(crate) patches: Vec<CatalogPatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CatalogPatch {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
    #[serde(default = "enabled", rename = "use")]
    pub(crate) use_by_default: bool,
    #[serde(default)]
    pub(crate) compatible_packages: Option<Vec<CompatiblePackage>>,
    #[serde(default)]
    pub(crate) options: Vec<PatchOption>,
    #[serde(default)]
    pub(crate) operations: Vec<CatalogOperation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub(crate) enum CatalogOperation {
    ReplaceText { entry: String, find: String, replace: String },
    ReplaceHex { entry: String, find: String, replace: String },
    PutText { entry: String, content: String },
    WriteEntry { entry: String, payload: String },
    RemoveEntry { entry: String },
}

fn enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_and_full_patches() {
        let catalog: Catalog = serde_json::from_str(
            r##"{
                "patches": [
                    { "name": "Universal" },
                    {
                        "name": "Themed",
                        "use": false,
                        "compatiblePackages": [{ "name": "com.example", "versions": ["1.0"] }],
                        "options": [{ "key": "color", "default": "#000000" }],
                        "operations": [
                            { "op": "replaceHex", "entry": "classes.dex", "find": "cafe", "replace": "beef" },
                            { "op": "removeEntry", "entry": "lib/x86/" }
                        ]
                    }
                ]
            }"##,
        )
        .unwrap();

        assert_eq!(catalog.patches.len(), 2);
        assert!(catalog.patches[0].use_by_default);
        assert!(catalog.patches[0].compatible_packages.is_none());
        assert!(!catalog.patches[1].use_by_default);
        assert_eq!(catalog.patches[1].operations.len(), 2);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let result: Result<Catalog, _> = serde_json::from_str(
            r#"{ "patches": [{ "name": "x", "operations": [{ "op": "format", "entry": "a" }] }] }"#,
        );
        assert!(result.is_err());
    }
}
