//! Bundle loader tests

use pretty_assertions::assert_eq;
use repatch_bundle::{
    load_bundle, patches, resolve_selection, BundleError, BundleSource, Entries, PatchOptions, PatchSelection,
};
use repatch_test_utils::{bundle_with_catalog, sample_bundle, ZipFixture};
use serde_json::json;

fn names(list: &[repatch_bundle::Patch]) -> Vec<&str> {
    list.iter().map(repatch_bundle::Patch::name).collect()
}

#[test]
fn loads_sample_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let path = sample_bundle(&dir.path().join("patches.rpb"));

    let loaded = load_bundle(&path).unwrap();
    assert_eq!(
        names(&loaded),
        vec!["Rename label", "Remove ads", "Add banner", "Other app", "Broken"]
    );
    assert_eq!(loaded[0].description(), Some("Changes the application label"));
}

#[test]
fn bundle_without_payload_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = ZipFixture::new()
        .entry("patches.json", br#"{ "patches": [{ "name": "x" }] }"#)
        .write_to(&dir.path().join("bundle.rpb"));

    let err = load_bundle(&path).unwrap_err();
    assert!(matches!(err, BundleError::CorruptBundle { .. }), "{err}");
}

#[test]
fn empty_payload_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = ZipFixture::new()
        .entry("classes.dex", b"dex")
        .entry("classes2.DEX", b"")
        .entry("patches.json", br#"{ "patches": [{ "name": "x" }] }"#)
        .write_to(&dir.path().join("bundle.rpb"));

    let err = load_bundle(&path).unwrap_err();
    assert!(err.to_string().contains("classes2.DEX is empty"), "{err}");
}

#[test]
fn truncated_archive_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.rpb");
    let bytes = ZipFixture::new().entry("classes.dex", b"dex").to_bytes();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    assert!(matches!(load_bundle(&path), Err(BundleError::CorruptBundle { .. })));
}

#[test]
fn malformed_catalog_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = ZipFixture::new()
        .entry("classes.dex", b"dex")
        .entry("patches.json", b"{ not json")
        .write_to(&dir.path().join("bundle.rpb"));

    let err = load_bundle(&path).unwrap_err();
    assert!(err.to_string().contains("malformed patches.json"), "{err}");
}

#[test]
fn catalog_without_patches_yields_no_group() {
    let dir = tempfile::tempdir().unwrap();
    let path = bundle_with_catalog(&dir.path().join("bundle.rpb"), &json!({ "patches": [] }));

    let err = load_bundle(&path).unwrap_err();
    assert!(err.to_string().contains("unexpected bundle load result"), "{err}");
}

#[test]
fn missing_write_payload_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = json!({
        "patches": [{
            "name": "x",
            "operations": [{ "op": "writeEntry", "entry": "a", "payload": "nope.bin" }]
        }]
    });
    let path = bundle_with_catalog(&dir.path().join("bundle.rpb"), &catalog);

    let err = load_bundle(&path).unwrap_err();
    assert!(err.to_string().contains("missing payload nope.bin"), "{err}");
}

#[test]
fn patches_filters_by_compatibility() {
    let dir = tempfile::tempdir().unwrap();
    let bundles = vec![BundleSource::new("main", sample_bundle(&dir.path().join("main.rpb")))];

    let by_bundle = patches(&bundles, "com.example.app").unwrap();
    assert_eq!(
        names(&by_bundle["main"]),
        vec!["Rename label", "Remove ads", "Add banner", "Broken"]
    );

    let by_bundle = patches(&bundles, "com.unrelated").unwrap();
    assert_eq!(names(&by_bundle["main"]), vec!["Rename label", "Broken"]);
}

#[test]
fn resolve_selection_keeps_catalog_order_and_applies_options() {
    let dir = tempfile::tempdir().unwrap();
    let bundles = vec![BundleSource::new("main", sample_bundle(&dir.path().join("main.rpb")))];
    let loaded = patches(&bundles, "com.example.app").unwrap();

    let selection = PatchSelection::new()
        .with("main", "Add banner")
        .with("main", "Rename label");
    let options = PatchOptions::new().with("main", "Rename label", "label", json!("Renamed"));

    let resolved = resolve_selection(loaded, &selection, &options).unwrap();
    assert_eq!(names(&resolved), vec!["Rename label", "Add banner"]);

    let mut entries: Entries = [("res/values/strings.txt".to_string(), b"app_name=Example".to_vec())]
        .into_iter()
        .collect();
    resolved[0].apply(&mut entries).unwrap();
    resolved[1].apply(&mut entries).unwrap();
    assert_eq!(entries["res/values/strings.txt"], b"app_name=Renamed".to_vec());
    assert_eq!(entries["assets/banner.txt"], b"patched-banner".to_vec());
}

#[test]
fn unknown_patch_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let bundles = vec![BundleSource::new("main", sample_bundle(&dir.path().join("main.rpb")))];
    let loaded = patches(&bundles, "com.example.app").unwrap();

    let selection = PatchSelection::new().with("main", "Other app");
    let err = resolve_selection(loaded, &selection, &PatchOptions::new()).unwrap_err();
    assert!(
        matches!(&err, BundleError::UnknownPatch { bundle, name } if bundle == "main" && name == "Other app"),
        "{err}"
    );
}

#[test]
fn unknown_bundle_and_option_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bundles = vec![BundleSource::new("main", sample_bundle(&dir.path().join("main.rpb")))];

    let loaded = patches(&bundles, "com.example.app").unwrap();
    let selection = PatchSelection::new().with("extra", "Rename label");
    assert!(matches!(
        resolve_selection(loaded, &selection, &PatchOptions::new()),
        Err(BundleError::UnknownBundle(id)) if id == "extra"
    ));

    let loaded = patches(&bundles, "com.example.app").unwrap();
    let selection = PatchSelection::new().with("main", "Rename label");
    let options = PatchOptions::new().with("main", "Rename label", "colour", json!("red"));
    assert!(matches!(
        resolve_selection(loaded, &selection, &options),
        Err(BundleError::UnknownOption { key, .. }) if key == "colour"
    ));
}
