//! Split preparation tests

use pretty_assertions::assert_eq;
use repatch_core::{EventSink, ProgressEvent};
use repatch_split::{excluded_modules, is_split_archive, prepare_if_needed, DeviceProfile, PrepareOptions, SplitError};
use repatch_test_utils::{
    abi_module, base_module, entry_set, sample_package, sample_split_archive, split_archive, ZipFixture,
};
use std::collections::BTreeSet;

fn options(strip: bool) -> PrepareOptions {
    PrepareOptions::default()
        .with_strip_native_libs(strip)
        .with_supported_abis(vec!["arm64-v8a".to_string()])
        .with_downloads_marker(None)
}

fn split_dirs(workspace: &std::path::Path) -> usize {
    std::fs::read_dir(workspace)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with("split-"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn detects_split_archives() {
    let dir = tempfile::tempdir().unwrap();

    let container = dir.path().join("app.apks");
    std::fs::write(&container, b"not even a zip").unwrap();
    assert!(is_split_archive(&container));

    let disguised = sample_split_archive(&dir.path().join("app.zip"));
    assert!(is_split_archive(&disguised));

    let plain = sample_package().write_to(&dir.path().join("app.apk"));
    assert!(!is_split_archive(&plain));

    let garbage = dir.path().join("garbage.bin");
    std::fs::write(&garbage, b"garbage").unwrap();
    assert!(!is_split_archive(&garbage));
}

#[test]
fn apk_wrapping_config_splits_is_a_split_archive() {
    let dir = tempfile::tempdir().unwrap();
    let wrapped = split_archive(
        &dir.path().join("app.apk"),
        &[
            ("base.apk", base_module()),
            ("split_config.arm64_v8a.apk", abi_module("arm64-v8a")),
        ],
    );
    assert!(is_split_archive(&wrapped));
    assert!(!is_split_archive(&dir.path().join("missing.apks")));
}

#[test]
fn only_foreign_architecture_modules_are_excluded() {
    let order: Vec<String> = ["base", "lib-arm64-v8a", "lib-x86_64"].map(String::from).to_vec();
    let excluded = excluded_modules(&order, &["arm64-v8a".to_string()]);
    assert_eq!(excluded, BTreeSet::from(["lib-x86_64".to_string()]));
}

#[tokio::test]
async fn unused_locale_and_density_splits_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = |qualifier: &str, entry: &str| {
        ZipFixture::new()
            .entry("AndroidManifest.xml", format!("<manifest split=\"config.{qualifier}\"/>"))
            .entry(entry, qualifier.as_bytes())
    };
    let source = split_archive(
        &dir.path().join("app.apks"),
        &[
            ("base.apk", base_module()),
            ("split_config.en.apk", config("en", "res/values-en/strings.txt")),
            ("split_config.fr.apk", config("fr", "res/values-fr/strings.txt")),
            ("split_config.mdpi.apk", config("mdpi", "res/drawable-mdpi/icon.png")),
            ("split_config.xxhdpi.apk", config("xxhdpi", "res/drawable-xxhdpi/icon.png")),
        ],
    );
    let options = options(false)
        .with_skip_unneeded_splits(true)
        .with_device(DeviceProfile::new(["en-US"], Some("xxhdpi")));
    let (sink, log) = EventSink::recorder();

    let result = prepare_if_needed(&source, &dir.path().join("work"), &options, &sink)
        .await
        .unwrap();

    let entries = entry_set(&result.file);
    assert!(entries.contains("res/values-en/strings.txt"));
    assert!(entries.contains("res/drawable-xxhdpi/icon.png"));
    assert!(!entries.contains("res/values-fr/strings.txt"));
    assert!(!entries.contains("res/drawable-mdpi/icon.png"));

    let skipped: BTreeSet<String> = log
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress {
                sub_steps: Some(steps), ..
            } => Some(steps),
            _ => None,
        })
        .flatten()
        .filter(|step| step.starts_with("[skipped]"))
        .collect();
    assert_eq!(
        skipped,
        BTreeSet::from([
            "[skipped] Merging split_config.fr.apk".to_string(),
            "[skipped] Merging split_config.mdpi.apk".to_string(),
        ])
    );
}

#[tokio::test]
async fn plain_package_passes_through() {
    let dir = tempfile::tempdir().unwrap();
    let plain = sample_package().write_to(&dir.path().join("app.apk"));

    let result = prepare_if_needed(&plain, dir.path(), &options(false), &EventSink::discard())
        .await
        .unwrap();
    assert_eq!(result.file, plain);
    assert!(!result.merged);
    result.cleanup();
}

#[tokio::test]
async fn merges_and_excludes_foreign_architectures() {
    let dir = tempfile::tempdir().unwrap();
    let source = sample_split_archive(&dir.path().join("app.apks"));
    let workspace = dir.path().join("work");
    let (sink, log) = EventSink::recorder();

    let result = prepare_if_needed(&source, &workspace, &options(true), &sink)
        .await
        .unwrap();
    assert!(result.merged);
    assert_eq!(result.file.file_name().unwrap(), "app-merged.apk");

    let entries = entry_set(&result.file);
    assert!(entries.contains("lib/arm64-v8a/libnative.so"));
    assert!(!entries.contains("lib/x86/libnative.so"));
    assert!(entries.contains("res/values-en/strings.txt"));
    assert!(!entries.iter().any(|name| name.starts_with("META-INF/")));

    let sub_steps = log
        .snapshot()
        .into_iter()
        .find_map(|event| match event {
            ProgressEvent::Progress {
                sub_steps: Some(steps), ..
            } => Some(steps),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        sub_steps,
        vec![
            "Extracting split APKs",
            "[skipped] Merging split_config.x86.apk",
            "Merging base.apk",
            "Merging split_config.arm64_v8a.apk",
            "Merging split_config.en.apk",
            "Writing merged APK",
            "Stripping native libraries",
            "Finalizing merged APK",
        ]
    );
    assert!(log.messages().iter().any(|line| line == "Finalizing merged APK"));

    let merged = result.file.clone();
    result.cleanup();
    result.cleanup();
    assert!(!merged.exists());
    assert_eq!(split_dirs(&workspace), 0);
}

#[tokio::test]
async fn dropping_the_result_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = sample_split_archive(&dir.path().join("app.apks"));
    let workspace = dir.path().join("work");

    let result = prepare_if_needed(&source, &workspace, &options(false), &EventSink::discard())
        .await
        .unwrap();
    assert_eq!(split_dirs(&workspace), 1);
    drop(result);
    assert_eq!(split_dirs(&workspace), 0);
}

#[tokio::test]
async fn archive_without_modules_fails_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = ZipFixture::new()
        .entry("manifest.json", b"{}")
        .write_to(&dir.path().join("empty.apks"));
    let workspace = dir.path().join("work");

    let err = prepare_if_needed(&source, &workspace, &options(false), &EventSink::discard())
        .await
        .unwrap_err();
    assert!(matches!(err, SplitError::NoModules(_)), "{err}");
    assert_eq!(split_dirs(&workspace), 0);
}

#[tokio::test]
async fn unreadable_module_fails_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = ZipFixture::new()
        .entry("base.apk", b"definitely not a zip")
        .write_to(&dir.path().join("broken.apks"));
    let workspace = dir.path().join("work");

    let err = prepare_if_needed(&source, &workspace, &options(false), &EventSink::discard())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("in-process failed"), "{err}");
    assert_eq!(split_dirs(&workspace), 0);
}

#[tokio::test]
async fn downloaded_sources_are_overwritten_with_the_merge() {
    let dir = tempfile::tempdir().unwrap();
    let app_dir = dir.path().join("downloaded-apps-v2").join("com.example.app");
    std::fs::create_dir_all(&app_dir).unwrap();
    let source = split_archive(
        &app_dir.join("app.apks"),
        &[("base.apk", repatch_test_utils::base_module())],
    );

    let options = options(false).with_downloads_marker(Some("downloaded-apps".to_string()));
    let result = prepare_if_needed(&source, &dir.path().join("work"), &options, &EventSink::discard())
        .await
        .unwrap();

    assert_eq!(entry_set(&source), entry_set(&result.file));
    assert!(entry_set(&source).contains("resources.arsc"));
}
