//! Testing utilities for repatch workspace
//!
//! Zip fixtures for bundles, packages and split archives.

#![allow(missing_docs)]

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// In-memory description of a zip archive
#[derive(Debug, Clone, Default)]
pub struct ZipFixture {
    entries: Vec<(String, Vec<u8>)>,
}

impl ZipFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: &str, data: impl AsRef<[u8]>) -> Self {
        self.entries.push((name.to_string(), data.as_ref().to_vec()));
        self
    }

    /// Directory entry (name should end with `/`)
    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push((name.to_string(), Vec::new()));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in &self.entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(name.as_str(), options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    pub fn write_to(&self, path: &Path) -> PathBuf {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap().write_all(&self.to_bytes()).unwrap();
        path.to_path_buf()
    }
}

/// Entry names of a zip archive on disk, in archive order
pub fn entry_names(path: &Path) -> Vec<String> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

/// Entry names as a set
pub fn entry_set(path: &Path) -> BTreeSet<String> {
    entry_names(path).into_iter().collect()
}

/// Content of one entry
pub fn read_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    data
}

/// A valid bundle with the given catalog
pub fn bundle_with_catalog(path: &Path, catalog: &Value) -> PathBuf {
    ZipFixture::new()
        .entry("classes.dex", b"dex\n035\0payload")
        .entry("patches.json", serde_json::to_vec_pretty(catalog).unwrap())
        .entry("assets/banner.txt", b"patched-banner")
        .write_to(path)
}

/// Catalog used across tests
///
/// - `Rename label`: universal, rewrites `res/values/strings.txt` with option `label`
/// - `Remove ads`: only `com.example.app`, removes `assets/ads/`
/// - `Add banner`: only `com.example.app`, copies a bundle payload
/// - `Other app`: only `com.other.app`
/// - `Broken`: universal, targets an entry packages do not contain
pub fn sample_catalog() -> Value {
    json!({
        "patches": [
            {
                "name": "Rename label",
                "description": "Changes the application label",
                "options": [{ "key": "label", "default": "Patched" }],
                "operations": [
                    { "op": "replaceText", "entry": "res/values/strings.txt", "find": "Example", "replace": "${label}" }
                ]
            },
            {
                "name": "Remove ads",
                "compatiblePackages": [{ "name": "com.example.app", "versions": ["1.0.0"] }],
                "operations": [{ "op": "removeEntry", "entry": "assets/ads/" }]
            },
            {
                "name": "Add banner",
                "compatiblePackages": [{ "name": "com.example.app" }],
                "operations": [{ "op": "writeEntry", "entry": "assets/banner.txt", "payload": "assets/banner.txt" }]
            },
            {
                "name": "Other app",
                "compatiblePackages": [{ "name": "com.other.app" }],
                "operations": []
            },
            {
                "name": "Broken",
                "operations": [{ "op": "replaceText", "entry": "missing.txt", "find": "a", "replace": "b" }]
            }
        ]
    })
}

/// Bundle built from [`sample_catalog`]
pub fn sample_bundle(path: &Path) -> PathBuf {
    bundle_with_catalog(path, &sample_catalog())
}

/// Plain single-module package
pub fn sample_package() -> ZipFixture {
    ZipFixture::new()
        .entry("AndroidManifest.xml", b"<manifest package=\"com.example.app\"/>")
        .entry("classes.dex", b"dex\n035\0app")
        .entry("res/values/strings.txt", b"app_name=Example")
        .entry("assets/ads/banner.png", b"ad")
        .entry("lib/arm64-v8a/libnative.so", b"arm64")
        .entry("lib/x86/libnative.so", b"x86")
        .entry("META-INF/CERT.SF", b"signature")
}

/// Base module of a split set
pub fn base_module() -> ZipFixture {
    ZipFixture::new()
        .entry("AndroidManifest.xml", b"<manifest split=\"base\"/>")
        .entry("classes.dex", b"dex\n035\0base")
        .entry("resources.arsc", vec![0u8; 64])
        .entry("res/values/strings.txt", b"app_name=Example")
        .entry("META-INF/BASE.RSA", b"signature")
}

/// Configuration module carrying native code for `abi`
pub fn abi_module(abi: &str) -> ZipFixture {
    ZipFixture::new()
        .entry("AndroidManifest.xml", format!("<manifest split=\"config.{abi}\"/>"))
        .entry(&format!("lib/{abi}/libnative.so"), abi.as_bytes())
        .entry("resources.arsc", vec![0u8; 8])
}

/// Split archive with the given modules
pub fn split_archive(path: &Path, modules: &[(&str, ZipFixture)]) -> PathBuf {
    let mut archive = ZipFixture::new().entry("manifest.json", b"{\"package_name\":\"com.example.app\"}");
    for (name, module) in modules {
        archive = archive.entry(name, module.to_bytes());
    }
    archive.write_to(path)
}

/// Split archive with a base module and arm64/x86 configuration modules
pub fn sample_split_archive(path: &Path) -> PathBuf {
    split_archive(
        path,
        &[
            ("base.apk", base_module()),
            ("split_config.arm64_v8a.apk", abi_module("arm64-v8a")),
            ("split_config.x86.apk", abi_module("x86")),
            (
                "split_config.en.apk",
                ZipFixture::new()
                    .entry("AndroidManifest.xml", b"<manifest split=\"config.en\"/>")
                    .entry("res/values-en/strings.txt", b"app_name=Example"),
            ),
        ],
    )
}
