//! Stamps both binaries with the same build identifier

use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    println!("cargo:rustc-env=REPATCH_BUILD_ID={stamp:x}-{:x}", std::process::id());
}
