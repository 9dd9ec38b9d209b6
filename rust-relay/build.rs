//! Build script embedding the compiler version for the diagnostics report.
//!
//! Sets `EFI_RELAY_RUSTC_VERSION`, read with `env!()` by
//! `web::diagnostics`. Falls back to `"unknown"` when `rustc` cannot be run.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=RUSTC");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into());
    let rustc_version = Command::new(rustc)
        .args(["--version"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=EFI_RELAY_RUSTC_VERSION={rustc_version}");
}
