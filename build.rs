//! Build script for rkllm.
//!
//! With the default `dynamic` feature the RKLLM entry points are resolved at
//! runtime and nothing needs linking. With `static-link` this script:
//! 1. Locates librkllm_wrapper (RKLLM_LIB_DIR, default /usr/lib)
//! 2. Emits link directives for the wrapper, the runtime and the C++ stdlib

use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=RKLLM_LIB_DIR");
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_STATIC_LINK").is_none() {
        return Ok(());
    }

    link_rkllm()?;

    Ok(())
}

/// Link the prebuilt RKLLM libraries shipped with the board support package.
fn link_rkllm() -> Result<(), Box<dyn std::error::Error>> {
    let lib_dir = env::var("RKLLM_LIB_DIR").unwrap_or_else(|_| "/usr/lib".to_string());

    if !std::path::Path::new(&lib_dir).join("librkllm_wrapper.so").exists() {
        println!(
            "cargo:warning=librkllm_wrapper.so not found in {} (set RKLLM_LIB_DIR)",
            lib_dir
        );
    }

    println!("cargo:rustc-link-search=native={}", lib_dir);
    println!("cargo:rustc-link-lib=dylib=rkllm_wrapper");
    println!("cargo:rustc-link-lib=dylib=rkllmrt");

    // The wrapper is C++
    #[cfg(target_os = "linux")]
    println!("cargo:rustc-link-lib=stdc++");

    Ok(())
}
