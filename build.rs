fn main() {
    // With the audio feature, the bundled libopus static library must be
    // propagated to the linker; the sys crate builds it but its link
    // paths don't always reach dependents.
    #[cfg(feature = "audio")]
    {
        // OUT_DIR is target/{profile}/build/framepump-{hash}/out; the
        // opus build output lives beside it.
        if let Ok(out_dir) = std::env::var("OUT_DIR") {
            let target_dir = std::path::Path::new(&out_dir)
                .parent()
                .and_then(|p| p.parent())
                .expect("could not find build directory");

            if let Ok(entries) = std::fs::read_dir(target_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if name.to_string_lossy().starts_with("opus-static-sys-") {
                        let opus_lib_dir = entry.path().join("out").join("lib");
                        if opus_lib_dir.exists() {
                            println!("cargo:rustc-link-search=native={}", opus_lib_dir.display());
                            println!("cargo:rustc-link-lib=static=opus");
                            println!("cargo:rerun-if-changed={}", opus_lib_dir.display());
                            return;
                        }
                    }
                }
            }
        }

        if let Ok(lib_path) = std::env::var("DEP_OPUS_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", lib_path);
            println!("cargo:rustc-link-lib=static=opus");
        }
    }
}
