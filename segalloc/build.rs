use std::env::{self, VarError};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const DEFAULT_STATIC_ARRAY_BACKEND_SIZE_BYTES: usize = 1024 * 1024 * 32;
const SEGALLOC_STATIC_ARRAY_BACKEND_BYTES: &str = "SEGALLOC_STATIC_ARRAY_BACKEND_BYTES";

fn main() {
    create_static_array_backend_size_bytes_file();
    export_rerun_rules();
}

fn create_static_array_backend_size_bytes_file() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR environment variable not provided");
    let dest_path = Path::new(&out_dir).join("segalloc_static_array_backend_size_bytes.txt");
    let size: usize = match env::var(SEGALLOC_STATIC_ARRAY_BACKEND_BYTES) {
        Ok(s) => s
            .parse()
            .expect("Could not interpret SEGALLOC_STATIC_ARRAY_BACKEND_BYTES as an unsigned integer"),
        Err(VarError::NotPresent) => DEFAULT_STATIC_ARRAY_BACKEND_SIZE_BYTES,
        Err(VarError::NotUnicode(_)) => panic!(
            "Could not interpret SEGALLOC_STATIC_ARRAY_BACKEND_BYTES as a string representing an unsigned integer"
        ),
    };
    // The heap needs room for its sentinels and at least one chunk.
    assert!(
        size >= 4096 + 16,
        "SEGALLOC_STATIC_ARRAY_BACKEND_BYTES must be at least 4112"
    );
    let mut f = File::create(&dest_path)
        .expect("Could not create file to store segalloc static_array_backend size metadata.");
    write!(f, "{}", size)
        .expect("Could not write to segalloc static_array_backend size metadata file");
    f.flush()
        .expect("Could not flush write to segalloc static_array_backend size metadata file");
}

fn export_rerun_rules() {
    println!(
        "cargo:rerun-if-env-changed={}",
        SEGALLOC_STATIC_ARRAY_BACKEND_BYTES
    );
    for path in ["./Cargo.toml", "./build.rs", "./src/imp_static_array.rs"].iter() {
        println!("cargo:rerun-if-changed={}", path);
    }
}
