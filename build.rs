use std::env;

fn main() {
    // the linker script only makes sense for the bare-metal image;
    // host builds (mkfs, cargo test) link normally.
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "none" {
        println!("cargo:rerun-if-changed=src/kernel/kernel.ld");
        println!("cargo:rustc-link-arg=-Tsrc/kernel/kernel.ld");
    }
}
