use std::env;
use std::path::PathBuf;

fn main() {
    let target = env::var("TARGET").unwrap();
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    // All assembly (boot stub, exception vectors, MMU-enable trampoline) is
    // pulled in with global_asm!, so the build script only has to hand the
    // linker script to bare-metal builds.
    if target.starts_with("aarch64") && target.ends_with("none") {
        println!(
            "cargo:rustc-link-arg-bins=-T{}",
            manifest_dir.join("linker.ld").display()
        );
    }

    println!("cargo:rerun-if-changed=linker.ld");
    println!("cargo:rerun-if-changed=src/boot.s");
    println!("cargo:rerun-if-changed=src/arch/aarch64/exceptions.s");
    println!("cargo:rerun-if-changed=src/arch/aarch64/mmu/mmu_on.s");
}
