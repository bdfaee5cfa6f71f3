use kernel_info::memory;
use std::{env, path::PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo"));
    let ld = manifest_dir.join("kernel.ld");

    let kernel_base = memory::KERNEL_BASE;
    let phys_load = memory::PHYS_LOAD;
    assert_eq!(
        kernel_base & ((1u64 << 21) - 1),
        0,
        "KERNEL_BASE must be 2 MiB aligned (got {kernel_base:#x})"
    );
    assert_eq!(phys_load & 0xfff, 0, "PHYS_LOAD must be 4 KiB aligned (got {phys_load:#x})");

    assert!(
        memory::HHDM_BASE >= memory::USERSPACE_END && memory::KERNEL_HEAP_BASE + memory::KERNEL_HEAP_MAX <= kernel_base,
        "kernel windows must stay between the lower half and the kernel image"
    );

    println!("cargo:rerun-if-changed={}", ld.display());
    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
    println!("cargo:rustc-link-arg-bins=--defsym=KERNEL_BASE={kernel_base:#x}");
    println!("cargo:rustc-link-arg-bins=--defsym=PHYS_LOAD={phys_load:#x}");
}
