//! Build script for Duovisor
//!
//! Generates the bare-metal linker script and wires it up when building
//! for the aarch64-unknown-none target. Host builds (unit tests) get no
//! special link arguments.

use std::env;
use std::fs;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=TARGET");

    let target = env::var("TARGET").unwrap_or_default();

    if target.contains("aarch64") && target.contains("none") {
        let out_dir = env::var("OUT_DIR").unwrap();
        generate_linker_script(&out_dir);

        println!("cargo:rustc-link-search={}", out_dir);
        println!("cargo:rustc-link-arg-bins=-Tlink-aarch64.ld");
        println!("cargo:rustc-link-arg-bins=--gc-sections");
    }
}

fn generate_linker_script(out_dir: &str) {
    let script = r#"
/* AArch64 linker script for Duovisor (QEMU virt, load at 1 GiB + 512 KiB) */
ENTRY(_start)

MEMORY {
    RAM (rwx) : ORIGIN = 0x40080000, LENGTH = 512M
}

SECTIONS {
    .text : {
        KEEP(*(.text.entry))   /* Entry point first */
        *(.text .text.*)
        *(.rodata .rodata.*)
    } > RAM

    .data : ALIGN(4096) {
        __data_start = .;
        *(.data .data.*)
        __data_end = .;
    } > RAM

    .bss : ALIGN(4096) {
        __bss_start = .;
        *(.bss .bss.*)
        *(COMMON)
        __bss_end = .;
    } > RAM

    /* Boot stack for each CPU */
    .stack : ALIGN(4096) {
        __stack_start = .;
        . = . + 64 * 1024;
        __stack_end = .;
    } > RAM

    /* Everything above __image_end is handed to the page allocator */
    .heap : ALIGN(4096) {
        __image_end = .;
    } > RAM

    /DISCARD/ : {
        *(.eh_frame)
        *(.comment)
        *(.note*)
    }
}
"#;

    let path = Path::new(out_dir).join("link-aarch64.ld");
    fs::write(&path, script).unwrap();
}
