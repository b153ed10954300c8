//! EL2 exception vector table
//!
//! Sixteen 128-byte slots, 2 KiB aligned. Lower-EL AArch64 synchronous
//! and IRQ entries push a full [`TrapFrame`] and call the Rust
//! handlers; the same-EL entries service IRQs taken while the
//! hypervisor itself runs (the idle loop and host tasks). Everything
//! else parks the CPU with a diagnostic.
//!
//! The frame layout is the `FRAME_*` contract in `cpu/context.rs`; the
//! restore path is `trap_frame_eret` there.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
macro_rules! vector_table_asm {
    ($elr:literal, $spsr:literal) => {
        core::arch::global_asm!(concat!(
            r#"
            .macro save_frame
                sub sp, sp, #272
                stp x0, x1, [sp, #0]
                stp x2, x3, [sp, #16]
                stp x4, x5, [sp, #32]
                stp x6, x7, [sp, #48]
                stp x8, x9, [sp, #64]
                stp x10, x11, [sp, #80]
                stp x12, x13, [sp, #96]
                stp x14, x15, [sp, #112]
                stp x16, x17, [sp, #128]
                stp x18, x19, [sp, #144]
                stp x20, x21, [sp, #160]
                stp x22, x23, [sp, #176]
                stp x24, x25, [sp, #192]
                stp x26, x27, [sp, #208]
                stp x28, x29, [sp, #224]
                str x30, [sp, #240]
                mrs x9, sp_el0
                mrs x10, "#, $elr, r#"
                stp x9, x10, [sp, #248]
                mrs x9, "#, $spsr, r#"
                str x9, [sp, #264]
            .endm

            .section .text
            .balign 2048
            .global exception_vectors
            exception_vectors:
            // Current EL with SP_EL0: unused configurations.
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang

            // Current EL with SP_ELx: IRQs can arrive while the
            // hypervisor runs host code.
            .balign 128
                b vector_curr_sync
            .balign 128
                b vector_curr_irq
            .balign 128
                b vector_hang
            .balign 128
                b vector_curr_irq

            // Lower EL, AArch64: guest traps.
            .balign 128
                b vector_lower_sync
            .balign 128
                b vector_lower_irq
            .balign 128
                b vector_hang
            .balign 128
                b vector_lower_irq

            // Lower EL, AArch32: unsupported guests.
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang
            .balign 128
                b vector_hang

            vector_lower_sync:
                save_frame
                mov x0, sp
                bl el2_sync_entry
                b trap_frame_eret

            vector_lower_irq:
                save_frame
                mov x0, sp
                bl el2_irq_entry
                b trap_frame_eret

            vector_curr_sync:
                save_frame
                mov x0, sp
                bl el2_curr_sync_entry
                b trap_frame_eret

            vector_curr_irq:
                save_frame
                mov x0, sp
                bl el2_irq_entry
                b trap_frame_eret

            vector_hang:
                bl vector_unexpected
            1:  wfi
                b 1b
            "#
        ));
    };
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none", feature = "hv"))] {
        vector_table_asm!("elr_el2", "spsr_el2");

        extern "C" {
            static exception_vectors: u8;
        }

        /// Point VBAR_EL2 at the table. Runs once per CPU.
        pub fn install() {
            unsafe {
                let base = &exception_vectors as *const u8 as u64;
                core::arch::asm!("msr vbar_el2, {}", in(reg) base,
                    options(nomem, nostack, preserves_flags));
            }
            crate::arch::cpu::isb();
        }
    } else if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        vector_table_asm!("elr_el1", "spsr_el1");

        extern "C" {
            static exception_vectors: u8;
        }

        /// Point VBAR_EL1 at the table. Runs once per CPU.
        pub fn install() {
            unsafe {
                let base = &exception_vectors as *const u8 as u64;
                core::arch::asm!("msr vbar_el1, {}", in(reg) base,
                    options(nomem, nostack, preserves_flags));
            }
            crate::arch::cpu::isb();
        }
    } else {
        /// Point the vector base register at the table (host stand-in).
        pub fn install() {}
    }
}

/// Synchronous exception taken at the hypervisor's own EL: a bug, not
/// guest behaviour.
#[no_mangle]
pub extern "C" fn el2_curr_sync_entry(frame: &mut crate::arch::cpu::context::TrapFrame) {
    log::error!(
        "sync exception at own EL, elr {:#x} spsr {:#x}",
        frame.elr,
        frame.spsr
    );
    panic!("hypervisor fault");
}

/// A vector slot that should be unreachable fired.
#[no_mangle]
pub extern "C" fn vector_unexpected() {
    log::error!("exception from an unsupported vector slot");
}
