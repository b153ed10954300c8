//! Task context and trap frame
//!
//! [`TaskContext`] is the callee-saved switch target: what
//! `context_switch` saves and restores when the scheduler moves between
//! tasks. [`TrapFrame`] is the register image pushed on exception entry
//! and consumed by `eret`.
//!
//! The assembly below is the ABI: the numeric offsets in the `str`/`ldr`
//! sequences are asserted against the Rust layout at compile time, so
//! any field reorder fails the build instead of corrupting registers.

use core::mem::offset_of;

/// Callee-saved register context of a suspended task.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskContext {
    /// Kernel stack pointer at suspension.
    pub sp: u64,
    /// Thread pointer (TPIDR_EL0).
    pub tpidr: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer (x29).
    pub fp: u64,
    /// Link register (x30): where the switch "returns" to.
    pub lr: u64,
}

/// Register image captured on exception entry: x0-x30, the user stack
/// pointer, and the `eret` pair (ELR, SPSR).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// General-purpose registers x0..x30.
    pub r: [u64; 31],
    /// SP_EL0 (user or guest EL1 stack pointer).
    pub usp: u64,
    /// Exception link register: resume address for `eret`.
    pub elr: u64,
    /// Saved processor state for `eret`.
    pub spsr: u64,
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self {
            r: [0; 31],
            usp: 0,
            elr: 0,
            spsr: 0,
        }
    }
}

impl TrapFrame {
    /// Read a general-purpose register by trap-syndrome index. Index 30
    /// follows the MMIO-emulation convention and reads as zero.
    pub fn reg(&self, index: usize) -> u64 {
        if index >= Self::RAZ_WI_INDEX {
            0
        } else {
            self.r[index]
        }
    }

    /// Write a general-purpose register by trap-syndrome index; writes
    /// to index 30 and above are discarded.
    pub fn set_reg(&mut self, index: usize, value: u64) {
        if index < Self::RAZ_WI_INDEX {
            self.r[index] = value;
        }
    }

    /// First register index treated as read-zero/write-ignore by the
    /// MMIO emulation path.
    pub const RAZ_WI_INDEX: usize = 30;

    /// Skip the faulting instruction (always 4 bytes in AArch64 state).
    pub fn skip_instruction(&mut self) {
        self.elr = self.elr.wrapping_add(4);
    }
}

// The assembly's view of TaskContext.
const CTX_SP: usize = 0;
const CTX_TPIDR: usize = 8;
const CTX_X19: usize = 16;
const CTX_FP: usize = 96;
const CTX_LR: usize = 104;

const _: () = assert!(offset_of!(TaskContext, sp) == CTX_SP);
const _: () = assert!(offset_of!(TaskContext, tpidr) == CTX_TPIDR);
const _: () = assert!(offset_of!(TaskContext, x19) == CTX_X19);
const _: () = assert!(offset_of!(TaskContext, fp) == CTX_FP);
const _: () = assert!(offset_of!(TaskContext, lr) == CTX_LR);
const _: () = assert!(core::mem::size_of::<TaskContext>() == 112);

// The assembly's view of TrapFrame.
const FRAME_R0: usize = 0;
const FRAME_USP: usize = 248;
const FRAME_ELR: usize = 256;
const FRAME_SPSR: usize = 264;
const FRAME_SIZE: usize = 272;

const _: () = assert!(offset_of!(TrapFrame, r) == FRAME_R0);
const _: () = assert!(offset_of!(TrapFrame, usp) == FRAME_USP);
const _: () = assert!(offset_of!(TrapFrame, elr) == FRAME_ELR);
const _: () = assert!(offset_of!(TrapFrame, spsr) == FRAME_SPSR);
const _: () = assert!(core::mem::size_of::<TrapFrame>() == FRAME_SIZE);
const _: () = assert!(FRAME_SIZE % 16 == 0);

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        core::arch::global_asm!(
            r#"
            // context_switch(prev: &mut TaskContext, next: &TaskContext)
            //
            // Offsets match the CTX_* constants in context.rs.
            .global context_switch
            .type context_switch, @function
            context_switch:
                stp x19, x20, [x0, #16]
                stp x21, x22, [x0, #32]
                stp x23, x24, [x0, #48]
                stp x25, x26, [x0, #64]
                stp x27, x28, [x0, #80]
                stp x29, x30, [x0, #96]
                mov x9, sp
                mrs x10, tpidr_el0
                stp x9, x10, [x0, #0]

                ldp x9, x10, [x1, #0]
                mov sp, x9
                msr tpidr_el0, x10
                ldp x19, x20, [x1, #16]
                ldp x21, x22, [x1, #32]
                ldp x23, x24, [x1, #48]
                ldp x25, x26, [x1, #64]
                ldp x27, x28, [x1, #80]
                ldp x29, x30, [x1, #96]
                ret

            // First ride of a freshly built task: sp points at the trap
            // frame pushed by task construction. Run the entry hook
            // (vCPU restore for guests), then drop into the frame.
            .global task_entry_trampoline
            .type task_entry_trampoline, @function
            task_entry_trampoline:
                bl task_entry_prepare
                b trap_frame_eret
            "#
        );

        // The eret pair lives in the EL the kernel occupies: EL2 in
        // hypervisor builds, EL1 in the native kernel mode.
        #[cfg(feature = "hv")]
        core::arch::global_asm!(
            r#"
            // Restore a TrapFrame at sp and eret through it.
            // Offsets match the FRAME_* constants in context.rs.
            .global trap_frame_eret
            .type trap_frame_eret, @function
            trap_frame_eret:
                ldp x9, x10, [sp, #248]      // usp, elr
                msr sp_el0, x9
                msr elr_el2, x10
                ldr x9, [sp, #264]           // spsr
                msr spsr_el2, x9
                ldp x0, x1, [sp, #0]
                ldp x2, x3, [sp, #16]
                ldp x4, x5, [sp, #32]
                ldp x6, x7, [sp, #48]
                ldp x8, x9, [sp, #64]
                ldp x10, x11, [sp, #80]
                ldp x12, x13, [sp, #96]
                ldp x14, x15, [sp, #112]
                ldp x16, x17, [sp, #128]
                ldp x18, x19, [sp, #144]
                ldp x20, x21, [sp, #160]
                ldp x22, x23, [sp, #176]
                ldp x24, x25, [sp, #192]
                ldp x26, x27, [sp, #208]
                ldp x28, x29, [sp, #224]
                ldr x30, [sp, #240]
                add sp, sp, #272
                eret
            "#
        );

        #[cfg(not(feature = "hv"))]
        core::arch::global_asm!(
            r#"
            .global trap_frame_eret
            .type trap_frame_eret, @function
            trap_frame_eret:
                ldp x9, x10, [sp, #248]      // usp, elr
                msr sp_el0, x9
                msr elr_el1, x10
                ldr x9, [sp, #264]           // spsr
                msr spsr_el1, x9
                ldp x0, x1, [sp, #0]
                ldp x2, x3, [sp, #16]
                ldp x4, x5, [sp, #32]
                ldp x6, x7, [sp, #48]
                ldp x8, x9, [sp, #64]
                ldp x10, x11, [sp, #80]
                ldp x12, x13, [sp, #96]
                ldp x14, x15, [sp, #112]
                ldp x16, x17, [sp, #128]
                ldp x18, x19, [sp, #144]
                ldp x20, x21, [sp, #160]
                ldp x22, x23, [sp, #176]
                ldp x24, x25, [sp, #192]
                ldp x26, x27, [sp, #208]
                ldp x28, x29, [sp, #224]
                ldr x30, [sp, #240]
                add sp, sp, #272
                eret
            "#
        );

        extern "C" {
            /// Save the current callee-saved state into `prev` and
            /// resume `next`. Returns when this task is switched back
            /// in.
            pub fn context_switch(prev: *mut TaskContext, next: *const TaskContext);

            /// Entry point installed in `ctx.lr` of freshly built tasks.
            pub fn task_entry_trampoline();
        }

        /// Address of the trampoline, for task construction.
        pub fn trampoline_addr() -> u64 {
            task_entry_trampoline as usize as u64
        }
    } else {
        /// Save the current callee-saved state into `prev` and resume
        /// `next` (host fallback: records the request, switches
        /// nothing).
        ///
        /// # Safety
        /// Mirrors the target signature.
        pub unsafe fn context_switch(_prev: *mut TaskContext, _next: *const TaskContext) {}

        /// Address of the trampoline, for task construction (host
        /// fallback: a recognizable sentinel).
        pub fn trampoline_addr() -> u64 {
            0x7ea7_0000
        }
    }
}

impl TaskContext {
    /// Prepare a context whose first switch-in enters
    /// `task_entry_trampoline` with `sp` pointing at a pushed trap
    /// frame.
    pub fn prepared(frame_addr: u64) -> Self {
        Self {
            sp: frame_addr,
            lr: trampoline_addr(),
            ..Self::default()
        }
    }
}
