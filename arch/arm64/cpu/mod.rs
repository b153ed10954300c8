//! CPU primitives for ARM64
//!
//! CPU identity, cacheline geometry, IRQ masking, barriers, and the
//! context-switch machinery. Everything that emits a privileged
//! instruction is gated on `aarch64-unknown-none`; host builds get
//! inert fallbacks.

pub mod atomics;
pub mod context;
pub mod sysreg;

use core::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        /// Current CPU index, from MPIDR_EL1 affinity level 0.
        #[inline]
        pub fn cpu_id() -> usize {
            let mpidr: u64;
            unsafe {
                core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr,
                    options(nomem, nostack, preserves_flags));
            }
            (mpidr & 0xFF) as usize
        }

        /// Park the CPU until the next interrupt.
        #[inline]
        pub fn wait_for_interrupt() {
            aarch64_cpu::asm::wfi();
        }

        /// Full-system data synchronization barrier.
        #[inline]
        pub fn dsb_sy() {
            aarch64_cpu::asm::barrier::dsb(aarch64_cpu::asm::barrier::SY);
        }

        /// Instruction synchronization barrier.
        #[inline]
        pub fn isb() {
            aarch64_cpu::asm::barrier::isb(aarch64_cpu::asm::barrier::SY);
        }

        fn read_dminline_bytes() -> usize {
            let ctr: u64;
            unsafe {
                core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr,
                    options(nomem, nostack, preserves_flags));
            }
            // DminLine is log2 of the line size in 4-byte words.
            4usize << ((ctr >> 16) & 0xF)
        }
    } else {
        /// Current CPU index (host fallback: always CPU 0).
        #[inline]
        pub fn cpu_id() -> usize {
            0
        }

        /// Park the CPU until the next interrupt (host fallback).
        #[inline]
        pub fn wait_for_interrupt() {
            core::hint::spin_loop();
        }

        /// Full-system data synchronization barrier (host fallback).
        #[inline]
        pub fn dsb_sy() {
            core::sync::atomic::fence(Ordering::SeqCst);
        }

        /// Instruction synchronization barrier (host fallback).
        #[inline]
        pub fn isb() {
            core::sync::atomic::fence(Ordering::SeqCst);
        }

        fn read_dminline_bytes() -> usize {
            64
        }
    }
}

static CACHELINE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Data cacheline size in bytes, read once from CTR_EL0.DminLine and
/// cached for the cache-maintenance loops.
pub fn cacheline_bytes() -> usize {
    let cached = CACHELINE_BYTES.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let line = read_dminline_bytes();
    CACHELINE_BYTES.store(line, Ordering::Relaxed);
    line
}

/// Local IRQ masking.
pub mod irq {
    /// Saved DAIF state, opaque to callers.
    #[derive(Clone, Copy)]
    pub struct IrqState(#[allow(dead_code)] u64);

    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
            /// Mask local IRQs, returning the previous state.
            #[inline]
            pub fn save_and_mask() -> IrqState {
                let daif: u64;
                unsafe {
                    core::arch::asm!("mrs {}, daif", out(reg) daif,
                        options(nomem, nostack, preserves_flags));
                    core::arch::asm!("msr daifset, #2",
                        options(nomem, nostack, preserves_flags));
                }
                IrqState(daif)
            }

            /// Restore a previously saved IRQ state.
            #[inline]
            pub fn restore(state: IrqState) {
                unsafe {
                    core::arch::asm!("msr daif, {}", in(reg) state.0,
                        options(nomem, nostack, preserves_flags));
                }
            }

            /// Unmask local IRQs unconditionally (boot path).
            #[inline]
            pub fn enable() {
                unsafe {
                    core::arch::asm!("msr daifclr, #2",
                        options(nomem, nostack, preserves_flags));
                }
            }
        } else {
            /// Mask local IRQs, returning the previous state (host no-op).
            #[inline]
            pub fn save_and_mask() -> IrqState {
                IrqState(0)
            }

            /// Restore a previously saved IRQ state (host no-op).
            #[inline]
            pub fn restore(_state: IrqState) {}

            /// Unmask local IRQs unconditionally (host no-op).
            #[inline]
            pub fn enable() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cacheline_is_cached_and_sane() {
        let line = cacheline_bytes();
        assert!(line.is_power_of_two());
        assert!(line >= 16);
        assert_eq!(cacheline_bytes(), line);
    }

    #[test]
    fn host_cpu_is_zero() {
        assert_eq!(cpu_id(), 0);
    }
}
