//! Guest system-register bank
//!
//! The EL1 system-register state a vCPU owns, saved on `vcpu_out` and
//! restored on `vcpu_in`. Access to the hardware registers is generated
//! by the macro so nothing else in the tree spells out `mrs`/`msr` for
//! these.

macro_rules! sysreg_bank {
    ($(($field:ident, $name:literal)),+ $(,)?) => {
        /// Per-vCPU snapshot of the AArch64 EL1 system registers (plus
        /// the EL2 registers that shape the guest's view of itself).
        #[repr(C)]
        #[derive(Debug, Default, Clone, Copy)]
        pub struct SysRegBank {
            $(pub $field: u64,)+
        }

        impl SysRegBank {
            /// An all-zero bank, for static arenas.
            pub const ZERO: SysRegBank = SysRegBank {
                $($field: 0,)+
            };

            /// Capture the live register state into this bank.
            #[allow(unused_variables)]
            pub fn save_from_hw(&mut self) {
                #[cfg(all(target_arch = "aarch64", target_os = "none"))]
                unsafe {
                    $(core::arch::asm!(
                        concat!("mrs {}, ", $name),
                        out(reg) self.$field,
                        options(nomem, nostack, preserves_flags)
                    );)+
                }
            }

            /// Program the hardware from this bank.
            #[allow(unused_variables)]
            pub fn restore_to_hw(&self) {
                #[cfg(all(target_arch = "aarch64", target_os = "none"))]
                unsafe {
                    $(core::arch::asm!(
                        concat!("msr ", $name, ", {}"),
                        in(reg) self.$field,
                        options(nomem, nostack, preserves_flags)
                    );)+
                }
            }
        }
    };
}

sysreg_bank! {
    (sctlr_el1, "sctlr_el1"),
    (ttbr0_el1, "ttbr0_el1"),
    (ttbr1_el1, "ttbr1_el1"),
    (tcr_el1, "tcr_el1"),
    (mair_el1, "mair_el1"),
    (amair_el1, "amair_el1"),
    (vbar_el1, "vbar_el1"),
    (esr_el1, "esr_el1"),
    (far_el1, "far_el1"),
    (par_el1, "par_el1"),
    (afsr0_el1, "afsr0_el1"),
    (afsr1_el1, "afsr1_el1"),
    (contextidr_el1, "contextidr_el1"),
    (cpacr_el1, "cpacr_el1"),
    (csselr_el1, "csselr_el1"),
    (sp_el1, "sp_el1"),
    (elr_el1, "elr_el1"),
    (spsr_el1, "spsr_el1"),
    (tpidr_el0, "tpidr_el0"),
    (tpidrro_el0, "tpidrro_el0"),
    (tpidr_el1, "tpidr_el1"),
    (cntkctl_el1, "cntkctl_el1"),
    (vmpidr_el2, "vmpidr_el2"),
    (vpidr_el2, "vpidr_el2"),
}

/// SCTLR_EL1 reset value: RES1 bits only, MMU and caches off, the state
/// a guest kernel expects at its entry point.
pub const SCTLR_EL1_RESET: u64 = 0x0000_0000_30D0_0800;

impl SysRegBank {
    /// Initialize the bank for a cold vCPU boot. `vmpidr` is the MPIDR
    /// value the guest reads for this vCPU.
    pub fn reset(&mut self, vmpidr: u64) {
        *self = Self::default();
        self.sctlr_el1 = SCTLR_EL1_RESET;
        self.vmpidr_el2 = vmpidr;
        // Report the host part number to the guest unchanged.
        self.vpidr_el2 = read_midr();
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        fn read_midr() -> u64 {
            let midr: u64;
            unsafe {
                core::arch::asm!("mrs {}, midr_el1", out(reg) midr,
                    options(nomem, nostack, preserves_flags));
            }
            midr
        }
    } else {
        fn read_midr() -> u64 {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_programs_identity_and_sctlr() {
        let mut bank = SysRegBank::default();
        bank.ttbr0_el1 = 0x1234;
        bank.reset(0x8000_0001);
        assert_eq!(bank.ttbr0_el1, 0);
        assert_eq!(bank.sctlr_el1, SCTLR_EL1_RESET);
        assert_eq!(bank.vmpidr_el2, 0x8000_0001);
    }
}
