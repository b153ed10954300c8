//! Stage-1 boot translation tables
//!
//! EL1 and EL2 run on a coarse identity map at boot: one L0 entry
//! pointing at one L1 table whose four 1 GiB block entries cover the
//! device window, the kernel RAM window, and two user regions. Finer
//! mappings for native user tasks are carved later per task; the coarse
//! map is what the boot path and the idle loops live on.

use crate::arch::arm64::mmu::attrs::{
    Stage1Attr, DESC_ADDR_MASK, DESC_BLOCK, DESC_TABLE, DESC_VALID,
};
use crate::arch::arm64::mmu::operations::{self, TlbScope};

/// 1 GiB, the block size at level 1.
pub const L1_BLOCK_SIZE: u64 = 1 << 30;

/// The four 1 GiB regions of the boot map, in L1 index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootRegion {
    /// Peripherals (GIC, UART) at 0..1 GiB.
    Device = 0,
    /// Kernel image and managed RAM at 1..2 GiB.
    KernelRam = 1,
    /// First user window at 2..3 GiB.
    UserLow = 2,
    /// Second user window at 3..4 GiB.
    UserHigh = 3,
}

impl BootRegion {
    /// Descriptor attributes for this region.
    pub fn attrs(self) -> Stage1Attr {
        match self {
            BootRegion::Device => {
                Stage1Attr::ATTR_IDX_DEVICE
                    | Stage1Attr::AF
                    | Stage1Attr::PXN
                    | Stage1Attr::UXN
            }
            BootRegion::KernelRam => {
                Stage1Attr::ATTR_IDX_NORMAL | Stage1Attr::AF | Stage1Attr::SH_INNER
            }
            BootRegion::UserLow | BootRegion::UserHigh => {
                Stage1Attr::ATTR_IDX_NORMAL
                    | Stage1Attr::AF
                    | Stage1Attr::SH_INNER
                    | Stage1Attr::AP_EL0
                    | Stage1Attr::PXN
            }
        }
    }
}

/// The boot table pair. The storage is caller-provided so that boot
/// code can place it in static, page-aligned memory.
pub struct BootTables<'a> {
    l0: &'a mut [u64; 512],
    l1: &'a mut [u64; 512],
}

impl<'a> BootTables<'a> {
    pub fn new(l0: &'a mut [u64; 512], l1: &'a mut [u64; 512]) -> Self {
        Self { l0, l1 }
    }

    /// Populate the coarse map: L0[0] points at L1, L1[0..4] are 1 GiB
    /// blocks. Identity mapping, so the table address doubles as its
    /// physical address.
    pub fn build(&mut self) {
        self.l0.fill(0);
        self.l1.fill(0);

        let l1_pa = self.l1.as_ptr() as u64;
        self.l0[0] = (l1_pa & DESC_ADDR_MASK) | DESC_VALID | DESC_TABLE;

        for region in [
            BootRegion::Device,
            BootRegion::KernelRam,
            BootRegion::UserLow,
            BootRegion::UserHigh,
        ] {
            let idx = region as usize;
            let base = idx as u64 * L1_BLOCK_SIZE;
            self.l1[idx] = (base & DESC_ADDR_MASK) | region.attrs().bits() | DESC_BLOCK;
        }
    }

    /// Rewrite one live L1 block entry. The descriptor line is cleaned,
    /// then the TLB entry for this address space is dropped, then the
    /// barriers complete, in that order.
    pub fn rewrite_block(&mut self, region: BootRegion, attrs: Stage1Attr) {
        let idx = region as usize;
        let base = idx as u64 * L1_BLOCK_SIZE;
        self.l1[idx] = (base & DESC_ADDR_MASK) | attrs.bits() | DESC_BLOCK;

        let descriptor_addr = &self.l1[idx] as *const u64 as u64;
        operations::sync_table_update(descriptor_addr, TlbScope::Asid(0));
    }

    /// Raw L1 descriptor for a region.
    pub fn l1_entry(&self, region: BootRegion) -> u64 {
        self.l1[region as usize]
    }

    /// Physical address of the L0 root, for the TTBR write.
    pub fn root(&self) -> u64 {
        self.l0.as_ptr() as u64
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        use crate::arch::arm64::mmu::attrs::MAIR_VALUE;
        use crate::arch::cpu;

        /// TCR_EL2: 4 KiB granule, 48-bit VA, inner-shareable
        /// write-back walks.
        const TCR_EL2_VALUE: u64 = 0x80803510;

        /// Install the boot map at EL2 and turn the MMU on.
        ///
        /// # Safety
        /// `tables` must identity-map the code executing this function.
        pub unsafe fn install_el2(tables: &BootTables<'_>) {
            core::arch::asm!(
                "msr mair_el2, {mair}",
                "msr tcr_el2, {tcr}",
                "msr ttbr0_el2, {root}",
                mair = in(reg) MAIR_VALUE,
                tcr = in(reg) TCR_EL2_VALUE,
                root = in(reg) tables.root(),
                options(nomem, nostack, preserves_flags)
            );
            cpu::isb();
            let mut sctlr: u64;
            core::arch::asm!("mrs {}, sctlr_el2", out(reg) sctlr,
                options(nomem, nostack, preserves_flags));
            sctlr |= 1 | (1 << 2) | (1 << 12); // M, C, I
            core::arch::asm!("msr sctlr_el2, {}", in(reg) sctlr,
                options(nomem, nostack, preserves_flags));
            cpu::isb();
        }

        /// TCR_EL1 twin of the EL2 value, with TTBR1 walks disabled
        /// until a task installs a high-half directory.
        const TCR_EL1_VALUE: u64 = 0x0000_0000_0080_3510 | (1 << 23);

        /// Install the boot map at EL1 (native kernel mode). The same
        /// table serves both TTBRs until user tasks get their own.
        ///
        /// # Safety
        /// `tables` must identity-map the code executing this function.
        pub unsafe fn install_el1(tables: &BootTables<'_>) {
            core::arch::asm!(
                "msr mair_el1, {mair}",
                "msr tcr_el1, {tcr}",
                "msr ttbr0_el1, {root}",
                "msr ttbr1_el1, {root}",
                mair = in(reg) MAIR_VALUE,
                tcr = in(reg) TCR_EL1_VALUE,
                root = in(reg) tables.root(),
                options(nomem, nostack, preserves_flags)
            );
            cpu::isb();
            let mut sctlr: u64;
            core::arch::asm!("mrs {}, sctlr_el1", out(reg) sctlr,
                options(nomem, nostack, preserves_flags));
            sctlr |= 1 | (1 << 2) | (1 << 12); // M, C, I
            core::arch::asm!("msr sctlr_el1, {}", in(reg) sctlr,
                options(nomem, nostack, preserves_flags));
            cpu::isb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> (Box<[u64; 512]>, Box<[u64; 512]>) {
        (Box::new([0u64; 512]), Box::new([0u64; 512]))
    }

    #[test]
    fn boot_map_covers_four_gib_in_blocks() {
        let (mut l0, mut l1) = tables();
        let mut boot = BootTables::new(&mut l0, &mut l1);
        boot.build();

        // L0[0] is a table pointer at the L1 array.
        let l0_entry = boot.l0[0];
        assert_eq!(l0_entry & 0x3, DESC_VALID | DESC_TABLE);

        for (idx, region) in [
            BootRegion::Device,
            BootRegion::KernelRam,
            BootRegion::UserLow,
            BootRegion::UserHigh,
        ]
        .into_iter()
        .enumerate()
        {
            let entry = boot.l1_entry(region);
            assert_eq!(entry & 0x3, DESC_BLOCK, "region {} not a block", idx);
            assert_eq!(entry & DESC_ADDR_MASK, idx as u64 * L1_BLOCK_SIZE);
        }
    }

    #[test]
    fn device_region_is_device_xn() {
        let (mut l0, mut l1) = tables();
        let mut boot = BootTables::new(&mut l0, &mut l1);
        boot.build();

        let entry = boot.l1_entry(BootRegion::Device);
        assert_eq!(entry & (0b111 << 2), 0, "device must use MAIR index 0");
        assert!(entry & Stage1Attr::UXN.bits() != 0);
        assert!(entry & Stage1Attr::PXN.bits() != 0);
    }

    #[test]
    fn user_regions_allow_el0() {
        let (mut l0, mut l1) = tables();
        let mut boot = BootTables::new(&mut l0, &mut l1);
        boot.build();

        for region in [BootRegion::UserLow, BootRegion::UserHigh] {
            let entry = boot.l1_entry(region);
            assert!(entry & Stage1Attr::AP_EL0.bits() != 0);
            assert!(entry & Stage1Attr::PXN.bits() != 0);
        }
        assert_eq!(
            boot.l1_entry(BootRegion::KernelRam) & Stage1Attr::AP_EL0.bits(),
            0
        );
    }

    #[test]
    fn rewrite_updates_descriptor_in_place() {
        let (mut l0, mut l1) = tables();
        let mut boot = BootTables::new(&mut l0, &mut l1);
        boot.build();

        let before = boot.l1_entry(BootRegion::UserHigh);
        boot.rewrite_block(
            BootRegion::UserHigh,
            Stage1Attr::ATTR_IDX_NORMAL | Stage1Attr::AF | Stage1Attr::AP_RO,
        );
        let after = boot.l1_entry(BootRegion::UserHigh);
        assert_ne!(before, after);
        assert!(after & Stage1Attr::AP_RO.bits() != 0);
        assert_eq!(after & DESC_ADDR_MASK, 3 * L1_BLOCK_SIZE);
    }
}
