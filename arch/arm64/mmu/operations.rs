//! Cache and TLB maintenance discipline
//!
//! Every mutation of a live translation table goes through this module,
//! in this order: clean+invalidate the dcache line holding the
//! descriptor, `dsb sy`, scoped TLB invalidate (VMID for Stage-2, ASID
//! for Stage-1), `dsb sy; isb`. The dcache line size comes from
//! CTR_EL0.DminLine, read once at boot.

use crate::arch::cpu;
use crate::core::mm::PhysAddr;

/// TLB invalidation scope for [`sync_table_update`].
#[derive(Debug, Clone, Copy)]
pub enum TlbScope {
    /// Stage-1, one address space.
    Asid(u16),
    /// Stage-2 (plus stage-1) for the current VMID.
    CurrentVmid,
    /// Everything at EL2.
    HostEl2,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        /// Clean and invalidate the dcache lines covering
        /// `[addr, addr + len)`.
        pub fn dcache_clean_invalidate(addr: PhysAddr, len: usize) {
            let line = cpu::cacheline_bytes() as u64;
            let mut cur = addr & !(line - 1);
            while cur < addr + len as u64 {
                unsafe {
                    core::arch::asm!("dc civac, {}", in(reg) cur,
                        options(nostack, preserves_flags));
                }
                cur += line;
            }
        }

        fn tlb_invalidate(scope: TlbScope) {
            unsafe {
                match scope {
                    TlbScope::Asid(asid) => {
                        let arg = (asid as u64) << 48;
                        core::arch::asm!("tlbi aside1is, {}", in(reg) arg,
                            options(nostack, preserves_flags));
                    }
                    TlbScope::CurrentVmid => {
                        core::arch::asm!("tlbi vmalls12e1is",
                            options(nostack, preserves_flags));
                    }
                    TlbScope::HostEl2 => {
                        core::arch::asm!("tlbi alle2is",
                            options(nostack, preserves_flags));
                    }
                }
            }
        }

        /// Switch the EL1 address space to `pgdir` (native kernel mode).
        pub fn switch_ttbr0(pgdir: PhysAddr) {
            unsafe {
                core::arch::asm!("msr ttbr0_el1, {}", in(reg) pgdir,
                    options(nomem, nostack, preserves_flags));
            }
            cpu::dsb_sy();
            tlb_invalidate(TlbScope::CurrentVmid);
            cpu::dsb_sy();
            cpu::isb();
        }

        /// Point Stage-2 translation at a VM's root table.
        pub fn write_vttbr(vttbr: u64) {
            unsafe {
                core::arch::asm!("msr vttbr_el2, {}", in(reg) vttbr,
                    options(nomem, nostack, preserves_flags));
            }
            cpu::isb();
        }
    } else {
        /// Clean and invalidate the dcache lines covering
        /// `[addr, addr + len)` (host fallback).
        pub fn dcache_clean_invalidate(_addr: PhysAddr, _len: usize) {}

        fn tlb_invalidate(_scope: TlbScope) {}

        /// Switch the EL1 address space to `pgdir` (host fallback).
        pub fn switch_ttbr0(_pgdir: PhysAddr) {}

        /// Point Stage-2 translation at a VM's root table (host
        /// fallback).
        pub fn write_vttbr(_vttbr: u64) {}
    }
}

/// Publish a descriptor update: cache maintenance on the descriptor
/// line, then the barrier/TLBI/barrier sequence, in that order.
pub fn sync_table_update(descriptor_addr: PhysAddr, scope: TlbScope) {
    dcache_clean_invalidate(descriptor_addr, core::mem::size_of::<u64>());
    cpu::dsb_sy();
    tlb_invalidate(scope);
    cpu::dsb_sy();
    cpu::isb();
}

/// Publish a freshly built table tree before its root goes live:
/// clean+invalidate every modified line, one TLBI, barriers.
pub fn sync_new_tables(ranges: &[(PhysAddr, usize)], scope: TlbScope) {
    for &(addr, len) in ranges {
        dcache_clean_invalidate(addr, len);
    }
    cpu::dsb_sy();
    tlb_invalidate(scope);
    cpu::dsb_sy();
    cpu::isb();
}
