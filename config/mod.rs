//! Platform configuration
//!
//! Compile-time constants for the reference platform (QEMU `virt`,
//! GICv2, PL011). Everything that varies between boards lives here.

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Number of physical CPUs the scheduler is built for.
pub const MAX_CPUS: usize = 4;

/// Size of the task descriptor pool (kernel tasks + vCPUs + idle tasks).
pub const MAX_TASKS: usize = 64;

/// Maximum number of guests.
pub const MAX_VMS: usize = 4;

/// Maximum vCPUs per guest.
pub const MAX_VCPUS: usize = 4;

/// Scheduler tick period in milliseconds.
pub const TICK_MS: u32 = 10;

/// Time slice handed to a task on each refill, in ticks.
pub const TIME_SLICE_TICKS: u32 = 5;

/// Per-CPU idle task stack size in bytes (4 KiB aligned).
pub const IDLE_STACK_SIZE: usize = 4096;

/// Kernel stack size for ordinary tasks and vCPU host threads.
pub const TASK_STACK_SIZE: usize = 2 * PAGE_SIZE;

/// Physical RAM window managed by the page allocator.
pub const RAM_START: u64 = 0x4000_0000;
pub const RAM_SIZE: u64 = 512 * 1024 * 1024;

/// First page index handed to filesystem buffer allocations, so that
/// `alloc_pages_fs` never collides with the general pool.
pub const FS_RESERVED_PAGE_OFFSET: usize = 0x1_0000;

// GICv2 register windows (QEMU virt).
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICC_BASE: u64 = 0x0801_0000;
pub const GICH_BASE: u64 = 0x0803_0000;
pub const GICV_BASE: u64 = 0x0804_0000;

/// Size of each GIC register window.
pub const GIC_FRAME_SIZE: u64 = 0x1_0000;

/// Added to a trapped GICC access to reach the hardware virtual interface.
pub const GICC_TO_GICV_OFFSET: u64 = GICV_BASE - GICC_BASE;

/// PL011 UART.
pub const UART_BASE: u64 = 0x0900_0000;

// Interrupt IDs (reference platform).
/// EL2 hypervisor timer (PPI 10).
pub const IRQ_HYP_TIMER: u32 = 26;
/// Virtual timer (PPI 11).
pub const IRQ_VTIMER: u32 = 27;
/// Non-secure physical timer (PPI 14), used when the `hv` feature is off.
pub const IRQ_PHYS_TIMER: u32 = 30;
/// PL011 UART.
pub const IRQ_UART: u32 = 33;

/// SGI reserved for inter-CPU scheduling wake-ups.
pub const IPI_SCHED: u32 = 7;

/// Highest interrupt ID the virtual distributor models.
pub const GIC_MAX_IRQS: usize = 1020;

/// Upper bound on hypervisor list registers; the live count is read from
/// GICH_VTR at boot.
pub const GICH_MAX_LRS: usize = 16;

/// Default guest physical memory layout: guests see their RAM at the same
/// IPA the host RAM occupies, so Stage-2 is an identity map for RAM.
pub const GUEST_RAM_IPA: u64 = 0x4000_0000;
pub const GUEST_RAM_SIZE: u64 = 128 * 1024 * 1024;

/// Default load addresses inside the guest IPA space.
pub const GUEST_KERNEL_IPA: u64 = GUEST_RAM_IPA + 0x8_0000;
pub const GUEST_DTB_IPA: u64 = GUEST_RAM_IPA + 0x600_0000;
pub const GUEST_INITRD_IPA: u64 = GUEST_RAM_IPA + 0x700_0000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_constants_agree() {
        assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
        assert_eq!(RAM_SIZE % PAGE_SIZE as u64, 0);
    }

    #[test]
    fn gic_windows_disjoint() {
        assert!(GICD_BASE + GIC_FRAME_SIZE <= GICC_BASE);
        assert!(GICC_BASE + GIC_FRAME_SIZE <= GICH_BASE);
        assert_eq!(GICC_BASE + GICC_TO_GICV_OFFSET, GICV_BASE);
    }
}
