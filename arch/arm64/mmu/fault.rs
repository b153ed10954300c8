//! Stage-2 fault dispatch and MMIO emulation
//!
//! A data abort trapped from a guest is classified by its IPA:
//! distributor accesses go to the vGIC emulator, CPU-interface accesses
//! are rebased onto the hardware GICV frame and executed for real, and
//! everything else inside a declared window is a generic MMIO access.
//! Faults outside every window are guest errors: logged, the
//! instruction skipped to avoid a fault livelock, and in strict builds
//! the VM dies.

use crate::arch::arm64::interrupt::vgic::GICC_EOIR;
use crate::arch::cpu;
use crate::arch::cpu::context::TrapFrame;
use crate::config::GICC_TO_GICV_OFFSET;
use crate::core::mm::Ipa;
use crate::core::vmm::vm::{IpaClass, Vm};
use crate::{Error, Result};

/// ESR_EL2 exception-class values the hypervisor dispatches on.
pub mod esr {
    pub const EC_WFX: u32 = 0x01;
    pub const EC_HVC64: u32 = 0x16;
    pub const EC_SMC64: u32 = 0x17;
    pub const EC_SYSREG: u32 = 0x18;
    pub const EC_IABT_LOW: u32 = 0x20;
    pub const EC_DABT_LOW: u32 = 0x24;

    /// Exception class field.
    #[inline]
    pub fn ec(esr: u64) -> u32 {
        ((esr >> 26) & 0x3f) as u32
    }

    /// Instruction-specific syndrome field.
    #[inline]
    pub fn iss(esr: u64) -> u32 {
        (esr & 0x01ff_ffff) as u32
    }
}

/// Decoded data-abort syndrome.
#[derive(Debug, Clone, Copy)]
pub struct DataAbort {
    /// Syndrome fields below are valid (ISV).
    pub isv: bool,
    /// Write (true) or read (false).
    pub write: bool,
    /// Access size in bytes: 1, 2, 4 or 8.
    pub size: usize,
    /// Register transferring the data (syndrome SRT).
    pub reg: usize,
    /// Sign-extend a narrow load (SSE).
    pub sign_extend: bool,
}

impl DataAbort {
    /// Decode the ISS of a lower-EL data abort.
    pub fn decode(iss: u32) -> Self {
        Self {
            isv: (iss >> 24) & 1 != 0,
            write: (iss >> 6) & 1 != 0,
            size: 1 << ((iss >> 22) & 0x3),
            reg: ((iss >> 16) & 0x1f) as usize,
            sign_extend: (iss >> 21) & 1 != 0,
        }
    }
}

/// Reconstruct the faulting IPA from HPFAR_EL2 (frame) and FAR_EL2
/// (page offset).
pub fn fault_ipa(hpfar: u64, far: u64) -> Ipa {
    ((hpfar & 0x0000_000f_ffff_fff0) << 8) | (far & 0xfff)
}

/// Dispatch a trapped guest data abort. On success the faulting
/// instruction has been emulated and skipped.
pub fn handle_stage2_fault(
    vm: &mut Vm,
    vcpu: usize,
    frame: &mut TrapFrame,
    ipa: Ipa,
    iss: u32,
) -> Result<()> {
    let abort = DataAbort::decode(iss);
    if !abort.isv {
        log::warn!("stage2: abort without syndrome at {:#x}, skipping", ipa);
        frame.skip_instruction();
        return Ok(());
    }

    match vm.layout.classify(ipa) {
        IpaClass::Distributor { offset } => {
            if abort.write {
                let value = frame.reg(abort.reg);
                vm.vgic.dist_write(vcpu, offset, abort.size, value);
            } else {
                let value = vm.vgic.dist_read(vcpu, offset, abort.size);
                frame.set_reg(abort.reg, value);
            }
        }
        IpaClass::CpuInterface { offset } => {
            // The guest thinks it is talking to GICC; the access really
            // lands on the hardware virtual interface.
            let target = ipa + GICC_TO_GICV_OFFSET;
            #[cfg(all(target_arch = "aarch64", target_os = "none"))]
            emulate_mmio(frame, &abort, target);
            #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
            let _ = target;

            if abort.write && offset == GICC_EOIR {
                let virq = (frame.reg(abort.reg) & 0x3ff) as u32;
                vm.vgic.eoi_from_guest(vcpu, virq);
            }
            vm.vgic.save_cpu_state(vcpu);
        }
        IpaClass::Passthrough => {
            emulate_mmio(frame, &abort, ipa);
        }
        IpaClass::Ram | IpaClass::Outside => {
            log::error!(
                "vm {}: stage2 fault outside emulated windows, ipa {:#x} ({} bytes, {})",
                vm.id,
                ipa,
                abort.size,
                if abort.write { "write" } else { "read" }
            );
            if cfg!(feature = "debug") {
                vm.mark_dead();
                frame.skip_instruction();
                return Err(Error::GuestFault);
            }
        }
    }

    frame.skip_instruction();
    cpu::dsb_sy();
    cpu::isb();
    Ok(())
}

/// Generic MMIO access: move `size` bytes between the faulting
/// register and the target address. Register 30 reads as zero and
/// swallows writes, per the emulation convention for XZR encodings.
pub fn emulate_mmio(frame: &mut TrapFrame, abort: &DataAbort, target: u64) {
    if abort.write {
        let value = frame.reg(abort.reg);
        mmio_write(target, value, abort.size);
    } else {
        let value = mmio_read(target, abort.size);
        frame.set_reg(abort.reg, value);
    }
}

/// Sized read, zero-extended. Aligned accesses use a single load; the
/// unaligned remainder goes byte by byte.
pub fn mmio_read(addr: u64, size: usize) -> u64 {
    let ptr = addr as usize;
    unsafe {
        if ptr % size == 0 {
            match size {
                1 => (ptr as *const u8).read_volatile() as u64,
                2 => (ptr as *const u16).read_volatile() as u64,
                4 => (ptr as *const u32).read_volatile() as u64,
                _ => (ptr as *const u64).read_volatile(),
            }
        } else {
            let mut value = 0u64;
            for i in 0..size {
                value |= ((ptr as *const u8).add(i).read_volatile() as u64) << (8 * i);
            }
            value
        }
    }
}

/// Sized write of the low `size` bytes of `value`.
pub fn mmio_write(addr: u64, value: u64, size: usize) {
    let ptr = addr as usize;
    unsafe {
        if ptr % size == 0 {
            match size {
                1 => (ptr as *mut u8).write_volatile(value as u8),
                2 => (ptr as *mut u16).write_volatile(value as u16),
                4 => (ptr as *mut u32).write_volatile(value as u32),
                _ => (ptr as *mut u64).write_volatile(value),
            }
        } else {
            for i in 0..size {
                (ptr as *mut u8).add(i).write_volatile((value >> (8 * i)) as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm64::interrupt::vgic::GICD_ISENABLER;
    use crate::config::{GICD_BASE, PAGE_SIZE};
    use crate::core::mm::Pmm;
    use crate::core::vmm::vm::GuestLayout;
    use crate::utils::align_up;
    use crate::utils::bitmap::Bitmap;

    fn host_pmm(pages: usize) -> &'static Pmm {
        let buf: Vec<u8> = vec![0u8; (pages + 1) * PAGE_SIZE];
        let start = align_up(buf.as_ptr() as u64, PAGE_SIZE as u64);
        std::mem::forget(buf);

        let storage = Box::leak(Box::new(vec![0u64; pages.div_ceil(64)]));
        let pmm = Box::leak(Box::new(Pmm::new()));
        pmm.init(
            start,
            pages as u64 * PAGE_SIZE as u64,
            Bitmap::from_slice(storage.as_mut_slice()),
        )
        .unwrap();
        pmm
    }

    fn test_vm(pmm: &'static Pmm) -> Vm {
        let layout = GuestLayout {
            ram_ipa: 0x4000_0000,
            ram_pa: pmm.start_addr(),
            ram_size: 4 * PAGE_SIZE as u64,
            passthrough: heapless::Vec::new(),
        };
        Vm::build(pmm, 0, "faultvm", layout).unwrap()
    }

    /// ISS for a 32-bit access via register `reg`.
    fn iss_word(reg: usize, write: bool) -> u32 {
        let mut iss = 1 << 24 | (2 << 22) | ((reg as u32) << 16);
        if write {
            iss |= 1 << 6;
        }
        iss
    }

    #[test]
    fn syndrome_decode_extracts_the_fields() {
        let abort = DataAbort::decode(iss_word(5, true));
        assert!(abort.isv);
        assert!(abort.write);
        assert_eq!(abort.size, 4);
        assert_eq!(abort.reg, 5);

        let abort = DataAbort::decode(1 << 24 | (0 << 22) | (12 << 16));
        assert!(!abort.write);
        assert_eq!(abort.size, 1);
        assert_eq!(abort.reg, 12);
    }

    #[test]
    fn hpfar_far_reassemble_the_ipa() {
        // HPFAR holds IPA[47:12] in bits [39:4].
        let ipa = 0x0800_0100u64;
        let hpfar = (ipa >> 12) << 4;
        let far = 0xffff_0000_0000_0100u64;
        assert_eq!(fault_ipa(hpfar, far), ipa);
    }

    #[test]
    fn distributor_write_reaches_the_vgic_shadow() {
        // Guest writes 0xDEADBEEF to GICD_ISENABLER0; the fault routes
        // to the distributor emulator and the value reads back.
        let pmm = host_pmm(32);
        let mut vm = test_vm(pmm);
        let mut frame = TrapFrame::default();

        frame.set_reg(3, 0xdead_beef);
        frame.elr = 0x4000_1000;
        handle_stage2_fault(
            &mut vm,
            0,
            &mut frame,
            GICD_BASE + GICD_ISENABLER,
            iss_word(3, true),
        )
        .unwrap();
        assert_eq!(frame.elr, 0x4000_1004, "faulting instruction skipped");

        let mut frame = TrapFrame::default();
        handle_stage2_fault(
            &mut vm,
            0,
            &mut frame,
            GICD_BASE + GICD_ISENABLER,
            iss_word(7, false),
        )
        .unwrap();
        assert_eq!(frame.reg(7), 0xdead_beef);
    }

    #[test]
    fn register_30_reads_zero_and_discards_writes() {
        let pmm = host_pmm(32);
        let mut vm = test_vm(pmm);

        let mut frame = TrapFrame::default();
        frame.r[30] = 0x7777_7777;
        handle_stage2_fault(
            &mut vm,
            0,
            &mut frame,
            GICD_BASE + GICD_ISENABLER,
            iss_word(30, true),
        )
        .unwrap();
        // The write was discarded: nothing latched in the shadow.
        assert_eq!(vm.vgic.dist_read(0, GICD_ISENABLER, 4), 0);

        handle_stage2_fault(
            &mut vm,
            0,
            &mut frame,
            GICD_BASE + GICD_ISENABLER,
            iss_word(30, false),
        )
        .unwrap();
        assert_eq!(frame.r[30], 0x7777_7777, "x30 itself stays untouched");
    }

    #[test]
    fn generic_mmio_moves_sized_values() {
        let mut backing = [0u8; 16];
        let base = backing.as_mut_ptr() as u64;

        mmio_write(base, 0x1122_3344_5566_7788, 8);
        assert_eq!(mmio_read(base, 8), 0x1122_3344_5566_7788);
        assert_eq!(mmio_read(base, 4), 0x5566_7788);
        assert_eq!(mmio_read(base, 2), 0x7788);
        assert_eq!(mmio_read(base, 1), 0x88);

        // Unaligned path.
        mmio_write(base + 3, 0xaabb, 2);
        assert_eq!(mmio_read(base + 3, 2), 0xaabb);
    }

    #[test]
    fn fault_outside_windows_skips_and_reports() {
        let pmm = host_pmm(32);
        let mut vm = test_vm(pmm);
        let mut frame = TrapFrame::default();
        frame.elr = 0x100;

        let result = handle_stage2_fault(&mut vm, 0, &mut frame, 0xf000_0000, iss_word(1, false));
        assert_eq!(frame.elr, 0x104, "instruction skipped to avoid livelock");
        if cfg!(feature = "debug") {
            assert_eq!(result.unwrap_err(), Error::GuestFault);
        } else {
            assert!(result.is_ok());
        }
    }
}
