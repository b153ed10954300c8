//! vCPU state and the vcpu_in / vcpu_out switch hooks
//!
//! Every vCPU's EL1 system-register bank lives in a dense arena indexed
//! by its host task's pool slot. The hooks run inside the context
//! switch:
//!
//! - `vcpu_out`: hardware is the authority, so registers are read into
//!   memory first (sysreg bank, GIC interface state, virtual timer).
//! - `vcpu_in`: memory is updated first (pending interrupts decide what
//!   the list registers will hold), then the hardware is programmed
//!   from memory.

use crate::arch::arm64::mmu::operations;
use crate::arch::cpu::sysreg::SysRegBank;
use crate::config::MAX_TASKS;
use crate::core::sched::scheduler::TASKS;
use crate::core::sched::TaskKind;
use crate::core::sync::SpinLock;
use crate::core::vmm::vm::with_vm;
use crate::{Error, Result};

/// Dense system-register arena, one bank per task-pool slot. Only vCPU
/// tasks ever use their slot.
static SYSREG_BANKS: SpinLock<SysRegArena> = SpinLock::new(SysRegArena::new());

struct SysRegArena {
    banks: [SysRegBank; MAX_TASKS],
}

impl SysRegArena {
    const fn new() -> Self {
        Self {
            banks: [SysRegBank::ZERO; MAX_TASKS],
        }
    }
}

/// Reset the register bank of a freshly created vCPU task. `vmpidr` is
/// what the guest will read as its own MPIDR.
pub fn reset_bank(task_idx: u16, vmpidr: u64) {
    SYSREG_BANKS.lock().banks[task_idx as usize].reset(vmpidr);
}

/// Copy of a task's register bank (diagnostics, tests).
pub fn bank_snapshot(task_idx: u16) -> SysRegBank {
    SYSREG_BANKS.lock().banks[task_idx as usize]
}

/// Run `f` on a task's register bank.
pub fn with_bank<R>(task_idx: u16, f: impl FnOnce(&mut SysRegBank) -> R) -> R {
    f(&mut SYSREG_BANKS.lock().banks[task_idx as usize])
}

/// Identify the VM and vCPU index behind a task, if any.
fn vcpu_of(task_idx: u16) -> Option<(u8, usize)> {
    match TASKS.lock().get(task_idx).kind {
        TaskKind::Vcpu { vm, vcpu } => Some((vm, vcpu as usize)),
        _ => None,
    }
}

/// Leaving a vCPU: capture hardware state into memory. Registers are
/// saved first; the in-memory copies become the authority the moment
/// this returns.
pub fn vcpu_out(task_idx: u16) {
    let Some((vm_id, vcpu)) = vcpu_of(task_idx) else {
        return;
    };

    SYSREG_BANKS.lock().banks[task_idx as usize].save_from_hw();
    with_vm(vm_id, |vm| {
        vm.vgic.save_cpu_state(vcpu);
        vm.vtimers[vcpu].save_from_hw();
    });
}

/// Entering a vCPU: decide in memory, then program hardware. Tasks
/// without a VM return immediately.
pub fn vcpu_in(task_idx: u16) {
    let Some((vm_id, vcpu)) = vcpu_of(task_idx) else {
        return;
    };

    SYSREG_BANKS.lock().banks[task_idx as usize].restore_to_hw();
    with_vm(vm_id, |vm| {
        // Injection decisions update the list-register shadow before
        // any hardware is touched.
        vm.vgic.flush_pending(vcpu);
        vm.vtimers[vcpu].restore_to_hw();
        vm.vgic.restore_cpu_state(vcpu);
        operations::write_vttbr(vm.stage2.vttbr());
    });
}

/// Create one vCPU host task for a VM and register it.
///
/// # Safety
/// `stack_top` must be the end of a writable kernel stack.
pub unsafe fn create_vcpu_task(
    vm_id: u8,
    guest_entry: u64,
    dtb_ipa: u64,
    stack_top: u64,
    affinity: usize,
) -> Result<u16> {
    let idx = {
        let mut pool = TASKS.lock();
        pool.alloc()?
    };

    let vcpu = match with_vm(vm_id, |vm| vm.add_vcpu_task(idx)) {
        Some(Ok(vcpu)) => vcpu,
        Some(Err(err)) => {
            TASKS.lock().free(idx);
            return Err(err);
        }
        None => {
            TASKS.lock().free(idx);
            return Err(Error::NotFound);
        }
    };

    {
        let mut pool = TASKS.lock();
        pool.build_vcpu_task(
            idx,
            vm_id,
            vcpu as u8,
            guest_entry,
            dtb_ipa,
            stack_top,
            affinity,
        );
    }
    // MPIDR affinity 0 carries the vCPU index.
    reset_bank(idx, 0x8000_0000 | vcpu as u64);
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::cpu::sysreg::SCTLR_EL1_RESET;

    #[test]
    fn reset_bank_prepares_guest_identity() {
        // Use a high slot to stay clear of other tests sharing the
        // global arena.
        reset_bank(60, 0x8000_0002);
        let bank = bank_snapshot(60);
        assert_eq!(bank.vmpidr_el2, 0x8000_0002);
        assert_eq!(bank.sctlr_el1, SCTLR_EL1_RESET);
    }

    #[test]
    fn banks_are_independent() {
        reset_bank(61, 0x8000_0000);
        with_bank(61, |bank| bank.ttbr0_el1 = 0xdead_0000);
        reset_bank(62, 0x8000_0001);
        assert_eq!(bank_snapshot(61).ttbr0_el1, 0xdead_0000);
        assert_eq!(bank_snapshot(62).ttbr0_el1, 0);
    }

    #[test]
    fn non_vcpu_tasks_skip_the_hooks() {
        // An empty pool slot is TaskKind::Kernel; both hooks must be
        // no-ops rather than touching the VM registry.
        vcpu_out(59);
        vcpu_in(59);
    }
}
