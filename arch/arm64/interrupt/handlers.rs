//! EL2 exception handlers
//!
//! The exception vectors (see `vectors.rs`) push a trap frame and call
//! into here. IRQs are acknowledged, dispatched and completed against
//! the physical GIC; synchronous exceptions from the guest are decoded
//! from ESR_EL2 and routed to the Stage-2 fault path, the WFx/HVC/SMC
//! emulations, or a diagnostic dump.

use crate::arch::arm64::interrupt::gic;
use crate::arch::arm64::mmu::fault::{self, esr};
use crate::arch::arm64::timer;
use crate::arch::cpu::context::TrapFrame;
use crate::config::{IPI_SCHED, IRQ_UART};
use crate::core::sched::{self, TaskKind};
use crate::core::vmm::vm::with_vm;

/// IRQ exception entry: acknowledge, dispatch, complete.
#[no_mangle]
pub extern "C" fn el2_irq_entry(_frame: &mut TrapFrame) {
    let iar = gic::ack();
    let irq = iar & 0x3ff;
    if irq >= gic::SPURIOUS_IRQ {
        return;
    }

    match irq {
        _ if irq == timer::TICK_IRQ => timer::tick_irq(),
        IPI_SCHED => {
            if sched::scheduler::ipi_sched_handler() {
                sched::schedule();
            }
        }
        IRQ_UART => {
            // Console input is drained by whoever waits on it; the
            // handler only needs to wake them.
            crate::drivers::uart::rx_ready();
        }
        _ => route_to_guest(irq),
    }

    gic::eoi(iar);
}

/// A physical interrupt owned by a guest: mark it pending in the vGIC
/// of the current vCPU's VM.
fn route_to_guest(irq: u32) {
    let idx = sched::current_task_idx();
    let kind = sched::scheduler::TASKS.lock().get(idx).kind;
    if let TaskKind::Vcpu { vm, vcpu } = kind {
        with_vm(vm, |vm| {
            if vm.vgic.inject(vcpu as usize, irq) {
                vm.vgic.flush_pending(vcpu as usize);
            }
        });
    } else {
        log::debug!("irq {} with no guest to take it", irq);
    }
}

/// Synchronous exception entry from a lower EL.
#[no_mangle]
pub extern "C" fn el2_sync_entry(frame: &mut TrapFrame) {
    let (esr_val, far, hpfar) = read_fault_regs();
    let ec = esr::ec(esr_val);
    let iss = esr::iss(esr_val);

    match ec {
        esr::EC_DABT_LOW => {
            let ipa = fault::fault_ipa(hpfar, far);
            dispatch_stage2(frame, ipa, iss);
        }
        esr::EC_WFX => {
            // A waiting guest yields its host task instead of parking
            // the physical CPU.
            frame.skip_instruction();
            sched::task_yield();
        }
        esr::EC_HVC64 => {
            // HVC already advances ELR past the instruction.
            handle_hypercall(frame);
        }
        esr::EC_SMC64 => {
            frame.skip_instruction();
            psci::handle_smc(frame);
        }
        esr::EC_SYSREG => {
            log::debug!("trapped sysreg access, iss {:#x}", iss);
            frame.skip_instruction();
        }
        esr::EC_IABT_LOW => {
            let ipa = fault::fault_ipa(hpfar, far);
            log::error!("guest instruction fetch fault at ipa {:#x}", ipa);
            dump_frame(frame);
            frame.skip_instruction();
        }
        _ => {
            log::error!("unhandled sync exception, ec {:#x} iss {:#x}", ec, iss);
            dump_frame(frame);
            frame.skip_instruction();
        }
    }
}

fn dispatch_stage2(frame: &mut TrapFrame, ipa: u64, iss: u32) {
    let idx = sched::current_task_idx();
    let kind = sched::scheduler::TASKS.lock().get(idx).kind;
    let TaskKind::Vcpu { vm, vcpu } = kind else {
        log::error!("stage2 fault from a non-guest task, ipa {:#x}", ipa);
        frame.skip_instruction();
        return;
    };
    let handled = with_vm(vm, |vm| {
        fault::handle_stage2_fault(vm, vcpu as usize, frame, ipa, iss)
    });
    if let Some(Err(err)) = handled {
        log::warn!("vm {}: stage2 fault not handled: {:?}", vm, err);
    }
}

/// Hypervisor calls from guests. x0 selects the service, x1.. carry
/// arguments, x0 returns the result.
fn handle_hypercall(frame: &mut TrapFrame) {
    const HVC_VERSION: u64 = 0;
    const HVC_PUTC: u64 = 1;
    const HVC_YIELD: u64 = 2;

    match frame.reg(0) {
        HVC_VERSION => frame.set_reg(0, 0x0001_0000),
        HVC_PUTC => {
            crate::drivers::uart::console_putc(frame.reg(1) as u8);
            frame.set_reg(0, 0);
        }
        HVC_YIELD => {
            frame.set_reg(0, 0);
            sched::task_yield();
        }
        other => {
            log::debug!("unknown hypercall {:#x}", other);
            frame.set_reg(0, u64::MAX);
        }
    }
}

/// PSCI emulation for guest SMCs.
pub mod psci {
    use super::*;

    pub const PSCI_VERSION: u32 = 0x8400_0000;
    pub const CPU_OFF: u32 = 0x8400_0002;
    pub const CPU_ON_32: u32 = 0x8400_0003;
    pub const CPU_ON_64: u32 = 0xc400_0003;
    pub const SYSTEM_OFF: u32 = 0x8400_0008;
    pub const SYSTEM_RESET: u32 = 0x8400_0009;

    pub const SUCCESS: u64 = 0;
    pub const NOT_SUPPORTED: u64 = u64::MAX; // -1

    /// What a guest SMC asks for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PsciCall {
        Version,
        CpuOn { target: u64, entry: u64, ctx: u64 },
        CpuOff,
        SystemOff,
        SystemReset,
        Unknown,
    }

    /// Classify the function ID and arguments of an SMC.
    pub fn classify(fid: u64, x1: u64, x2: u64, x3: u64) -> PsciCall {
        match fid as u32 {
            PSCI_VERSION => PsciCall::Version,
            CPU_ON_32 | CPU_ON_64 => PsciCall::CpuOn {
                target: x1,
                entry: x2,
                ctx: x3,
            },
            CPU_OFF => PsciCall::CpuOff,
            SYSTEM_OFF => PsciCall::SystemOff,
            SYSTEM_RESET => PsciCall::SystemReset,
            _ => PsciCall::Unknown,
        }
    }

    /// Handle a guest SMC in place, updating its registers.
    pub fn handle_smc(frame: &mut TrapFrame) {
        let call = classify(frame.reg(0), frame.reg(1), frame.reg(2), frame.reg(3));
        let idx = sched::current_task_idx();
        let kind = sched::scheduler::TASKS.lock().get(idx).kind;
        let TaskKind::Vcpu { vm, .. } = kind else {
            frame.set_reg(0, NOT_SUPPORTED);
            return;
        };

        match call {
            PsciCall::Version => frame.set_reg(0, 0x0001_0001), // PSCI 1.1
            PsciCall::CpuOn { target, entry, .. } => {
                log::info!(
                    "vm {}: CPU_ON vcpu {:#x} at entry {:#x}",
                    vm,
                    target,
                    entry
                );
                let started = with_vm(vm, |vm| {
                    start_secondary_vcpu(vm, target, entry)
                })
                .unwrap_or(false);
                frame.set_reg(0, if started { SUCCESS } else { NOT_SUPPORTED });
            }
            PsciCall::CpuOff => {
                frame.set_reg(0, SUCCESS);
                sched::wait_for_irq();
            }
            PsciCall::SystemOff | PsciCall::SystemReset => {
                with_vm(vm, |vm| vm.mark_dead());
                frame.set_reg(0, SUCCESS);
                sched::task_yield();
            }
            PsciCall::Unknown => frame.set_reg(0, NOT_SUPPORTED),
        }
    }

    /// Queue the host task of a secondary vCPU whose MPIDR matches
    /// `target`, pointing its entry at the requested address.
    fn start_secondary_vcpu(vm: &mut crate::core::vmm::vm::Vm, target: u64, entry: u64) -> bool {
        let vcpu = (target & 0xff) as usize;
        let Some(&task_idx) = vm.vcpu_tasks.get(vcpu) else {
            return false;
        };
        crate::core::vmm::vcpu::with_bank(task_idx, |bank| bank.elr_el1 = entry);
        let affinity = sched::scheduler::TASKS.lock().get(task_idx).affinity;
        sched::scheduler::queue_on(task_idx, affinity);
        true
    }
}

fn dump_frame(frame: &TrapFrame) {
    for chunk in 0..8 {
        let base = chunk * 4;
        log::error!(
            "  x{:02}={:#018x} x{:02}={:#018x} x{:02}={:#018x} x{:02}={:#018x}",
            base,
            frame.r[base],
            base + 1,
            frame.r[base + 1],
            base + 2,
            frame.r[base + 2],
            base + 3,
            frame.r.get(base + 3).copied().unwrap_or(0)
        );
    }
    log::error!(
        "  elr={:#018x} spsr={:#010x} sp_el0={:#018x}",
        frame.elr,
        frame.spsr,
        frame.usp
    );
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        fn read_fault_regs() -> (u64, u64, u64) {
            let (esr, far, hpfar): (u64, u64, u64);
            unsafe {
                core::arch::asm!(
                    "mrs {esr}, esr_el2",
                    "mrs {far}, far_el2",
                    "mrs {hpfar}, hpfar_el2",
                    esr = out(reg) esr,
                    far = out(reg) far,
                    hpfar = out(reg) hpfar,
                    options(nomem, nostack, preserves_flags)
                );
            }
            (esr, far, hpfar)
        }
    } else {
        fn read_fault_regs() -> (u64, u64, u64) {
            (0, 0, 0)
        }
    }
}
