//! ARM Generic Timer support
//!
//! The scheduler tick runs off the EL2 hypervisor timer (CNTHP) in
//! hypervisor builds and the non-secure EL1 physical timer (CNTP) in
//! native kernel builds. Each vCPU additionally owns a virtual timer
//! ([`vtimer`]) whose expiry is checked after every tick and delivered
//! through the vGIC.

pub mod vtimer;

use crate::config::{IRQ_HYP_TIMER, IRQ_PHYS_TIMER, IRQ_VTIMER, TICK_MS};
use crate::core::sched::{self, TaskKind};
use crate::core::vmm::vm::with_vm;

/// Interrupt ID driving the scheduler tick in this build.
pub const TICK_IRQ: u32 = if cfg!(feature = "hv") {
    IRQ_HYP_TIMER
} else {
    IRQ_PHYS_TIMER
};

/// Control register bits shared by every generic-timer frame.
pub mod ctl {
    pub const ENABLE: u64 = 1 << 0;
    pub const IMASK: u64 = 1 << 1;
    pub const ISTATUS: u64 = 1 << 2;
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        /// Physical counter value.
        pub fn cntpct() -> u64 {
            let value: u64;
            unsafe {
                core::arch::asm!("isb", "mrs {}, cntpct_el0", out(reg) value,
                    options(nomem, nostack, preserves_flags));
            }
            value
        }

        /// Counter frequency from CNTFRQ_EL0.
        pub fn cntfrq() -> u64 {
            let value: u64;
            unsafe {
                core::arch::asm!("mrs {}, cntfrq_el0", out(reg) value,
                    options(nomem, nostack, preserves_flags));
            }
            value
        }

        #[cfg(feature = "hv")]
        fn program_tval(ticks: u64) {
            unsafe {
                core::arch::asm!(
                    "msr cnthp_tval_el2, {t}",
                    "msr cnthp_ctl_el2, {c}",
                    t = in(reg) ticks,
                    c = in(reg) ctl::ENABLE,
                    options(nomem, nostack, preserves_flags)
                );
            }
        }

        #[cfg(not(feature = "hv"))]
        fn program_tval(ticks: u64) {
            unsafe {
                core::arch::asm!(
                    "msr cntp_tval_el0, {t}",
                    "msr cntp_ctl_el0, {c}",
                    t = in(reg) ticks,
                    c = in(reg) ctl::ENABLE,
                    options(nomem, nostack, preserves_flags)
                );
            }
        }
    } else {
        /// Physical counter value (host stand-in).
        pub fn cntpct() -> u64 {
            0
        }

        /// Counter frequency (host stand-in: a common QEMU value).
        pub fn cntfrq() -> u64 {
            62_500_000
        }

        fn program_tval(_ticks: u64) {}
    }
}

/// Counter increments per scheduler tick.
pub fn counts_per_tick() -> u64 {
    cntfrq() * TICK_MS as u64 / 1000
}

/// Arm the tick timer for one period and enable its interrupt line.
/// Runs on each CPU during bring-up.
pub fn start_tick(cpu: usize) {
    crate::arch::arm64::interrupt::gic::enable_irq(TICK_IRQ);
    program_tval(counts_per_tick());
    log::debug!("timer: tick armed on cpu {} (irq {})", cpu, TICK_IRQ);
}

/// Tick interrupt body: rearm, drive the scheduler, then evaluate the
/// running vCPU's virtual timer against the physical counter.
pub fn tick_irq() {
    program_tval(counts_per_tick());
    sched::timer_tick();
    poll_vtimer();
}

/// After scheduling, fire the virtual timer of whatever vCPU is now
/// current, if its compare value has passed and it is unmasked.
pub fn poll_vtimer() {
    let idx = sched::current_task_idx();
    let kind = sched::scheduler::TASKS.lock().get(idx).kind;
    let TaskKind::Vcpu { vm, vcpu } = kind else {
        return;
    };
    let now = cntpct();
    with_vm(vm, |vm| {
        if vm.vtimers[vcpu as usize].should_fire(now) && vm.vgic.inject(vcpu as usize, IRQ_VTIMER)
        {
            vm.vgic.flush_pending(vcpu as usize);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_matches_frequency() {
        // 62.5 MHz at a 10 ms tick is 625_000 counts.
        assert_eq!(counts_per_tick(), cntfrq() / 100);
    }

    #[test]
    fn tick_irq_id_tracks_build_mode() {
        if cfg!(feature = "hv") {
            assert_eq!(TICK_IRQ, IRQ_HYP_TIMER);
        } else {
            assert_eq!(TICK_IRQ, IRQ_PHYS_TIMER);
        }
    }
}
