//! Per-vCPU virtual timer
//!
//! Each vCPU owns `{cntv_cval, cntv_ctl, cntvoff}`. While the vCPU is
//! on a physical CPU the hardware registers hold the state; while it is
//! off-CPU this struct does. The hypervisor checks expiry after every
//! scheduler tick and delivers IRQ 27 through the vGIC.

use crate::arch::arm64::timer::ctl;
use bitflags::bitflags;

bitflags! {
    /// CNTV_CTL_EL0 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VtimerCtl: u64 {
        const ENABLE = ctl::ENABLE;
        const IMASK = ctl::IMASK;
        const ISTATUS = ctl::ISTATUS;
    }
}

/// Saved virtual-timer state of one vCPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct VTimerState {
    /// CNTV_CVAL_EL0: absolute compare value in virtual time.
    pub cval: u64,
    /// CNTV_CTL_EL0.
    pub ctl: u64,
    /// CNTVOFF_EL2: subtracted from the physical counter to form the
    /// guest's virtual counter.
    pub cntvoff: u64,
}

impl VTimerState {
    pub const fn new() -> Self {
        Self {
            cval: 0,
            ctl: 0,
            cntvoff: 0,
        }
    }

    /// The guest's view of the counter.
    pub fn virtual_count(&self, cntpct: u64) -> u64 {
        cntpct.wrapping_sub(self.cntvoff)
    }

    /// Does the timer interrupt fire at physical count `cntpct`? True
    /// iff the virtual counter has reached the compare value, the
    /// timer is enabled, and the interrupt is not masked.
    pub fn should_fire(&self, cntpct: u64) -> bool {
        let ctl = VtimerCtl::from_bits_truncate(self.ctl);
        ctl.contains(VtimerCtl::ENABLE)
            && !ctl.contains(VtimerCtl::IMASK)
            && self.virtual_count(cntpct) >= self.cval
    }

    /// Read the hardware virtual-timer registers into this state.
    /// Runs in `vcpu_out`.
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    pub fn save_from_hw(&mut self) {
        unsafe {
            core::arch::asm!(
                "mrs {cval}, cntv_cval_el0",
                "mrs {ctl}, cntv_ctl_el0",
                "mrs {off}, cntvoff_el2",
                cval = out(reg) self.cval,
                ctl = out(reg) self.ctl,
                off = out(reg) self.cntvoff,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// Program the hardware from this state. Runs in `vcpu_in`; the
    /// offset is written first so the compare value is interpreted in
    /// the right timebase.
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    pub fn restore_to_hw(&self) {
        unsafe {
            core::arch::asm!(
                "msr cntvoff_el2, {off}",
                "msr cntv_cval_el0, {cval}",
                "msr cntv_ctl_el0, {ctl}",
                off = in(reg) self.cntvoff,
                cval = in(reg) self.cval,
                ctl = in(reg) self.ctl,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    /// Read the hardware virtual-timer registers (host stand-in).
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    pub fn save_from_hw(&mut self) {}

    /// Program the hardware from this state (host stand-in).
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    pub fn restore_to_hw(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // should_fire iff cntpct - cntvoff >= cval and enabled, unmasked.
    #[test_case(1000, 0, 900, true; "expired fires")]
    #[test_case(1000, 0, 1000, true; "exact compare fires")]
    #[test_case(1000, 0, 1100, false; "future does not fire")]
    #[test_case(1000, 500, 400, true; "offset shifts the timebase")]
    #[test_case(1000, 500, 600, false; "offset keeps it in the future")]
    fn compare_semantics(cntpct: u64, cntvoff: u64, cval: u64, fires: bool) {
        let state = VTimerState {
            cval,
            ctl: VtimerCtl::ENABLE.bits(),
            cntvoff,
        };
        assert_eq!(state.should_fire(cntpct), fires);
    }

    #[test]
    fn masked_or_disabled_never_fires() {
        let mut state = VTimerState {
            cval: 0,
            ctl: (VtimerCtl::ENABLE | VtimerCtl::IMASK).bits(),
            cntvoff: 0,
        };
        assert!(!state.should_fire(u64::MAX), "masked timer must not fire");

        state.ctl = 0;
        assert!(!state.should_fire(u64::MAX), "disabled timer must not fire");

        state.ctl = VtimerCtl::ENABLE.bits();
        assert!(state.should_fire(u64::MAX));
    }

    #[test]
    fn virtual_count_wraps_cleanly() {
        let state = VTimerState {
            cval: 10,
            ctl: VtimerCtl::ENABLE.bits(),
            cntvoff: 100,
        };
        // Physical counter behind the offset: the virtual counter is a
        // huge wrapped value, which still compares as expired.
        assert_eq!(state.virtual_count(40), 40u64.wrapping_sub(100));
        assert!(state.should_fire(40));
    }
}
