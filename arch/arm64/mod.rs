//! ARM64 (AArch64) architecture support
//!
//! - CPU primitives: atomics, IRQ masking, context switch, sysreg bank
//! - MMU: boot Stage-1 tables, per-VM Stage-2 tables, fault dispatch
//! - Interrupts: physical GICv2 driver, virtual GICv2, IRQ handlers
//! - Timers: tick source (EL2 hyp timer or EL1 physical timer) and the
//!   per-vCPU virtual timer
//! - SMP: secondary bring-up glue over the start-CPU primitive
//!
//! Exception levels as used here: the hypervisor runs at EL2, guests at
//! EL1/EL0, and the companion kernel mode keeps the same scheduler
//! running natively at EL1.

pub mod cpu;
pub mod interrupt;
pub mod mmu;
pub mod smp;
pub mod timer;
