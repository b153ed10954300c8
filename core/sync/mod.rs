//! Synchronization primitives
//!
//! Spinlocks for short critical sections and a blocking mutex that
//! parks the calling task on contention.

pub mod mutex;
pub mod spinlock;

pub use mutex::Mutex;
pub use spinlock::{IrqSpinLock, SpinLock};
