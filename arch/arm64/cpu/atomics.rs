//! Named atomic primitives
//!
//! The only place in the tree that is allowed to perform atomic
//! read-modify-write operations. Each function names its exact memory
//! ordering contract; on AArch64 these lower to the
//! `ldaxr`/`stlxr`/`ldar`/`stlr` exclusives.

use core::sync::atomic::{AtomicU64, Ordering};

/// Compare-and-swap with acquire ordering on success (relaxed on
/// failure). Returns the previous value; the caller succeeded iff it
/// equals `old`.
#[inline]
pub fn cas_acquire(atom: &AtomicU64, old: u64, new: u64) -> u64 {
    match atom.compare_exchange(old, new, Ordering::Acquire, Ordering::Relaxed) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

/// Atomic increment; returns the new value. Release ordering: prior
/// writes by this CPU are visible before the new value is.
#[inline]
pub fn inc_return_release(atom: &AtomicU64) -> u64 {
    atom.fetch_add(1, Ordering::Release) + 1
}

/// Atomic decrement; returns the new value. Release ordering.
#[inline]
pub fn dec_return_release(atom: &AtomicU64) -> u64 {
    atom.fetch_sub(1, Ordering::Release).wrapping_sub(1)
}

/// Atomic add; returns the new value. Release ordering.
#[inline]
pub fn add_return_release(atom: &AtomicU64, value: u64) -> u64 {
    atom.fetch_add(value, Ordering::Release).wrapping_add(value)
}

/// Atomic exchange with acquire-release ordering; returns the previous
/// value.
#[inline]
pub fn xchg_acq_rel(atom: &AtomicU64, value: u64) -> u64 {
    atom.swap(value, Ordering::AcqRel)
}

/// Load with acquire ordering: later reads by this CPU cannot be
/// reordered before it.
#[inline]
pub fn load_acquire(atom: &AtomicU64) -> u64 {
    atom.load(Ordering::Acquire)
}

/// Store with release ordering: earlier writes by this CPU are visible
/// to any CPU that acquire-loads the stored value.
#[inline]
pub fn store_release(atom: &AtomicU64, value: u64) {
    atom.store(value, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_succeeds_only_on_match() {
        let atom = AtomicU64::new(5);
        assert_eq!(cas_acquire(&atom, 5, 7), 5);
        assert_eq!(load_acquire(&atom), 7);
        assert_eq!(cas_acquire(&atom, 5, 9), 7);
        assert_eq!(load_acquire(&atom), 7);
    }

    #[test]
    fn counters_return_the_new_value() {
        let atom = AtomicU64::new(10);
        assert_eq!(inc_return_release(&atom), 11);
        assert_eq!(dec_return_release(&atom), 10);
        assert_eq!(add_return_release(&atom, 5), 15);
    }

    #[test]
    fn xchg_returns_previous() {
        let atom = AtomicU64::new(1);
        assert_eq!(xchg_acq_rel(&atom, 2), 1);
        store_release(&atom, 3);
        assert_eq!(load_acquire(&atom), 3);
    }
}
