//! Blocking mutex
//!
//! A test-and-set lock that parks the calling task on contention
//! instead of spinning: the acquirer joins the mutex's wait list (via
//! its TCB wait node), goes `Waiting`, and yields the CPU. Release
//! hands the wake to the head waiter on its owner CPU, by IPI when that
//! CPU is remote.

use crate::arch::cpu;
use crate::arch::cpu::atomics::{cas_acquire, store_release};
use crate::core::sched::list::{IndexList, NodeSel};
use crate::core::sched::scheduler::{self, CPUS, TASKS};
use crate::core::sched::task::TaskState;
use crate::core::sync::SpinLock;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicU64;

const UNLOCKED: u64 = 0;
const LOCKED: u64 = 1;

/// A mutex whose contended acquirers sleep.
pub struct Mutex<T> {
    locked: AtomicU64,
    waiters: SpinLock<IndexList>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU64::new(UNLOCKED),
            waiters: SpinLock::new(IndexList::new(NodeSel::Wait)),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        (cas_acquire(&self.locked, UNLOCKED, LOCKED) == UNLOCKED).then(|| MutexGuard { mutex: self })
    }

    /// Acquire, parking the calling task while the lock is held
    /// elsewhere.
    pub fn lock(&self) -> MutexGuard<T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            // Join the wait list; the re-check under the waiters lock
            // closes the race against a release that saw no waiter.
            let parked = {
                let mut pool = TASKS.lock();
                let sched = CPUS[cpu::cpu_id()].lock();
                let mut waiters = self.waiters.lock();

                if cas_acquire(&self.locked, UNLOCKED, LOCKED) == UNLOCKED {
                    return MutexGuard { mutex: self };
                }
                let idx = sched.current();
                let mut list = *waiters;
                list.push_tail(&mut *pool, idx);
                *waiters = list;
                pool.get_mut(idx).state = TaskState::Waiting;
                true
            };
            if parked {
                scheduler::schedule();
            }
        }
    }

    fn release(&self) {
        let waiter = {
            let mut pool = TASKS.lock();
            let mut waiters = self.waiters.lock();
            let mut list = *waiters;
            let head = list.pop_head(&mut *pool);
            *waiters = list;
            // The unlock must retire while `waiters` is still held: a
            // contended acquirer re-checks the lock word under this
            // lock before parking, so it either observes UNLOCKED here
            // or was already on the list we just popped from. Storing
            // after the lock drops would let it park against a free
            // lock with nobody left to wake it.
            store_release(&self.locked, UNLOCKED);
            head
        };
        if let Some(idx) = waiter {
            scheduler::wake_task(idx);
        }
    }
}

/// Guard providing access to the protected data.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}
