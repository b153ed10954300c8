//! Task model and scheduler
//!
//! Fixed-pool task control blocks ([`task`]), arena-indexed queues
//! ([`list`]), and the per-CPU preemptive round-robin scheduler
//! ([`scheduler`]).

pub mod list;
pub mod scheduler;
pub mod task;

pub use scheduler::{
    current_task_idx, schedule, sleep, task_add_to_readylist_tail_remote, task_yield,
    timer_tick, wait_for_irq, wake_task, CpuScheduler,
};
pub use task::{TaskId, TaskKind, TaskPool, TaskState, Tcb};
