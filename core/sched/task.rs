//! Task control blocks and the task pool
//!
//! Every runnable entity is a [`Tcb`] slot in the fixed [`TaskPool`]
//! arena: kernel tasks, vCPU host tasks, and the per-CPU idle tasks. A
//! non-zero `task_id` marks a live slot; IDs are monotonic and never
//! recycled.

use crate::arch::cpu::context::{TaskContext, TrapFrame};
use crate::config::MAX_TASKS;
use crate::core::mm::PhysAddr;
use crate::core::sched::list::{IndexList, ListNode, NodeArena, NodeSel, NIL};
use crate::{Error, Result};

/// Monotonic task identifier; zero marks a free pool slot.
pub type TaskId = u32;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Allocated but not yet runnable.
    Create,
    /// On some CPU's ready list.
    Ready,
    /// Currently executing; on neither ready nor sleep list.
    Running,
    /// On a sleep list or parked on a mutex.
    Waiting,
    /// Parked until an IRQ handler re-queues it.
    WaitIrq,
    /// Terminated; slot awaits reclamation.
    Dead,
}

/// What a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Native EL1 task with its own Stage-1 page directory.
    Kernel,
    /// Host thread of a guest vCPU.
    Vcpu { vm: u8, vcpu: u8 },
    /// Per-CPU idle task; always schedulable, never sleeps.
    Idle,
}

/// SPSR for entering a native task at EL0t.
pub const SPSR_EL0T: u64 = 0x0000_0000;

/// SPSR for entering a guest at EL1h with DAIF masked; the guest kernel
/// unmasks once its vectors are up.
pub const SPSR_GUEST_EL1H: u64 = 0x0000_03C5;

/// Task control block.
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub task_id: TaskId,
    pub state: TaskState,
    pub kind: TaskKind,
    /// Preferred CPU index.
    pub affinity: usize,
    /// Ticks left in the current time slice.
    pub remaining_ticks: u32,
    /// Ticks left to sleep while on a sleep list.
    pub sleep_ticks: u32,
    /// Stage-1 root for native tasks; unused for vCPUs.
    pub pgdir: PhysAddr,
    /// Callee-saved switch target.
    pub ctx: TaskContext,
    /// Register snapshot as of the last exception entry.
    pub frame: TrapFrame,
    pub run_node: ListNode,
    pub wait_node: ListNode,
    pub vm_node: ListNode,
    pub all_node: ListNode,
}

impl Tcb {
    const EMPTY: Tcb = Tcb {
        task_id: 0,
        state: TaskState::Dead,
        kind: TaskKind::Kernel,
        affinity: 0,
        remaining_ticks: 0,
        sleep_ticks: 0,
        pgdir: 0,
        ctx: TaskContext {
            sp: 0,
            tpidr: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
        },
        frame: TrapFrame {
            r: [0; 31],
            usp: 0,
            elr: 0,
            spsr: 0,
        },
        run_node: ListNode::new(),
        wait_node: ListNode::new(),
        vm_node: ListNode::new(),
        all_node: ListNode::new(),
    };

    pub fn is_idle(&self) -> bool {
        matches!(self.kind, TaskKind::Idle)
    }
}

/// The fixed task arena plus the all-tasks list.
pub struct TaskPool {
    slots: [Tcb; MAX_TASKS],
    next_id: TaskId,
    all: IndexList,
}

impl NodeArena for TaskPool {
    fn node(&self, idx: u16, sel: NodeSel) -> &ListNode {
        let tcb = &self.slots[idx as usize];
        match sel {
            NodeSel::Run => &tcb.run_node,
            NodeSel::Wait => &tcb.wait_node,
            NodeSel::Vm => &tcb.vm_node,
            NodeSel::All => &tcb.all_node,
        }
    }

    fn node_mut(&mut self, idx: u16, sel: NodeSel) -> &mut ListNode {
        let tcb = &mut self.slots[idx as usize];
        match sel {
            NodeSel::Run => &mut tcb.run_node,
            NodeSel::Wait => &mut tcb.wait_node,
            NodeSel::Vm => &mut tcb.vm_node,
            NodeSel::All => &mut tcb.all_node,
        }
    }
}

impl TaskPool {
    pub const fn new() -> Self {
        Self {
            slots: [Tcb::EMPTY; MAX_TASKS],
            next_id: 1,
            all: IndexList::new(NodeSel::All),
        }
    }

    /// Claim a free slot: assigns the next monotonic ID, resets the TCB
    /// and links it on the all-tasks list.
    pub fn alloc(&mut self) -> Result<u16> {
        let idx = self.claim()?;
        // IndexList is Copy; work on a copy to appease the borrows.
        let mut all = self.all;
        all.push_tail(self, idx);
        self.all = all;
        Ok(idx)
    }

    /// Claim a slot for a per-CPU idle task. Idle tasks are
    /// distinguished instances: they never appear on the all-tasks list
    /// and are never torn down.
    pub fn alloc_idle(&mut self, cpu: usize) -> Result<u16> {
        let idx = self.claim()?;
        let tcb = &mut self.slots[idx as usize];
        tcb.kind = TaskKind::Idle;
        tcb.affinity = cpu;
        tcb.state = TaskState::Ready;
        Ok(idx)
    }

    fn claim(&mut self) -> Result<u16> {
        let idx = self
            .slots
            .iter()
            .position(|t| t.task_id == 0)
            .ok_or(Error::NoSpace)? as u16;
        let id = self.next_id;
        self.next_id += 1;

        let tcb = &mut self.slots[idx as usize];
        *tcb = Tcb::EMPTY;
        tcb.task_id = id;
        tcb.state = TaskState::Create;
        Ok(idx)
    }

    /// Release a slot. The caller must already have unlinked the task
    /// from the scheduler queues it was on; this clears the remaining
    /// membership and zeroes the slot.
    pub fn free(&mut self, idx: u16) {
        let mut all = self.all;
        all.remove(self, idx);
        self.all = all;
        self.slots[idx as usize] = Tcb::EMPTY;
    }

    pub fn get(&self, idx: u16) -> &Tcb {
        &self.slots[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u16) -> &mut Tcb {
        &mut self.slots[idx as usize]
    }

    /// Number of live tasks on the all-tasks list.
    pub fn live_tasks(&self) -> usize {
        self.all.len()
    }

    /// Initialize a native task: push its first trap frame onto the
    /// supplied kernel stack and aim the switch context at the entry
    /// trampoline.
    ///
    /// # Safety
    /// `stack_top` must be the end of a writable, 16-byte-aligned kernel
    /// stack with room for a trap frame.
    pub unsafe fn build_kernel_task(
        &mut self,
        idx: u16,
        entry: u64,
        stack_top: u64,
        user_sp: u64,
        affinity: usize,
    ) {
        let frame_addr = push_initial_frame(stack_top, |frame| {
            frame.elr = entry;
            frame.spsr = SPSR_EL0T;
            frame.usp = user_sp;
        });

        let tcb = &mut self.slots[idx as usize];
        tcb.kind = TaskKind::Kernel;
        tcb.affinity = affinity;
        tcb.ctx = TaskContext::prepared(frame_addr);
        tcb.state = TaskState::Ready;
    }

    /// Initialize a vCPU host task: the frame enters the guest kernel
    /// at EL1h with x0 holding the device-tree IPA.
    ///
    /// # Safety
    /// Same stack contract as [`TaskPool::build_kernel_task`].
    pub unsafe fn build_vcpu_task(
        &mut self,
        idx: u16,
        vm: u8,
        vcpu: u8,
        guest_entry: u64,
        dtb_ipa: u64,
        stack_top: u64,
        affinity: usize,
    ) {
        let frame_addr = push_initial_frame(stack_top, |frame| {
            frame.elr = guest_entry;
            frame.spsr = SPSR_GUEST_EL1H;
            frame.r[0] = dtb_ipa;
        });

        let tcb = &mut self.slots[idx as usize];
        tcb.kind = TaskKind::Vcpu { vm, vcpu };
        tcb.affinity = affinity;
        tcb.ctx = TaskContext::prepared(frame_addr);
        tcb.state = TaskState::Ready;
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a zeroed trap frame below `stack_top`, let `fill` populate it,
/// and return its address.
unsafe fn push_initial_frame(stack_top: u64, fill: impl FnOnce(&mut TrapFrame)) -> u64 {
    let frame_addr = (stack_top - core::mem::size_of::<TrapFrame>() as u64) & !0xF;
    let frame = &mut *(frame_addr as usize as *mut TrapFrame);
    *frame = TrapFrame::default();
    fill(frame);
    frame_addr
}

/// Queue-membership invariant probe: a task is on at most one
/// run-family list, and `Running` means on neither.
pub fn run_node_is_unlinked(pool: &TaskPool, idx: u16) -> bool {
    let node = pool.get(idx).run_node;
    node.prev == NIL && node.next == NIL
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> (Vec<u8>, u64) {
        let buf = vec![0u8; 4096];
        let top = (buf.as_ptr() as u64 + 4096) & !0xF;
        (buf, top)
    }

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let mut pool = TaskPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.get(a).task_id, 1);
        assert_eq!(pool.get(b).task_id, 2);

        pool.free(a);
        let c = pool.alloc().unwrap();
        // Slot is reused, the ID is not.
        assert_eq!(c, a);
        assert_eq!(pool.get(c).task_id, 3);
    }

    #[test]
    fn pool_exhaustion() {
        let mut pool = TaskPool::new();
        for _ in 0..MAX_TASKS {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.alloc().unwrap_err(), Error::NoSpace);
    }

    #[test]
    fn idle_tasks_stay_off_the_all_list() {
        let mut pool = TaskPool::new();
        let idle = pool.alloc_idle(0).unwrap();
        let task = pool.alloc().unwrap();
        assert_eq!(pool.live_tasks(), 1);
        assert!(pool.get(idle).is_idle());
        assert!(!pool.get(task).is_idle());
    }

    #[test]
    fn kernel_task_frame_enters_at_el0() {
        let mut pool = TaskPool::new();
        let (_stack, top) = stack();
        let idx = pool.alloc().unwrap();
        unsafe { pool.build_kernel_task(idx, 0x1234_5678, top, 0x7fff_0000, 1) };

        let tcb = pool.get(idx);
        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.affinity, 1);

        let frame = unsafe { &*(tcb.ctx.sp as usize as *const TrapFrame) };
        assert_eq!(frame.elr, 0x1234_5678);
        assert_eq!(frame.spsr, SPSR_EL0T);
        assert_eq!(frame.usp, 0x7fff_0000);
    }

    #[test]
    fn vcpu_task_frame_enters_guest_with_dtb() {
        let mut pool = TaskPool::new();
        let (_stack, top) = stack();
        let idx = pool.alloc().unwrap();
        unsafe { pool.build_vcpu_task(idx, 0, 2, 0x4008_0000, 0x4600_0000, top, 0) };

        let tcb = pool.get(idx);
        assert_eq!(tcb.kind, TaskKind::Vcpu { vm: 0, vcpu: 2 });

        let frame = unsafe { &*(tcb.ctx.sp as usize as *const TrapFrame) };
        assert_eq!(frame.elr, 0x4008_0000);
        assert_eq!(frame.spsr, SPSR_GUEST_EL1H);
        assert_eq!(frame.r[0], 0x4600_0000);
    }
}
