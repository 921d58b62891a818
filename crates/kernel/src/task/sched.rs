/// Run queue and scheduler.
///
/// Strict round-robin FIFO on one logical CPU. The queue is an intrusive
/// doubly-linked list threaded through the task table by id: a task sits
/// in at most one queue, and the running task is never in it. The idle
/// task is never enqueued; it is the fallback when the queue drains.
///
/// Locking: enqueue/dequeue/head-pick happen with IRQs masked and the
/// scheduler lock held. The lock is released before the context-switch
/// routine runs; the interrupt mask is restored by the resumed task.
use super::signal::Signal;
use super::table::{alloc_task_id, TaskTable};
use super::task::{Task, TaskId, TaskState};
use crate::error::KernelError;
use crate::sync::SpinLock;
use alloc::boxed::Box;

pub struct RunQueue {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append to the tail. A task already queued stays where it is.
    pub fn push_back(&mut self, table: &mut TaskTable, id: TaskId) {
        let Some(task) = table.get_mut(id) else { return };
        if task.queued {
            return;
        }
        task.queued = true;
        task.run_next = None;
        task.run_prev = self.tail;

        match self.tail {
            Some(tail) => {
                if let Some(prev) = table.get_mut(tail) {
                    prev.run_next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Detach the head.
    pub fn pop_front(&mut self, table: &mut TaskTable) -> Option<TaskId> {
        let id = self.head?;
        self.unlink(table, id);
        Some(id)
    }

    /// Remove a task wherever it sits.
    pub fn unlink(&mut self, table: &mut TaskTable, id: TaskId) {
        let (prev, next, was_queued) = match table.get_mut(id) {
            Some(task) => {
                let links = (task.run_prev, task.run_next, task.queued);
                task.run_prev = None;
                task.run_next = None;
                task.queued = false;
                links
            }
            None => return,
        };
        if !was_queued {
            return;
        }

        match prev {
            Some(p) => {
                if let Some(t) = table.get_mut(p) {
                    t.run_next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(t) = table.get_mut(n) {
                    t.run_prev = prev;
                }
            }
            None => self.tail = prev,
        }
        self.len -= 1;
    }
}

pub struct Scheduler {
    pub table: TaskTable,
    pub queue: RunQueue,
    pub current: TaskId,
    pub idle: TaskId,
}

/// What `pick_next` decided; the switch itself happens with the lock
/// dropped.
struct SwitchPlan {
    prev_ctx: *mut crate::arch::Context,
    next_ctx: *const crate::arch::Context,
    /// Root to install when the incoming task owns a different space
    install_root: Option<u64>,
}

impl Scheduler {
    /// Build the scheduler around a fresh idle task (id 0). The run
    /// queue starts empty; entering `schedule` runs idle.
    pub fn new() -> Result<Self, KernelError> {
        let mut table = TaskTable::new();
        let idle = Box::new(Task::new(0, "swapper")?);
        table.insert(idle)?;
        Ok(Self {
            table,
            queue: RunQueue::new(),
            current: 0,
            idle: 0,
        })
    }

    /// Head-pick with round-robin requeue of the outgoing task. Returns
    /// `(prev, next)`; `None` when there is nothing to switch to.
    pub fn pick_next(&mut self) -> Option<(TaskId, TaskId)> {
        let prev = self.current;
        let next = self.queue.pop_front(&mut self.table).unwrap_or(self.idle);
        if next == prev {
            return None;
        }

        // The caller goes to the tail if it can still run; idle never
        // queues.
        if prev != self.idle {
            if let Some(task) = self.table.get(prev) {
                if task.state.is_runnable() {
                    self.queue.push_back(&mut self.table, prev);
                }
            }
        }

        self.current = next;
        Some((prev, next))
    }

    /// Make a task runnable and queue it. Waking is the sleep-exit
    /// signal checkpoint: a sleeper with KILL pending terminates here
    /// instead of running again.
    pub fn wake(&mut self, id: TaskId) -> Result<(), KernelError> {
        let current = self.current;
        {
            let task = self.table.get_mut(id).ok_or(KernelError::NoSuchTask)?;
            match task.state {
                TaskState::Zombie { .. } | TaskState::Dead => {
                    return Err(KernelError::NoSuchTask)
                }
                _ => {}
            }
        }

        if super::exit::check_pending_kill(self, id) {
            return Ok(());
        }

        if let Some(task) = self.table.get_mut(id) {
            task.state = TaskState::Runnable;
        }
        if id != current {
            self.queue.push_back(&mut self.table, id);
        }
        Ok(())
    }

    /// Kernel-task factory: the task enters at `entry(arg)` on its own
    /// kernel stack and joins the queue immediately.
    pub fn spawn(
        &mut self,
        name: &str,
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> Result<TaskId, KernelError> {
        let id = alloc_task_id()?;
        let mut task = Box::new(Task::new(id, name)?);
        task.context = crate::arch::Context::new_kernel(entry, arg, task.kstack_top());
        task.parent = Some(self.current);
        self.table.insert(task)?;

        let current = self.current;
        if let Some(parent) = self.table.get_mut(current) {
            parent.children.push(id);
        }
        self.queue.push_back(&mut self.table, id);
        Ok(id)
    }

    /// Mark the target for termination. Interruptible sleepers are woken
    /// and requeued so they can observe the pending KILL and die; the
    /// idle task is untouchable.
    pub fn kill(&mut self, id: TaskId) -> Result<(), KernelError> {
        if id == self.idle {
            return Err(KernelError::PermissionDenied);
        }
        let task = self.table.get_mut(id).ok_or(KernelError::NoSuchTask)?;
        match task.state {
            TaskState::Zombie { .. } | TaskState::Dead => return Err(KernelError::NoSuchTask),
            _ => {}
        }
        task.exiting = true;
        task.pending.add(Signal::Kill);
        if task.state == TaskState::Interruptible {
            task.state = TaskState::Runnable;
            if id != self.current {
                self.queue.push_back(&mut self.table, id);
            }
        }
        Ok(())
    }

    /// Mark the current task sleeping and take it off the queue; the
    /// next `schedule` switches away.
    pub fn sleep_current(&mut self, interruptible: bool) {
        let id = self.current;
        self.queue.unlink(&mut self.table, id);
        if let Some(task) = self.table.get_mut(id) {
            task.state = if interruptible {
                TaskState::Interruptible
            } else {
                TaskState::Uninterruptible
            };
        }
    }

    fn plan_switch(&mut self) -> Option<SwitchPlan> {
        let (prev, next) = self.pick_next()?;

        let install_root = {
            let next_task = self.table.get(next)?;
            let next_root = next_task
                .space
                .as_ref()
                .map(|s| s.lock().root());
            let prev_root = self
                .table
                .get(prev)
                .and_then(|t| t.space.as_ref().map(|s| s.lock().root()));
            match next_root {
                Some(root) if Some(root) != prev_root => Some(root),
                _ => None,
            }
        };

        let prev_ctx = self.table.get_mut(prev)?;
        let prev_ctx = &mut prev_ctx.context as *mut crate::arch::Context;
        let next_ctx = &self.table.get(next)?.context as *const crate::arch::Context;
        Some(SwitchPlan {
            prev_ctx,
            next_ctx,
            install_root,
        })
    }
}

/// Global scheduler. Plain spinlock: every path that takes it masks IRQs
/// first and keeps them masked until after the switch.
static SCHED: SpinLock<Option<Scheduler>> = SpinLock::new(None);

/// Stand up the global scheduler. A second call is a no-op.
pub fn init() -> Result<(), KernelError> {
    if SCHED.lock().is_some() {
        return Ok(());
    }
    let sched = Scheduler::new()?;
    let mut guard = SCHED.lock();
    if guard.is_none() {
        *guard = Some(sched);
        crate::info!("sched: run queue ready, idle task installed");
    }
    Ok(())
}

/// Run `f` under the scheduler lock with IRQs masked.
pub fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Result<R, KernelError> {
    let irq = crate::arch::irq_save();
    let result = {
        let mut guard = SCHED.lock();
        match guard.as_mut() {
            Some(sched) => Ok(f(sched)),
            None => Err(KernelError::Unsupported),
        }
    };
    unsafe { crate::arch::irq_restore(irq) };
    result
}

/// Cooperative preemption point: pick the queue head and switch to it.
/// Returns immediately when the caller should keep running.
pub fn schedule() {
    let irq = crate::arch::irq_save();

    let plan = {
        let mut guard = SCHED.lock();
        guard.as_mut().and_then(|s| s.plan_switch())
        // Lock drops here, before the switch instruction
    };

    if let Some(plan) = plan {
        unsafe {
            if let Some(root) = plan.install_root {
                crate::arch::set_translation_base(root);
            }
            crate::arch::context_switch(plan.prev_ctx, plan.next_ctx);
        }
    }

    unsafe { crate::arch::irq_restore(irq) };
}

/// Voluntarily give up the CPU but stay runnable.
pub fn yield_now() {
    schedule();
}

pub fn current() -> TaskId {
    with_sched(|s| s.current).unwrap_or(0)
}

pub fn wake(id: TaskId) -> Result<(), KernelError> {
    with_sched(|s| s.wake(id))?
}

pub fn kill(id: TaskId) -> Result<(), KernelError> {
    with_sched(|s| s.kill(id))?
}

pub fn create_task(
    name: &str,
    entry: extern "C" fn(usize) -> !,
    arg: usize,
) -> Result<TaskId, KernelError> {
    with_sched(|s| s.spawn(name, entry, arg))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        unreachable!("test tasks are never switched into")
    }

    fn sched_with_tasks(n: usize) -> (Scheduler, alloc::vec::Vec<TaskId>) {
        init_global_test_arena();
        let mut sched = Scheduler::new().unwrap();
        let mut ids = alloc::vec::Vec::new();
        for i in 0..n {
            let name = alloc::format!("t{}", i + 1);
            ids.push(sched.spawn(&name, dummy_entry, i).unwrap());
        }
        (sched, ids)
    }

    #[test]
    fn round_robin_order_is_stable() {
        let (mut sched, ids) = sched_with_tasks(3);
        // 9 picks starting from idle: t1 t2 t3 t1 t2 t3 t1 t2 t3
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..9 {
            let (_, next) = sched.pick_next().expect("queue never empties");
            seen.push(next);
        }
        let expected: alloc::vec::Vec<TaskId> =
            ids.iter().cycle().take(9).copied().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn equal_quanta_over_thirty_cycles() {
        let (mut sched, ids) = sched_with_tasks(3);
        let mut counts = [0usize; 3];
        for _ in 0..30 {
            let (_, next) = sched.pick_next().unwrap();
            let idx = ids.iter().position(|&id| id == next).unwrap();
            counts[idx] += 1;
        }
        assert_eq!(counts, [10, 10, 10]);
    }

    #[test]
    fn running_task_is_not_queued() {
        let (mut sched, ids) = sched_with_tasks(2);
        let (_, next) = sched.pick_next().unwrap();
        assert_eq!(next, ids[0]);
        // The running task sits outside the queue
        assert!(!sched.table.get(ids[0]).unwrap().queued);
        assert!(sched.table.get(ids[1]).unwrap().queued);
        // And it appears at most once after requeue
        let (_, next) = sched.pick_next().unwrap();
        assert_eq!(next, ids[1]);
        assert_eq!(sched.queue.len(), 1);
    }

    #[test]
    fn empty_queue_falls_back_to_idle() {
        init_global_test_arena();
        let mut sched = Scheduler::new().unwrap();
        assert!(sched.queue.is_empty());
        assert!(sched.pick_next().is_none(), "idle keeps running");

        let id = sched.spawn("t", dummy_entry, 0).unwrap();
        let (prev, next) = sched.pick_next().unwrap();
        assert_eq!(prev, sched.idle);
        assert_eq!(next, id);

        // Task blocks: queue drains back to idle
        sched.sleep_current(true);
        let (prev, next) = sched.pick_next().unwrap();
        assert_eq!(prev, id);
        assert_eq!(next, sched.idle);
    }

    #[test]
    fn sleeper_skips_requeue_until_woken() {
        let (mut sched, ids) = sched_with_tasks(2);
        let (_, first) = sched.pick_next().unwrap();
        assert_eq!(first, ids[0]);
        sched.sleep_current(true);
        let (_, second) = sched.pick_next().unwrap();
        assert_eq!(second, ids[1]);
        // Only t2 cycles now
        let (_, again) = sched.pick_next().unwrap();
        assert_eq!(again, ids[1]);

        sched.wake(ids[0]).unwrap();
        let (_, woken) = sched.pick_next().unwrap();
        assert_eq!(woken, ids[0]);
    }

    #[test]
    fn kill_wakes_interruptible_sleeper() {
        let (mut sched, ids) = sched_with_tasks(2);
        let (_, t1) = sched.pick_next().unwrap();
        assert_eq!(t1, ids[0]);
        sched.sleep_current(true);
        sched.pick_next().unwrap();

        sched.kill(ids[0]).unwrap();
        let task = sched.table.get(ids[0]).unwrap();
        assert!(task.exiting);
        assert!(task.pending.contains(Signal::Kill));
        assert_eq!(task.state, TaskState::Runnable);
        assert!(task.queued, "requeued so it can observe the kill");
    }

    #[test]
    fn wake_is_a_kill_checkpoint() {
        let (mut sched, ids) = sched_with_tasks(2);
        let (_, t1) = sched.pick_next().unwrap();
        assert_eq!(t1, ids[0]);
        // Uninterruptible sleep: kill marks the task but cannot wake it
        sched.sleep_current(false);
        sched.pick_next().unwrap();
        sched.kill(ids[0]).unwrap();
        assert_eq!(
            sched.table.get(ids[0]).unwrap().state,
            TaskState::Uninterruptible
        );

        // Sleep exit observes the pending KILL: the task dies instead
        // of rejoining the queue
        sched.wake(ids[0]).unwrap();
        let task = sched.table.get(ids[0]).unwrap();
        assert!(task.state.is_zombie());
        assert!(!task.queued);
    }

    #[test]
    fn idle_task_cannot_be_killed() {
        init_global_test_arena();
        let mut sched = Scheduler::new().unwrap();
        assert_eq!(sched.kill(sched.idle), Err(KernelError::PermissionDenied));
        assert_eq!(sched.kill(9999), Err(KernelError::NoSuchTask));
    }
}
