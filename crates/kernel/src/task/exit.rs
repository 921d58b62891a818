/// Task termination and reaping.
///
/// Exit marks the caller a zombie (carrying its exit code), hands its
/// children to init, and schedules away for good. The parent reaps the
/// zombie, which releases the record and its kernel stack; the address
/// space already died with its last reference.
use super::sched::{self, Scheduler};
use super::signal::Signal;
use super::table::INIT_TASK;
use super::task::{TaskId, TaskState};
use crate::error::KernelError;

/// Exit-status encoding consumed by wait: exit code in bits 8..16,
/// terminating signal in the low 7.
pub fn encode_wait_status(exit_code: i32, signal: i32) -> i32 {
    (exit_code << 8) | (signal & 0x7f)
}

/// Transition a task to zombie inside the scheduler: dequeue, record the
/// exit code, reparent children, notify a sleeping parent.
pub fn mark_exited(sched: &mut Scheduler, id: TaskId, exit_code: i32) {
    sched.queue.unlink(&mut sched.table, id);
    let parent = match sched.table.get_mut(id) {
        Some(task) => {
            task.state = TaskState::Zombie { exit_code };
            // The owned space drops here; threads sharing it keep it alive
            task.space = None;
            task.active_space = None;
            task.parent
        }
        None => return,
    };

    sched.table.reparent_to_init(id);

    if let Some(parent_id) = parent {
        if let Some(parent) = sched.table.get_mut(parent_id) {
            parent.pending.add(Signal::Chld);
            if parent.state == TaskState::Interruptible {
                parent.state = TaskState::Runnable;
                sched.queue.push_back(&mut sched.table, parent_id);
            }
        }
    }

    crate::info!("task {} exited with code {}", id, exit_code);
}

/// Terminate the calling task. Never returns: after the zombie
/// transition the scheduler switches away permanently.
pub fn exit(code: i32) -> ! {
    let _ = sched::with_sched(|s| {
        let id = s.current;
        mark_exited(s, id, code);
    });
    sched::schedule();

    // A zombie can never be picked again; reaching here means the
    // scheduler invariants are gone.
    panic!("exit: zombie task resumed");
}

/// Reap one zombie child of `parent`. Returns the child id and encoded
/// wait status, or `Busy` when children exist but none has exited yet.
pub fn wait_any(sched: &mut Scheduler, parent: TaskId) -> Result<(TaskId, i32), KernelError> {
    let has_children = !sched
        .table
        .get(parent)
        .ok_or(KernelError::NoSuchTask)?
        .children
        .is_empty();
    if !has_children {
        return Err(KernelError::NoSuchTask);
    }

    let zombies = sched.table.zombie_children(parent);
    let Some(&child) = zombies.first() else {
        return Err(KernelError::Busy);
    };
    reap(sched, parent, child)
}

/// Reap a specific zombie child: free the record and return its status.
pub fn reap(
    sched: &mut Scheduler,
    parent: TaskId,
    child: TaskId,
) -> Result<(TaskId, i32), KernelError> {
    let is_child = sched
        .table
        .get(child)
        .map(|t| t.parent == Some(parent))
        .unwrap_or(false);
    if !is_child {
        return Err(KernelError::NoSuchTask);
    }

    let exit_code = sched.table.release(child).ok_or(KernelError::Busy)?;
    sched.table.unlink_child(parent, child);
    if let Some(p) = sched.table.get_mut(parent) {
        p.pending.remove(Signal::Chld);
    }
    Ok((child, encode_wait_status(exit_code, 0)))
}

/// Signal-delivery checkpoint at kernel-to-user return and sleep exit: a
/// task with KILL pending terminates instead of returning.
pub fn check_pending_kill(sched: &mut Scheduler, id: TaskId) -> bool {
    let doomed = sched
        .table
        .get(id)
        .map(|t| {
            t.exiting
                || t.pending
                    .deliverable(&t.blocked)
                    .contains(Signal::Kill)
        })
        .unwrap_or(false);
    if doomed {
        mark_exited(sched, id, encode_wait_status(0, Signal::Kill as i32));
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;
    use crate::task::table::alloc_task_id;
    use crate::task::task::Task;
    use alloc::boxed::Box;

    fn sched_with_family() -> (Scheduler, TaskId, TaskId) {
        init_global_test_arena();
        let mut sched = Scheduler::new().unwrap();
        sched
            .table
            .insert(Box::new(Task::new(INIT_TASK, "init").unwrap()))
            .unwrap();

        let parent = alloc_task_id().unwrap();
        sched
            .table
            .insert(Box::new(Task::new(parent, "parent").unwrap()))
            .unwrap();
        let child = crate::task::fork::do_fork(&mut sched, parent).unwrap();
        (sched, parent, child)
    }

    #[test]
    fn exit_then_reap_frees_the_record() {
        let (mut sched, parent, child) = sched_with_family();

        mark_exited(&mut sched, child, 7);
        assert!(sched.table.get(child).unwrap().state.is_zombie());
        assert!(!sched.table.get(child).unwrap().queued);

        let (reaped, status) = wait_any(&mut sched, parent).unwrap();
        assert_eq!(reaped, child);
        assert_eq!(status, encode_wait_status(7, 0));
        assert!(!sched.table.contains(child), "record freed after reap");
        assert!(!sched.table.get(parent).unwrap().children.contains(&child));
    }

    #[test]
    fn wait_reports_busy_while_child_runs() {
        let (mut sched, parent, _child) = sched_with_family();
        assert_eq!(wait_any(&mut sched, parent).unwrap_err(), KernelError::Busy);
    }

    #[test]
    fn exit_reparents_grandchildren_to_init() {
        let (mut sched, _parent, child) = sched_with_family();
        let grandchild = crate::task::fork::do_fork(&mut sched, child).unwrap();

        mark_exited(&mut sched, child, 0);
        assert_eq!(
            sched.table.get(grandchild).unwrap().parent,
            Some(INIT_TASK)
        );
    }

    #[test]
    fn exiting_parent_wakes_interruptible_waiter() {
        let (mut sched, parent, child) = sched_with_family();
        sched.table.get_mut(parent).unwrap().state = TaskState::Interruptible;

        mark_exited(&mut sched, child, 3);
        let p = sched.table.get(parent).unwrap();
        assert_eq!(p.state, TaskState::Runnable);
        assert!(p.pending.contains(Signal::Chld));
    }

    #[test]
    fn killed_task_terminates_at_checkpoint() {
        let (mut sched, _parent, child) = sched_with_family();
        sched.kill(child).unwrap();
        assert!(check_pending_kill(&mut sched, child));
        assert!(sched.table.get(child).unwrap().state.is_zombie());
    }
}
