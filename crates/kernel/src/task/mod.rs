/// Task subsystem: records, table, run queue, fork/exec/clone, signals,
/// exit and reaping.
pub mod exec;
pub mod exit;
pub mod fork;
pub mod sched;
pub mod signal;
pub mod table;
pub mod task;

pub use exec::{do_execve, load_elf, register_filesystem, ExecFilesystem, LoadedImage};
pub use exit::{check_pending_kill, exit, reap, wait_any};
pub use sched::{create_task, current, init, kill, schedule, wake, yield_now, Scheduler};
pub use signal::{Signal, SignalSet};
pub use table::{alloc_task_id, TaskTable, INIT_TASK, MAX_TASKS};
pub use task::{CloneFlags, Credentials, Task, TaskId, TaskState, COMM_LEN, KSTACK_SIZE};

use crate::error::KernelError;

/// Fork the calling task; parent receives the child id.
pub fn fork() -> Result<TaskId, KernelError> {
    sched::with_sched(|s| {
        let parent = s.current;
        fork::do_fork(s, parent)
    })?
}

/// Clone a thread of the calling task starting at `entry(arg)` on
/// `user_stack_top`.
pub fn create_thread(
    entry: u64,
    arg: u64,
    user_stack_top: u64,
    flags: CloneFlags,
) -> Result<TaskId, KernelError> {
    sched::with_sched(|s| {
        let parent = s.current;
        fork::do_clone_thread(s, parent, entry, arg, user_stack_top, flags)
    })?
}

/// Replace the calling task's image.
pub fn execve(path: &str, argv: &[&str], envp: &[&str]) -> Result<(), KernelError> {
    sched::with_sched(|s| {
        let id = s.current;
        exec::do_execve(s, id, path, argv, envp)
    })?
}
