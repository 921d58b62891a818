/// Task records.
///
/// A task is one schedulable kernel entity: identity, scheduling state
/// (a tagged variant carrying exit information), saved CPU context, trap
/// frame, kernel stack, address-space handles, parent/child links by id,
/// timing accumulators, and signal bitsets. The task table owns every
/// record; all cross-references are ids, never pointers.
use super::signal::SignalSet;
use crate::arch::{Context, TrapFrame};
use crate::error::KernelError;
use crate::mm::{self, PhysAddr, SharedAddressSpace};

pub type TaskId = u32;

/// Command names truncate to this many bytes.
pub const COMM_LEN: usize = 15;

/// Kernel stacks are 2^KSTACK_ORDER frames (16 KiB).
pub const KSTACK_ORDER: u8 = 2;
pub const KSTACK_SIZE: usize = mm::PAGE_SIZE << KSTACK_ORDER;

/// Scheduling state; exit information rides the Zombie variant instead of
/// living in a side field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    /// Sleeping; signals wake it
    Interruptible,
    /// Sleeping; only an explicit wake does
    Uninterruptible,
    Stopped,
    /// Exited, waiting for the parent to reap
    Zombie { exit_code: i32 },
    /// Reaped; the slot is about to be reclaimed
    Dead,
}

impl TaskState {
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskState::Runnable)
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self, TaskState::Zombie { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
        }
    }
}

bitflags::bitflags! {
    /// Thread-clone behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Share the parent's address space instead of getting a fresh one
        const SHARE_VM = 1 << 0;
        /// Join the parent's thread group
        const SAME_THREAD_GROUP = 1 << 1;
    }
}

pub struct Task {
    pub id: TaskId,
    /// Thread-group id; equals `id` for group leaders
    pub tgid: TaskId,
    pub parent: Option<TaskId>,
    pub children: alloc::vec::Vec<TaskId>,
    pub comm: heapless::String<COMM_LEN>,
    pub state: TaskState,
    pub nice: i8,
    pub priority: u8,
    pub cred: Credentials,
    /// Saved callee-saved context for kernel switches
    pub context: Context,
    /// Register snapshot at the last kernel entry
    pub trap_frame: TrapFrame,
    /// Kernel stack base (physical, KSTACK_SIZE bytes)
    pub kstack: PhysAddr,
    /// Address space this task owns (None for pure kernel threads)
    pub space: Option<SharedAddressSpace>,
    /// Space currently installed while this task runs
    pub active_space: Option<SharedAddressSpace>,
    pub pending: SignalSet,
    pub blocked: SignalSet,
    /// Marked for termination; observed at the next checkpoint
    pub exiting: bool,
    pub utime_us: u64,
    pub stime_us: u64,
    // Intrusive run-queue links, owned by the scheduler
    pub(super) run_next: Option<TaskId>,
    pub(super) run_prev: Option<TaskId>,
    pub(super) queued: bool,
}

impl Task {
    /// Allocate the record and its kernel stack. The context starts
    /// zeroed; factories fill it in.
    pub fn new(id: TaskId, name: &str) -> Result<Self, KernelError> {
        let kstack = mm::alloc_frames(KSTACK_ORDER)?;
        let mut comm = heapless::String::new();
        for c in name.chars().take(COMM_LEN) {
            let _ = comm.push(c);
        }
        Ok(Self {
            id,
            tgid: id,
            parent: None,
            children: alloc::vec::Vec::new(),
            comm,
            state: TaskState::Runnable,
            nice: 0,
            priority: 20,
            cred: Credentials::default(),
            context: Context::zeroed(),
            trap_frame: TrapFrame::default(),
            kstack,
            space: None,
            active_space: None,
            pending: SignalSet::empty(),
            blocked: SignalSet::empty(),
            exiting: false,
            utime_us: 0,
            stime_us: 0,
            run_next: None,
            run_prev: None,
            queued: false,
        })
    }

    /// Top of the kernel stack as a kernel-usable address.
    pub fn kstack_top(&self) -> u64 {
        mm::phys_to_ptr(self.kstack) as u64 + KSTACK_SIZE as u64
    }

    /// Replace the command name with the final component of `path`,
    /// truncated to COMM_LEN.
    pub fn set_comm_from_path(&mut self, path: &str) {
        let base = path.rsplit('/').next().unwrap_or(path);
        self.comm.clear();
        for c in base.chars().take(COMM_LEN) {
            let _ = self.comm.push(c);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        mm::free_frames(self.kstack, KSTACK_ORDER);
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("tgid", &self.tgid)
            .field("comm", &self.comm.as_str())
            .field("state", &self.state)
            .finish()
    }
}
