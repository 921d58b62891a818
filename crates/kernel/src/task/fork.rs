/// Process duplication and thread clone.
///
/// Fork gives the child a fresh address space whose kernel half mirrors
/// the parent's and a verbatim copy of the parent's trap frame, so the
/// child resumes at the same trap return point with a forced return
/// value of zero. User pages are not copied or shared; they fault in
/// fresh (no copy-on-write by design).
///
/// Thread clone reuses the parent's address space when SHARE_VM is set
/// (bumping its refcount) and joins the parent's thread group when
/// SAME_THREAD_GROUP is set.
use super::sched::Scheduler;
use super::table::alloc_task_id;
use super::task::{CloneFlags, Task, TaskId};
use crate::arch::Context;
use crate::error::KernelError;
use crate::mm::AddressSpace;
use alloc::boxed::Box;

/// Duplicate `parent` inside the scheduler. Returns the child id; the
/// parent's own syscall return delivers it, the child's trap frame
/// already says zero.
pub fn do_fork(sched: &mut Scheduler, parent_id: TaskId) -> Result<TaskId, KernelError> {
    let child_id = alloc_task_id()?;

    let (trap_frame, cred, nice, priority, comm, blocked) = {
        let parent = sched
            .table
            .get(parent_id)
            .ok_or(KernelError::NoSuchTask)?;
        (
            parent.trap_frame,
            parent.cred,
            parent.nice,
            parent.priority,
            parent.comm.clone(),
            parent.blocked,
        )
    };

    let mut child = Box::new(Task::new(child_id, comm.as_str())?);
    child.parent = Some(parent_id);
    child.cred = cred;
    child.nice = nice;
    child.priority = priority;
    child.blocked = blocked;

    // Child resumes at the parent's trap point, observing fork() == 0
    child.trap_frame = trap_frame;
    child.trap_frame.set_return_value(0);

    // Fresh space: kernel half shared via the root copy, user half empty
    let space = AddressSpace::new_user()?.into_shared();
    child.space = Some(space);

    // The first switch into the child restores its trap frame and
    // returns to user mode; the frame lives inside the boxed record, so
    // take its address only after boxing.
    let frame_at = &child.trap_frame as *const _ as u64;
    child.context = Context::new_forked(child.kstack_top(), frame_at);

    sched.table.insert(child)?;
    if let Some(parent) = sched.table.get_mut(parent_id) {
        parent.children.push(child_id);
    }
    sched.queue.push_back(&mut sched.table, child_id);

    crate::debug!("fork: {} -> {}", parent_id, child_id);
    Ok(child_id)
}

/// Clone a thread. `entry`/`user_stack_top` describe where the new
/// thread starts in user mode.
pub fn do_clone_thread(
    sched: &mut Scheduler,
    parent_id: TaskId,
    entry: u64,
    arg: u64,
    user_stack_top: u64,
    flags: CloneFlags,
) -> Result<TaskId, KernelError> {
    let child_id = alloc_task_id()?;

    let (trap_frame, cred, comm, tgid, shared_space) = {
        let parent = sched
            .table
            .get(parent_id)
            .ok_or(KernelError::NoSuchTask)?;
        let space = if flags.contains(CloneFlags::SHARE_VM) {
            match &parent.space {
                Some(space) => Some(space.clone()),
                None => return Err(KernelError::InvalidArgument),
            }
        } else {
            None
        };
        (
            parent.trap_frame,
            parent.cred,
            parent.comm.clone(),
            parent.tgid,
            space,
        )
    };

    let mut child = Box::new(Task::new(child_id, comm.as_str())?);
    child.parent = Some(parent_id);
    child.cred = cred;
    if flags.contains(CloneFlags::SAME_THREAD_GROUP) {
        child.tgid = tgid;
    }

    child.space = match shared_space {
        Some(space) => Some(space),
        None => Some(AddressSpace::new_user()?.into_shared()),
    };

    child.trap_frame = trap_frame;
    child.trap_frame.set_user_entry(entry, user_stack_top);
    child.trap_frame.set_arg0(arg);

    let frame_at = &child.trap_frame as *const _ as u64;
    child.context = Context::new_forked(child.kstack_top(), frame_at);

    sched.table.insert(child)?;
    if let Some(parent) = sched.table.get_mut(parent_id) {
        parent.children.push(child_id);
    }
    sched.queue.push_back(&mut sched.table, child_id);

    crate::debug!(
        "clone: {} -> {} (flags {:?}, stack {:#x})",
        parent_id,
        child_id,
        flags,
        user_stack_top
    );
    Ok(child_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;
    use alloc::sync::Arc;

    fn sched_with_parent() -> (Scheduler, TaskId) {
        init_global_test_arena();
        let mut sched = Scheduler::new().unwrap();
        let id = alloc_task_id().unwrap();
        let mut parent = Box::new(Task::new(id, "parent").unwrap());
        parent.space = Some(AddressSpace::new_user().unwrap().into_shared());
        sched.table.insert(parent).unwrap();
        (sched, id)
    }

    #[test]
    fn fork_child_leads_its_own_thread_group() {
        let (mut sched, parent) = sched_with_parent();
        let child = do_fork(&mut sched, parent).unwrap();
        assert_ne!(child, parent);

        let child_task = sched.table.get(child).unwrap();
        assert_eq!(child_task.tgid, child, "fork child is a group leader");
        assert_eq!(child_task.parent, Some(parent));
        assert!(sched.table.get(parent).unwrap().children.contains(&child));
        assert!(child_task.queued, "child is runnable immediately");
    }

    #[test]
    fn fork_child_sees_zero_return() {
        let (mut sched, parent) = sched_with_parent();
        sched
            .table
            .get_mut(parent)
            .unwrap()
            .trap_frame
            .set_return_value(0xdead);
        let child = do_fork(&mut sched, parent).unwrap();
        let frame = &sched.table.get(child).unwrap().trap_frame;
        assert_eq!(frame.return_value(), 0);
    }

    #[test]
    fn fork_creates_distinct_address_space() {
        let (mut sched, parent) = sched_with_parent();
        let child = do_fork(&mut sched, parent).unwrap();
        let parent_root = sched.table.get(parent).unwrap().space.as_ref().unwrap().lock().root();
        let child_root = sched.table.get(child).unwrap().space.as_ref().unwrap().lock().root();
        assert_ne!(parent_root, child_root);
    }

    #[test]
    fn thread_clone_shares_vm_and_group() {
        let (mut sched, parent) = sched_with_parent();
        let child = do_clone_thread(
            &mut sched,
            parent,
            0x40_1000,
            7,
            0x7fff_0000,
            CloneFlags::SHARE_VM | CloneFlags::SAME_THREAD_GROUP,
        )
        .unwrap();

        let parent_tgid = sched.table.get(parent).unwrap().tgid;
        let child_task = sched.table.get(child).unwrap();
        assert_eq!(child_task.tgid, parent_tgid);

        let parent_space = sched.table.get(parent).unwrap().space.as_ref().unwrap().clone();
        let child_space = sched.table.get(child).unwrap().space.as_ref().unwrap().clone();
        assert!(Arc::ptr_eq(&parent_space, &child_space), "same space, refcounted");
        assert!(Arc::strong_count(&parent_space) >= 3);
    }

    #[test]
    fn plain_clone_gets_private_space_and_group() {
        let (mut sched, parent) = sched_with_parent();
        let child = do_clone_thread(
            &mut sched,
            parent,
            0x40_1000,
            0,
            0x7fff_0000,
            CloneFlags::empty(),
        )
        .unwrap();
        let child_task = sched.table.get(child).unwrap();
        assert_eq!(child_task.tgid, child);
        let parent_space = sched.table.get(parent).unwrap().space.as_ref().unwrap().clone();
        let child_space = sched.table.get(child).unwrap().space.as_ref().unwrap().clone();
        assert!(!Arc::ptr_eq(&parent_space, &child_space));
    }
}
