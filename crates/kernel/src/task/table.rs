/// Task table.
///
/// The single owner of every task record. Parent/child and run-queue
/// relationships are ids indexed through here, which keeps the cyclic
/// task graph out of the ownership story entirely.
use super::task::{Task, TaskId, TaskState};
use crate::error::KernelError;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Hard cap on live tasks.
pub const MAX_TASKS: usize = 4096;

/// Init's task id; orphans reparent to it.
pub const INIT_TASK: TaskId = 1;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

pub fn alloc_task_id() -> Result<TaskId, KernelError> {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    if id as usize >= MAX_TASKS {
        return Err(KernelError::OutOfMemory);
    }
    Ok(id)
}

pub struct TaskTable {
    slots: Vec<Option<Box<Task>>>,
}

impl TaskTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(64);
        slots.resize_with(64, || None);
        Self { slots }
    }

    pub fn insert(&mut self, task: Box<Task>) -> Result<(), KernelError> {
        let idx = task.id as usize;
        if idx >= MAX_TASKS {
            return Err(KernelError::InvalidArgument);
        }
        if idx >= self.slots.len() {
            self.slots.resize_with((idx + 1).next_power_of_two(), || None);
        }
        if self.slots[idx].is_some() {
            return Err(KernelError::Busy);
        }
        self.slots[idx] = Some(task);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id as usize)?.as_deref_mut()
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Box<Task>> {
        self.slots.get_mut(id as usize)?.take()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.slots.iter().filter_map(|s| s.as_deref())
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Children of `parent` that have exited.
    pub fn zombie_children(&self, parent: TaskId) -> Vec<TaskId> {
        self.iter()
            .filter(|t| t.parent == Some(parent) && t.state.is_zombie())
            .map(|t| t.id)
            .collect()
    }

    /// Hand a dying task's children to init.
    pub fn reparent_to_init(&mut self, dying: TaskId) {
        let orphans: Vec<TaskId> = self
            .iter()
            .filter(|t| t.parent == Some(dying))
            .map(|t| t.id)
            .collect();
        for id in &orphans {
            if let Some(task) = self.get_mut(*id) {
                task.parent = Some(INIT_TASK);
            }
        }
        if !orphans.is_empty() {
            if let Some(init) = self.get_mut(INIT_TASK) {
                init.children.extend_from_slice(&orphans);
            }
        }
    }

    /// Drop the parent's bookkeeping for a reaped child.
    pub fn unlink_child(&mut self, parent: TaskId, child: TaskId) {
        if let Some(p) = self.get_mut(parent) {
            p.children.retain(|&c| c != child);
        }
    }

    /// Mark a task dead and reclaim its slot.
    pub fn release(&mut self, id: TaskId) -> Option<i32> {
        let exit_code = match self.get(id)?.state {
            TaskState::Zombie { exit_code } => exit_code,
            _ => return None,
        };
        if let Some(mut task) = self.remove(id) {
            task.state = TaskState::Dead;
        }
        Some(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::buddy::tests::init_global_test_arena;

    fn boxed_task(id: TaskId, name: &str) -> Box<Task> {
        Box::new(Task::new(id, name).unwrap())
    }

    #[test]
    fn insert_get_remove() {
        init_global_test_arena();
        let mut table = TaskTable::new();
        table.insert(boxed_task(3, "a")).unwrap();
        assert!(table.contains(3));
        assert_eq!(table.get(3).unwrap().comm.as_str(), "a");
        assert!(table.insert(boxed_task(3, "dup")).is_err());
        assert!(table.remove(3).is_some());
        assert!(!table.contains(3));
    }

    #[test]
    fn reparenting_moves_orphans_to_init() {
        init_global_test_arena();
        let mut table = TaskTable::new();
        table.insert(boxed_task(INIT_TASK, "init")).unwrap();
        let mut parent = boxed_task(10, "parent");
        parent.children = alloc::vec![11, 12];
        table.insert(parent).unwrap();
        for id in [11u32, 12] {
            let mut child = boxed_task(id, "child");
            child.parent = Some(10);
            table.insert(child).unwrap();
        }

        table.reparent_to_init(10);
        assert_eq!(table.get(11).unwrap().parent, Some(INIT_TASK));
        assert_eq!(table.get(12).unwrap().parent, Some(INIT_TASK));
        assert!(table.get(INIT_TASK).unwrap().children.contains(&11));
    }

    #[test]
    fn release_requires_zombie() {
        init_global_test_arena();
        let mut table = TaskTable::new();
        table.insert(boxed_task(20, "t")).unwrap();
        assert_eq!(table.release(20), None);
        table.get_mut(20).unwrap().state = TaskState::Zombie { exit_code: 5 };
        assert_eq!(table.release(20), Some(5));
        assert!(!table.contains(20));
    }
}
