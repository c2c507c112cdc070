use crate::{
    sync::{AtomicUsize, Mutex, Ordering, lock},
    task::Task,
    types::{CoreType, TaskId},
};
use std::collections::VecDeque;

/// Mutex-protected FIFO of ready task ids, shared by scheduler threads.
///
/// `len` mirrors the queue length so pollers can skip the lock while the
/// queue is empty; it is only written under the lock.
#[derive(Debug)]
pub struct ReadyQueue {
    queue: Mutex<VecDeque<TaskId>>,
    len: AtomicUsize,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl ReadyQueue {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, id: TaskId) {
        let mut queue = lock(&self.queue);
        queue.push_back(id);
        self.len.store(queue.len(), Ordering::Release);
    }

    pub fn extend(&self, ids: impl IntoIterator<Item = TaskId>) {
        let mut queue = lock(&self.queue);
        queue.extend(ids);
        self.len.store(queue.len(), Ordering::Release);
    }

    /// Oldest ready task, if any.
    pub fn pop(&self) -> Option<TaskId> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut queue = lock(&self.queue);
        let id = queue.pop_front()?;
        self.len.store(queue.len(), Ordering::Release);
        Some(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut queue = lock(&self.queue);
        queue.clear();
        self.len.store(0, Ordering::Release);
    }
}

/// Ready queues of both pools, shared by all scheduler threads of a run.
///
/// A task only ever enters the queue of its own core type, and a channel only
/// ever pops from the queue of its own core type, so a task cannot reach an
/// incompatible worker.
#[derive(Debug, Default)]
pub struct SharedRouter {
    queues: [ReadyQueue; 2],
}

impl SharedRouter {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: [
                ReadyQueue::with_capacity(capacity),
                ReadyQueue::with_capacity(capacity),
            ],
        }
    }

    /// Enqueues `task` on the queue of its core type.
    pub fn route(&self, task: &Task) {
        self.push(task.core_type(), task.task_id());
    }

    pub fn push(&self, core_type: CoreType, id: TaskId) {
        self.queues[core_type.index()].push(id);
    }

    pub fn pop(&self, core_type: CoreType) -> Option<TaskId> {
        self.queues[core_type.index()].pop()
    }

    #[must_use]
    pub fn queue(&self, core_type: CoreType) -> &ReadyQueue {
        &self.queues[core_type.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(ReadyQueue::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(ReadyQueue::is_empty)
    }

    pub fn clear(&self) {
        for queue in &self.queues {
            queue.clear();
        }
    }
}

/// Ready queues of both pools for a single scheduler thread; no locking.
#[derive(Debug, Default, Clone)]
pub struct LocalRouter {
    queues: [VecDeque<TaskId>; 2],
}

impl LocalRouter {
    pub fn route(&mut self, task: &Task) {
        self.push(task.core_type(), task.task_id());
    }

    pub fn push(&mut self, core_type: CoreType, id: TaskId) {
        self.queues[core_type.index()].push_back(id);
    }

    pub fn pop(&mut self, core_type: CoreType) -> Option<TaskId> {
        self.queues[core_type.index()].pop_front()
    }

    #[must_use]
    pub fn len(&self, core_type: CoreType) -> usize {
        self.queues[core_type.index()].len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn clear(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn shared_router_keeps_pools_apart_and_is_fifo() {
        let router = SharedRouter::with_capacity(4);
        router.push(CoreType::Cube, TaskId(1));
        router.push(CoreType::Vector, TaskId(2));
        router.push(CoreType::Cube, TaskId(3));
        assert_eq!(router.len(), 3);
        assert_eq!(router.queue(CoreType::Cube).len(), 2);

        assert_eq!(router.pop(CoreType::Vector), Some(TaskId(2)));
        assert_eq!(router.pop(CoreType::Vector), None);
        assert_eq!(router.pop(CoreType::Cube), Some(TaskId(1)));
        assert_eq!(router.pop(CoreType::Cube), Some(TaskId(3)));
        assert!(router.is_empty());
    }

    #[test]
    fn clear_drains_everything() {
        let router = SharedRouter::default();
        router.queue(CoreType::Vector).extend([TaskId(0), TaskId(5)]);
        router.clear();
        assert!(router.is_empty());
        assert_eq!(router.pop(CoreType::Vector), None);
    }

    #[test]
    fn local_router_is_fifo_per_pool() {
        let mut router = LocalRouter::default();
        router.push(CoreType::Vector, TaskId(7));
        router.push(CoreType::Vector, TaskId(8));
        assert_eq!(router.len(CoreType::Vector), 2);
        assert_eq!(router.len(CoreType::Cube), 0);
        assert_eq!(router.pop(CoreType::Vector), Some(TaskId(7)));
        router.clear();
        assert!(router.is_empty());
    }
}
