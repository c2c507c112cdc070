#[cfg(not(feature = "loom"))]
use crate::sync::LoomUnsafeCellCompat;
use crate::{
    error::{GraphError, InvariantViolation},
    graph::{TaskSource, TaskView, next_generation},
    router::SharedRouter,
    spinlock::SpinLock,
    sync::{AtomicBool, AtomicI32, AtomicUsize, Ordering, UnsafeCell},
    task::{MAX_TASK_ARGS, StatusWord, TaskStatus},
    types::{CoreType, FuncId, TaskHandle, TaskId},
};
use core::mem;
use log::{debug, trace};

/// Maximum number of tasks a [`StreamingGraph`] accepts.
pub const PTO_MAX_TASKS: usize = 4096;

/// Top bit of the admission word; the rest counts submissions.
const SEALED: usize = 1 << (usize::BITS - 1);

/// Immutable part of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingTask {
    task_id: TaskId,
    func_id: FuncId,
    core_type: CoreType,
    args: Vec<u64>,
    producers: Vec<TaskId>,
}

impl StreamingTask {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[must_use]
    pub fn func_id(&self) -> FuncId {
        self.func_id
    }

    #[must_use]
    pub fn core_type(&self) -> CoreType {
        self.core_type
    }

    #[must_use]
    pub fn args(&self) -> &[u64] {
        &self.args
    }

    /// Producers that were still running at submission time. Each of them
    /// holds a reference on behalf of this task until it completes.
    #[must_use]
    pub fn producers(&self) -> &[TaskId] {
        &self.producers
    }

    fn view(&self) -> TaskView<'_> {
        TaskView {
            task_id: self.task_id,
            func_id: self.func_id,
            core_type: self.core_type,
            args: &self.args,
        }
    }
}

/// Counters of a [`StreamingGraph`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct StreamingStats {
    pub submitted: usize,
    pub completed: usize,
    /// Tasks whose output no consumer references any more.
    pub retired: usize,
    pub sealed: bool,
}

/// Write-once cell published with a release store.
struct WriteOnce<T> {
    ready: AtomicBool,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the value is written once before `ready` is released and only read
// after `ready` is acquired.
unsafe impl<T: Send + Sync> Sync for WriteOnce<T> {}
unsafe impl<T: Send> Send for WriteOnce<T> {}

impl<T> WriteOnce<T> {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(None),
        }
    }

    /// # Safety
    /// Must be called at most once per cell.
    unsafe fn set(&self, value: T) {
        // SAFETY: single writer, and readers wait for `ready`.
        self.value.with_mut(|ptr| unsafe { *ptr = Some(value) });
        self.ready.store(true, Ordering::Release);
    }

    fn get(&self) -> Option<&T> {
        if !self.ready.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `ready` is set, so the value is never written again.
        self.value.with(|ptr| unsafe { (*ptr).as_ref() })
    }
}

#[derive(Debug, Default)]
struct FanoutList {
    completed: bool,
    successors: Vec<TaskId>,
}

struct Slot {
    task: WriteOnce<StreamingTask>,
    /// Unsatisfied producers plus one submission guard.
    fanin_refcount: AtomicI32,
    /// Outstanding references to this task's output: one held by the task
    /// until it completes, one per consumer registered before that.
    fanout_refcount: AtomicI32,
    fanout: SpinLock<FanoutList>,
    status: StatusWord,
}

impl Slot {
    fn new() -> Self {
        Self {
            task: WriteOnce::new(),
            fanin_refcount: AtomicI32::new(0),
            fanout_refcount: AtomicI32::new(0),
            fanout: SpinLock::default(),
            status: StatusWord::new(),
        }
    }
}

/// Task graph that grows while it runs.
///
/// An orchestrator submits tasks, naming already-submitted producers, while
/// scheduler threads dispatch and complete earlier ones. Dependencies can
/// only point backwards, so the graph is acyclic by construction.
///
/// Each producer keeps its consumer list behind a [`SpinLock`] together with
/// a `completed` flag. A submission either appends itself to that list or, if
/// the producer already completed, counts the edge as satisfied right away;
/// both happen under the same lock as the completion, so no edge is lost and
/// none is counted twice. The submission guard in `fanin_refcount` keeps a
/// task from becoming ready before all of its edges were wired.
///
/// A submission is admitted and counted in the same atomic step that
/// checks the seal, so a graph observed sealed with every counted task
/// complete can never gain another task.
///
/// Ready tasks are routed into the graph's own [`SharedRouter`].
pub struct StreamingGraph {
    slots: Box<[Slot]>,
    next: AtomicUsize,
    /// [`SEALED`] bit plus the number of admitted submissions.
    admission: AtomicUsize,
    completed: AtomicUsize,
    retired: AtomicUsize,
    ready: SharedRouter,
    generation: u32,
}

impl Default for StreamingGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for StreamingGraph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamingGraph")
            .field("capacity", &self.slots.len())
            .field("generation", &self.generation)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl StreamingGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(PTO_MAX_TASKS)
    }

    /// Graph holding at most `capacity` tasks, clamped to [`PTO_MAX_TASKS`].
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(PTO_MAX_TASKS);
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            next: AtomicUsize::new(0),
            admission: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            retired: AtomicUsize::new(0),
            ready: SharedRouter::with_capacity(capacity),
            generation: next_generation(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Adds a task depending on `deps`, all of which must have been submitted
    /// before. The task is routed as soon as every dependency has completed,
    /// possibly before this call returns.
    ///
    /// # Errors
    /// `Sealed` after [`seal`](Self::seal), `TooManyArgs`, `InvalidTaskId`
    /// for an unknown dependency, `CapacityExceeded`. Nothing is submitted on
    /// error.
    pub fn submit(
        &self,
        func_id: FuncId,
        core_type: CoreType,
        args: &[u64],
        deps: &[TaskId],
    ) -> Result<TaskId, GraphError> {
        if self.is_sealed() {
            return Err(GraphError::Sealed);
        }
        if args.len() > MAX_TASK_ARGS {
            return Err(GraphError::TooManyArgs {
                count: args.len(),
                capacity: MAX_TASK_ARGS,
            });
        }
        if let Some(&dep) = deps.iter().find(|dep| self.published(**dep).is_none()) {
            return Err(GraphError::InvalidTaskId(dep));
        }
        self.admission
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| (word & SEALED == 0).then_some(word + 1))
            .map_err(|_| GraphError::Sealed)?;
        let capacity = self.capacity();
        let index = match self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| (next < capacity).then_some(next + 1))
        {
            Ok(index) => index,
            Err(_) => {
                self.admission.fetch_sub(1, Ordering::AcqRel);
                return Err(GraphError::CapacityExceeded { capacity });
            }
        };
        let task_id = TaskId(index as u32);
        let slot = &self.slots[index];
        slot.fanin_refcount.store(deps.len() as i32 + 1, Ordering::Relaxed);
        slot.fanout_refcount.store(1, Ordering::Relaxed);

        let mut producers = Vec::with_capacity(deps.len());
        let mut satisfied = 0;
        for &dep in deps {
            let producer = &self.slots[dep.index()];
            let registered = producer.fanout.with(|list| {
                if list.completed {
                    return false;
                }
                list.successors.push(task_id);
                producer.fanout_refcount.fetch_add(1, Ordering::Relaxed);
                true
            });
            if registered {
                producers.push(dep);
            } else {
                satisfied += 1;
            }
        }
        trace!(
            "submitted {task_id} ({core_type}, func {func_id}): {} pending, {satisfied} satisfied",
            producers.len()
        );

        // SAFETY: `index` was handed out exactly once by `next`.
        unsafe {
            slot.task.set(StreamingTask {
                task_id,
                func_id,
                core_type,
                args: args.to_vec(),
                producers,
            });
        }

        let prev = slot.fanin_refcount.fetch_sub(satisfied + 1, Ordering::AcqRel);
        debug_assert!(prev >= satisfied + 1, "fanin of {task_id} underflowed on submit");
        if prev == satisfied + 1 {
            slot.status
                .mark_ready(task_id)
                .expect("StreamingGraph::submit: fresh task is pending");
            self.ready.push(core_type, task_id);
        }
        Ok(task_id)
    }

    /// Stops accepting submissions. Once every submitted task completed, the
    /// graph is [finished](Self::is_finished).
    pub fn seal(&self) {
        let word = self.admission.fetch_or(SEALED, Ordering::AcqRel);
        if word & SEALED == 0 {
            debug!("streaming graph sealed after {word} task(s)");
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.admission.load(Ordering::Acquire) & SEALED != 0
    }

    /// Sealed and every submitted task completed.
    ///
    /// A submission still in flight when the graph was sealed is already
    /// counted, so the graph is not finished before that task completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let word = self.admission.load(Ordering::Acquire);
        word & SEALED != 0 && self.completed.load(Ordering::Acquire) == word & !SEALED
    }

    /// Oldest ready task of `core_type`.
    pub fn pop_ready(&self, core_type: CoreType) -> Option<TaskId> {
        self.ready.pop(core_type)
    }

    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Ready tasks waiting for a `core_type` worker.
    #[must_use]
    pub fn ready_count(&self, core_type: CoreType) -> usize {
        self.ready.queue(core_type).len()
    }

    /// Submitted task behind `id`.
    ///
    /// # Errors
    /// `InvalidTaskId` if no task was submitted under `id`.
    pub fn get_task(&self, id: TaskId) -> Result<&StreamingTask, GraphError> {
        self.published(id).ok_or(GraphError::InvalidTaskId(id))
    }

    /// Current status of a submitted task.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.published(id)?;
        Some(self.slots[id.index()].status.load())
    }

    #[must_use]
    pub fn fanin_refcount(&self, id: TaskId) -> Option<i32> {
        self.published(id)?;
        Some(self.slots[id.index()].fanin_refcount.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn fanout_refcount(&self, id: TaskId) -> Option<i32> {
        self.published(id)?;
        Some(self.slots[id.index()].fanout_refcount.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        let word = self.admission.load(Ordering::Acquire);
        StreamingStats {
            submitted: word & !SEALED,
            completed: self.completed.load(Ordering::Acquire),
            retired: self.retired.load(Ordering::Acquire),
            sealed: word & SEALED != 0,
        }
    }

    #[must_use]
    pub fn handle(&self, id: TaskId) -> TaskHandle {
        TaskHandle::new(self.generation, id)
    }

    /// Task named by a channel handle issued by this graph.
    ///
    /// # Errors
    /// `UnknownHandle` for the sentinel, a foreign generation or an id that
    /// was never submitted.
    pub fn resolve(&self, handle: TaskHandle) -> Result<&StreamingTask, InvariantViolation> {
        handle
            .decode()
            .filter(|&(generation, _)| generation == self.generation)
            .and_then(|(_, id)| self.published(id))
            .ok_or(InvariantViolation::UnknownHandle { handle })
    }

    /// Moves a ready task popped by a scheduler to `Running`.
    ///
    /// # Errors
    /// `InvalidTaskId`, `DoubleDispatch` when the task is not `Ready`.
    pub fn mark_running(&self, id: TaskId) -> Result<(), InvariantViolation> {
        self.slot(id)?.status.mark_running(id)
    }

    /// Accounts for a harvested completion: releases every registered
    /// consumer, routes those that became ready and drops the references
    /// this task held.
    ///
    /// # Errors
    /// `InvalidTaskId`, `DoubleCompletion` when the task is not `Running`,
    /// `FaninUnderflow` on corrupted counters.
    pub fn complete(&self, id: TaskId) -> Result<(), InvariantViolation> {
        let slot = self.slot(id)?;
        slot.status.mark_complete(id)?;
        let successors = slot.fanout.with(|list| {
            list.completed = true;
            mem::take(&mut list.successors)
        });
        for consumer_id in successors {
            let consumer = self.slot_unchecked(consumer_id)?;
            let prev = consumer.fanin_refcount.fetch_sub(1, Ordering::AcqRel);
            if prev <= 0 {
                return Err(InvariantViolation::FaninUnderflow { task: consumer_id });
            }
            if prev == 1 {
                let task = consumer.task.get().ok_or(InvariantViolation::InvalidTaskId(consumer_id))?;
                consumer.status.mark_ready(consumer_id)?;
                self.ready.push(task.core_type, consumer_id);
            }
        }
        let task = slot.task.get().ok_or(InvariantViolation::InvalidTaskId(id))?;
        for &producer in &task.producers {
            self.release_output(producer)?;
        }
        self.release_output(id)?;
        self.completed.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn release_output(&self, id: TaskId) -> Result<(), InvariantViolation> {
        let prev = self.slot_unchecked(id)?.fanout_refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            return Err(InvariantViolation::FaninUnderflow { task: id });
        }
        if prev == 1 {
            self.retired.fetch_add(1, Ordering::Relaxed);
            trace!("{id} retired");
        }
        Ok(())
    }

    fn published(&self, id: TaskId) -> Option<&StreamingTask> {
        self.slots.get(id.index())?.task.get()
    }

    fn slot(&self, id: TaskId) -> Result<&Slot, InvariantViolation> {
        self.published(id).ok_or(InvariantViolation::InvalidTaskId(id))?;
        Ok(&self.slots[id.index()])
    }

    /// Slot of a task whose submission may still be in flight.
    fn slot_unchecked(&self, id: TaskId) -> Result<&Slot, InvariantViolation> {
        self.slots.get(id.index()).ok_or(InvariantViolation::InvalidTaskId(id))
    }
}

impl TaskSource for StreamingGraph {
    fn view(&self, handle: TaskHandle) -> Result<TaskView<'_>, InvariantViolation> {
        self.resolve(handle).map(StreamingTask::view)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    const F: FuncId = FuncId(0);

    fn run(graph: &StreamingGraph, id: TaskId) {
        graph.mark_running(id).unwrap();
        graph.complete(id).unwrap();
    }

    #[test]
    fn task_without_deps_is_ready_immediately() {
        let graph = StreamingGraph::with_capacity(4);
        let a = graph.submit(F, CoreType::Vector, &[7], &[]).unwrap();
        assert_eq!(graph.status(a), Some(TaskStatus::Ready));
        assert_eq!(graph.pop_ready(CoreType::Cube), None);
        assert_eq!(graph.pop_ready(CoreType::Vector), Some(a));
        assert_eq!(graph.get_task(a).unwrap().args(), &[7]);
    }

    #[test]
    fn consumer_waits_for_running_producer() {
        let graph = StreamingGraph::with_capacity(4);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        let b = graph.submit(F, CoreType::Vector, &[], &[a]).unwrap();
        assert_eq!(graph.fanin_refcount(b), Some(1));
        assert_eq!(graph.fanout_refcount(a), Some(2));
        assert_eq!(graph.get_task(b).unwrap().producers(), &[a]);

        assert_eq!(graph.pop_ready(CoreType::Cube), Some(a));
        assert_eq!(graph.pop_ready(CoreType::Vector), None);
        run(&graph, a);
        assert_eq!(graph.pop_ready(CoreType::Vector), Some(b));
        assert_eq!(graph.fanout_refcount(a), Some(1));
        run(&graph, b);
        assert_eq!(graph.fanout_refcount(a), Some(0));
        assert_eq!(graph.stats().retired, 2);
    }

    #[test]
    fn dependency_on_completed_producer_is_satisfied_at_submit() {
        let graph = StreamingGraph::with_capacity(4);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        graph.pop_ready(CoreType::Cube).unwrap();
        run(&graph, a);
        let b = graph.submit(F, CoreType::Cube, &[], &[a]).unwrap();
        assert_eq!(graph.status(b), Some(TaskStatus::Ready));
        assert!(graph.get_task(b).unwrap().producers().is_empty());
        assert_eq!(graph.fanout_refcount(a), Some(0));
    }

    #[test]
    fn finished_only_after_seal_and_all_completions() {
        let graph = StreamingGraph::with_capacity(4);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        assert!(!graph.is_finished());
        run(&graph, a);
        assert!(!graph.is_finished());
        graph.seal();
        assert!(graph.is_finished());
        assert_eq!(graph.submit(F, CoreType::Cube, &[], &[]), Err(GraphError::Sealed));
        assert_eq!(
            graph.stats(),
            StreamingStats {
                submitted: 1,
                completed: 1,
                retired: 1,
                sealed: true
            }
        );
    }

    #[test]
    fn invalid_submissions_are_rejected() {
        let graph = StreamingGraph::with_capacity(1);
        assert_eq!(
            graph.submit(F, CoreType::Cube, &[], &[TaskId(0)]),
            Err(GraphError::InvalidTaskId(TaskId(0)))
        );
        assert!(matches!(
            graph.submit(F, CoreType::Cube, &[0; MAX_TASK_ARGS + 1], &[]),
            Err(GraphError::TooManyArgs { .. })
        ));
        graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        assert_eq!(
            graph.submit(F, CoreType::Cube, &[], &[]),
            Err(GraphError::CapacityExceeded { capacity: 1 })
        );
        assert_eq!(graph.stats().submitted, 1);
    }

    #[test]
    fn seal_counts_every_admitted_submission() {
        let graph = StreamingGraph::with_capacity(2);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        let b = graph.submit(F, CoreType::Vector, &[], &[a]).unwrap();
        graph.seal();
        assert_eq!(graph.stats().submitted, 2);
        assert_eq!(graph.pop_ready(CoreType::Cube), Some(a));
        run(&graph, a);
        // One admitted task is still outstanding.
        assert!(!graph.is_finished());
        assert_eq!(graph.pop_ready(CoreType::Vector), Some(b));
        run(&graph, b);
        assert!(graph.is_finished());
        assert_eq!(graph.submit(F, CoreType::Cube, &[], &[]), Err(GraphError::Sealed));
        assert_eq!(graph.stats().submitted, 2);
    }

    #[test]
    fn rejected_submission_does_not_hold_off_finish() {
        let graph = StreamingGraph::with_capacity(1);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        assert_eq!(
            graph.submit(F, CoreType::Cube, &[], &[a]),
            Err(GraphError::CapacityExceeded { capacity: 1 })
        );
        graph.seal();
        graph.pop_ready(CoreType::Cube).unwrap();
        run(&graph, a);
        assert!(graph.is_finished());
        assert_eq!(graph.stats().submitted, 1);
    }

    #[test]
    fn double_completion_is_detected() {
        let graph = StreamingGraph::with_capacity(2);
        let a = graph.submit(F, CoreType::Cube, &[], &[]).unwrap();
        run(&graph, a);
        assert_eq!(
            graph.complete(a),
            Err(InvariantViolation::DoubleCompletion { task: a })
        );
    }

    #[test]
    fn handles_resolve_only_in_their_graph() {
        let one = StreamingGraph::with_capacity(2);
        let other = StreamingGraph::with_capacity(2);
        let a = one.submit(F, CoreType::Cube, &[], &[]).unwrap();
        let handle = one.handle(a);
        assert_eq!(one.resolve(handle).unwrap().task_id(), a);
        assert!(other.resolve(handle).is_err());
        assert!(one.resolve(one.handle(TaskId(1))).is_err());
    }

    #[test]
    fn concurrent_submit_and_complete_lose_no_edge() {
        use std::thread;

        let graph = StreamingGraph::with_capacity(PTO_MAX_TASKS);
        let total = 1_000;
        thread::scope(|scope| {
            scope.spawn(|| {
                let mut prev = None;
                for i in 0..total {
                    let deps: Vec<TaskId> = prev.into_iter().collect();
                    let core_type = CoreType::ALL[i % 2];
                    prev = Some(graph.submit(F, core_type, &[], &deps).unwrap());
                }
                graph.seal();
            });
            scope.spawn(|| {
                let mut order = Vec::with_capacity(total);
                while !graph.is_finished() {
                    for core_type in CoreType::ALL {
                        if let Some(id) = graph.pop_ready(core_type) {
                            run(&graph, id);
                            order.push(id.0);
                        }
                    }
                    std::hint::spin_loop();
                }
                assert_eq!(order, (0..total as u32).collect::<Vec<_>>());
            });
        });
        assert_eq!(graph.stats().retired, total);
    }
}
