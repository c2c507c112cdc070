use crate::{
    error::InvariantViolation,
    sync::{AtomicI32, AtomicU8, Ordering},
    types::{CoreType, FuncId, IndexMap, TaskId},
};
use derive_more::Display;
use log::warn;
use rustc_hash::FxBuildHasher;

/// Maximum number of argument words a task descriptor carries.
pub const MAX_TASK_ARGS: usize = 16;

/// Uniform kernel calling convention: a pointer to the argument array and
/// nothing else. All kernels share it, so dispatch needs no per-kernel switch.
pub type KernelFn = fn(args: &[u64]);

/// Execution state of a task.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Waiting for predecessors.
    Pending = 0,
    /// All predecessors completed; sitting in a ready queue.
    Ready = 1,
    /// Written into a worker's channel.
    Running = 2,
    /// Completion harvested by the scheduler.
    Complete = 3,
}

impl TaskStatus {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Ready,
            2 => Self::Running,
            _ => Self::Complete,
        }
    }
}

/// A single unit of work in a [`TaskGraph`](crate::graph::TaskGraph).
///
/// Everything except `fanin` and `status` is written while the graph is built
/// and only read during a run.
#[derive(Debug)]
pub struct Task {
    task_id: TaskId,
    func_id: FuncId,
    core_type: CoreType,
    args: Vec<u64>,
    /// Predecessors that haven't completed yet.
    fanin: AtomicI32,
    /// Build-time value of `fanin`, restored by `reset`.
    fanin_total: i32,
    /// Successors, in insertion order.
    fanout: Vec<TaskId>,
    status: StatusWord,
}

impl Task {
    pub(crate) fn new(task_id: TaskId, func_id: FuncId, core_type: CoreType, args: &[u64]) -> Self {
        Self {
            task_id,
            func_id,
            core_type,
            args: args.to_vec(),
            fanin: AtomicI32::new(0),
            fanin_total: 0,
            fanout: Vec::new(),
            status: StatusWord::new(),
        }
    }

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

    #[must_use]
    pub fn fanout(&self) -> &[TaskId] {
        &self.fanout
    }

    /// Current number of unsatisfied predecessors.
    #[must_use]
    pub fn fanin(&self) -> i32 {
        self.fanin.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    pub(crate) fn push_successor(&mut self, consumer: TaskId) {
        self.fanout.push(consumer);
    }

    pub(crate) fn add_predecessor(&mut self) {
        self.fanin_total += 1;
        self.fanin.fetch_add(1, Ordering::Relaxed);
    }

    /// Restores the build-time dependency count and status.
    pub(crate) fn reset(&self) {
        self.fanin.store(self.fanin_total, Ordering::Relaxed);
        self.status.reset();
    }

    /// Accounts for one completed predecessor.
    ///
    /// Returns `true` iff this call performed the 1 → 0 transition, which
    /// happens exactly once per task no matter how many threads decrement
    /// concurrently.
    pub(crate) fn release_dependency(&self) -> Result<bool, InvariantViolation> {
        let prev = self.fanin.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            return Err(InvariantViolation::FaninUnderflow { task: self.task_id });
        }
        Ok(prev == 1)
    }

    pub(crate) fn mark_ready(&self) -> Result<(), InvariantViolation> {
        self.status.mark_ready(self.task_id)
    }

    pub(crate) fn mark_running(&self) -> Result<(), InvariantViolation> {
        self.status.mark_running(self.task_id)
    }

    pub(crate) fn mark_complete(&self) -> Result<(), InvariantViolation> {
        self.status.mark_complete(self.task_id)
    }
}

/// Atomic [`TaskStatus`] whose transitions only succeed from the expected
/// predecessor state; a failed transition names the broken invariant.
#[derive(Debug)]
pub(crate) struct StatusWord(AtomicU8);

impl StatusWord {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(TaskStatus::Pending as u8))
    }

    pub(crate) fn load(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn reset(&self) {
        self.0.store(TaskStatus::Pending as u8, Ordering::Relaxed);
    }

    pub(crate) fn mark_ready(&self, task: TaskId) -> Result<(), InvariantViolation> {
        self.transition(TaskStatus::Pending, TaskStatus::Ready)
            .map_err(|_| InvariantViolation::DoubleReady { task })
    }

    pub(crate) fn mark_running(&self, task: TaskId) -> Result<(), InvariantViolation> {
        self.transition(TaskStatus::Ready, TaskStatus::Running)
            .map_err(|_| InvariantViolation::DoubleDispatch { task })
    }

    pub(crate) fn mark_complete(&self, task: TaskId) -> Result<(), InvariantViolation> {
        self.transition(TaskStatus::Running, TaskStatus::Complete)
            .map_err(|_| InvariantViolation::DoubleCompletion { task })
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(TaskStatus::from_u8)
    }
}

/// Maps function ids to kernels.
///
/// Plays the role of the device-side function table: workers look a task's
/// `func_id` up here and call the kernel with the task's arguments.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    kernels: IndexMap<FuncId, KernelFn>,
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kernels: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// Registers `kernel` under `func_id`, returning the kernel it replaces.
    pub fn register(&mut self, func_id: FuncId, kernel: KernelFn) -> Option<KernelFn> {
        self.kernels.insert(func_id, kernel)
    }

    #[must_use]
    pub fn lookup(&self, func_id: FuncId) -> Option<KernelFn> {
        self.kernels.get(&func_id).copied()
    }

    /// Runs the kernel bound to `func_id`. Unknown ids do nothing.
    pub fn invoke(&self, func_id: FuncId, args: &[u64]) {
        match self.lookup(func_id) {
            Some(kernel) => kernel(args),
            None => warn!("no kernel registered for func {func_id}, skipping"),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
