mod streaming;

pub use self::streaming::{StreamingGraph, StreamingStats, StreamingTask, PTO_MAX_TASKS};
use crate::{
    error::{GraphError, InvariantViolation},
    task::{MAX_TASK_ARGS, Task},
    types::{CoreType, FuncId, TaskHandle, TaskId},
};
use core::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use log::trace;

/// Maximum number of tasks in a [`TaskGraph`].
pub const GRAPH_MAX_TASKS: usize = 1024;
/// Maximum number of successors of a single task.
pub const GRAPH_MAX_FANOUT: usize = 512;

/// Source of graph generation tags. Starts at 1 so no live graph shares the
/// tag of a zeroed channel word.
static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_generation() -> u32 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn check_core_type(task: TaskId, task_type: CoreType, core_type: CoreType) -> Result<(), InvariantViolation> {
    if task_type == core_type {
        Ok(())
    } else {
        Err(InvariantViolation::CoreTypeMismatch {
            task,
            task_type,
            core_type,
        })
    }
}

/// What a worker needs to run a dispatched task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskView<'a> {
    pub task_id: TaskId,
    pub func_id: FuncId,
    pub core_type: CoreType,
    pub args: &'a [u64],
}

/// Resolves the handle found in a channel into the task behind it.
pub trait TaskSource: Sync {
    /// # Errors
    /// `UnknownHandle` when the handle was not issued by this source.
    fn view(&self, handle: TaskHandle) -> Result<TaskView<'_>, InvariantViolation>;
}

/// Fixed-capacity DAG of [`Task`]s, indexed by [`TaskId`].
///
/// The graph is built single-threaded (`add_task`, `add_successor`), then
/// shared read-mostly by every scheduler thread and worker of a run: only the
/// per-task `fanin` counters and status words change while it executes.
/// Acyclicity is the caller's responsibility.
#[must_use]
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    generation: u32,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            generation: next_generation(),
        }
    }

    /// Appends a task without dependencies.
    ///
    /// # Errors
    /// `CapacityExceeded` when the graph is full, `TooManyArgs` when `args`
    /// is longer than [`MAX_TASK_ARGS`]. The graph is unchanged on error.
    pub fn add_task(
        &mut self,
        args: &[u64],
        func_id: FuncId,
        core_type: CoreType,
    ) -> Result<TaskId, GraphError> {
        if self.tasks.len() >= GRAPH_MAX_TASKS {
            return Err(GraphError::CapacityExceeded {
                capacity: GRAPH_MAX_TASKS,
            });
        }
        if args.len() > MAX_TASK_ARGS {
            return Err(GraphError::TooManyArgs {
                count: args.len(),
                capacity: MAX_TASK_ARGS,
            });
        }
        let task_id = TaskId(u32::try_from(self.tasks.len()).expect("TaskGraph::add_task"));
        self.tasks.push(Task::new(task_id, func_id, core_type, args));
        Ok(task_id)
    }

    /// Declares that `consumer` may only run after `producer` completed.
    ///
    /// # Errors
    /// `InvalidTaskId` for unknown ids, `SelfDependency` for a loop edge and
    /// `FanoutCapacityExceeded` when the producer is full.
    pub fn add_successor(&mut self, producer: TaskId, consumer: TaskId) -> Result<(), GraphError> {
        if consumer.index() >= self.tasks.len() {
            return Err(GraphError::InvalidTaskId(consumer));
        }
        if producer == consumer {
            return Err(GraphError::SelfDependency(producer));
        }
        let producer_task = self
            .tasks
            .get_mut(producer.index())
            .ok_or(GraphError::InvalidTaskId(producer))?;
        if producer_task.fanout().len() >= GRAPH_MAX_FANOUT {
            return Err(GraphError::FanoutCapacityExceeded {
                task: producer,
                capacity: GRAPH_MAX_FANOUT,
            });
        }
        producer_task.push_successor(consumer);
        self.tasks[consumer.index()].add_predecessor();
        Ok(())
    }

    /// # Errors
    /// `InvalidTaskId` when `id` is out of range.
    pub fn get_task(&self, id: TaskId) -> Result<&Task, GraphError> {
        self.tasks.get(id.index()).ok_or(GraphError::InvalidTaskId(id))
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl ExactSizeIterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Appends every task whose `fanin` is zero to `out`, in id order, and
    /// returns how many were appended.
    ///
    /// Before a run starts this is a pure function of the graph's structure.
    pub fn get_initial_ready_tasks(&self, out: &mut Vec<TaskId>) -> usize {
        let before = out.len();
        out.extend(
            self.tasks
                .iter()
                .filter(|task| task.fanin() == 0)
                .map(Task::task_id),
        );
        out.len() - before
    }

    #[must_use]
    pub fn initial_ready_tasks(&self) -> Vec<TaskId> {
        let mut out = Vec::new();
        self.get_initial_ready_tasks(&mut out);
        out
    }

    /// Channel word identifying `id` within this graph.
    pub fn handle(&self, id: TaskId) -> TaskHandle {
        TaskHandle::new(self.generation, id)
    }

    /// Resolves a channel word written by [`handle`](Self::handle).
    ///
    /// # Errors
    /// `UnknownHandle` for the sentinel, another graph's handle, or an
    /// out-of-range index.
    pub fn resolve(&self, handle: TaskHandle) -> Result<&Task, InvariantViolation> {
        handle
            .decode()
            .filter(|&(generation, _)| generation == self.generation)
            .and_then(|(_, id)| self.tasks.get(id.index()))
            .ok_or(InvariantViolation::UnknownHandle { handle })
    }

    pub(crate) fn task(&self, id: TaskId) -> Result<&Task, InvariantViolation> {
        self.tasks
            .get(id.index())
            .ok_or(InvariantViolation::InvalidTaskId(id))
    }

    /// Moves a task whose dependencies are satisfied to `Ready`.
    ///
    /// # Errors
    /// `InvalidTaskId`, `DoubleReady` when it already left `Pending`.
    pub fn mark_ready(&self, id: TaskId) -> Result<&Task, InvariantViolation> {
        let task = self.task(id)?;
        task.mark_ready()?;
        Ok(task)
    }

    /// Moves a ready task popped for an idle `core_type` worker to `Running`
    /// and returns the handle to write into its channel.
    ///
    /// # Errors
    /// `InvalidTaskId`, `CoreTypeMismatch`, `DoubleDispatch` when the task
    /// is not `Ready`.
    pub fn start(&self, id: TaskId, core_type: CoreType) -> Result<TaskHandle, InvariantViolation> {
        let task = self.task(id)?;
        check_core_type(id, task.core_type(), core_type)?;
        task.mark_running()?;
        Ok(self.handle(id))
    }

    /// Accounts for the completion harvested from a `core_type` channel:
    /// marks the task complete and releases each successor exactly once.
    /// `on_ready` receives every successor whose last dependency this was,
    /// already marked `Ready`.
    ///
    /// # Errors
    /// `UnknownHandle`, `CoreTypeMismatch`, `DoubleCompletion`,
    /// `FaninUnderflow`.
    pub fn complete<'g>(
        &'g self,
        handle: TaskHandle,
        core_type: CoreType,
        mut on_ready: impl FnMut(&'g Task),
    ) -> Result<TaskId, InvariantViolation> {
        let task = self.resolve(handle)?;
        check_core_type(task.task_id(), task.core_type(), core_type)?;
        task.mark_complete()?;
        for &successor_id in task.fanout() {
            let successor = self.task(successor_id)?;
            if successor.release_dependency()? {
                successor.mark_ready()?;
                trace!("{} ready after {}", successor_id, task.task_id());
                on_ready(successor);
            }
        }
        Ok(task.task_id())
    }

    /// Restores every task's dependency count and status so the graph can be
    /// executed again.
    pub fn reset(&self) {
        for task in &self.tasks {
            task.reset();
        }
    }
}

impl TaskSource for TaskGraph {
    fn view(&self, handle: TaskHandle) -> Result<TaskView<'_>, InvariantViolation> {
        self.resolve(handle).map(|task| TaskView {
            task_id: task.task_id(),
            func_id: task.func_id(),
            core_type: task.core_type(),
            args: task.args(),
        })
    }
}

impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TaskGraph: {} task(s)", self.tasks.len())?;
        for task in &self.tasks {
            write!(
                f,
                "  task {} func={} core={} fanin={} fanout=[",
                task.task_id(),
                task.func_id(),
                task.core_type(),
                task.fanin()
            )?;
            for (i, successor) in task.fanout().iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{successor}")?;
            }
            writeln!(f, "]")?;
        }
        Ok(())
    }
}
