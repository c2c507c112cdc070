use crate::types::{CoreType, TaskHandle, TaskId};
use std::path::PathBuf;
use thiserror::Error;

/// Error returned while building a task graph.
///
/// Every failing operation leaves the graph exactly as it was before the call.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum GraphError {
    /// The graph already holds its maximum number of tasks.
    #[error("task capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },
    /// The producer already has its maximum number of successors.
    #[error("task {task} exceeds fanout capacity of {capacity}")]
    FanoutCapacityExceeded { task: TaskId, capacity: usize },
    /// More argument words than a task descriptor can carry.
    #[error("{count} task arguments given, at most {capacity} allowed")]
    TooManyArgs { count: usize, capacity: usize },
    /// The id does not name a task of this graph.
    #[error("task {0} does not exist")]
    InvalidTaskId(TaskId),
    /// An edge from a task to itself.
    #[error("task {0} cannot depend on itself")]
    SelfDependency(TaskId),
    /// The streaming graph no longer accepts submissions.
    #[error("graph is sealed")]
    Sealed,
}

/// Error produced while loading or validating a [`RuntimeConfig`](crate::config::RuntimeConfig).
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("device id {0} out of range [0, {max}]", max = crate::config::MAX_DEVICE_ID)]
    InvalidDeviceId(u32),
    #[error("scheduler thread count {0} out of range [1, {max}]", max = crate::config::MAX_AICPU_THREADS)]
    InvalidThreadNum(usize),
    #[error("no AICore workers configured")]
    NoCores,
    #[error("{cores} cores per scheduler thread exceeds maximum {max}")]
    CoresPerThreadExceeded { cores: usize, max: usize },
    #[error("binary {0:?} does not exist")]
    MissingBinary(PathBuf),
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("malformed YAML configuration: {0}")]
    Yaml(String),
    #[error("cannot read configuration: {0}")]
    Io(String),
}

/// A broken scheduling invariant.
///
/// These are never runtime faults: they mean the graph or the handshake
/// contract has been violated and the dependency counters can no longer be
/// trusted.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum InvariantViolation {
    #[error("task {task} dispatched twice")]
    DoubleDispatch { task: TaskId },
    #[error("task {task} became ready twice")]
    DoubleReady { task: TaskId },
    #[error("task {task} completed twice")]
    DoubleCompletion { task: TaskId },
    #[error("fanin of task {task} dropped below zero")]
    FaninUnderflow { task: TaskId },
    #[error("handle {handle:?} does not belong to this graph")]
    UnknownHandle { handle: TaskHandle },
    #[error("{task_type} task {task} routed to {core_type} core")]
    CoreTypeMismatch {
        task: TaskId,
        task_type: CoreType,
        core_type: CoreType,
    },
    #[error("channel reports invalid core type {0}")]
    InvalidCoreType(i32),
    #[error("task {0} does not exist")]
    InvalidTaskId(TaskId),
}

/// Error returned by a scheduler run.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExecError {
    /// A worker never acknowledged the rendezvous.
    #[error("core {core_id} did not acknowledge rendezvous in time")]
    RendezvousTimeout { core_id: usize },
    /// The run did not finish in time; usually a hung worker or a cyclic graph.
    #[error("run timed out after {completed} of {total} tasks")]
    RunTimeout { completed: usize, total: usize },
    /// The designated initialising scheduler thread failed.
    #[error("scheduler initialization failed")]
    InitFailed,
    /// Another scheduler thread of the same run failed.
    #[error("run aborted after a failure on scheduler thread {thread_idx}")]
    Aborted { thread_idx: usize },
    /// The launch blob was missing.
    #[error("invalid kernel arguments: null pointer")]
    NullArguments,
    /// A core id with no handshake channel behind it.
    #[error("core {core_id} out of range for {core_num} channels")]
    InvalidCore { core_id: usize, core_num: usize },
    /// The graph holds tasks of a core type the run has no workers of.
    #[error("no {core_type} core to run {core_type} tasks on")]
    UnservedCoreType { core_type: CoreType },
    /// A scheduler thread index outside the configured range.
    #[error("scheduler thread index {thread_idx} out of range for {thread_num} threads")]
    InvalidThread { thread_idx: usize, thread_num: usize },
    /// Aborted on a broken invariant; `core_id` is the channel being served.
    #[error("invariant violated on core {core_id:?}: {violation}")]
    Invariant {
        violation: InvariantViolation,
        core_id: Option<usize>,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ExecError {
    pub(crate) fn on_core(violation: InvariantViolation, core_id: usize) -> Self {
        Self::Invariant {
            violation,
            core_id: Some(core_id),
        }
    }
}

impl From<InvariantViolation> for ExecError {
    fn from(violation: InvariantViolation) -> Self {
        Self::Invariant {
            violation,
            core_id: None,
        }
    }
}
