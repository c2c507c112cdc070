//! Software stand-in for the AICore side of the handshake.
//!
//! A worker acknowledges the rendezvous with its core id, then polls its
//! channel: a busy channel carries a task to run through the
//! [`KernelRegistry`], a quit request ends the loop. Workers never touch the
//! graph's dependency state; they only read the dispatched task.

use crate::{
    error::InvariantViolation,
    graph::TaskSource,
    handshake::Handshake,
    sync::{Mutex, lock, spin_hint, thread},
    task::KernelRegistry,
    types::{CoreType, TaskId},
};
use derive_more::Display;
use log::{debug, error, trace};

/// Start or end of a task on a worker.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    #[display("start")]
    Start,
    #[display("end")]
    End,
}

/// One entry of a [`DispatchLog`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    /// Position in the global order of events.
    pub seq: usize,
    pub kind: EventKind,
    pub task: TaskId,
    pub core_id: usize,
    pub core_type: CoreType,
}

/// Totally ordered record of what the workers executed.
///
/// Every event gets its sequence number under the same lock that appends it,
/// so `seq` order is the real order in which workers started and finished
/// tasks.
#[derive(Debug)]
pub struct DispatchLog {
    events: Mutex<Vec<DispatchEvent>>,
}

impl Default for DispatchLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, kind: EventKind, task: TaskId, core_id: usize, core_type: CoreType) {
        let mut events = lock(&self.events);
        let seq = events.len();
        events.push(DispatchEvent {
            seq,
            kind,
            task,
            core_id,
            core_type,
        });
    }

    /// Copy of every event, in sequence order.
    #[must_use]
    pub fn events(&self) -> Vec<DispatchEvent> {
        lock(&self.events).clone()
    }

    /// Sequence number of the first `kind` event of `task`.
    #[must_use]
    pub fn seq_of(&self, kind: EventKind, task: TaskId) -> Option<usize> {
        lock(&self.events)
            .iter()
            .find(|event| event.kind == kind && event.task == task)
            .map(|event| event.seq)
    }

    /// How many times `task` was started.
    #[must_use]
    pub fn executions(&self, task: TaskId) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.kind == EventKind::Start && event.task == task)
            .count()
    }

    /// Tasks in the order they were started.
    #[must_use]
    pub fn start_order(&self) -> Vec<TaskId> {
        lock(&self.events)
            .iter()
            .filter(|event| event.kind == EventKind::Start)
            .map(|event| event.task)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

/// What a worker did before it was told to quit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub core_id: usize,
    pub core_type: CoreType,
    /// Tasks executed.
    pub executed: usize,
}

/// Worker loop for the core behind `channel`.
///
/// Returns once the scheduler requested quit. A worker that is told to quit
/// before the rendezvous leaves without acknowledging.
///
/// # Errors
/// `InvalidCoreType` for a corrupted channel, `UnknownHandle` when the
/// dispatched handle does not resolve in `source`.
pub fn run_worker(
    channel: &Handshake,
    core_id: usize,
    source: &dyn TaskSource,
    kernels: &KernelRegistry,
    log: Option<&DispatchLog>,
) -> Result<WorkerReport, InvariantViolation> {
    let core_type = channel.core_type()?;
    let mut report = WorkerReport {
        core_id,
        core_type,
        executed: 0,
    };
    while !channel.ready_signalled() {
        if channel.quit_requested() {
            debug!("core {core_id}: quit before rendezvous");
            return Ok(report);
        }
        thread::yield_now();
    }
    channel.acknowledge(core_id as u32);
    trace!("core {core_id}: acknowledged");

    loop {
        if let Some(handle) = channel.assigned_task() {
            let task = source.view(handle)?;
            if channel.profiling() {
                debug!("core {core_id}: running {} (func {})", task.task_id, task.func_id);
            }
            if let Some(log) = log {
                log.record(EventKind::Start, task.task_id, core_id, core_type);
            }
            kernels.invoke(task.func_id, task.args);
            if let Some(log) = log {
                log.record(EventKind::End, task.task_id, core_id, core_type);
            }
            channel.complete();
            report.executed += 1;
            continue;
        }
        if channel.quit_requested() {
            break;
        }
        spin_hint();
        thread::yield_now();
    }
    debug!("core {core_id}: quit after {} task(s)", report.executed);
    Ok(report)
}

/// Worker outcomes of a [`SimulatedCluster::run`].
pub type WorkerResults = Vec<Result<WorkerReport, InvariantViolation>>;

/// One simulated worker thread per channel, alive for the duration of a
/// scheduler run.
#[derive(Debug)]
pub struct SimulatedCluster<'a> {
    channels: &'a [Handshake],
    kernels: &'a KernelRegistry,
    log: Option<&'a DispatchLog>,
    silent: Vec<usize>,
}

impl<'a> SimulatedCluster<'a> {
    pub fn new(channels: &'a [Handshake], kernels: &'a KernelRegistry) -> Self {
        Self {
            channels,
            kernels,
            log: None,
            silent: Vec::new(),
        }
    }

    /// Records every execution into `log`.
    #[must_use]
    pub fn with_log(mut self, log: &'a DispatchLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Starts no worker for `core_id`, as if the core never came up.
    #[must_use]
    pub fn silence(mut self, core_id: usize) -> Self {
        self.silent.push(core_id);
        self
    }

    /// Resets the channels, starts the workers, runs `scheduler` on the
    /// calling thread and joins the workers.
    ///
    /// Workers are told to quit once `scheduler` returns, whatever it did.
    pub fn run<R>(&self, source: &dyn TaskSource, scheduler: impl FnOnce() -> R) -> (R, WorkerResults) {
        for channel in self.channels {
            channel.reset();
        }
        std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .channels
                .iter()
                .enumerate()
                .filter(|(core_id, _)| !self.silent.contains(core_id))
                .map(|(core_id, channel)| {
                    scope.spawn(move || run_worker(channel, core_id, source, self.kernels, self.log))
                })
                .collect();
            let outcome = scheduler();
            for channel in self.channels {
                channel.request_quit();
            }
            let results = workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .inspect(|result| {
                    if let Err(violation) = result {
                        error!("worker failed: {violation}");
                    }
                })
                .collect();
            (outcome, results)
        })
    }
}
