mod multi;
mod single;
mod streaming;

pub use crate::executor::{
    multi::{MultiThreadExecutor, RunContext, ThreadReport},
    single::{RunState, SingleThreadExecutor},
    streaming::StreamingExecutor,
};
use crate::{
    error::{ExecError, InvariantViolation},
    handshake::{ChannelState, CoherencyHook, Handshake, channel_at},
    types::{CoreType, TaskHandle},
    utils::SpinWait,
};
use log::{debug, trace};
use std::time::Duration;

/// Outcome of a scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    /// Tasks completed during the run.
    pub completed: usize,
    /// Tasks the graph held; for a streaming graph, the tasks submitted
    /// before it was sealed.
    pub total: usize,
    /// Scheduler threads that took part.
    pub threads: usize,
    pub elapsed: Duration,
}

/// Graph-side half of the harvest/dispatch loop.
///
/// Implementations decide where ready tasks live and how completions
/// propagate; [`CorePoller`] owns the channel side.
pub(crate) trait Workload {
    /// Accounts for the completion of the task behind `handle`, which ran on
    /// a `core_type` worker.
    fn complete(&mut self, handle: TaskHandle, core_type: CoreType) -> Result<(), InvariantViolation>;

    /// Next task for an idle `core_type` worker, already marked running.
    fn next(&mut self, core_type: CoreType) -> Result<Option<TaskHandle>, InvariantViolation>;

    fn is_done(&self) -> bool;

    /// Run-wide `(completed, total)`. Any change counts as progress.
    fn progress(&self) -> (usize, usize);

    /// Thread that failed, if another scheduler thread of the run gave up.
    fn aborted_by(&self) -> Option<usize> {
        None
    }

    /// Core type of ready work that no core of the run can take.
    fn unserved(&self) -> Option<CoreType> {
        None
    }
}

/// Which core types have at least one of `cores` behind them, indexed by
/// [`CoreType::index`].
pub(crate) fn served_pools(channels: &[Handshake], cores: &[usize]) -> Result<[bool; 2], ExecError> {
    let mut served = [false; 2];
    for &core_id in cores {
        let core_type = channel_at(channels, core_id)?
            .core_type()
            .map_err(|violation| ExecError::on_core(violation, core_id))?;
        served[core_type.index()] = true;
    }
    Ok(served)
}

/// Fails on the first of `core_types` that `served` lacks.
pub(crate) fn check_pools(
    served: [bool; 2],
    core_types: impl IntoIterator<Item = CoreType>,
) -> Result<(), ExecError> {
    match core_types.into_iter().find(|core_type| !served[core_type.index()]) {
        Some(core_type) => Err(ExecError::UnservedCoreType { core_type }),
        None => Ok(()),
    }
}

/// Channel side of the harvest/dispatch loop over a fixed set of cores.
pub(crate) struct CorePoller<'a> {
    channels: &'a [Handshake],
    hook: &'a dyn CoherencyHook,
    cores: Vec<(usize, CoreType)>,
    in_flight: usize,
    completed: usize,
    dispatched: usize,
}

impl<'a> CorePoller<'a> {
    pub(crate) fn new(
        channels: &'a [Handshake],
        cores: &[usize],
        hook: &'a dyn CoherencyHook,
    ) -> Result<Self, ExecError> {
        let cores = cores
            .iter()
            .map(|&core_id| {
                let core_type = channel_at(channels, core_id)?
                    .core_type()
                    .map_err(|violation| ExecError::on_core(violation, core_id))?;
                Ok((core_id, core_type))
            })
            .collect::<Result<_, ExecError>>()?;
        Ok(Self {
            channels,
            hook,
            cores,
            in_flight: 0,
            completed: 0,
            dispatched: 0,
        })
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// One pass over every core: harvest a completion, then refill the
    /// channel from the queue of its own core type. Returns whether anything
    /// happened.
    pub(crate) fn poll(&mut self, workload: &mut impl Workload) -> Result<bool, ExecError> {
        let mut progressed = false;
        for &(core_id, core_type) in &self.cores {
            let channel = &self.channels[core_id];
            self.hook.invalidate(channel);
            match channel.state() {
                ChannelState::Busy => continue,
                ChannelState::Completed(handle) => {
                    workload
                        .complete(handle, core_type)
                        .map_err(|violation| ExecError::on_core(violation, core_id))?;
                    channel.harvest();
                    self.hook.flush(channel);
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.completed += 1;
                    progressed = true;
                    debug!("core {core_id}: harvested {handle:?}");
                }
                ChannelState::Available => {}
            }
            if self.in_flight >= self.cores.len() {
                continue;
            }
            if let Some(handle) = workload
                .next(core_type)
                .map_err(|violation| ExecError::on_core(violation, core_id))?
            {
                channel.dispatch(handle);
                self.hook.flush(channel);
                self.in_flight += 1;
                self.dispatched += 1;
                progressed = true;
                debug!("core {core_id}: dispatched {handle:?}");
            }
        }
        Ok(progressed)
    }

    /// Polls until `workload` is done.
    ///
    /// The idle deadline restarts on every local harvest or dispatch and
    /// whenever the run-wide [`progress`](Workload::progress) moves, so a
    /// thread whose own cores have nothing to do waits as long as other
    /// threads keep completing tasks.
    ///
    /// # Errors
    /// `RunTimeout` when `timeout` elapses without progress anywhere in the
    /// run, `Aborted` when another thread of the run failed,
    /// `UnservedCoreType` when ready work can never be dispatched, and
    /// whatever [`poll`](Self::poll) reports.
    pub(crate) fn drive(&mut self, workload: &mut impl Workload, timeout: Option<Duration>) -> Result<(), ExecError> {
        let mut wait = SpinWait::new(timeout);
        let mut seen = workload.progress();
        while !workload.is_done() {
            if let Some(thread_idx) = workload.aborted_by() {
                return Err(ExecError::Aborted { thread_idx });
            }
            if self.poll(workload)? {
                wait = SpinWait::new(timeout);
                continue;
            }
            let progress = workload.progress();
            if progress != seen {
                seen = progress;
                wait = SpinWait::new(timeout);
                continue;
            }
            if let Some(core_type) = workload.unserved() {
                return Err(ExecError::UnservedCoreType { core_type });
            }
            if !wait.spin() {
                let (completed, total) = workload.progress();
                return Err(ExecError::RunTimeout { completed, total });
            }
        }
        trace!(
            "cores {:?} idle: {} dispatched, {} harvested",
            self.cores.iter().map(|(core_id, _)| core_id).collect::<Vec<_>>(),
            self.dispatched,
            self.completed
        );
        Ok(())
    }
}
