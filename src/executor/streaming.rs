use crate::{
    config::RuntimeConfig,
    error::{ExecError, InvariantViolation},
    executor::{CorePoller, RunReport, Workload, served_pools},
    graph::{StreamingGraph, check_core_type},
    handshake::{self, CoherencyHook, Handshake, NoCacheMaintenance},
    sync::{AtomicUsize, Ordering},
    types::{CoreType, TaskHandle},
};
use log::{debug, error, info};
use std::{thread, time::Instant};

const NOT_ABORTED: usize = usize::MAX;

struct StreamingWorkload<'g> {
    graph: &'g StreamingGraph,
    aborted_by: &'g AtomicUsize,
    served: [bool; 2],
}

impl Workload for StreamingWorkload<'_> {
    fn complete(&mut self, handle: TaskHandle, core_type: CoreType) -> Result<(), InvariantViolation> {
        let task = self.graph.resolve(handle)?;
        check_core_type(task.task_id(), task.core_type(), core_type)?;
        self.graph.complete(task.task_id())
    }

    fn next(&mut self, core_type: CoreType) -> Result<Option<TaskHandle>, InvariantViolation> {
        let Some(id) = self.graph.pop_ready(core_type) else {
            return Ok(None);
        };
        let task = self.graph.get_task(id).map_err(|_| InvariantViolation::InvalidTaskId(id))?;
        check_core_type(id, task.core_type(), core_type)?;
        self.graph.mark_running(id)?;
        Ok(Some(self.graph.handle(id)))
    }

    fn is_done(&self) -> bool {
        self.graph.is_finished()
    }

    fn progress(&self) -> (usize, usize) {
        let stats = self.graph.stats();
        (stats.completed, stats.submitted)
    }

    fn aborted_by(&self) -> Option<usize> {
        match self.aborted_by.load(Ordering::Acquire) {
            NOT_ABORTED => None,
            thread_idx => Some(thread_idx),
        }
    }

    fn unserved(&self) -> Option<CoreType> {
        CoreType::ALL
            .into_iter()
            .find(|&core_type| !self.served[core_type.index()] && self.graph.ready_count(core_type) > 0)
    }
}

/// Runs a [`StreamingGraph`] while it is still being submitted to.
///
/// Scheduler threads and their cores follow the configured
/// [`CoreAssignment`](crate::config::CoreAssignment). The run ends once the
/// graph is sealed and drained, so the orchestrator must eventually call
/// [`StreamingGraph::seal`].
#[derive(derive_more::Debug)]
pub struct StreamingExecutor<'a> {
    channels: &'a [Handshake],
    #[debug(skip)]
    hook: &'a dyn CoherencyHook,
    config: RuntimeConfig,
}

impl<'a> StreamingExecutor<'a> {
    pub fn new(channels: &'a [Handshake], config: &RuntimeConfig) -> Self {
        Self {
            channels,
            hook: &NoCacheMaintenance,
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: &'a dyn CoherencyHook) -> Self {
        self.hook = hook;
        self
    }

    /// # Errors
    /// `Config` for an invalid partition, `InvalidCore` when there are fewer
    /// channels than configured cores, and the first failure of any
    /// scheduler thread. An idle run times out after `run_timeout`, which
    /// includes waiting for the orchestrator. A task that becomes ready on a
    /// core type without workers fails the run with `UnservedCoreType`.
    pub fn run(&self, graph: &StreamingGraph) -> Result<RunReport, ExecError> {
        let started = Instant::now();
        let assignment = self.config.core_assignment()?;
        if self.channels.len() < assignment.core_num() {
            return Err(ExecError::InvalidCore {
                core_id: self.channels.len(),
                core_num: self.channels.len(),
            });
        }
        let all_cores: Vec<usize> = (0..assignment.core_num()).collect();
        let served = served_pools(self.channels, &all_cores)?;
        let thread_num = assignment.thread_num();
        info!(
            "streaming run: {} thread(s), {} core(s)",
            thread_num,
            assignment.core_num()
        );
        let aborted_by = AtomicUsize::new(NOT_ABORTED);
        let results: Vec<Result<usize, ExecError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..thread_num)
                .map(|thread_idx| {
                    let cores = assignment.cores(thread_idx);
                    let aborted_by = &aborted_by;
                    scope.spawn(move || {
                        let workload = StreamingWorkload {
                            graph,
                            aborted_by,
                            served,
                        };
                        let result = self.serve(workload, thread_idx, &cores);
                        if let Err(err) = &result {
                            if !matches!(err, ExecError::Aborted { .. }) {
                                error!("streaming thread {thread_idx} failed: {err}");
                                let _ = aborted_by.compare_exchange(
                                    NOT_ABORTED,
                                    thread_idx,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                            }
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut completed = 0;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(harvested) => completed += harvested,
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            let root_cause = errors
                .iter()
                .position(|err| !matches!(err, ExecError::Aborted { .. }))
                .unwrap_or(0);
            return Err(errors.swap_remove(root_cause));
        }
        let stats = graph.stats();
        let report = RunReport {
            completed,
            total: stats.submitted,
            threads: thread_num,
            elapsed: started.elapsed(),
        };
        info!(
            "streaming run finished: {}/{} task(s), {} retired, in {:?}",
            report.completed, report.total, stats.retired, report.elapsed
        );
        Ok(report)
    }

    fn serve(&self, mut workload: StreamingWorkload<'_>, thread_idx: usize, cores: &[usize]) -> Result<usize, ExecError> {
        let result = handshake::rendezvous(self.channels, cores, self.hook, self.config.rendezvous_timeout)
            .and_then(|()| CorePoller::new(self.channels, cores, self.hook))
            .and_then(|mut poller| {
                poller.drive(&mut workload, self.config.run_timeout)?;
                debug!(
                    "streaming thread {thread_idx}: {} dispatched, {} harvested",
                    poller.dispatched(),
                    poller.completed()
                );
                Ok(poller.completed())
            });
        let quit = handshake::shutdown(self.channels, cores, self.hook);
        let completed = result?;
        quit?;
        Ok(completed)
    }
}
