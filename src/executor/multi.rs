use crate::{
    config::{CoreAssignment, RuntimeConfig},
    error::{ExecError, InvariantViolation},
    executor::{CorePoller, RunReport, Workload, check_pools, served_pools},
    graph::TaskGraph,
    handshake::{self, CoherencyHook, Handshake, NoCacheMaintenance},
    router::SharedRouter,
    sync::{AtomicBool, AtomicUsize, Ordering},
    types::{CoreType, TaskHandle},
    utils::SpinWait,
};
use log::{debug, error, info, warn};
use std::{
    thread,
    time::{Duration, Instant},
};

/// No thread aborted.
const NOT_ABORTED: usize = usize::MAX;

/// What one scheduler thread did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadReport {
    pub thread_idx: usize,
    /// Cores this thread owned.
    pub cores: Vec<usize>,
    /// Completions harvested from those cores.
    pub completed: usize,
    pub dispatched: usize,
}

/// State shared by the scheduler threads of a multi-threaded run.
///
/// Thread 0 seeds the ready queues and publishes `init_done`; the others wait
/// for it. The last thread to finish restores the context, and the graph, for
/// the next run.
#[derive(derive_more::Debug)]
pub struct RunContext<'a> {
    graph: &'a TaskGraph,
    channels: &'a [Handshake],
    #[debug(skip)]
    hook: &'a dyn CoherencyHook,
    assignment: CoreAssignment,
    rendezvous_timeout: Option<Duration>,
    run_timeout: Option<Duration>,
    router: SharedRouter,
    completed: AtomicUsize,
    total: AtomicUsize,
    init_done: AtomicBool,
    init_failed: AtomicBool,
    finished: AtomicUsize,
    aborted_by: AtomicUsize,
}

struct SharedWorkload<'c, 'a> {
    ctx: &'c RunContext<'a>,
}

impl Workload for SharedWorkload<'_, '_> {
    fn complete(&mut self, handle: TaskHandle, core_type: CoreType) -> Result<(), InvariantViolation> {
        let router = &self.ctx.router;
        self.ctx.graph.complete(handle, core_type, |ready| router.route(ready))?;
        self.ctx.completed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn next(&mut self, core_type: CoreType) -> Result<Option<TaskHandle>, InvariantViolation> {
        match self.ctx.router.pop(core_type) {
            Some(id) => self.ctx.graph.start(id, core_type).map(Some),
            None => Ok(None),
        }
    }

    fn is_done(&self) -> bool {
        self.ctx.completed.load(Ordering::Acquire) >= self.ctx.total.load(Ordering::Acquire)
    }

    fn progress(&self) -> (usize, usize) {
        (
            self.ctx.completed.load(Ordering::Acquire),
            self.ctx.total.load(Ordering::Acquire),
        )
    }

    fn aborted_by(&self) -> Option<usize> {
        self.ctx.aborted_by()
    }
}

impl<'a> RunContext<'a> {
    /// Context for running `graph` on `channels` with `config`'s thread
    /// count and timeouts.
    ///
    /// # Errors
    /// `Config` when the thread/core partition is invalid, `InvalidCore`
    /// when `channels` is shorter than the configured core count,
    /// `UnservedCoreType` when `graph` holds tasks of a core type none of
    /// the configured cores serves.
    pub fn new(graph: &'a TaskGraph, channels: &'a [Handshake], config: &RuntimeConfig) -> Result<Self, ExecError> {
        let assignment = config.core_assignment()?;
        if channels.len() < assignment.core_num() {
            return Err(ExecError::InvalidCore {
                core_id: channels.len(),
                core_num: channels.len(),
            });
        }
        let cores: Vec<usize> = (0..assignment.core_num()).collect();
        check_pools(
            served_pools(channels, &cores)?,
            graph.tasks().map(|task| task.core_type()),
        )?;
        Ok(Self {
            graph,
            channels,
            hook: &NoCacheMaintenance,
            assignment,
            rendezvous_timeout: config.rendezvous_timeout,
            run_timeout: config.run_timeout,
            router: SharedRouter::with_capacity(graph.task_count()),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            init_done: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            finished: AtomicUsize::new(0),
            aborted_by: AtomicUsize::new(NOT_ABORTED),
        })
    }

    #[must_use]
    pub fn with_hook(mut self, hook: &'a dyn CoherencyHook) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub fn thread_num(&self) -> usize {
        self.assignment.thread_num()
    }

    #[must_use]
    pub fn assignment(&self) -> &CoreAssignment {
        &self.assignment
    }

    #[must_use]
    pub fn graph(&self) -> &'a TaskGraph {
        self.graph
    }

    #[must_use]
    pub fn channels(&self) -> &'a [Handshake] {
        self.channels
    }

    /// Body of scheduler thread `thread_idx`: handshake with its own cores,
    /// serve them until the whole graph completed, shut them down.
    ///
    /// Every thread index of the run must be driven exactly once, each on
    /// its own OS thread.
    ///
    /// # Errors
    /// `InvalidThread` for an index outside the run, `InitFailed` when
    /// thread 0 could not seed the run, `Aborted` when another thread failed,
    /// and any error of the harvest/dispatch loop.
    pub fn run_thread(&self, thread_idx: usize) -> Result<ThreadReport, ExecError> {
        let thread_num = self.thread_num();
        if thread_idx >= thread_num {
            return Err(ExecError::InvalidThread { thread_idx, thread_num });
        }
        let cores = self.assignment.cores(thread_idx);
        debug!("thread {thread_idx}: cores {cores:?}");

        let result = self
            .wait_for_init(thread_idx)
            .and_then(|()| self.serve(thread_idx, &cores));
        let quit = handshake::shutdown(self.channels, &cores, self.hook);
        if let Err(err) = &result {
            if !matches!(err, ExecError::Aborted { .. } | ExecError::InitFailed) {
                error!("thread {thread_idx} failed: {err}");
                let _ = self.aborted_by.compare_exchange(
                    NOT_ABORTED,
                    thread_idx,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        self.finish(thread_idx);
        let (completed, dispatched) = result?;
        quit?;
        Ok(ThreadReport {
            thread_idx,
            cores,
            completed,
            dispatched,
        })
    }

    fn wait_for_init(&self, thread_idx: usize) -> Result<(), ExecError> {
        if thread_idx == 0 {
            return match self.initialise() {
                Ok(()) => {
                    self.init_done.store(true, Ordering::Release);
                    Ok(())
                }
                Err(err) => {
                    self.init_failed.store(true, Ordering::Release);
                    Err(err)
                }
            };
        }
        let mut wait = SpinWait::new(self.rendezvous_timeout);
        while !self.init_done.load(Ordering::Acquire) {
            if self.init_failed.load(Ordering::Acquire) || !wait.spin() {
                warn!("thread {thread_idx}: initialisation failed, aborting");
                return Err(ExecError::InitFailed);
            }
        }
        Ok(())
    }

    fn initialise(&self) -> Result<(), ExecError> {
        let graph = self.graph;
        info!(
            "multi-thread run: {} task(s), {} thread(s), {} core(s)",
            graph.task_count(),
            self.thread_num(),
            self.assignment.core_num()
        );
        self.total.store(graph.task_count(), Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        for id in graph.initial_ready_tasks() {
            self.router.route(graph.mark_ready(id)?);
        }
        Ok(())
    }

    fn serve(&self, thread_idx: usize, cores: &[usize]) -> Result<(usize, usize), ExecError> {
        handshake::rendezvous(self.channels, cores, self.hook, self.rendezvous_timeout)?;
        let mut poller = CorePoller::new(self.channels, cores, self.hook)?;
        poller.drive(&mut SharedWorkload { ctx: self }, self.run_timeout)?;
        debug!(
            "thread {thread_idx}: {} dispatched, {} harvested",
            poller.dispatched(),
            poller.completed()
        );
        Ok((poller.completed(), poller.dispatched()))
    }

    fn aborted_by(&self) -> Option<usize> {
        match self.aborted_by.load(Ordering::Acquire) {
            NOT_ABORTED => None,
            thread_idx => Some(thread_idx),
        }
    }

    /// The last thread out restores everything for the next run.
    fn finish(&self, thread_idx: usize) {
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if finished < self.thread_num() {
            return;
        }
        debug!("thread {thread_idx} is the last one out, resetting run state");
        self.router.clear();
        self.graph.reset();
        self.completed.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.init_failed.store(false, Ordering::Relaxed);
        self.aborted_by.store(NOT_ABORTED, Ordering::Relaxed);
        self.init_done.store(false, Ordering::Relaxed);
        self.finished.store(0, Ordering::Release);
    }
}

/// Runs a graph with one scheduler thread per configured AICPU thread.
#[derive(derive_more::Debug)]
pub struct MultiThreadExecutor<'a> {
    channels: &'a [Handshake],
    #[debug(skip)]
    hook: &'a dyn CoherencyHook,
    config: RuntimeConfig,
}

impl<'a> MultiThreadExecutor<'a> {
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

    /// Spawns the scheduler threads and waits for all of them.
    ///
    /// The graph is reset afterwards, so it can be run again.
    ///
    /// # Errors
    /// The root cause when threads failed: errors that merely report another
    /// thread's failure (`Aborted`, `InitFailed`) only win when nothing
    /// else was reported.
    pub fn run(&self, graph: &TaskGraph) -> Result<RunReport, ExecError> {
        let started = Instant::now();
        let ctx = RunContext::new(graph, self.channels, &self.config)?.with_hook(self.hook);
        let thread_num = ctx.thread_num();
        let results: Vec<Result<ThreadReport, ExecError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..thread_num)
                .map(|thread_idx| {
                    let ctx = &ctx;
                    scope.spawn(move || ctx.run_thread(thread_idx))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut reports = Vec::with_capacity(thread_num);
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            let root_cause = errors
                .iter()
                .position(|err| !matches!(err, ExecError::Aborted { .. } | ExecError::InitFailed))
                .unwrap_or(0);
            return Err(errors.swap_remove(root_cause));
        }
        let report = RunReport {
            completed: reports.iter().map(|report| report.completed).sum(),
            total: graph.task_count(),
            threads: thread_num,
            elapsed: started.elapsed(),
        };
        info!(
            "run finished: {}/{} task(s) on {} thread(s) in {:?}",
            report.completed, report.total, report.threads, report.elapsed
        );
        Ok(report)
    }
}
