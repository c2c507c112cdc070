use crate::{
    config::RuntimeConfig,
    error::{ConfigError, ExecError, InvariantViolation},
    executor::{CorePoller, RunReport, Workload, check_pools, served_pools},
    graph::TaskGraph,
    handshake::{self, CoherencyHook, Handshake, NoCacheMaintenance},
    router::LocalRouter,
    types::{CoreType, TaskHandle},
};
use derive_more::Display;
use log::{error, info};
use std::time::{Duration, Instant};

/// Lifecycle of a [`SingleThreadExecutor`] run.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    /// Handshaking and seeding the ready queues.
    #[default]
    Init,
    Dispatching,
    Done,
}

/// One scheduler thread serving every channel.
#[derive(derive_more::Debug)]
pub struct SingleThreadExecutor<'a> {
    channels: &'a [Handshake],
    #[debug(skip)]
    hook: &'a dyn CoherencyHook,
    rendezvous_timeout: Option<Duration>,
    run_timeout: Option<Duration>,
    state: RunState,
}

struct LocalWorkload<'g> {
    graph: &'g TaskGraph,
    router: LocalRouter,
    completed: usize,
}

impl Workload for LocalWorkload<'_> {
    fn complete(&mut self, handle: TaskHandle, core_type: CoreType) -> Result<(), InvariantViolation> {
        let router = &mut self.router;
        self.graph.complete(handle, core_type, |ready| router.route(ready))?;
        self.completed += 1;
        Ok(())
    }

    fn next(&mut self, core_type: CoreType) -> Result<Option<TaskHandle>, InvariantViolation> {
        match self.router.pop(core_type) {
            Some(id) => self.graph.start(id, core_type).map(Some),
            None => Ok(None),
        }
    }

    fn is_done(&self) -> bool {
        self.completed >= self.graph.task_count()
    }

    fn progress(&self) -> (usize, usize) {
        (self.completed, self.graph.task_count())
    }
}

impl<'a> SingleThreadExecutor<'a> {
    /// Executor over `channels` with the timeouts of `config`.
    pub fn new(channels: &'a [Handshake], config: &RuntimeConfig) -> Self {
        Self {
            channels,
            hook: &NoCacheMaintenance,
            rendezvous_timeout: config.rendezvous_timeout,
            run_timeout: config.run_timeout,
            state: RunState::Init,
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: &'a dyn CoherencyHook) -> Self {
        self.hook = hook;
        self
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs `graph` to completion: handshake, dispatch until every task
    /// completed, shutdown. The workers are told to quit on error too.
    ///
    /// # Errors
    /// `RendezvousTimeout`, `RunTimeout`, `Invariant` on a broken protocol,
    /// `Config(NoCores)` for a non-empty graph without channels,
    /// `UnservedCoreType` for tasks of a core type no channel serves. The
    /// last two are reported before any worker is contacted.
    pub fn run(&mut self, graph: &TaskGraph) -> Result<RunReport, ExecError> {
        let started = Instant::now();
        self.state = RunState::Init;
        if self.channels.is_empty() && !graph.is_empty() {
            return Err(ConfigError::NoCores.into());
        }
        let cores: Vec<usize> = (0..self.channels.len()).collect();
        check_pools(
            served_pools(self.channels, &cores)?,
            graph.tasks().map(|task| task.core_type()),
        )?;
        info!("single-thread run: {} task(s) on {} core(s)", graph.task_count(), self.channels.len());
        let result = self.execute(graph, &cores);
        let quit = handshake::shutdown(self.channels, &cores, self.hook);
        self.state = RunState::Done;
        let completed = result.inspect_err(|err| error!("single-thread run failed: {err}"))?;
        quit?;
        let report = RunReport {
            completed,
            total: graph.task_count(),
            threads: 1,
            elapsed: started.elapsed(),
        };
        info!("run finished: {}/{} task(s) in {:?}", report.completed, report.total, report.elapsed);
        Ok(report)
    }

    fn execute(&mut self, graph: &TaskGraph, cores: &[usize]) -> Result<usize, ExecError> {
        handshake::rendezvous(self.channels, cores, self.hook, self.rendezvous_timeout)?;
        let mut workload = LocalWorkload {
            graph,
            router: LocalRouter::default(),
            completed: 0,
        };
        for id in graph.initial_ready_tasks() {
            workload.router.route(graph.mark_ready(id)?);
        }
        self.state = RunState::Dispatching;
        let mut poller = CorePoller::new(self.channels, cores, self.hook)?;
        poller.drive(&mut workload, self.run_timeout)?;
        Ok(poller.completed())
    }
}
