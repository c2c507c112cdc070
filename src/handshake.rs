//! Scheduler ⇄ worker mailbox.
//!
//! Protocol, per channel:
//! 1. the scheduler sets `aicpu_ready = 1`;
//! 2. the worker answers with `aicore_done = core_id + 1` (non-zero, so it is
//!    distinguishable from the zeroed initial state);
//! 3. steady state: the scheduler writes `task`, then `task_status = 1`; the
//!    worker runs the task and writes `task_status = 0`; the scheduler harvests
//!    the completion by writing `task = 0`;
//! 4. the scheduler sets `control = 1` and the worker leaves its loop.
//!
//! Each field has exactly one writer at a time, which is why plain
//! acquire/release atomics are enough.

use crate::{
    error::{ExecError, InvariantViolation},
    sync::{AtomicI32, AtomicU32, AtomicU64, Ordering},
    types::{CoreType, TaskHandle},
    utils::SpinWait,
};
use log::{debug, info, trace};
use std::time::Duration;

const CONTROL_RUN: i32 = 0;
const CONTROL_QUIT: i32 = 1;
const STATUS_IDLE: i32 = 0;
const STATUS_BUSY: i32 = 1;

/// One worker's handshake record.
///
/// The layout is shared with separately compiled worker and host code, which
/// address the fields by hardcoded offset: do not reorder.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct Handshake {
    /// Scheduler → worker: initialization complete.
    aicpu_ready: AtomicU32,
    /// Worker → scheduler: `core_id + 1` once the worker polls.
    aicore_done: AtomicU32,
    /// Scheduler → worker: 0 = run, 1 = quit.
    control: AtomicI32,
    _pad: u32,
    /// Scheduler → worker: assigned [`TaskHandle`], 0 = none.
    task: AtomicU64,
    /// 1 = busy (set by the scheduler), 0 = idle (set by the worker).
    task_status: AtomicI32,
    /// Pool of this worker; written once at allocation.
    core_type: i32,
    profile_enable: AtomicU32,
    _reserved: [u32; 7],
}

#[cfg(not(feature = "loom"))]
mod layout {
    use super::Handshake;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<Handshake>(), 64);
    const_assert_eq!(align_of::<Handshake>(), 64);
    const_assert_eq!(offset_of!(Handshake, aicpu_ready), 0);
    const_assert_eq!(offset_of!(Handshake, aicore_done), 4);
    const_assert_eq!(offset_of!(Handshake, control), 8);
    const_assert_eq!(offset_of!(Handshake, task), 16);
    const_assert_eq!(offset_of!(Handshake, task_status), 24);
    const_assert_eq!(offset_of!(Handshake, core_type), 28);
    const_assert_eq!(offset_of!(Handshake, profile_enable), 32);
}

/// What the scheduler sees when it polls a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// The worker is executing.
    Busy,
    /// The worker finished `handle`; the completion has not been harvested.
    Completed(TaskHandle),
    /// Harvested and free for new work.
    Available,
}

/// Plain copy of a channel, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HandshakeSnapshot {
    pub aicpu_ready: u32,
    pub aicore_done: u32,
    pub control: i32,
    pub task: TaskHandle,
    pub task_status: i32,
    pub core_type: i32,
}

impl Handshake {
    /// Zeroed channel for a worker of `core_type`.
    #[must_use]
    pub fn new(core_type: CoreType) -> Self {
        Self {
            aicpu_ready: AtomicU32::new(0),
            aicore_done: AtomicU32::new(0),
            control: AtomicI32::new(CONTROL_RUN),
            _pad: 0,
            task: AtomicU64::new(0),
            task_status: AtomicI32::new(STATUS_IDLE),
            core_type: core_type as i32,
            profile_enable: AtomicU32::new(0),
            _reserved: [0; 7],
        }
    }

    /// # Errors
    /// `InvalidCoreType` if the raw field holds neither 0 nor 1.
    pub fn core_type(&self) -> Result<CoreType, InvariantViolation> {
        CoreType::from_raw(self.core_type).ok_or(InvariantViolation::InvalidCoreType(self.core_type))
    }

    pub fn set_profiling(&self, enable: bool) {
        self.profile_enable.store(u32::from(enable), Ordering::Relaxed);
    }

    #[must_use]
    pub fn profiling(&self) -> bool {
        self.profile_enable.load(Ordering::Relaxed) != 0
    }

    // Scheduler side.

    pub fn signal_ready(&self) {
        self.aicpu_ready.store(1, Ordering::Release);
    }

    /// The worker's `core_id + 1`, once it acknowledged.
    #[must_use]
    pub fn acknowledgement(&self) -> Option<u32> {
        match self.aicore_done.load(Ordering::Acquire) {
            0 => None,
            done => Some(done),
        }
    }

    pub fn request_quit(&self) {
        self.control.store(CONTROL_QUIT, Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        if self.task_status.load(Ordering::Acquire) != STATUS_IDLE {
            return ChannelState::Busy;
        }
        match TaskHandle::from_raw(self.task.load(Ordering::Acquire)) {
            handle if handle.is_none() => ChannelState::Available,
            handle => ChannelState::Completed(handle),
        }
    }

    /// Hands `handle` to the worker and marks it busy. Only valid on an
    /// [`Available`](ChannelState::Available) channel.
    pub fn dispatch(&self, handle: TaskHandle) {
        self.task.store(handle.into_raw(), Ordering::Relaxed);
        self.task_status.store(STATUS_BUSY, Ordering::Release);
    }

    /// Consumes a completion: the channel becomes available.
    pub fn harvest(&self) {
        self.task.store(0, Ordering::Release);
    }

    /// Back to the zeroed state, keeping the core type.
    pub fn reset(&self) {
        self.aicpu_ready.store(0, Ordering::Relaxed);
        self.aicore_done.store(0, Ordering::Relaxed);
        self.control.store(CONTROL_RUN, Ordering::Relaxed);
        self.task.store(0, Ordering::Relaxed);
        self.task_status.store(STATUS_IDLE, Ordering::Release);
    }

    // Worker side.

    #[must_use]
    pub fn ready_signalled(&self) -> bool {
        self.aicpu_ready.load(Ordering::Acquire) != 0
    }

    pub fn acknowledge(&self, core_id: u32) {
        self.aicore_done.store(core_id + 1, Ordering::Release);
    }

    #[must_use]
    pub fn quit_requested(&self) -> bool {
        self.control.load(Ordering::Acquire) == CONTROL_QUIT
    }

    /// The task this worker must run, if the scheduler marked it busy.
    #[must_use]
    pub fn assigned_task(&self) -> Option<TaskHandle> {
        if self.task_status.load(Ordering::Acquire) != STATUS_BUSY {
            return None;
        }
        Some(TaskHandle::from_raw(self.task.load(Ordering::Relaxed))).filter(|h| !h.is_none())
    }

    /// Reports the assigned task as done.
    pub fn complete(&self) {
        self.task_status.store(STATUS_IDLE, Ordering::Release);
    }

    #[must_use]
    pub fn snapshot(&self) -> HandshakeSnapshot {
        HandshakeSnapshot {
            aicpu_ready: self.aicpu_ready.load(Ordering::Acquire),
            aicore_done: self.aicore_done.load(Ordering::Acquire),
            control: self.control.load(Ordering::Acquire),
            task: TaskHandle::from_raw(self.task.load(Ordering::Acquire)),
            task_status: self.task_status.load(Ordering::Acquire),
            core_type: self.core_type,
        }
    }
}

/// Allocates the channel array: `aic_num` cube channels followed by
/// `aiv_num` vector channels, matching the workers' block index layout.
#[must_use]
pub fn channels(aic_num: usize, aiv_num: usize) -> Vec<Handshake> {
    (0..aic_num)
        .map(|_| Handshake::new(CoreType::Cube))
        .chain((0..aiv_num).map(|_| Handshake::new(CoreType::Vector)))
        .collect()
}

/// Platform cache maintenance around channel accesses.
///
/// Hardware whose polling core does not snoop the writer's cache invalidates
/// the line before each poll and flushes it after each write. Shared-memory
/// CPU hosts need neither.
pub trait CoherencyHook: Send + Sync {
    /// Drops any stale cached copy of `channel` before it is read.
    fn invalidate(&self, _channel: &Handshake) {}
    /// Publishes local writes to `channel`.
    fn flush(&self, _channel: &Handshake) {}
}

/// Coherent-memory hook: does nothing.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoCacheMaintenance;

impl CoherencyHook for NoCacheMaintenance {}

pub(crate) fn channel_at(channels: &[Handshake], core_id: usize) -> Result<&Handshake, ExecError> {
    channels.get(core_id).ok_or(ExecError::InvalidCore {
        core_id,
        core_num: channels.len(),
    })
}

/// Initial rendezvous with the workers behind `cores`.
///
/// Signals every channel first, then busy-polls until each worker
/// acknowledged. Once this returns, nothing a worker did before
/// acknowledging can race with the caller's dispatches.
///
/// # Errors
/// `RendezvousTimeout` naming the first silent core if `timeout` elapses,
/// `InvalidCore` for a core without a channel.
pub fn rendezvous(
    channels: &[Handshake],
    cores: &[usize],
    hook: &dyn CoherencyHook,
    timeout: Option<Duration>,
) -> Result<(), ExecError> {
    info!("handshaking with {} core(s)", cores.len());
    for &core_id in cores {
        let channel = channel_at(channels, core_id)?;
        channel.signal_ready();
        hook.flush(channel);
    }
    let mut wait = SpinWait::new(timeout);
    for &core_id in cores {
        let channel = channel_at(channels, core_id)?;
        loop {
            hook.invalidate(channel);
            if let Some(done) = channel.acknowledgement() {
                debug!("core {core_id} ready (aicore_done={done})");
                break;
            }
            if !wait.spin() {
                return Err(ExecError::RendezvousTimeout { core_id });
            }
        }
    }
    trace!("rendezvous complete");
    Ok(())
}

/// Tells the workers behind `cores` to leave their polling loop. Does not
/// wait for them.
///
/// # Errors
/// `InvalidCore` for a core without a channel.
pub fn shutdown(channels: &[Handshake], cores: &[usize], hook: &dyn CoherencyHook) -> Result<(), ExecError> {
    info!("shutting down {} core(s)", cores.len());
    for &core_id in cores {
        let channel = channel_at(channels, core_id)?;
        channel.request_quit();
        hook.flush(channel);
    }
    Ok(())
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{graph::TaskGraph, types::FuncId};
    use std::{sync::Arc, thread, time::Instant};

    #[test]
    fn channel_states_follow_the_protocol() {
        let mut graph = TaskGraph::new();
        let id = graph.add_task(&[], FuncId(0), CoreType::Vector).unwrap();
        let handle = graph.handle(id);
        let channel = Handshake::new(CoreType::Vector);

        assert_eq!(channel.state(), ChannelState::Available);
        assert_eq!(channel.assigned_task(), None);

        channel.dispatch(handle);
        assert_eq!(channel.state(), ChannelState::Busy);
        assert_eq!(channel.assigned_task(), Some(handle));

        channel.complete();
        assert_eq!(channel.state(), ChannelState::Completed(handle));
        assert_eq!(channel.assigned_task(), None);

        channel.harvest();
        assert_eq!(channel.state(), ChannelState::Available);
    }

    #[test]
    fn reset_keeps_core_type() {
        let channel = Handshake::new(CoreType::Vector);
        channel.signal_ready();
        channel.acknowledge(4);
        channel.request_quit();
        assert_eq!(channel.acknowledgement(), Some(5));
        channel.reset();
        let snapshot = channel.snapshot();
        assert_eq!(snapshot.aicpu_ready, 0);
        assert_eq!(snapshot.aicore_done, 0);
        assert_eq!(snapshot.control, 0);
        assert_eq!(channel.core_type(), Ok(CoreType::Vector));
    }

    #[test]
    fn channels_are_cube_first() {
        let channels = channels(1, 2);
        let types: Vec<_> = channels.iter().map(|c| c.core_type().unwrap()).collect();
        assert_eq!(types, [CoreType::Cube, CoreType::Vector, CoreType::Vector]);
    }

    #[test]
    fn rendezvous_waits_for_every_core_then_shutdown_broadcasts() {
        let channels = Arc::new(channels(1, 1));
        let worker = {
            let channels = Arc::clone(&channels);
            thread::spawn(move || {
                for (core_id, channel) in channels.iter().enumerate() {
                    while !channel.ready_signalled() {
                        core::hint::spin_loop();
                    }
                    channel.acknowledge(core_id as u32);
                }
            })
        };
        rendezvous(&channels, &[0, 1], &NoCacheMaintenance, Some(Duration::from_secs(10))).unwrap();
        worker.join().unwrap();
        assert_eq!(channels[0].acknowledgement(), Some(1));
        assert_eq!(channels[1].acknowledgement(), Some(2));

        shutdown(&channels, &[0, 1], &NoCacheMaintenance).unwrap();
        assert!(channels.iter().all(Handshake::quit_requested));
    }

    #[test]
    fn rendezvous_with_silent_worker_times_out() {
        let channels = channels(1, 1);
        channels[0].acknowledge(0);
        let start = Instant::now();
        let result = rendezvous(&channels, &[0, 1], &NoCacheMaintenance, Some(Duration::from_millis(20)));
        assert_eq!(result, Err(ExecError::RendezvousTimeout { core_id: 1 }));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn unknown_core_is_rejected() {
        let channels = channels(1, 0);
        assert_eq!(
            shutdown(&channels, &[3], &NoCacheMaintenance),
            Err(ExecError::InvalidCore { core_id: 3, core_num: 1 })
        );
    }
}
