//! Task-graph runtime for a heterogeneous accelerator: AICPU scheduler threads
//! dispatch a DAG of tasks to two pools of AICore workers (cube and vector)
//! over per-core shared-memory handshake channels.
//!
//! The scheduler:
//! - Tracks dependencies with atomic per-task `fanin` counters. A task becomes
//!   ready on the exact 1 → 0 transition of its counter, so it is enqueued once
//!   no matter how many predecessors complete concurrently.
//! - Routes every ready task into the FIFO queue of its core type; a channel
//!   only ever pops from the queue of its own core type.
//! - Talks to each worker through a fixed-layout [`Handshake`] record using
//!   acquire/release handoffs: the worker observes the task before it sees the
//!   channel busy, and the scheduler observes the worker's effects before it
//!   releases any successor.
//!
//! Key modules:
//! - `graph`: the fixed [`TaskGraph`] and the growing
//!   [`StreamingGraph`](graph::StreamingGraph) whose tasks are submitted while
//!   earlier ones run.
//! - `handshake`: the channel record, rendezvous and shutdown.
//! - `executor`: single-threaded, multi-threaded and streaming schedulers.
//! - `worker`: software workers that follow the channel protocol, used for
//!   simulation and tests.
//! - `launch`: the launch blob and per-thread kernel entry points.
//!
//! Quick start:
//! 1. Build a [`TaskGraph`] with `add_task` and `add_successor`.
//! 2. Allocate channels with [`handshake::channels`] and get workers polling
//!    them (on hardware, the AICore kernels; otherwise a
//!    [`SimulatedCluster`](worker::SimulatedCluster)).
//! 3. Run a [`SingleThreadExecutor`](executor::SingleThreadExecutor) or a
//!    [`MultiThreadExecutor`](executor::MultiThreadExecutor) with a
//!    [`RuntimeConfig`](config::RuntimeConfig).

/// Runtime configuration: defaults, builder, YAML loading and validation, and
/// the partition of cores among scheduler threads.
pub mod config;
/// Error types of graph construction, configuration and execution.
pub mod error;
/// Schedulers.
///
/// All variants share one harvest/dispatch loop over their cores: harvest a
/// completion, release the successors, refill the channel from the ready queue
/// of its core type.
pub mod executor;
/// Task graphs.
pub mod graph;
/// Per-core scheduler/worker handshake channels.
pub mod handshake;
/// Launch blob and scheduler kernel entry points.
pub mod launch;
/// Global logger setup.
pub mod logging;
/// Per-core-type ready queues.
pub mod router;
/// Test-and-test-and-set spinlock.
pub mod spinlock;
mod sync;
/// Task descriptors, status tracking and the kernel registry.
pub mod task;
/// Ids, handles and shared aliases.
pub mod types;
mod utils;
/// Simulated AICore workers.
pub mod worker;

pub use crate::{
    graph::TaskGraph,
    handshake::Handshake,
    types::{CoreType, FuncId, TaskHandle, TaskId},
};
