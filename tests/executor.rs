#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use aicpu_sched::{
    config::RuntimeConfig,
    error::ExecError,
    executor::{MultiThreadExecutor, RunReport, RunState, SingleThreadExecutor, StreamingExecutor},
    graph::{StreamingGraph, TaskGraph},
    handshake::{self, Handshake},
    task::{KernelRegistry, TaskStatus},
    worker::{DispatchLog, EventKind, SimulatedCluster, WorkerResults},
    CoreType, FuncId, TaskId,
};
use rstest::rstest;
use std::{thread, time::Duration};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Variant {
    Single,
    Multi,
    Streaming,
}

/// A task and the indices of the earlier tasks it depends on.
type Node<'a> = (CoreType, &'a [usize]);

fn noop(_: &[u64]) {}

fn kernels() -> KernelRegistry {
    let mut kernels = KernelRegistry::new();
    kernels.register(FuncId(0), noop);
    kernels
}

fn config(aic_num: usize, aiv_num: usize, thread_num: usize) -> RuntimeConfig {
    RuntimeConfig::builder()
        .aic_num(aic_num)
        .aiv_num(aiv_num)
        .thread_num(thread_num)
        .rendezvous_timeout(Some(Duration::from_secs(10)))
        .run_timeout(Some(Duration::from_secs(20)))
        .build()
        .unwrap()
}

fn build(nodes: &[Node<'_>]) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for (index, &(core_type, deps)) in nodes.iter().enumerate() {
        let id = graph.add_task(&[index as u64], FuncId(0), core_type).unwrap();
        for &dep in deps {
            graph.add_successor(TaskId(dep as u32), id).unwrap();
        }
    }
    graph
}

/// Runs `nodes` with `variant` on simulated workers. Task `i` of the graph is
/// always `TaskId(i)`.
fn run(
    variant: Variant,
    config: &RuntimeConfig,
    nodes: &[Node<'_>],
    log: &DispatchLog,
) -> (Result<RunReport, ExecError>, WorkerResults) {
    let channels = handshake::channels(config.aic_num, config.aiv_num);
    let kernels = kernels();
    let cluster = SimulatedCluster::new(&channels, &kernels).with_log(log);
    match variant {
        Variant::Single => {
            let graph = build(nodes);
            let mut executor = SingleThreadExecutor::new(&channels, config);
            let outcome = cluster.run(&graph, || executor.run(&graph));
            assert_eq!(executor.state(), RunState::Done);
            outcome
        }
        Variant::Multi => {
            let graph = build(nodes);
            let executor = MultiThreadExecutor::new(&channels, config);
            cluster.run(&graph, || executor.run(&graph))
        }
        Variant::Streaming => {
            let graph = StreamingGraph::new();
            let executor = StreamingExecutor::new(&channels, config);
            cluster.run(&graph, || {
                thread::scope(|scope| {
                    scope.spawn(|| {
                        for &(core_type, deps) in nodes {
                            let deps: Vec<TaskId> = deps.iter().map(|&dep| TaskId(dep as u32)).collect();
                            graph.submit(FuncId(0), core_type, &[], &deps).unwrap();
                        }
                        graph.seal();
                    });
                    executor.run(&graph)
                })
            })
        }
    }
}

fn executed(workers: WorkerResults) -> usize {
    workers.into_iter().map(|worker| worker.unwrap().executed).sum()
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 1)]
#[case::streaming(Variant::Streaming, 1)]
fn chain_on_one_cube_worker_runs_in_order(#[case] variant: Variant, #[case] thread_num: usize) {
    let log = DispatchLog::new();
    let nodes: [Node<'_>; 3] = [
        (CoreType::Cube, &[]),
        (CoreType::Cube, &[0]),
        (CoreType::Cube, &[1]),
    ];
    let (report, workers) = run(variant, &config(1, 0, thread_num), &nodes, &log);
    let report = report.unwrap();
    assert_eq!((report.completed, report.total), (3, 3));
    assert_eq!(log.start_order(), [TaskId(0), TaskId(1), TaskId(2)]);
    assert_eq!(executed(workers), 3);
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi_one_thread(Variant::Multi, 1)]
#[case::multi_two_threads(Variant::Multi, 2)]
#[case::streaming(Variant::Streaming, 2)]
fn diamond_joins_after_both_branches(#[case] variant: Variant, #[case] thread_num: usize) {
    //      A(cube)
    //     /       \
    //  B(vec)   C(vec)
    //     \       /
    //      D(cube)
    let log = DispatchLog::new();
    let nodes: [Node<'_>; 4] = [
        (CoreType::Cube, &[]),
        (CoreType::Vector, &[0]),
        (CoreType::Vector, &[0]),
        (CoreType::Cube, &[1, 2]),
    ];
    let (report, workers) = run(variant, &config(2, 2, thread_num), &nodes, &log);
    assert_eq!(report.unwrap().completed, 4);
    assert_eq!(executed(workers), 4);

    let d_start = log.seq_of(EventKind::Start, TaskId(3)).unwrap();
    for branch in [TaskId(1), TaskId(2)] {
        assert!(log.seq_of(EventKind::End, branch).unwrap() < d_start);
    }
    for id in 0..4 {
        assert_eq!(log.executions(TaskId(id)), 1);
    }
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 2)]
#[case::streaming(Variant::Streaming, 2)]
fn tasks_only_reach_workers_of_their_type(#[case] variant: Variant, #[case] thread_num: usize) {
    let log = DispatchLog::new();
    let nodes: Vec<Node<'_>> = (0..24)
        .map(|i| {
            let core_type = if i % 3 == 0 { CoreType::Cube } else { CoreType::Vector };
            let deps: &[usize] = if i >= 4 { &[0, 1, 2, 3] } else { &[] };
            (core_type, deps)
        })
        .collect();
    let (report, workers) = run(variant, &config(2, 4, thread_num), &nodes, &log);
    assert_eq!(report.unwrap().completed, nodes.len());
    assert_eq!(executed(workers), nodes.len());

    for event in log.events() {
        assert_eq!(event.core_type, nodes[event.task.index()].0);
        let expected_pool = if event.core_id < 2 { CoreType::Cube } else { CoreType::Vector };
        assert_eq!(event.core_type, expected_pool);
    }
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 3)]
#[case::streaming(Variant::Streaming, 3)]
fn empty_graph_only_handshakes(#[case] variant: Variant, #[case] thread_num: usize) {
    let log = DispatchLog::new();
    let (report, workers) = run(variant, &config(3, 3, thread_num), &[], &log);
    let report = report.unwrap();
    assert_eq!((report.completed, report.total), (0, 0));
    assert_eq!(executed(workers), 0);
    assert!(log.is_empty());
}

#[test]
fn empty_graph_channels_are_acknowledged_then_told_to_quit() {
    let channels = handshake::channels(1, 2);
    let kernels = kernels();
    let graph = TaskGraph::new();
    let mut executor = SingleThreadExecutor::new(&channels, &config(1, 2, 1));
    let (report, _) = SimulatedCluster::new(&channels, &kernels).run(&graph, || executor.run(&graph));
    assert_eq!(report.unwrap().completed, 0);
    for (core_id, channel) in channels.iter().enumerate() {
        assert_eq!(channel.acknowledgement(), Some(core_id as u32 + 1));
        assert!(channel.quit_requested());
    }
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 4)]
#[case::streaming(Variant::Streaming, 4)]
fn wide_join_is_released_exactly_once(#[case] variant: Variant, #[case] thread_num: usize) {
    const ROOTS: usize = 64;
    let roots: Vec<usize> = (0..ROOTS).collect();
    let no_deps: &[usize] = &[];
    for _ in 0..10 {
        let log = DispatchLog::new();
        let mut nodes: Vec<Node<'_>> = (0..ROOTS)
            .map(|i| {
                let core_type = if i % 2 == 0 { CoreType::Cube } else { CoreType::Vector };
                (core_type, no_deps)
            })
            .collect();
        nodes.push((CoreType::Vector, &roots));
        let (report, workers) = run(variant, &config(4, 4, thread_num), &nodes, &log);
        assert_eq!(report.unwrap().completed, ROOTS + 1);
        assert_eq!(executed(workers), ROOTS + 1);
        let sink = TaskId(ROOTS as u32);
        assert_eq!(log.executions(sink), 1);
        let sink_start = log.seq_of(EventKind::Start, sink).unwrap();
        assert!((0..ROOTS).all(|root| log.seq_of(EventKind::End, TaskId(root as u32)).unwrap() < sink_start));
    }
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 2)]
#[case::streaming(Variant::Streaming, 2)]
fn every_task_starts_after_its_producers_end(#[case] variant: Variant, #[case] thread_num: usize) {
    // Layers of four, each task depending on the whole previous layer.
    let layers: Vec<Vec<usize>> = (0..8)
        .map(|layer: usize| (layer.saturating_sub(1) * 4..layer * 4).collect())
        .collect();
    let nodes: Vec<Node<'_>> = (0..32)
        .map(|i| {
            let core_type = if i % 2 == 0 { CoreType::Cube } else { CoreType::Vector };
            (core_type, layers[i / 4].as_slice())
        })
        .collect();
    let log = DispatchLog::new();
    let (report, workers) = run(variant, &config(2, 2, thread_num), &nodes, &log);
    assert_eq!(report.unwrap().completed, nodes.len());
    assert_eq!(executed(workers), nodes.len());

    for (i, &(_, deps)) in nodes.iter().enumerate() {
        let id = TaskId(i as u32);
        assert_eq!(log.executions(id), 1);
        let start = log.seq_of(EventKind::Start, id).unwrap();
        for &dep in deps {
            assert!(log.seq_of(EventKind::End, TaskId(dep as u32)).unwrap() < start);
        }
    }
}

#[rstest]
#[case::single(Variant::Single, 1)]
#[case::multi(Variant::Multi, 2)]
#[case::streaming(Variant::Streaming, 2)]
fn silent_worker_times_out_the_rendezvous(#[case] variant: Variant, #[case] thread_num: usize) {
    let config = RuntimeConfig::builder()
        .aic_num(2)
        .aiv_num(2)
        .thread_num(thread_num)
        .rendezvous_timeout(Some(Duration::from_millis(100)))
        .run_timeout(Some(Duration::from_secs(5)))
        .build()
        .unwrap();
    let channels = handshake::channels(2, 2);
    let kernels = kernels();
    let cluster = SimulatedCluster::new(&channels, &kernels).silence(1);
    let mut graph = TaskGraph::new();
    graph.add_task(&[], FuncId(0), CoreType::Cube).unwrap();

    let (result, workers) = match variant {
        Variant::Single => {
            let mut executor = SingleThreadExecutor::new(&channels, &config);
            cluster.run(&graph, || executor.run(&graph))
        }
        Variant::Multi => {
            let executor = MultiThreadExecutor::new(&channels, &config);
            cluster.run(&graph, || executor.run(&graph))
        }
        Variant::Streaming => {
            let streaming = StreamingGraph::new();
            streaming.submit(FuncId(0), CoreType::Cube, &[], &[]).unwrap();
            streaming.seal();
            let executor = StreamingExecutor::new(&channels, &config);
            cluster.run(&streaming, || executor.run(&streaming))
        }
    };
    assert_eq!(result.unwrap_err(), ExecError::RendezvousTimeout { core_id: 1 });
    assert_eq!(workers.len(), 3);
    assert!(workers.into_iter().all(|worker| worker.is_ok()));
}

#[test]
fn single_thread_graph_runs_again_after_reset() {
    let channels = handshake::channels(1, 1);
    let kernels = kernels();
    let log = DispatchLog::new();
    let graph = build(&[(CoreType::Cube, &[]), (CoreType::Vector, &[0])]);
    let mut executor = SingleThreadExecutor::new(&channels, &config(1, 1, 1));
    let cluster = SimulatedCluster::new(&channels, &kernels).with_log(&log);

    let (first, _) = cluster.run(&graph, || executor.run(&graph));
    assert_eq!(first.unwrap().completed, 2);
    assert_eq!(graph.get_task(TaskId(1)).unwrap().status(), TaskStatus::Complete);

    graph.reset();
    assert_eq!(graph.get_task(TaskId(1)).unwrap().fanin(), 1);
    log.clear();
    let (second, _) = cluster.run(&graph, || executor.run(&graph));
    assert_eq!(second.unwrap().completed, 2);
    assert_eq!(log.start_order(), [TaskId(0), TaskId(1)]);
}

#[test]
fn multi_thread_run_leaves_the_graph_ready_for_the_next_one() {
    let channels = handshake::channels(2, 2);
    let kernels = kernels();
    let graph = build(&[
        (CoreType::Cube, &[]),
        (CoreType::Vector, &[0]),
        (CoreType::Cube, &[0]),
        (CoreType::Vector, &[1, 2]),
    ]);
    let executor = MultiThreadExecutor::new(&channels, &config(2, 2, 2));
    let cluster = SimulatedCluster::new(&channels, &kernels);
    for _ in 0..3 {
        let (report, workers) = cluster.run(&graph, || executor.run(&graph));
        assert_eq!(report.unwrap().completed, 4);
        assert_eq!(executed(workers), 4);
        assert!(graph.tasks().all(|task| task.status() == TaskStatus::Pending));
        assert_eq!(graph.get_task(TaskId(3)).unwrap().fanin(), 2);
    }
}

#[test]
fn streaming_run_drains_while_the_orchestrator_submits() {
    let config = config(2, 2, 2);
    let channels = handshake::channels(2, 2);
    let kernels = kernels();
    let log = DispatchLog::new();
    let graph = StreamingGraph::with_capacity(512);
    let executor = StreamingExecutor::new(&channels, &config);

    let (report, workers) = SimulatedCluster::new(&channels, &kernels)
        .with_log(&log)
        .run(&graph, || {
            thread::scope(|scope| {
                scope.spawn(|| {
                    let mut previous: Vec<TaskId> = Vec::new();
                    for i in 0..500u32 {
                        let core_type = if i % 2 == 0 { CoreType::Cube } else { CoreType::Vector };
                        let id = graph.submit(FuncId(0), core_type, &[u64::from(i)], &previous).unwrap();
                        previous = vec![id];
                        if i % 50 == 0 {
                            thread::yield_now();
                        }
                    }
                    graph.seal();
                });
                executor.run(&graph)
            })
        });
    let report = report.unwrap();
    assert_eq!((report.completed, report.total), (500, 500));
    assert_eq!(executed(workers), 500);
    let stats = graph.stats();
    assert_eq!((stats.completed, stats.retired), (500, 500));
    assert!(graph.is_finished());
    let order = log.start_order();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn streaming_run_times_out_without_seal() {
    let config = RuntimeConfig::builder()
        .aic_num(1)
        .aiv_num(1)
        .run_timeout(Some(Duration::from_millis(500)))
        .build()
        .unwrap();
    let channels = handshake::channels(1, 1);
    let kernels = kernels();
    let graph = StreamingGraph::new();
    graph.submit(FuncId(0), CoreType::Vector, &[], &[]).unwrap();
    let executor = StreamingExecutor::new(&channels, &config);
    let (result, _) = SimulatedCluster::new(&channels, &kernels).run(&graph, || executor.run(&graph));
    assert_eq!(
        result.unwrap_err(),
        ExecError::RunTimeout {
            completed: 1,
            total: 1
        }
    );
}

#[test]
fn too_few_channels_are_rejected_before_running() {
    let channels: Vec<Handshake> = handshake::channels(1, 1);
    let graph = build(&[(CoreType::Cube, &[])]);
    let executor = MultiThreadExecutor::new(&channels, &config(2, 2, 2));
    assert!(matches!(executor.run(&graph), Err(ExecError::InvalidCore { .. })));
}

const NAP: FuncId = FuncId(1);

fn nap(args: &[u64]) {
    thread::sleep(Duration::from_millis(args.first().copied().unwrap_or(0)));
}

#[rstest]
#[case::multi_idle_vector_thread(Variant::Multi, 1, 1)]
#[case::multi_thread_without_cores(Variant::Multi, 1, 0)]
#[case::streaming_idle_vector_thread(Variant::Streaming, 1, 1)]
#[case::streaming_thread_without_cores(Variant::Streaming, 1, 0)]
fn idle_thread_waits_while_another_thread_progresses(
    #[case] variant: Variant,
    #[case] aic_num: usize,
    #[case] aiv_num: usize,
) {
    // Thread 0 owns the only cube core and works through a chain that lasts
    // well past `run_timeout`; thread 1 never has anything to dispatch.
    const TASKS: usize = 8;
    const NAP_MS: u64 = 60;
    let config = RuntimeConfig::builder()
        .aic_num(aic_num)
        .aiv_num(aiv_num)
        .thread_num(2)
        .rendezvous_timeout(Some(Duration::from_secs(10)))
        .run_timeout(Some(Duration::from_millis(300)))
        .build()
        .unwrap();
    let channels = handshake::channels(aic_num, aiv_num);
    let mut kernels = kernels();
    kernels.register(NAP, nap);
    let cluster = SimulatedCluster::new(&channels, &kernels);

    let (report, workers) = match variant {
        Variant::Multi => {
            let mut graph = TaskGraph::new();
            let mut previous = None;
            for _ in 0..TASKS {
                let id = graph.add_task(&[NAP_MS], NAP, CoreType::Cube).unwrap();
                if let Some(previous) = previous {
                    graph.add_successor(previous, id).unwrap();
                }
                previous = Some(id);
            }
            let executor = MultiThreadExecutor::new(&channels, &config);
            cluster.run(&graph, || executor.run(&graph))
        }
        Variant::Streaming => {
            let graph = StreamingGraph::new();
            let executor = StreamingExecutor::new(&channels, &config);
            cluster.run(&graph, || {
                thread::scope(|scope| {
                    scope.spawn(|| {
                        let mut previous: Vec<TaskId> = Vec::new();
                        for _ in 0..TASKS {
                            let id = graph.submit(NAP, CoreType::Cube, &[NAP_MS], &previous).unwrap();
                            previous = vec![id];
                        }
                        graph.seal();
                    });
                    executor.run(&graph)
                })
            })
        }
        Variant::Single => unreachable!("one thread owns every core"),
    };
    let report = report.unwrap();
    assert_eq!((report.completed, report.total), (TASKS, TASKS));
    assert!(report.elapsed > Duration::from_millis(300));
    assert_eq!(executed(workers), TASKS);
}

#[rstest]
#[case::single(Variant::Single)]
#[case::multi(Variant::Multi)]
fn graph_needing_a_missing_pool_is_rejected_up_front(#[case] variant: Variant) {
    let channels = handshake::channels(0, 2);
    let config = config(0, 2, 1);
    let graph = build(&[(CoreType::Vector, &[]), (CoreType::Cube, &[0])]);
    let result = match variant {
        Variant::Single => SingleThreadExecutor::new(&channels, &config).run(&graph),
        Variant::Multi => MultiThreadExecutor::new(&channels, &config).run(&graph),
        Variant::Streaming => unreachable!("streaming graphs grow during the run"),
    };
    assert_eq!(
        result.unwrap_err(),
        ExecError::UnservedCoreType {
            core_type: CoreType::Cube
        }
    );
    // Nothing was dispatched or handshaked.
    assert!(graph.tasks().all(|task| task.status() == TaskStatus::Pending));
    assert!(channels.iter().all(|channel| !channel.ready_signalled()));
}

#[test]
fn streaming_task_without_a_pool_fails_the_run() {
    let config = config(0, 1, 1);
    let channels = handshake::channels(0, 1);
    let kernels = kernels();
    let graph = StreamingGraph::new();
    let vector = graph.submit(FuncId(0), CoreType::Vector, &[], &[]).unwrap();
    graph.submit(FuncId(0), CoreType::Cube, &[], &[vector]).unwrap();
    graph.seal();
    let executor = StreamingExecutor::new(&channels, &config);
    let (result, workers) = SimulatedCluster::new(&channels, &kernels).run(&graph, || executor.run(&graph));
    assert_eq!(
        result.unwrap_err(),
        ExecError::UnservedCoreType {
            core_type: CoreType::Cube
        }
    );
    // The vector producer ran before its cube consumer became ready.
    assert_eq!(executed(workers), 1);
}
