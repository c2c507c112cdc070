//! Runs a demo task graph on simulated AICore workers.
//!
//! ```text
//! aicpu-sim --variant multi --threads 3 --aic 3 --aiv 6 --graph layers --tasks 64
//! ```

use aicpu_sched::{
    config::RuntimeConfig,
    executor::{MultiThreadExecutor, RunReport, SingleThreadExecutor, StreamingExecutor},
    graph::{StreamingGraph, TaskGraph},
    handshake,
    logging,
    task::KernelRegistry,
    worker::{DispatchLog, SimulatedCluster, WorkerResults},
    CoreType, FuncId, TaskId,
};
use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::{info, warn};
use std::{
    hint,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};

const ACCUMULATE: FuncId = FuncId(0);
const BUSY_LOOP: FuncId = FuncId(1);

/// Width of a level of the `layers` graph.
const LAYER_WIDTH: usize = 4;

static CHECKSUM: AtomicU64 = AtomicU64::new(0);

fn accumulate(args: &[u64]) {
    CHECKSUM.fetch_add(args.iter().sum(), Ordering::Relaxed);
}

fn busy_loop(args: &[u64]) {
    let rounds = args.first().copied().unwrap_or(0);
    for _ in 0..rounds {
        hint::spin_loop();
    }
}

//======================================================================================================================
// Program Arguments
//======================================================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Variant {
    Single,
    Multi,
    Streaming,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Shape {
    Chain,
    Diamond,
    Layers,
}

#[derive(Debug)]
struct ProgramArguments {
    config: Option<PathBuf>,
    variant: Variant,
    shape: Shape,
    tasks: usize,
    matches: ArgMatches,
}

impl ProgramArguments {
    fn new() -> Result<Self> {
        let matches: ArgMatches = Command::new("aicpu-sim")
            .about("Runs a demo task graph on simulated AICore workers")
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(PathBuf))
                    .value_name("FILE")
                    .help("Sets the YAML runtime configuration"),
            )
            .arg(
                Arg::new("device")
                    .long("device")
                    .value_parser(clap::value_parser!(u32))
                    .value_name("ID")
                    .help("Sets the device id (0-15)"),
            )
            .arg(
                Arg::new("aic")
                    .long("aic")
                    .value_parser(clap::value_parser!(usize))
                    .value_name("N")
                    .help("Sets the number of cube workers"),
            )
            .arg(
                Arg::new("aiv")
                    .long("aiv")
                    .value_parser(clap::value_parser!(usize))
                    .value_name("N")
                    .help("Sets the number of vector workers"),
            )
            .arg(
                Arg::new("threads")
                    .long("threads")
                    .value_parser(clap::value_parser!(usize))
                    .value_name("N")
                    .help("Sets the number of scheduler threads"),
            )
            .arg(
                Arg::new("rendezvous-timeout-ms")
                    .long("rendezvous-timeout-ms")
                    .value_parser(clap::value_parser!(u64))
                    .value_name("MS")
                    .help("Sets the handshake timeout, 0 waits forever"),
            )
            .arg(
                Arg::new("run-timeout-ms")
                    .long("run-timeout-ms")
                    .value_parser(clap::value_parser!(u64))
                    .value_name("MS")
                    .help("Sets the idle timeout of a run, 0 waits forever"),
            )
            .arg(
                Arg::new("profiling")
                    .long("profiling")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enables per-task worker traces"),
            )
            .arg(
                Arg::new("variant")
                    .long("variant")
                    .value_parser(["single", "multi", "streaming"])
                    .default_value("single")
                    .help("Sets the scheduler variant"),
            )
            .arg(
                Arg::new("graph")
                    .long("graph")
                    .value_parser(["chain", "diamond", "layers"])
                    .default_value("diamond")
                    .help("Sets the demo graph"),
            )
            .arg(
                Arg::new("tasks")
                    .long("tasks")
                    .value_parser(clap::value_parser!(usize))
                    .value_name("N")
                    .default_value("16")
                    .help("Sets the number of tasks of chain and layers graphs"),
            )
            .get_matches();

        let variant = match matches.get_one::<String>("variant").map(String::as_str) {
            Some("multi") => Variant::Multi,
            Some("streaming") => Variant::Streaming,
            _ => Variant::Single,
        };
        let shape = match matches.get_one::<String>("graph").map(String::as_str) {
            Some("chain") => Shape::Chain,
            Some("layers") => Shape::Layers,
            _ => Shape::Diamond,
        };
        let tasks = matches.get_one::<usize>("tasks").copied().unwrap_or(16);
        if tasks == 0 {
            bail!("--tasks must be positive");
        }
        Ok(Self {
            config: matches.get_one::<PathBuf>("config").cloned(),
            variant,
            shape,
            tasks,
            matches,
        })
    }

    /// Configuration file (or defaults) with the command line applied on top.
    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let base = match &self.config {
            Some(path) => RuntimeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
            None => RuntimeConfig::default(),
        };
        let mut builder = base.into_builder();
        if let Some(&device_id) = self.matches.get_one::<u32>("device") {
            builder = builder.device_id(device_id);
        }
        if let Some(&aic_num) = self.matches.get_one::<usize>("aic") {
            builder = builder.aic_num(aic_num);
        }
        if let Some(&aiv_num) = self.matches.get_one::<usize>("aiv") {
            builder = builder.aiv_num(aiv_num);
        }
        if let Some(&thread_num) = self.matches.get_one::<usize>("threads") {
            builder = builder.thread_num(thread_num);
        }
        if let Some(&ms) = self.matches.get_one::<u64>("rendezvous-timeout-ms") {
            builder = builder.rendezvous_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if let Some(&ms) = self.matches.get_one::<u64>("run-timeout-ms") {
            builder = builder.run_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if self.matches.get_flag("profiling") {
            builder = builder.profiling(true);
        }
        Ok(builder.build()?)
    }
}

//======================================================================================================================
// Demo Graphs
//======================================================================================================================

#[derive(Debug)]
struct Node {
    func_id: FuncId,
    core_type: CoreType,
    args: Vec<u64>,
    deps: Vec<usize>,
}

fn alternate(index: usize) -> CoreType {
    if index % 2 == 0 {
        CoreType::Cube
    } else {
        CoreType::Vector
    }
}

/// Nodes in topological order; `deps` index earlier nodes.
fn demo_nodes(shape: Shape, tasks: usize) -> Vec<Node> {
    match shape {
        Shape::Diamond => vec![
            Node {
                func_id: ACCUMULATE,
                core_type: CoreType::Cube,
                args: vec![1],
                deps: vec![],
            },
            Node {
                func_id: BUSY_LOOP,
                core_type: CoreType::Vector,
                args: vec![1_000],
                deps: vec![0],
            },
            Node {
                func_id: BUSY_LOOP,
                core_type: CoreType::Vector,
                args: vec![2_000],
                deps: vec![0],
            },
            Node {
                func_id: ACCUMULATE,
                core_type: CoreType::Cube,
                args: vec![2, 3],
                deps: vec![1, 2],
            },
        ],
        Shape::Chain => (0..tasks)
            .map(|index| Node {
                func_id: ACCUMULATE,
                core_type: alternate(index),
                args: vec![index as u64],
                deps: index.checked_sub(1).into_iter().collect(),
            })
            .collect(),
        Shape::Layers => (0..tasks)
            .map(|index| {
                let layer = index / LAYER_WIDTH;
                let previous = layer.saturating_sub(1) * LAYER_WIDTH..layer * LAYER_WIDTH;
                Node {
                    func_id: if index % LAYER_WIDTH == 0 { ACCUMULATE } else { BUSY_LOOP },
                    core_type: alternate(index),
                    args: vec![index as u64 * 100],
                    deps: previous.collect(),
                }
            })
            .collect(),
    }
}

fn build_graph(nodes: &[Node]) -> Result<TaskGraph> {
    let mut graph = TaskGraph::new();
    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        let id = graph.add_task(&node.args, node.func_id, node.core_type)?;
        for &dep in &node.deps {
            graph.add_successor(ids[dep], id)?;
        }
        ids.push(id);
    }
    Ok(graph)
}

/// Submits `nodes` to `graph` while it runs, then seals it.
fn orchestrate(graph: &StreamingGraph, nodes: &[Node]) -> Result<()> {
    let mut ids: Vec<TaskId> = Vec::with_capacity(nodes.len());
    let result = nodes.iter().try_for_each(|node| {
        let deps: Vec<TaskId> = node.deps.iter().map(|&dep| ids[dep]).collect();
        ids.push(graph.submit(node.func_id, node.core_type, &node.args, &deps)?);
        Ok(())
    });
    graph.seal();
    result
}

fn check_workers(workers: WorkerResults) -> Result<usize> {
    let mut executed = 0;
    for worker in workers {
        executed += worker?.executed;
    }
    Ok(executed)
}

//======================================================================================================================
// main()
//======================================================================================================================

fn main() -> Result<()> {
    logging::initialize();
    let args = ProgramArguments::new()?;
    let config = args.runtime_config()?;
    let nodes = demo_nodes(args.shape, args.tasks);

    let channels = handshake::channels(config.aic_num, config.aiv_num);
    for channel in &channels {
        channel.set_profiling(config.profiling);
    }
    let mut kernels = KernelRegistry::new();
    kernels.register(ACCUMULATE, accumulate);
    kernels.register(BUSY_LOOP, busy_loop);
    let log = DispatchLog::new();
    let cluster = SimulatedCluster::new(&channels, &kernels).with_log(&log);

    info!(
        "device {}: {:?} scheduler, {:?} graph of {} task(s)",
        config.device_id,
        args.variant,
        args.shape,
        nodes.len()
    );
    let (report, workers): (Result<RunReport>, _) = match args.variant {
        Variant::Single => {
            let graph = build_graph(&nodes)?;
            let mut executor = SingleThreadExecutor::new(&channels, &config);
            cluster.run(&graph, || executor.run(&graph).map_err(anyhow::Error::from))
        }
        Variant::Multi => {
            let graph = build_graph(&nodes)?;
            let executor = MultiThreadExecutor::new(&channels, &config);
            cluster.run(&graph, || executor.run(&graph).map_err(anyhow::Error::from))
        }
        Variant::Streaming => {
            let graph = StreamingGraph::new();
            let executor = StreamingExecutor::new(&channels, &config);
            cluster.run(&graph, || {
                thread::scope(|scope| {
                    let orchestrator = scope.spawn(|| orchestrate(&graph, &nodes));
                    let report = executor.run(&graph);
                    match orchestrator.join() {
                        Ok(submitted) => submitted.and(report.map_err(anyhow::Error::from)),
                        Err(panic) => std::panic::resume_unwind(panic),
                    }
                })
            })
        }
    };
    let executed = check_workers(workers)?;
    let report = report?;
    if executed != report.completed {
        warn!("workers executed {executed} task(s), scheduler harvested {}", report.completed);
    }

    println!(
        "completed {}/{} task(s) on {} scheduler thread(s) in {:?}",
        report.completed, report.total, report.threads, report.elapsed
    );
    println!("start order: {:?}", log.start_order());
    println!("checksum: {}", CHECKSUM.load(Ordering::Relaxed));
    Ok(())
}
