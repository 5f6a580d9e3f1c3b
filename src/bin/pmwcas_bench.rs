#[cfg(not(feature = "shuttle"))]
use clap::Parser;
#[cfg(not(feature = "shuttle"))]
use pmwcas::{Competitor, Error, Operation, OperationEngine, PoolConfig, Target, Worker};
#[cfg(not(feature = "shuttle"))]
use std::path::PathBuf;
#[cfg(not(feature = "shuttle"))]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(not(feature = "shuttle"))]
use std::time::{Duration, Instant};
#[cfg(not(feature = "shuttle"))]
use tracing::{info, warn};

#[cfg(not(feature = "shuttle"))]
#[derive(Parser, Debug)]
#[command(name = "pmwcas_bench")]
#[command(about = "Throughput and latency benchmark of persistent multi-word CAS competitors")]
struct Cli {
    /// Directory holding one pool file per competitor
    #[arg(long)]
    pmem_dir: PathBuf,

    /// Strategy used to update the targeted words
    #[arg(short = 'c', long, value_enum, default_value = "pmwcas")]
    competitor: Competitor,

    /// Number of worker threads
    #[arg(short = 't', long, default_value = "8")]
    threads: usize,

    /// Operations executed by each thread
    #[arg(short = 'n', long, default_value = "100000")]
    operations: usize,

    /// Words updated together by one operation
    #[arg(short = 'k', long, default_value = "2")]
    targets: usize,

    /// Number of words in the pool
    #[arg(short = 'e', long, default_value = "1000000")]
    elements: usize,

    /// Zipf skew of the accessed positions; 0 is uniform
    #[arg(short = 's', long, default_value = "0")]
    skew: f64,

    /// Seed for position shuffling and operation generation
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Descriptor slots of the pool
    #[arg(long, default_value = "1024")]
    descriptor_slots: usize,

    /// Seconds after which the workers are stopped
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Measure per-operation latency instead of throughput
    #[arg(long)]
    latency: bool,

    /// Print results as CSV
    #[arg(long)]
    csv: bool,

    /// Recreate the pool with every word set to zero, then exit
    #[arg(long, conflicts_with = "show")]
    init: bool,

    /// Print the values of some sampled words, then exit
    #[arg(long)]
    show: bool,
}

/// What one worker did before it ran out of operations or was stopped.
#[cfg(not(feature = "shuttle"))]
#[derive(Debug, Default)]
struct WorkerResult {
    executed: usize,
    latencies: Vec<Duration>,
}

#[cfg(not(feature = "shuttle"))]
const PERCENTILES: [f64; 7] = [0.0, 0.5, 0.9, 0.95, 0.99, 0.999, 1.0];

/// Nearest-rank percentiles of `sorted`, which must be in ascending order.
#[cfg(not(feature = "shuttle"))]
fn percentiles(sorted: &[Duration]) -> Vec<(f64, Duration)> {
    if sorted.is_empty() {
        return Vec::new();
    }
    PERCENTILES
        .iter()
        .map(|&percentile| {
            let rank: usize = ((sorted.len() - 1) as f64 * percentile).round() as usize;
            (percentile, sorted[rank])
        })
        .collect()
}

#[cfg(not(feature = "shuttle"))]
fn run_worker(
    target: &Target,
    operations: &[Operation],
    measure_latency: bool,
    stop_flag: &AtomicBool,
) -> Result<WorkerResult, Error> {
    let worker: Worker = target.worker();
    let mut result: WorkerResult = WorkerResult::default();
    if measure_latency {
        result.latencies.reserve(operations.len());
    }
    for operation in operations {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        if measure_latency {
            let start: Instant = Instant::now();
            result.executed += worker.execute(operation)?;
            result.latencies.push(start.elapsed());
        } else {
            result.executed += worker.execute(operation)?;
        }
    }
    Ok(result)
}

/// Run every workload on its own thread. The workers are stopped once `timeout` has passed.
#[cfg(not(feature = "shuttle"))]
fn run_workers(
    target: &Target,
    workloads: &[Vec<Operation>],
    measure_latency: bool,
    timeout: Duration,
) -> Result<(WorkerResult, Duration, bool), Error> {
    let stop_flag: AtomicBool = AtomicBool::new(false);
    let running: AtomicUsize = AtomicUsize::new(workloads.len());
    let start: Instant = Instant::now();

    let (result, timed_out) = std::thread::scope(|scope| {
        let handles: Vec<_> = workloads
            .iter()
            .map(|operations| {
                let (stop_flag, running) = (&stop_flag, &running);
                scope.spawn(move || {
                    let result = run_worker(target, operations, measure_latency, stop_flag);
                    running.fetch_sub(1, Ordering::Release);
                    result
                })
            })
            .collect();

        let mut timed_out: bool = false;
        while running.load(Ordering::Acquire) > 0 {
            if start.elapsed() >= timeout {
                stop_flag.store(true, Ordering::Release);
                timed_out = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let result = handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .try_fold(WorkerResult::default(), |mut total, result| {
                let result: WorkerResult = result?;
                total.executed += result.executed;
                total.latencies.extend(result.latencies);
                Ok::<_, Error>(total)
            });
        (result, timed_out)
    });
    Ok((result?, start.elapsed(), timed_out))
}

#[cfg(not(feature = "shuttle"))]
fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli: Cli = Cli::parse();
    let config: PoolConfig = PoolConfig::new(cli.elements)
        .with_descriptor_slots(cli.descriptor_slots)
        .with_max_targets(cli.targets.max(1));
    let engine: OperationEngine = OperationEngine::new(cli.elements, cli.skew, cli.seed)?;

    if cli.init {
        let path: PathBuf = cli.pmem_dir.join(cli.competitor.layout_tag());
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let target: Target = Target::open(cli.competitor, &cli.pmem_dir, config)?;
        target.pool().sync()?;
        info!("initialized {} with {} zeroed words", path.display(), cli.elements);
        return Ok(());
    }

    let target: Target = Target::open(cli.competitor, &cli.pmem_dir, config)?;
    if cli.show {
        for operation in engine.generate(10, 1, cli.seed)? {
            if let Some(position) = operation.position(0) {
                println!("{position}: {}", target.value(position)?);
            }
        }
        return Ok(());
    }

    let workloads: Vec<Vec<Operation>> = (0..cli.threads as u64)
        .map(|thread| engine.generate(cli.operations, cli.targets, cli.seed + thread + 1))
        .collect::<Result<_, _>>()?;
    info!(
        "running {} operations of {} targets on {} threads with {:?}",
        cli.operations, cli.targets, cli.threads, cli.competitor
    );

    let (mut result, elapsed, timed_out) = run_workers(
        &target,
        &workloads,
        cli.latency,
        Duration::from_secs(cli.timeout),
    )?;
    if timed_out {
        warn!(
            "stopped the workers after {}s, {} operations were executed",
            cli.timeout, result.executed
        );
    }
    target.pool().sync()?;
    info!("executed {} operations in {elapsed:?}", result.executed);

    let tag: &str = cli.competitor.layout_tag();
    if cli.latency {
        result.latencies.sort_unstable();
        for (percentile, latency) in percentiles(&result.latencies) {
            if cli.csv {
                println!("{tag},{},{},{percentile},{}", cli.threads, cli.targets, latency.as_nanos());
            } else {
                println!("p{:<6} {:>10} ns", percentile * 100.0, latency.as_nanos());
            }
        }
    } else {
        let throughput: f64 = result.executed as f64 / elapsed.as_secs_f64();
        if cli.csv {
            println!("{tag},{},{},{},{throughput:.0}", cli.threads, cli.targets, cli.skew);
        } else {
            println!("{tag}: {throughput:.0} operations/s");
        }
    }
    Ok(())
}

#[cfg(feature = "shuttle")]
fn main() {
    eprintln!("pmwcas_bench needs file-backed pools, which are not available with the shuttle feature");
}
