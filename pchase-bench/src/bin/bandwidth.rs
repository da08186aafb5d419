//! Multi-threaded sequential bandwidth hog.
//!
//! Each thread sweeps a region at cache-line stride, reading or writing one
//! byte per line, until the duration elapses, a signal arrives, or its job
//! completes.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use pchase::region::CACHE_LINE_SIZE;
use pchase::{
    AccessKind, Bound, PoolReport, RegionOptions, StopToken, WorkerPool, WorkerSpec,
    Workload,
};
use pchase_bench::{fatal, init_logging, parse_args, parse_size, report_pool, CommonArgs};

/// Generate sequential memory traffic from several cores.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Region size: a bare number is in KiB, or use a K/M/G suffix
    #[arg(short, long, value_parser = parse_size, default_value = "8192")]
    mem: usize,

    /// Back the region with hugetlb pages
    #[arg(short = 'x', long)]
    hugepage: bool,

    /// Access type
    #[arg(short, long, value_enum, default_value_t = AccessKind::Read)]
    access: AccessKind,

    /// Number of threads
    #[arg(short = 'n', long, default_value_t = 1)]
    threads: usize,

    /// Seconds to run (0 runs until interrupted)
    #[arg(short = 't', long, default_value_t = 5)]
    duration: u64,

    /// Sweeps per job (0 sweeps until stopped)
    #[arg(short, long, default_value_t = 0)]
    iterations: u64,

    /// Number of jobs of `iterations` sweeps each
    #[arg(short, long, default_value_t = 0)]
    jobs: u64,

    /// Real-time priority (SCHED_FIFO, 1-99)
    #[arg(short = 'r', long)]
    rt_priority: Option<u8>,

    /// Each thread maps its own region
    #[arg(short = 'o', long = "local")]
    thread_local: bool,
}

impl Args {
    /// Sweeps per batch and the number of batches.
    fn schedule(&self) -> (u64, Bound) {
        if self.iterations == 0 {
            (1, Bound::Unbounded)
        } else {
            (self.iterations, Bound::Batches(self.jobs.max(1)))
        }
    }
}

fn run(args: &Args) -> pchase::Result<PoolReport> {
    if args.threads == 0 {
        return Err(pchase::PchaseError::InvalidConfiguration(
            "need at least one thread".to_string()));
    }
    if let Some(nice) = args.common.nice {
        pchase::env::set_nice(nice);
    }
    let opts = RegionOptions::new(args.mem, CACHE_LINE_SIZE).hugepage(args.hugepage);
    let shared = match args.thread_local {
        true => None,
        false => Some(Arc::new(opts.map()?)),
    };
    info!("mem={} KB ({}), type={}, nthreads={} cpuid={}, iterations={}, jobs={}",
        args.mem / 1024, if args.thread_local { "private" } else { "shared" },
        args.access, args.threads, args.common.cpu.unwrap_or(0), args.iterations, args.jobs);

    let stop = StopToken::new();
    stop.install_signal_handlers()?;
    let (batch, bound) = args.schedule();
    let cpu = args.common.cpu.unwrap_or(0);
    let mut pool = WorkerPool::new(stop.clone())
        .realtime(args.rt_priority);
    for i in 0..args.threads {
        let workload = match &shared {
            Some(r) => Workload::Sweep(Arc::clone(r)),
            None => Workload::LocalSweep(opts),
        };
        pool.add(WorkerSpec::new(format!("bw{}", i), workload)
            .cpu(cpu + i)
            .kind(args.access)
            .batch(batch)
            .bound(bound));
    }

    let running = pool.start()?;
    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    if running.wait(limit) {
        info!("stop at {}", args.duration);
    }
    running.join()
}

fn main() -> ExitCode {
    let args: Args = parse_args();
    init_logging(args.common.debug);
    match run(&args) {
        Ok(report) => {
            report_pool(&report, CACHE_LINE_SIZE as u64);
            ExitCode::SUCCESS
        },
        Err(e) => fatal(e),
    }
}
