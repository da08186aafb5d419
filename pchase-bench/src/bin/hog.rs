//! CPU hog: spins on one or more cores without touching memory.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::info;

use pchase::{PoolReport, StopToken, WorkerPool, WorkerSpec, Workload};
use pchase_bench::{fatal, init_logging, parse_args, CommonArgs};

/// Occupy cores with a busy loop.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of spinning threads
    #[arg(short = 'n', long, default_value_t = 1)]
    threads: usize,

    /// Seconds to run (0 runs until interrupted)
    #[arg(short = 't', long, default_value_t = 0)]
    duration: u64,

    /// Real-time priority (SCHED_FIFO, 1-99)
    #[arg(short = 'r', long)]
    rt_priority: Option<u8>,
}

fn run(args: &Args) -> pchase::Result<PoolReport> {
    if args.threads == 0 {
        return Err(pchase::PchaseError::InvalidConfiguration(
            "need at least one thread".to_string()));
    }
    if let Some(nice) = args.common.nice {
        pchase::env::set_nice(nice);
    }
    let stop = StopToken::new();
    stop.install_signal_handlers()?;

    let mut pool = WorkerPool::new(stop.clone())
        .synchronized(false)
        .realtime(args.rt_priority);
    for i in 0..args.threads {
        let mut spec = WorkerSpec::new(format!("hog{}", i), Workload::Spin).batch(1 << 20);
        if let Some(cpu) = args.common.cpu {
            spec = spec.cpu(cpu + i);
        }
        pool.add(spec);
    }

    let running = pool.start()?;
    let limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    if !running.wait(limit) {
        info!("got a signal to quit");
    }
    running.join()
}

fn main() -> ExitCode {
    let args: Args = parse_args();
    init_logging(args.common.debug);
    match run(&args) {
        Ok(report) => {
            for (name, count) in report.names.iter().zip(&report.counts) {
                println!("[*] {} count={}", name, count);
            }
            println!("[*] elapsed = {:.2} sec", report.elapsed.as_secs_f64());
            ExitCode::SUCCESS
        },
        Err(e) => fatal(e),
    }
}
