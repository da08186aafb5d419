//! Multi-threaded pointer-chase co-runner.
//!
//! Several pinned threads each chase their own group of chains at the same
//! time, starting together behind a barrier, until the duration elapses or a
//! signal arrives. Chains are either carved out of one shared region
//! (optionally restricted to selected colors, or to pages matching an address
//! pattern) or built by each thread in a private region.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use pchase::region::CACHE_LINE_SIZE;
use pchase::{
    AccessKind, AddressResolver, BenchConfig, BenchContext, PageMatch, PartitionBuilder,
    PoolReport, Region, StopToken, WorkerPool, WorkerSpec, Workload,
};
use pchase_bench::{
    fatal, init_logging, parse_args, parse_int, report_pool, ColorArgs, CommonArgs, MemArgs,
};

/// Run concurrent pointer chases on several cores.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    mem: MemArgs,

    #[command(flatten)]
    colors: ColorArgs,

    /// Number of threads
    #[arg(short = 'n', long, default_value_t = 1)]
    threads: usize,

    /// Chains per thread
    #[arg(short = 'l', long, default_value_t = 6)]
    mlp: usize,

    /// Seconds to run (0 runs until interrupted)
    #[arg(short = 't', long, default_value_t = 5)]
    duration: u64,

    /// Steps per chain between checks of the stop flag
    #[arg(short, long, default_value_t = 1000)]
    iterations: u64,

    /// Access type
    #[arg(short, long, value_enum, default_value_t = AccessKind::Read)]
    access: AccessKind,

    /// Element size in bytes
    #[arg(short, long, default_value_t = 64)]
    unit: usize,

    /// Each thread maps and links its own region
    #[arg(short = 'o', long)]
    thread_local: bool,

    /// Build chains over pages whose address matches this pattern
    #[arg(long, value_parser = parse_int, conflicts_with = "thread_local")]
    page_match: Option<u64>,

    /// Number of low address bits compared against the page-match pattern
    #[arg(long, default_value_t = 17)]
    match_shift: u32,

    /// Elements per page-match chain
    #[arg(long, default_value_t = 32)]
    match_len: usize,

    /// Seed for the chain permutation
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Build the chains in one region and split them between the threads.
fn shared_chains(args: &Args) -> pchase::Result<(Arc<Region>, Vec<Vec<u32>>)> {
    let count = args.threads * args.mlp;
    if let Some(pattern) = args.page_match {
        let cfg = BenchConfig::new()
            .mem_size(args.mem.mem)
            .unit_size(args.unit)
            .hugepage(args.mem.hugepage);
        cfg.validate()?;
        let mut region = cfg.region_options().map()?;
        let mut resolver = AddressResolver::detect();
        let chains = PageMatch::new(pattern as usize, args.match_shift, args.match_len)
            .build(&mut region, &mut resolver, count)?;
        return Ok((Arc::new(region), chains.groups(args.mlp)));
    }

    let scheme = args.colors.scheme()?;
    args.colors.announce(&scheme);
    let cfg = BenchConfig::new()
        .mem_size(args.mem.mem)
        .unit_size(args.unit)
        .hugepage(args.mem.hugepage)
        .parallelism(count)
        .colors(args.colors.color_set())
        .scheme(scheme)
        .seed(args.seed);
    let (region, chains) = BenchContext::new(cfg)?.into_shared()?;
    Ok((region, chains.groups(args.mlp)))
}

fn run(args: &Args) -> pchase::Result<PoolReport> {
    if args.threads == 0 || args.mlp == 0 {
        return Err(pchase::PchaseError::InvalidConfiguration(
            "need at least one thread and one chain per thread".to_string()));
    }
    if let Some(nice) = args.common.nice {
        pchase::env::set_nice(nice);
    }
    let stop = StopToken::new();
    stop.install_signal_handlers()?;
    let cpu = args.common.cpu.unwrap_or(0);

    let mut pool = WorkerPool::new(stop.clone());
    if args.thread_local {
        let scheme = args.colors.scheme()?;
        args.colors.announce(&scheme);
        let cfg = BenchConfig::new()
            .mem_size(args.mem.mem)
            .unit_size(args.unit)
            .hugepage(args.mem.hugepage)
            .parallelism(args.mlp);
        cfg.validate()?;
        for i in 0..args.threads {
            let builder = PartitionBuilder::new(args.mlp)
                .seed(args.seed.wrapping_add(i as u64))
                .colors(args.colors.color_set())
                .scheme(scheme.clone());
            pool.add(WorkerSpec::new(format!("corun{}", i),
                    Workload::LocalChase { region: cfg.region_options(), builder })
                .cpu(cpu + i)
                .kind(args.access)
                .batch(args.iterations));
        }
    } else {
        let (region, groups) = shared_chains(args)?;
        for (i, cursors) in groups.into_iter().enumerate() {
            pool.add(WorkerSpec::new(format!("corun{}", i),
                    Workload::Chase { region: Arc::clone(&region), cursors })
                .cpu(cpu + i)
                .kind(args.access)
                .batch(args.iterations));
        }
    }

    info!("threads: {}, MLP: {}, {}, {} region(s)", args.threads, args.mlp, args.access,
        if args.thread_local { "private" } else { "shared" });
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
            report_pool(&report, CACHE_LINE_SIZE as u64);
            ExitCode::SUCCESS
        },
        Err(e) => fatal(e),
    }
}
