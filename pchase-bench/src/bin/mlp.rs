//! Single-threaded interleaved pointer chase.
//!
//! `P` chains built over one region are advanced together, one load per
//! chain per step, so up to `P` misses can be outstanding at once. With
//! `--color` the chains only use elements in the selected DRAM banks.

use std::process::ExitCode;

use clap::Parser;
use log::{debug, info};

use pchase::{
    AccessKind, Accelerator, BenchConfig, BenchContext, HostAccelerator, RunSummary,
};
use pchase_bench::{
    fatal, init_logging, parse_args, report_run, setup_process, ColorArgs, CommonArgs,
    MemArgs,
};

/// Measure latency and bandwidth of interleaved pointer chasing.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    mem: MemArgs,

    #[command(flatten)]
    colors: ColorArgs,

    /// Element size in bytes
    #[arg(short, long, default_value_t = 64)]
    unit: usize,

    /// Access type
    #[arg(short, long, value_enum, default_value_t = AccessKind::Read)]
    access: AccessKind,

    /// Memory-level parallelism (number of interleaved chains)
    #[arg(short = 'l', long, default_value_t = 1)]
    mlp: usize,

    /// Laps over each chain
    #[arg(short, long, default_value_t = 100)]
    iterations: u64,

    /// Seed for the chain permutation
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Check that every chain is a closed, disjoint cycle before measuring
    #[arg(long)]
    verify: bool,

    /// Run the write-then-follow kernel through the accelerator interface
    #[arg(long)]
    accel: bool,
}

fn run(args: &Args) -> pchase::Result<RunSummary> {
    setup_process(&args.common)?;

    let scheme = args.colors.scheme()?;
    args.colors.announce(&scheme);
    let cfg = BenchConfig::new()
        .mem_size(args.mem.mem)
        .hugepage(args.mem.hugepage)
        .unit_size(args.unit)
        .kind(args.access)
        .parallelism(args.mlp)
        .iterations(args.iterations)
        .colors(args.colors.color_set())
        .scheme(scheme)
        .seed(args.seed);
    info!("size: {} ({} KB), unit {}, mlp {}, {}",
        cfg.mem_size, cfg.mem_size / 1024, cfg.unit_size, cfg.parallelism, cfg.kind);

    let ctx = BenchContext::new(cfg)?;
    let chains = ctx.chains()?;
    for (idx, head) in chains.heads().iter().enumerate() {
        debug!("list[{}] {:#018x}", idx, ctx.region().vaddr(*head as usize));
    }
    if args.verify {
        chains.verify(ctx.region())?;
        info!("verified {} chain(s) of {}", chains.num_chains(), chains.chain_len());
    }

    if args.accel {
        let mut acc = HostAccelerator;
        let mut next = chains.cursors();
        let steps = ctx.outer_steps()?;
        let elapsed = acc.run_write_follow(ctx.region(), &mut next, steps)?;
        info!("{} accelerator ran {} steps", acc.name(), steps);
        return Ok(RunSummary::new(elapsed, steps * next.len() as u64,
            ctx.config().bytes_per_access));
    }
    ctx.run()
}

fn main() -> ExitCode {
    let args: Args = parse_args();
    init_logging(args.common.debug);
    match run(&args) {
        Ok(summary) => {
            report_run(&summary);
            ExitCode::SUCCESS
        },
        Err(e) => fatal(e),
    }
}
