//! Command-line plumbing shared by the measurement programs.

use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, ValueEnum};
use log::info;

use pchase::{ColorScheme, ColorSet, PoolReport, RunSummary};

/// Options accepted by every program.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Diagnostic verbosity (0: info, 1: debug, 2 and up: trace)
    #[arg(short, long, default_value_t = 0)]
    pub debug: u8,

    /// Pin the process (or the first worker) to this CPU
    #[arg(short, long)]
    pub cpu: Option<usize>,

    /// Nice value for the process
    #[arg(short = 'p', long, allow_negative_numbers = true)]
    pub nice: Option<i32>,
}

/// Options describing the memory region.
#[derive(Args, Debug, Clone)]
pub struct MemArgs {
    /// Region size: a bare number is in KiB, or use a K/M/G suffix
    #[arg(short, long, value_parser = parse_size, default_value = "16384")]
    pub mem: usize,

    /// Back the region with hugetlb pages
    #[arg(short = 'x', long)]
    pub hugepage: bool,
}

/// Hard-wired bank function sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Four XOR functions of a Coffee Lake DDR4 system
    Coffeelake,
}

/// Options selecting a color scheme and the colors to keep.
#[derive(Args, Debug, Clone)]
pub struct ColorArgs {
    /// Keep only elements of this color (repeatable); none keeps everything
    #[arg(short = 'e', long = "color")]
    pub colors: Vec<usize>,

    /// Bank bitmask (default 0x7800)
    #[arg(short, long, value_parser = parse_int, conflicts_with_all = ["mapping", "preset"])]
    pub bitmask: Option<u64>,

    /// File of bank XOR functions, one per line
    #[arg(long, conflicts_with = "preset")]
    pub mapping: Option<PathBuf>,

    /// Use a built-in set of bank functions
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,
}

impl ColorArgs {
    pub fn scheme(&self) -> pchase::Result<ColorScheme> {
        Ok(match (&self.bitmask, &self.mapping, &self.preset) {
            (Some(mask), _, _) => ColorScheme::Bitmask(*mask),
            (_, Some(path), _) => ColorScheme::from_mapping_file(path)?,
            (_, _, Some(Preset::Coffeelake)) => ColorScheme::coffeelake(),
            _ => ColorScheme::default(),
        })
    }

    pub fn color_set(&self) -> ColorSet {
        self.colors.iter().copied().collect()
    }

    /// Log the scheme and selection the way the programs announce them.
    pub fn announce(&self, scheme: &ColorScheme) {
        let colors = self.color_set();
        if colors.accepts_all() {
            info!("no coloring");
            return;
        }
        info!("bank scheme: {}", scheme);
        let bits: Vec<String> = scheme.bits().iter().map(|b| b.to_string()).collect();
        info!("bank bits: {}", bits.join(","));
        info!("total number of colors: {}", scheme.num_colors());
        info!("selected colors: {}", colors);
    }
}

/// Parse an integer in C notation (`0x` hex, leading `0` octal, or decimal).
pub fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let res = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8)
    } else {
        s.parse()
    };
    res.map_err(|e| format!("'{}': {}", s, e))
}

pub fn parse_size(s: &str) -> Result<usize, String> {
    pchase::parse_mem_size(s).map_err(|e| e.to_string())
}

/// Parse the command line. Usage errors exit with status 1, while `--help`
/// and `--version` exit with status 0.
pub fn parse_args<T: Parser>() -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        },
    }
}

/// Install the logger. `RUST_LOG` takes precedence over `debug`.
pub fn init_logging(debug: u8) {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// Apply the process-wide pinning and nice value.
pub fn setup_process(common: &CommonArgs) -> pchase::Result<()> {
    if let Some(cpu) = common.cpu {
        pchase::env::pin_to_core(cpu)?;
    }
    if let Some(nice) = common.nice {
        pchase::env::set_nice(nice);
    }
    Ok(())
}

/// Report a fatal error and produce the failing exit status.
pub fn fatal(e: impl Display) -> ExitCode {
    eprintln!("[!] {}", e);
    ExitCode::FAILURE
}

/// Print the result of a single-threaded run.
pub fn report_run(s: &RunSummary) {
    for line in s.to_string().lines() {
        println!("[*] {}", line);
    }
}

/// Print per-worker and aggregate results of a pool run.
pub fn report_pool(report: &PoolReport, bytes_per_access: u64) {
    for (name, s) in report.names.iter().zip(report.summaries(bytes_per_access)) {
        println!("[*] {:<12} #access {:>14} {:>10.2} MB/s", name, s.accesses, s.bandwidth_mbps());
    }
    let total = report.summary(bytes_per_access);
    println!("[*] bytes accessed = {} ({})", total.bytes(), pchase::format_size(total.bytes()));
    println!("[*] elapsed = {:.2} sec", total.elapsed.as_secs_f64());
    println!("[*] Total B/W = {:.2} MB/s | Latency = {:.2} ns",
        total.bandwidth_mbps(), total.avg_latency_ns());
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        mem: MemArgs,
        #[command(flatten)]
        colors: ColorArgs,
    }

    #[test]
    fn c_integers() {
        assert_eq!(parse_int("0x7800"), Ok(0x7800));
        assert_eq!(parse_int("010"), Ok(8));
        assert_eq!(parse_int("0"), Ok(0));
        assert_eq!(parse_int("42"), Ok(42));
        assert!(parse_int("0xzz").is_err());
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["t"]).unwrap();
        assert_eq!(cli.mem.mem, 16 << 20);
        assert_eq!(cli.common.debug, 0);
        assert!(cli.colors.color_set().accepts_all());
        assert_eq!(cli.colors.scheme().unwrap(), ColorScheme::Bitmask(0x7800));
    }

    #[test]
    fn color_options() {
        let cli = Cli::try_parse_from(["t", "-b", "0x1e000", "-e", "3", "-e", "5", "-m", "1M"])
            .unwrap();
        assert_eq!(cli.colors.scheme().unwrap(), ColorScheme::Bitmask(0x1e000));
        assert_eq!(cli.colors.color_set().to_string(), "3 5");
        assert_eq!(cli.mem.mem, 1 << 20);

        let cli = Cli::try_parse_from(["t", "--preset", "coffeelake", "-p", "-5"]).unwrap();
        assert_eq!(cli.colors.scheme().unwrap(), ColorScheme::coffeelake());
        assert_eq!(cli.common.nice, Some(-5));

        assert!(Cli::try_parse_from(["t", "-b", "0x10", "--preset", "coffeelake"]).is_err());
        assert!(Cli::try_parse_from(["t", "-m", "12Q"]).is_err());
    }

    #[test]
    fn help_is_not_an_error() {
        let e = Cli::try_parse_from(["t", "--help"]).unwrap_err();
        assert!(!e.use_stderr());
        let e = Cli::try_parse_from(["t", "--bogus"]).unwrap_err();
        assert!(e.use_stderr());
    }
}
