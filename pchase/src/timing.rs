//! Wall-clock bracketing of a measurement and the derived metrics.

use std::fmt;
use std::time::{Duration, Instant};

/// Monotonic start/stop timestamps around a measured interval.
#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    start: Instant,
    end: Option<Instant>,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self { start: Instant::now(), end: None }
    }

    /// Latch the end timestamp. Only the first call has any effect.
    pub fn stop(&mut self) -> Duration {
        let end = *self.end.get_or_insert_with(Instant::now);
        end - self.start
    }

    pub fn is_stopped(&self) -> bool { self.end.is_some() }

    /// Time between start and the latched stop (or now, while running).
    pub fn elapsed(&self) -> Duration {
        self.end.unwrap_or_else(Instant::now) - self.start
    }
}

/// The outcome of one measured run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub accesses: u64,
    pub bytes_per_access: u64,
}

impl RunSummary {
    pub fn new(elapsed: Duration, accesses: u64, bytes_per_access: u64) -> Self {
        Self { elapsed, accesses, bytes_per_access }
    }

    pub fn elapsed_ns(&self) -> u128 {
        self.elapsed.as_nanos()
    }

    pub fn bytes(&self) -> u64 {
        self.accesses * self.bytes_per_access
    }

    /// Throughput in 10^6 bytes per second.
    pub fn bandwidth_mbps(&self) -> f64 {
        let ns = self.elapsed_ns();
        if ns == 0 {
            return 0.0;
        }
        self.bytes() as f64 * 1000.0 / ns as f64
    }

    /// Throughput in 2^20 bytes per second.
    pub fn bandwidth_mibps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes() as f64 / secs / (1024.0 * 1024.0)
    }

    /// Average time per access.
    pub fn avg_latency_ns(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.elapsed_ns() as f64 / self.accesses as f64
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "duration {} ns, #access {}", self.elapsed_ns(), self.accesses)?;
        writeln!(f, "Avg. latency {:.2} ns", self.avg_latency_ns())?;
        write!(f, "bandwidth {:.2} MB/s ({:.2} MiB/s)",
            self.bandwidth_mbps(), self.bandwidth_mibps())
    }
}

/// Stop `watch` (if still running) and summarize `accesses` over its interval.
pub fn summarize(watch: &mut Stopwatch, accesses: u64, bytes_per_access: u64) -> RunSummary {
    RunSummary::new(watch.stop(), accesses, bytes_per_access)
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    let b = bytes as f64;
    if bytes >= GIB {
        format!("{:.2} GiB", b / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", b / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", b / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_latches_first() {
        let mut sw = Stopwatch::start();
        assert!(!sw.is_stopped());
        std::thread::sleep(Duration::from_millis(2));
        let first = sw.stop();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(sw.stop(), first);
        assert_eq!(sw.elapsed(), first);
        assert!(first >= Duration::from_millis(2));
    }

    #[test]
    fn metrics() {
        let s = RunSummary::new(Duration::from_millis(10), 1_000_000, 64);
        assert_eq!(s.elapsed_ns(), 10_000_000);
        assert_eq!(s.bytes(), 64_000_000);
        assert!((s.bandwidth_mbps() - 6400.0).abs() < 1e-6);
        assert!((s.bandwidth_mibps() - 6103.515625).abs() < 1e-6);
        assert!((s.avg_latency_ns() - 10.0).abs() < 1e-9);

        let zero = RunSummary::new(Duration::ZERO, 0, 64);
        assert_eq!(zero.bandwidth_mbps(), 0.0);
        assert_eq!(zero.avg_latency_ns(), 0.0);
    }

    #[test]
    fn report_lines() {
        let s = RunSummary::new(Duration::from_micros(1), 100, 64);
        let text = s.to_string();
        assert!(text.starts_with("duration 1000 ns, #access 100\n"));
        assert!(text.contains("Avg. latency 10.00 ns"));
        assert!(text.contains("bandwidth 6400.00 MB/s"));
    }

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KiB");
        assert_eq!(format_size(16 << 20), "16.00 MiB");
        assert_eq!(format_size(3 << 30), "3.00 GiB");
    }
}
