//! Measurement configuration.

use crate::color::{ColorScheme, ColorSet};
use crate::error::{PchaseError, Result};
use crate::region::{RegionOptions, CACHE_LINE_SIZE};
use crate::traverse::{AccessKind, MAX_PARALLELISM};

/// Default region size (16MiB).
pub const DEFAULT_MEM_SIZE: usize = 16384 * 1024;

/// Default number of laps over each chain.
pub const DEFAULT_ITERATIONS: u64 = 100;

/// Parameters for building chains and running a traversal.
#[derive(Clone, Debug)]
pub struct BenchConfig {
    /// Size of the region in bytes.
    pub mem_size: usize,
    /// Size of one element in bytes.
    pub unit_size: usize,
    pub kind: AccessKind,
    /// Number of chains traversed together.
    pub parallelism: usize,
    /// Laps over each chain. One lap is `chain_len` outer steps.
    pub iterations: u64,
    pub colors: ColorSet,
    pub scheme: ColorScheme,
    pub seed: u64,
    pub hugepage: bool,
    /// Bytes accounted to every access when deriving bandwidth.
    pub bytes_per_access: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mem_size: DEFAULT_MEM_SIZE,
            unit_size: CACHE_LINE_SIZE,
            kind: AccessKind::Read,
            parallelism: 1,
            iterations: DEFAULT_ITERATIONS,
            colors: ColorSet::all(),
            scheme: ColorScheme::default(),
            seed: 0,
            hugepage: false,
            bytes_per_access: CACHE_LINE_SIZE as u64,
        }
    }
}

impl BenchConfig {
    pub fn new() -> Self { Self::default() }

    pub fn mem_size(mut self, x: usize) -> Self {
        self.mem_size = x;
        self
    }

    pub fn unit_size(mut self, x: usize) -> Self {
        self.unit_size = x;
        self
    }

    pub fn kind(mut self, x: AccessKind) -> Self {
        self.kind = x;
        self
    }

    pub fn parallelism(mut self, x: usize) -> Self {
        self.parallelism = x;
        self
    }

    pub fn iterations(mut self, x: u64) -> Self {
        self.iterations = x;
        self
    }

    pub fn colors(mut self, x: ColorSet) -> Self {
        self.colors = x;
        self
    }

    pub fn scheme(mut self, x: ColorScheme) -> Self {
        self.scheme = x;
        self
    }

    pub fn seed(mut self, x: u64) -> Self {
        self.seed = x;
        self
    }

    pub fn hugepage(mut self, x: bool) -> Self {
        self.hugepage = x;
        self
    }

    pub fn bytes_per_access(mut self, x: u64) -> Self {
        self.bytes_per_access = x;
        self
    }

    pub fn num_elements(&self) -> usize {
        self.mem_size / self.unit_size.max(1)
    }

    pub fn region_options(&self) -> RegionOptions {
        RegionOptions::new(self.mem_size, self.unit_size).hugepage(self.hugepage)
    }

    pub fn validate(&self) -> Result<()> {
        self.region_options().validate()?;
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(PchaseError::invalid(format!(
                "parallelism {} not in 1..={}", self.parallelism, MAX_PARALLELISM)));
        }
        if self.parallelism > self.num_elements() {
            return Err(PchaseError::invalid(format!(
                "parallelism {} exceeds the {} elements of the region",
                self.parallelism, self.num_elements())));
        }
        if let Some(c) = self.colors.iter().find(|&c| c >= self.scheme.num_colors()) {
            return Err(PchaseError::invalid(format!(
                "color {} out of range for {} ({} colors)",
                c, self.scheme, self.scheme.num_colors())));
        }
        if self.bytes_per_access == 0 {
            return Err(PchaseError::invalid("bytes per access must be nonzero"));
        }
        Ok(())
    }
}

/// Parse a memory size. A bare number is in KiB; `K`, `M` and `G` suffixes
/// (optionally followed by `B` or `iB`) select the unit explicitly.
pub fn parse_mem_size(s: &str) -> Result<usize> {
    let t = s.trim();
    let bad = || PchaseError::invalid(format!("bad memory size '{}'", s));
    let split = t.find(|c: char| !c.is_ascii_digit()).unwrap_or(t.len());
    let (num, suffix) = t.split_at(split);
    let value: usize = num.parse().map_err(|_| bad())?;
    let shift = match suffix.to_ascii_uppercase().as_str() {
        "" | "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        _ => return Err(bad()),
    };
    value.checked_mul(1 << shift).ok_or_else(bad)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mem_sizes() {
        assert_eq!(parse_mem_size("16384").unwrap(), 16 << 20);
        assert_eq!(parse_mem_size("64k").unwrap(), 64 << 10);
        assert_eq!(parse_mem_size("16M").unwrap(), 16 << 20);
        assert_eq!(parse_mem_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_mem_size(" 2mb ").unwrap(), 2 << 20);
        for bad in ["", "M", "12Q", "1.5M", "-4"] {
            assert!(parse_mem_size(bad).is_err(), "{:?}", bad);
        }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = BenchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_elements(), 262144);
    }

    #[test]
    fn rejects_inconsistent() {
        let base = BenchConfig::new().mem_size(0x1000);
        assert!(base.clone().parallelism(0).validate().is_err());
        assert!(base.clone().parallelism(65).validate().is_err());
        assert!(base.clone().parallelism(MAX_PARALLELISM + 1).validate().is_err());
        assert!(base.clone().unit_size(12).validate().is_ok());
        assert!(base.clone().unit_size(10).validate().is_err());
        assert!(base.clone().bytes_per_access(0).validate().is_err());
        assert!(base.clone().colors([15].into_iter().collect()).validate().is_ok());
        assert!(base.clone().colors([16].into_iter().collect()).validate().is_err());
        assert!(base.scheme(ColorScheme::Bitmask(0x1800))
            .colors([3].into_iter().collect()).validate().is_ok());
    }
}
