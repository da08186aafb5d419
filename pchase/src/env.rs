//! Utilities for inspecting the host and controlling the current process.

use std::path::Path;

use log::{info, warn};
use nix::unistd::{sysconf, SysconfVar};

use crate::error::{PchaseError, Result};

const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Base page size of the host.
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Number of configured processors.
pub fn num_cpus() -> usize {
    match sysconf(SysconfVar::_NPROCESSORS_CONF) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => 1,
    }
}

/// Returns true when running with an effective uid of 0.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Pin the calling thread to a particular core (modulo the core count).
pub fn pin_to_core(core: usize) -> Result<usize> {
    let core = core % num_cpus();
    let this_pid = nix::unistd::Pid::from_raw(0);
    let mut cpuset = nix::sched::CpuSet::new();
    cpuset.set(core).map_err(|errno| {
        PchaseError::invalid(format!("cpu {}: {}", core, errno.desc()))
    })?;
    nix::sched::sched_setaffinity(this_pid, &cpuset).map_err(|errno| {
        PchaseError::invalid(format!("couldn't pin to cpu {}: {}", core, errno.desc()))
    })?;
    info!("assigned to cpu {}", core);
    Ok(core)
}

/// Set the nice value of the calling process. Failure is only reported.
pub fn set_nice(prio: i32) -> bool {
    // SAFETY: setpriority() has no memory-safety preconditions.
    let ret = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, prio) };
    if ret < 0 {
        warn!("couldn't set nice value {}: {}", prio, nix::errno::Errno::last().desc());
        false
    } else {
        info!("assigned priority {}", prio);
        true
    }
}

pub const SYSFS_ISOLATED: &str = "/sys/devices/system/cpu/isolated";
pub const SYSFS_NOHZ_FULL: &str = "/sys/devices/system/cpu/nohz_full";
pub const SYSFS_SMT_CONTROL: &str = "/sys/devices/system/cpu/smt/control";
pub const SYSFS_CPUFREQ_BOOST: &str = "/sys/devices/system/cpu/cpufreq/boost";
pub const SYSFS_THP_ENABLED: &str = "/sys/kernel/mm/transparent_hugepage/enabled";
pub const PROCFS_NR_HUGEPAGES: &str = "/proc/sys/vm/nr_hugepages";

fn read_trimmed(path: impl AsRef<Path>) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// CPUs removed from the scheduler with `isolcpus=`.
pub fn sysfs_isolated() -> std::io::Result<String> {
    read_trimmed(SYSFS_ISOLATED)
}

/// CPUs running without the periodic tick.
pub fn sysfs_nohz() -> std::io::Result<String> {
    read_trimmed(SYSFS_NOHZ_FULL)
}

pub fn sysfs_smt_enabled() -> std::io::Result<bool> {
    Ok(read_trimmed(SYSFS_SMT_CONTROL)? == "on")
}

pub fn sysfs_cpufreq_boost_enabled() -> std::io::Result<bool> {
    Ok(read_trimmed(SYSFS_CPUFREQ_BOOST)? == "1")
}

pub fn sysfs_cpufreq_governor(cpu: usize) -> std::io::Result<String> {
    read_trimmed(format!(
        "/sys/devices/system/cpu/cpufreq/policy{}/scaling_governor", cpu))
}

/// The selected transparent hugepage mode (the bracketed entry).
pub fn sysfs_thp_mode() -> std::io::Result<String> {
    let s = read_trimmed(SYSFS_THP_ENABLED)?;
    Ok(parse_bracketed(&s).unwrap_or(&s).to_string())
}

/// Number of preallocated hugetlb pages.
pub fn procfs_nr_hugepages() -> std::io::Result<usize> {
    read_trimmed(PROCFS_NR_HUGEPAGES)?.parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    })
}

fn parse_bracketed(s: &str) -> Option<&str> {
    let start = s.find('[')? + 1;
    let end = start + s[start..].find(']')?;
    Some(&s[start..end])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_basics() {
        assert!(page_size().is_power_of_two());
        assert!(num_cpus() >= 1);
    }

    #[test]
    fn bracketed_mode() {
        assert_eq!(parse_bracketed("always [madvise] never"), Some("madvise"));
        assert_eq!(parse_bracketed("[always] madvise never"), Some("always"));
        assert_eq!(parse_bracketed("always"), None);
    }
}
