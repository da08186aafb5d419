
use pchase::env;
use pchase::pagemap::PageMap;
use pchase::region::RegionOptions;

fn flag(r: std::io::Result<bool>, bad_when: bool) -> String {
    match r {
        Ok(v) if v == bad_when => format!("{} [!!]", if v { "enabled" } else { "disabled" }),
        Ok(v) => (if v { "enabled" } else { "disabled" }).to_string(),
        Err(e) => format!("<{}>", e),
    }
}

fn text<T: std::fmt::Display>(r: std::io::Result<T>) -> String {
    match r {
        Ok(v) => v.to_string(),
        Err(e) => format!("<{}>", e),
    }
}

/// Whether this process can see its own physical frame numbers.
fn pagemap_status() -> String {
    let region = match RegionOptions::new(env::page_size(), 64).map() {
        Ok(r) => r,
        Err(e) => return format!("<{}>", e),
    };
    let pm = match PageMap::open() {
        Ok(pm) => pm,
        Err(e) => return format!("{} [!!]", e),
    };
    match pm.resolve(region.base_addr()) {
        Ok(paddr) => format!("readable (test page at {:#x})", paddr),
        Err(e) => format!("{} [!!]", e),
    }
}

fn main() {
    println!("[*] 'pchase' environment summary:");
    println!("  {:<40}: {}", "configured cores", env::num_cpus());
    println!("  {:<40}: {:#x}", "page size", env::page_size());
    println!("  {:<40}: {}", "running as root", env::is_root());
    println!("  {:<40}: {}", "physical address map", pagemap_status());
    println!("  {:<40}: {}", "isolated cores", text(env::sysfs_isolated()));
    println!("  {:<40}: {}", "nohz_full cores", text(env::sysfs_nohz()));
    println!("  {:<40}: {}", "simultaneous multithreading (SMT)",
        flag(env::sysfs_smt_enabled(), true));
    println!("  {:<40}: {}", "cpufreq boost", flag(env::sysfs_cpufreq_boost_enabled(), true));
    println!("  {:<40}: {}", "cpufreq scaling (cpu0)", text(env::sysfs_cpufreq_governor(0)));
    println!("  {:<40}: {}", "transparent hugepages", text(env::sysfs_thp_mode()));
    println!("  {:<40}: {}", "preallocated hugetlb pages", text(env::procfs_nr_hugepages()));
}
