//! Execution substrates other than the calling thread.
//!
//! An accelerator receives a region with chains already linked through it
//! and one cursor per lane. Each lane writes the sentinel into the element
//! under its cursor and then follows that element's next index, `iterations`
//! times. Cursors are written back so the caller can check where each lane
//! ended up.

use std::time::Duration;

use crate::error::Result;
use crate::region::Region;
use crate::timing::Stopwatch;
use crate::traverse::{self, AccessKind};

/// Something that can run the write-then-follow kernel over a region.
pub trait Accelerator {
    /// Short name used in reports.
    fn name(&self) -> &str;

    /// Run the kernel and return how long it took.
    fn run_write_follow(&mut self, region: &Region, next: &mut [u32], iterations: u64)
        -> Result<Duration>;
}

/// Runs every lane on the calling thread, interleaved.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostAccelerator;

impl Accelerator for HostAccelerator {
    fn name(&self) -> &str { "host" }

    fn run_write_follow(&mut self, region: &Region, next: &mut [u32], iterations: u64)
        -> Result<Duration>
    {
        let mut watch = Stopwatch::start();
        traverse::traverse(region, next, iterations, AccessKind::Write)?;
        Ok(watch.stop())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::PartitionBuilder;
    use crate::pagemap::AddressResolver;
    use crate::region::RegionOptions;
    use crate::traverse::SENTINEL;

    #[test]
    fn host_lanes_write_then_follow() {
        let mut r = RegionOptions::new(0x8000, 64).map().unwrap();
        let cs = PartitionBuilder::new(8).seed(5)
            .build(&mut r, &mut AddressResolver::Virtual).unwrap();
        let mut next = cs.cursors();
        let mut acc = HostAccelerator;
        acc.run_write_follow(&r, &mut next, 3).unwrap();
        for lane in 0..8 {
            let elems = cs.elements(&r, lane);
            assert_eq!(next[lane], elems[3]);
            assert!(elems[..3].iter().all(|&e| r.sentinel(e) == SENTINEL));
            assert_eq!(r.sentinel(elems[3]), 0);
        }
        assert_eq!(acc.name(), "host");
    }
}
