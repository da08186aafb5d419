//! The pointer-chase kernels.
//!
//! Each step of a chain is a load whose address depends on the value of the
//! previous load, so the only overlap the core can find is between distinct
//! chains. Interleaving `P` cursors in one loop therefore exposes up to `P`
//! outstanding misses at a time.

use std::hint::black_box;

use crate::error::{PchaseError, Result};
use crate::region::{Region, CACHE_LINE_SIZE};

/// Value stored into the sentinel slot by write traversals.
pub const SENTINEL: u32 = 0xff;

/// Largest interleave compiled to a fixed-width kernel.
pub const MAX_INTERLEAVE: usize = 32;

/// Largest number of cursors a single traversal accepts.
pub const MAX_PARALLELISM: usize = 256;

/// What each visited element is subjected to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum AccessKind {
    #[default]
    Read,
    Write,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

#[inline(always)]
fn step<const WRITE: bool>(region: &Region, cur: u32) -> u32 {
    // SAFETY: `cur` is either a checked initial cursor or a value loaded from
    // a next slot, and next slots only ever hold valid indices.
    unsafe {
        if WRITE {
            region.store_sentinel_unchecked(cur, SENTINEL);
        }
        region.load_next_unchecked(cur)
    }
}

fn chase_fixed<const P: usize, const WRITE: bool>(
    region: &Region, cursors: &mut [u32], iterations: u64)
{
    let mut cur = [0u32; P];
    cur.copy_from_slice(cursors);
    for _ in 0..iterations {
        for c in cur.iter_mut() {
            *c = step::<WRITE>(region, *c);
        }
    }
    cursors.copy_from_slice(black_box(&cur));
}

fn chase_slice<const WRITE: bool>(region: &Region, cursors: &mut [u32], iterations: u64) {
    for _ in 0..iterations {
        for c in cursors.iter_mut() {
            *c = step::<WRITE>(region, *c);
        }
    }
}

macro_rules! dispatch_fixed {
    ($write:literal, $region:ident, $cursors:ident, $iters:ident; $($p:literal)*) => {
        match $cursors.len() {
            $( $p => chase_fixed::<$p, $write>($region, $cursors, $iters), )*
            _ => chase_slice::<$write>($region, $cursors, $iters),
        }
    };
}

fn chase<const WRITE: bool>(region: &Region, cursors: &mut [u32], iterations: u64) {
    if WRITE {
        dispatch_fixed!(true, region, cursors, iterations;
            1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16
            17 18 19 20 21 22 23 24 25 26 27 28 29 30 31 32)
    } else {
        dispatch_fixed!(false, region, cursors, iterations;
            1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16
            17 18 19 20 21 22 23 24 25 26 27 28 29 30 31 32)
    }
}

/// Check that `cursors` can be traversed over `region`.
pub fn check_cursors(region: &Region, cursors: &[u32]) -> Result<()> {
    if cursors.is_empty() {
        return Err(PchaseError::ChainNotBuilt("no chain cursors".to_string()));
    }
    if cursors.len() > MAX_PARALLELISM {
        return Err(PchaseError::invalid(format!(
            "{} cursors exceeds the maximum parallelism of {}",
            cursors.len(), MAX_PARALLELISM)));
    }
    if let Some(bad) = cursors.iter().find(|&&c| !region.contains(c)) {
        return Err(PchaseError::ChainNotBuilt(format!(
            "cursor {} outside a region of {} elements", bad, region.num_elements())));
    }
    Ok(())
}

/// Advance every cursor `iterations` times, returning the number of
/// accesses performed (`iterations * cursors.len()`).
///
/// On return `cursors` holds the position reached by each chain, so
/// consecutive calls continue where the previous one stopped.
pub fn traverse(region: &Region, cursors: &mut [u32], iterations: u64, kind: AccessKind)
    -> Result<u64>
{
    check_cursors(region, cursors)?;
    match kind {
        AccessKind::Read => chase::<false>(region, cursors, iterations),
        AccessKind::Write => chase::<true>(region, cursors, iterations),
    }
    Ok(iterations * cursors.len() as u64)
}

/// One sequential pass over `region` at cache-line stride. Returns the number
/// of lines touched.
///
/// Each line is accessed at its first byte outside a next-index slot, so a
/// write sweep leaves any chains linked through the region intact.
pub fn sweep(region: &Region, kind: AccessKind) -> u64 {
    let mut lines = 0;
    let mut sum = 0u64;
    for line in (0..region.len_bytes()).step_by(CACHE_LINE_SIZE) {
        let off = region.payload_offset(line);
        match kind {
            AccessKind::Read => sum += region.read_byte(off) as u64,
            AccessKind::Write => region.write_byte(off, SENTINEL as u8),
        }
        lines += 1;
    }
    black_box(sum);
    lines
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::PartitionBuilder;
    use crate::pagemap::AddressResolver;
    use crate::region::RegionOptions;

    fn setup(size: usize, p: usize) -> (Region, crate::chain::ChainSet) {
        let mut r = RegionOptions::new(size, 64).map().unwrap();
        let cs = PartitionBuilder::new(p).seed(1)
            .build(&mut r, &mut AddressResolver::Virtual).unwrap();
        (r, cs)
    }

    #[test]
    fn cursors_follow_chains() {
        for p in [1, 2, 5, 32, 33, 64] {
            let (r, cs) = setup(0x20000, p);
            let mut cur = cs.cursors();
            let n = traverse(&r, &mut cur, 13, AccessKind::Read).unwrap();
            assert_eq!(n, 13 * p as u64);
            for (c, &pos) in cur.iter().enumerate() {
                assert_eq!(pos, cs.walk(&r, c, 13), "p={} chain {}", p, c);
            }
        }
    }

    #[test]
    fn full_lap_returns_to_heads() {
        let (r, cs) = setup(0x10000, 4);
        let mut cur = cs.cursors();
        traverse(&r, &mut cur, cs.chain_len() as u64, AccessKind::Write).unwrap();
        assert_eq!(cur, cs.heads());
    }

    #[test]
    fn write_marks_visited() {
        let (r, cs) = setup(0x10000, 1);
        let mut cur = cs.cursors();
        traverse(&r, &mut cur, 10, AccessKind::Read).unwrap();
        assert!((0..r.num_elements() as u32).all(|e| r.sentinel(e) == 0));

        let mut cur = cs.cursors();
        traverse(&r, &mut cur, 10, AccessKind::Write).unwrap();
        let visited = &cs.elements(&r, 0)[..10];
        for e in 0..r.num_elements() as u32 {
            let expect = if visited.contains(&e) { SENTINEL } else { 0 };
            assert_eq!(r.sentinel(e), expect, "element {}", e);
        }
    }

    #[test]
    fn rejects_unbuilt_chains() {
        let r = RegionOptions::new(0x1000, 64).map().unwrap();
        assert!(matches!(traverse(&r, &mut [], 1, AccessKind::Read),
            Err(PchaseError::ChainNotBuilt(_))));
        assert!(matches!(traverse(&r, &mut [0, 64], 1, AccessKind::Read),
            Err(PchaseError::ChainNotBuilt(_))));
        let mut many = vec![0u32; MAX_PARALLELISM + 1];
        assert!(matches!(traverse(&r, &mut many, 1, AccessKind::Read),
            Err(PchaseError::InvalidConfiguration(_))));
    }

    #[test]
    fn sweep_lines() {
        let r = RegionOptions::new(0x4000, 64).map().unwrap();
        assert_eq!(sweep(&r, AccessKind::Read), 0x100);
        assert_eq!(sweep(&r, AccessKind::Write), 0x100);
        for e in 0..r.num_elements() {
            assert_eq!(r.sentinel(e as u32), SENTINEL);
            assert_eq!(r.next(e as u32), 0);
            assert_eq!(r.read_byte(e * 64 + 5), 0);
        }
    }

    #[test]
    fn write_sweep_keeps_links() {
        for (size, unit) in [(0x1000, 64), (0x1000, 8), (0x3000, 12), (0x4000, 256)] {
            let mut r = RegionOptions::new(size, unit).map().unwrap();
            let cs = PartitionBuilder::new(1)
                .build(&mut r, &mut AddressResolver::Virtual).unwrap();
            sweep(&r, AccessKind::Write);
            cs.verify(&r).unwrap();
            assert!((0..r.num_elements() as u32).all(|e| r.contains(r.next(e))),
                "unit {}", unit);
            let mut cur = cs.cursors();
            traverse(&r, &mut cur, 2 * cs.chain_len() as u64, AccessKind::Read).unwrap();
            assert_eq!(cur, cs.heads());
        }
    }
}
