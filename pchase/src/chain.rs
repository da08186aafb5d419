//! Construction of disjoint circular chains over a [`Region`].

use bitvec::prelude::*;
use log::{debug, info, trace};
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::color::{ColorScheme, ColorSet};
use crate::error::{PchaseError, Result};
use crate::pagemap::AddressResolver;
use crate::region::Region;

/// A set of disjoint circular chains linked through a region.
///
/// Chains are identified by their head element. All chains built together
/// have the same length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSet {
    heads: Vec<u32>,
    chain_len: usize,
    unit_size: usize,
}

impl ChainSet {
    pub fn heads(&self) -> &[u32] { &self.heads }
    pub fn num_chains(&self) -> usize { self.heads.len() }
    pub fn chain_len(&self) -> usize { self.chain_len }
    pub fn unit_size(&self) -> usize { self.unit_size }

    /// Total number of linked elements.
    pub fn num_elements(&self) -> usize {
        self.heads.len() * self.chain_len
    }

    /// Initial traversal cursors (one per chain).
    pub fn cursors(&self) -> Vec<u32> {
        self.heads.clone()
    }

    /// Cursor groups of `per` chains each, for handing to separate workers.
    pub fn groups(&self, per: usize) -> Vec<Vec<u32>> {
        assert!(per > 0);
        self.heads.chunks(per).map(|c| c.to_vec()).collect()
    }

    /// Follow `steps` links from the head of `chain`, returning the element
    /// reached.
    pub fn walk(&self, region: &Region, chain: usize, steps: usize) -> u32 {
        (0..steps).fold(self.heads[chain], |cur, _| region.next(cur))
    }

    /// Elements of `chain` in traversal order, starting at its head.
    pub fn elements(&self, region: &Region, chain: usize) -> Vec<u32> {
        let mut res = Vec::with_capacity(self.chain_len);
        let mut cur = self.heads[chain];
        for _ in 0..self.chain_len {
            res.push(cur);
            cur = region.next(cur);
        }
        res
    }

    /// Check that every chain closes after exactly `chain_len` links and that
    /// no element belongs to two chains.
    pub fn verify(&self, region: &Region) -> Result<()> {
        let mut seen = bitvec![0; region.num_elements()];
        for (idx, &head) in self.heads.iter().enumerate() {
            let mut cur = head;
            for step in 0..self.chain_len {
                if seen.replace(cur as usize, true) {
                    return Err(PchaseError::ChainNotBuilt(format!(
                        "chain {} revisits element {} at step {}", idx, cur, step)));
                }
                cur = region.next(cur);
            }
            if cur != head {
                return Err(PchaseError::ChainNotBuilt(format!(
                    "chain {} does not close after {} links", idx, self.chain_len)));
            }
        }
        Ok(())
    }
}

/// Link `elems` into a cycle in the given order.
fn link_cycle(region: &mut Region, elems: &[u32]) {
    for (cur, next) in elems.iter().zip(elems.iter().cycle().skip(1)) {
        region.set_next(*cur, *next);
    }
}

/// Builds `parallelism` equal-length chains from the elements of a region
/// whose color is selected.
#[derive(Clone, Debug)]
pub struct PartitionBuilder {
    parallelism: usize,
    seed: u64,
    colors: ColorSet,
    scheme: ColorScheme,
}

impl PartitionBuilder {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism,
            seed: 0,
            colors: ColorSet::all(),
            scheme: ColorScheme::default(),
        }
    }

    pub fn seed(mut self, x: u64) -> Self {
        self.seed = x;
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

    /// Indices of every element whose color is selected, in address order.
    ///
    /// Without a color selection nothing is resolved and every element is
    /// eligible.
    pub fn candidates(&self, region: &Region, resolver: &mut AddressResolver)
        -> Result<Vec<u32>>
    {
        let n = region.num_elements();
        if self.colors.accepts_all() {
            return Ok((0..n as u32).collect());
        }

        let page_size = resolver.page_size();
        let mut res = Vec::new();
        let mut cur_page = None;
        let mut page_paddr = 0;
        for elem in 0..n {
            let vaddr = region.vaddr(elem);
            let page = vaddr & !(page_size - 1);
            if cur_page != Some(page) {
                page_paddr = resolver.translate(page)?;
                cur_page = Some(page);
            }
            let paddr = page_paddr + (vaddr - page);
            let color = self.scheme.classify(paddr as u64);
            trace!("elem {:6} vaddr {:#018x} paddr {:#014x} color {}",
                elem, vaddr, paddr, color);
            if self.colors.contains(color) {
                res.push(elem as u32);
            }
        }
        Ok(res)
    }

    /// Link the selected elements of `region` into chains.
    ///
    /// Eligible elements are shuffled with the builder's seed before the
    /// remainder beyond a multiple of the parallelism is dropped, so the
    /// result is a pure function of (seed, candidate set).
    pub fn build(&self, region: &mut Region, resolver: &mut AddressResolver)
        -> Result<ChainSet>
    {
        if self.parallelism == 0 {
            return Err(PchaseError::invalid("parallelism must be at least 1"));
        }
        let mut elems = self.candidates(region, resolver)?;
        info!("{} of {} elements eligible (colors: {})",
            elems.len(), region.num_elements(), self.colors);
        if elems.len() < self.parallelism {
            return Err(PchaseError::InsufficientElements {
                found: elems.len(),
                requested: self.parallelism,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        elems.shuffle(&mut rng);
        let chain_len = elems.len() / self.parallelism;
        elems.truncate(chain_len * self.parallelism);

        let mut heads = Vec::with_capacity(self.parallelism);
        for run in elems.chunks_exact(chain_len) {
            link_cycle(region, run);
            debug!("chain {}: head {} ({:#018x})",
                heads.len(), run[0], region.vaddr(run[0] as usize));
            heads.push(run[0]);
        }
        Ok(ChainSet { heads, chain_len, unit_size: region.unit_size() })
    }
}

/// Builds chains over pages whose address matches a pattern in its low bits.
///
/// Each chain element sits at in-page offset `pattern & (page_size - 1)` of a
/// page whose (physical) address equals `pattern` in bits `[shift-1:0]`, so
/// all elements map to the same cache set and the same bank. Chains are
/// linked in address order and never share a page.
#[derive(Clone, Copy, Debug)]
pub struct PageMatch {
    pattern: usize,
    shift: u32,
    chain_len: usize,
}

impl PageMatch {
    pub fn new(pattern: usize, shift: u32, chain_len: usize) -> Self {
        Self { pattern, shift, chain_len }
    }

    fn mask(&self) -> usize {
        1usize.checked_shl(self.shift).map_or(usize::MAX, |v| v - 1)
    }

    /// Build `count` chains.
    pub fn build(&self, region: &mut Region, resolver: &mut AddressResolver, count: usize)
        -> Result<ChainSet>
    {
        if self.chain_len == 0 || count == 0 {
            return Err(PchaseError::invalid("page-match chains need a length and a count"));
        }
        let page_size = resolver.page_size();
        let in_page = self.pattern & (page_size - 1);
        if in_page + region.unit_size() > page_size {
            return Err(PchaseError::invalid(format!(
                "in-page offset {:#x} leaves no room for a {}B element",
                in_page, region.unit_size())));
        }
        info!("page match {:#x}, shift {}: {} chain(s) of {}",
            self.pattern, self.shift, count, self.chain_len);

        let mut used = bitvec![0; region.num_elements()];
        let mut heads = Vec::with_capacity(count);
        for _ in 0..count {
            let chain = self.collect_one(region, resolver, &mut used, in_page)?;
            if chain.len() < self.chain_len {
                return Err(PchaseError::InsufficientElements {
                    found: heads.len() * self.chain_len + chain.len(),
                    requested: count * self.chain_len,
                });
            }
            link_cycle(region, &chain);
            heads.push(chain[0]);
        }
        Ok(ChainSet { heads, chain_len: self.chain_len, unit_size: region.unit_size() })
    }

    fn collect_one(&self, region: &Region, resolver: &mut AddressResolver,
        used: &mut BitVec, in_page: usize) -> Result<Vec<u32>>
    {
        let page_size = resolver.page_size();
        let base = region.base_addr();
        let mut res = Vec::with_capacity(self.chain_len);
        for off in (0..region.len_bytes()).step_by(page_size) {
            let Some(elem) = region.element_at(off + in_page) else { break };
            if used[elem] {
                continue;
            }
            let paddr = resolver.translate(base + off)? + in_page;
            if (paddr & self.mask()) != self.pattern {
                continue;
            }
            trace!("match elem {} vaddr {:#018x} paddr {:#014x}",
                elem, base + off + in_page, paddr);
            used.set(elem, true);
            res.push(elem as u32);
            if res.len() == self.chain_len {
                break;
            }
        }
        Ok(res)
    }
}
