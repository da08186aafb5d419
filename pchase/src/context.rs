//! Owner of everything a single-threaded measurement needs.

use std::sync::Arc;

use log::{debug, info};

use crate::chain::{ChainSet, PartitionBuilder};
use crate::config::BenchConfig;
use crate::error::{PchaseError, Result};
use crate::pagemap::AddressResolver;
use crate::region::Region;
use crate::timing::{summarize, RunSummary, Stopwatch};
use crate::traverse;

/// A region, the chains linked through it and the configuration that
/// produced them.
///
/// Chains are rebuilt whenever the configuration changes, so they always
/// reflect the current [`BenchConfig`].
#[derive(Debug)]
pub struct BenchContext {
    cfg: BenchConfig,
    region: Region,
    resolver: AddressResolver,
    chains: Option<ChainSet>,
}

impl BenchContext {
    /// Map a region for `cfg` and build its chains, resolving physical
    /// addresses when the host allows it.
    pub fn new(cfg: BenchConfig) -> Result<Self> {
        Self::with_resolver(cfg, AddressResolver::detect())
    }

    pub fn with_resolver(cfg: BenchConfig, resolver: AddressResolver) -> Result<Self> {
        cfg.validate()?;
        let region = cfg.region_options().map()?;
        let mut res = Self { cfg, region, resolver, chains: None };
        res.rebuild()?;
        Ok(res)
    }

    pub fn config(&self) -> &BenchConfig { &self.cfg }
    pub fn region(&self) -> &Region { &self.region }
    pub fn resolver(&self) -> &AddressResolver { &self.resolver }

    /// Replace the configuration. The region is remapped if its geometry
    /// changed, and the chains are rebuilt in any case.
    pub fn reconfigure(&mut self, cfg: BenchConfig) -> Result<&ChainSet> {
        cfg.validate()?;
        let remap = cfg.mem_size != self.cfg.mem_size
            || cfg.unit_size != self.cfg.unit_size
            || cfg.hugepage != self.cfg.hugepage;
        if remap {
            self.region = cfg.region_options().map()?;
        }
        self.cfg = cfg;
        self.rebuild()
    }

    /// Unlink every element and build fresh chains from the configuration.
    pub fn rebuild(&mut self) -> Result<&ChainSet> {
        self.chains = None;
        self.region.clear();
        let builder = PartitionBuilder::new(self.cfg.parallelism)
            .seed(self.cfg.seed)
            .colors(self.cfg.colors.clone())
            .scheme(self.cfg.scheme.clone());
        let chains = builder.build(&mut self.region, &mut self.resolver)?;
        info!("{} chain(s) of {} elements ({} addresses)",
            chains.num_chains(), chains.chain_len(),
            if self.resolver.is_physical() { "physical" } else { "virtual" });
        let chains: &ChainSet = self.chains.insert(chains);
        Ok(chains)
    }

    pub fn chains(&self) -> Result<&ChainSet> {
        self.chains.as_ref().ok_or_else(|| {
            PchaseError::ChainNotBuilt("no chains built for this context".to_string())
        })
    }

    /// Outer steps of one run: `iterations` laps over each chain.
    pub fn outer_steps(&self) -> Result<u64> {
        Ok(self.cfg.iterations * self.chains()?.chain_len() as u64)
    }

    /// Traverse every chain together from its head, bracketed by a
    /// stopwatch.
    pub fn run(&self) -> Result<RunSummary> {
        let chains = self.chains()?;
        let steps = self.outer_steps()?;
        let mut cursors = chains.cursors();
        debug!("running {} x {} steps ({})", chains.num_chains(), steps, self.cfg.kind);

        let mut watch = Stopwatch::start();
        let accesses = traverse::traverse(&self.region, &mut cursors, steps, self.cfg.kind)?;
        Ok(summarize(&mut watch, accesses, self.cfg.bytes_per_access))
    }

    /// Give up ownership of the region so it can be shared with workers.
    pub fn into_shared(self) -> Result<(Arc<Region>, ChainSet)> {
        let chains = self.chains.ok_or_else(|| {
            PchaseError::ChainNotBuilt("no chains built for this context".to_string())
        })?;
        Ok((Arc::new(self.region), chains))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::color::ColorScheme;
    use crate::traverse::AccessKind;

    fn ctx(cfg: BenchConfig) -> BenchContext {
        BenchContext::with_resolver(cfg, AddressResolver::Virtual).unwrap()
    }

    #[test]
    fn run_counts_accesses() {
        let c = ctx(BenchConfig::new().mem_size(0x10000).parallelism(4).iterations(3));
        assert_eq!(c.chains().unwrap().chain_len(), 256);
        assert_eq!(c.outer_steps().unwrap(), 768);
        let s = c.run().unwrap();
        assert_eq!(s.accesses, 3072);
        assert_eq!(s.bytes_per_access, 64);
    }

    #[test]
    fn rebuild_is_idempotent() {
        let mut c = ctx(BenchConfig::new().mem_size(0x8000).parallelism(2).seed(9));
        let links = |c: &BenchContext| -> Vec<u32> {
            (0..c.region().num_elements() as u32).map(|e| c.region().next(e)).collect()
        };
        let before = (c.chains().unwrap().clone(), links(&c));
        c.rebuild().unwrap();
        assert_eq!(before, (c.chains().unwrap().clone(), links(&c)));
    }

    #[test]
    fn reconfigure_remaps() {
        let mut c = ctx(BenchConfig::new().mem_size(0x8000));
        let cfg = c.config().clone().mem_size(0x4000).unit_size(32).kind(AccessKind::Write);
        let chains = c.reconfigure(cfg).unwrap();
        assert_eq!(chains.chain_len(), 0x200);
        assert_eq!(c.region().len_bytes(), 0x4000);
        c.run().unwrap();

        let bad = c.config().clone().parallelism(0x201);
        assert!(c.reconfigure(bad).is_err());
        // A rejected configuration leaves the previous chains in place.
        assert!(c.chains().is_ok());
    }

    #[test]
    fn failed_remap_keeps_previous_state() {
        let mut c = ctx(BenchConfig::new().mem_size(0x8000).parallelism(2));
        let heads = c.chains().unwrap().heads().to_vec();
        let huge = c.config().clone().mem_size(1 << 40).unit_size(4096).hugepage(true);
        huge.validate().unwrap();
        assert!(matches!(c.reconfigure(huge),
            Err(PchaseError::AllocationFailure { hugepage: true, .. })));
        assert_eq!(c.config().mem_size, 0x8000);
        assert!(!c.config().hugepage);
        assert_eq!(c.region().len_bytes(), 0x8000);
        assert_eq!(c.chains().unwrap().heads(), &heads[..]);
        c.run().unwrap();
    }

    #[test]
    fn failed_build_leaves_no_chains() {
        let mut c = ctx(BenchConfig::new().mem_size(0x1000));
        // Elements are 64B aligned, so address bit 5 is never set.
        let cfg = c.config().clone()
            .scheme(ColorScheme::Bitmask(0x20))
            .colors([1].into_iter().collect());
        assert!(matches!(c.reconfigure(cfg),
            Err(PchaseError::InsufficientElements { found: 0, requested: 1 })));
        assert!(matches!(c.run(), Err(PchaseError::ChainNotBuilt(_))));
    }
}
