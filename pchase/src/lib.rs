//! Physical-address-aware pointer chasing.
//!
//! A [`Region`] is split into disjoint circular chains, optionally restricted
//! to the elements whose physical address falls into selected DRAM colors.
//! Chains are then traversed either interleaved on one thread (to expose
//! memory-level parallelism) or by a pool of pinned worker threads (to
//! generate contention), and the traversal is timed.

pub mod accel;
pub mod chain;
pub mod color;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod pagemap;
pub mod region;
pub mod timing;
pub mod traverse;
pub mod worker;

pub use crate::accel::{Accelerator, HostAccelerator};
pub use crate::chain::{ChainSet, PageMatch, PartitionBuilder};
pub use crate::color::{BitFunction, ColorScheme, ColorSet};
pub use crate::config::{parse_mem_size, BenchConfig};
pub use crate::context::BenchContext;
pub use crate::error::{PchaseError, Result};
pub use crate::pagemap::{AddressResolver, PageMap};
pub use crate::region::{Region, RegionOptions};
pub use crate::timing::{format_size, summarize, RunSummary, Stopwatch};
pub use crate::traverse::{sweep, traverse, AccessKind};
pub use crate::worker::{
    Bound, PoolReport, RunningPool, StopToken, WorkerPool, WorkerSpec, Workload,
};
