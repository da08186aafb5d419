//! Error type shared by every part of the engine.

use std::path::PathBuf;

/// Failures surfaced by the engine.
///
/// Resource-acquisition failures (allocation, address resolution, thread
/// creation) are fatal to a measurement. Classification and traversal never
/// fail once their preconditions hold.
#[derive(Debug, thiserror::Error)]
pub enum PchaseError {
    /// The memory region could not be mapped at the requested size.
    #[error("couldn't allocate {size} bytes (hugetlb: {hugepage}): {source}")]
    AllocationFailure {
        size: usize,
        hugepage: bool,
        #[source]
        source: std::io::Error,
    },

    /// A queried page has no physical backing.
    #[error("page for vaddr {vaddr:#018x} is not resident")]
    PageNotResident { vaddr: usize },

    /// The privileged address map can't be opened or hides frame numbers.
    #[error("physical address map unavailable ({reason}); are you root?")]
    PermissionDenied { reason: String },

    /// The color filter left fewer elements than requested chains.
    #[error("only {found} eligible elements for {requested} chain(s)")]
    InsufficientElements { found: usize, requested: usize },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Traversal was requested on chains that were never built.
    #[error("chain not built: {0}")]
    ChainNotBuilt(String),

    /// A bank-function mapping file couldn't be read or parsed.
    #[error("{}:{line}: {msg}", .path.display())]
    MappingFile {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    /// A worker thread couldn't be created.
    #[error("couldn't spawn worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked instead of returning.
    #[error("worker '{0}' panicked")]
    WorkerPanicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PchaseError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PchaseError>;
