//! Module for interacting with `/proc/self/pagemap`.
//!
//! The kernel exposes one 64-bit entry per virtual page. Bit 63 is the
//! "present" flag and bits [53:0] hold the physical frame number. Readers
//! without `CAP_SYS_ADMIN` see a frame number of zero.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::{debug, warn};

use crate::env;
use crate::error::{PchaseError, Result};

/// An entry in `/proc/self/pagemap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMapEntry(pub u64);
impl PageMapEntry {
    pub const NUM_BYTES: usize = 8;
    const PFN_MASK: u64 = (1 << 54) - 1;

    pub fn present(&self) -> bool { (self.0 & (1 << 63)) != 0 }
    pub fn swapped(&self) -> bool { (self.0 & (1 << 62)) != 0 }
    pub fn pfn(&self) -> u64 { self.0 & Self::PFN_MASK }
}

/// Open handle to a pagemap image.
#[derive(Debug)]
pub struct PageMap {
    file: File,
    page_size: usize,
}

impl PageMap {
    pub const PATH: &'static str = "/proc/self/pagemap";

    /// Open the pagemap of the current process.
    pub fn open() -> Result<Self> {
        Self::open_path(Self::PATH, env::page_size())
    }

    /// Open a file laid out like a pagemap (one entry per page).
    pub fn open_path(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PchaseError::PermissionDenied {
            reason: format!("couldn't open {}: {}", path.display(), e),
        })?;
        Ok(Self::from_file(file, page_size))
    }

    pub fn from_file(file: File, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        Self { file, page_size }
    }

    pub fn page_size(&self) -> usize { self.page_size }

    /// Read the raw entry describing the page that contains `vaddr`.
    pub fn entry(&self, vaddr: usize) -> Result<PageMapEntry> {
        let mut buf = [0u8; PageMapEntry::NUM_BYTES];
        let vfn = vaddr / self.page_size;
        let foff = (vfn * PageMapEntry::NUM_BYTES) as i64;
        let got = nix::sys::uio::pread(self.file.as_raw_fd(), &mut buf, foff)
            .map_err(|errno| PchaseError::PermissionDenied {
                reason: format!("pagemap read at {:#x} failed: {}", foff, errno.desc()),
            })?;
        assert_eq!(got, PageMapEntry::NUM_BYTES,
            "short pagemap read at offset {:#x}", foff);
        Ok(PageMapEntry(u64::from_le_bytes(buf)))
    }

    /// Resolve the given virtual address into a physical address.
    pub fn resolve(&self, vaddr: usize) -> Result<usize> {
        let entry = self.entry(vaddr)?;
        if !entry.present() {
            return Err(PchaseError::PageNotResident { vaddr });
        }
        if entry.pfn() == 0 {
            return Err(PchaseError::PermissionDenied {
                reason: "pagemap reports PFN 0".to_string(),
            });
        }
        let offset = vaddr & (self.page_size - 1);
        Ok((entry.pfn() as usize * self.page_size) | offset)
    }
}

/// Source of the addresses fed to the color classifier.
///
/// `Virtual` is the degraded mode: virtual addresses stand in for physical
/// ones. Colors computed this way are not meaningful, but timing results
/// that don't depend on color placement still are.
#[derive(Debug)]
pub enum AddressResolver {
    Physical(PageMap),
    Virtual,
}

impl AddressResolver {
    /// Use the process pagemap when it can actually reveal frame numbers.
    pub fn detect() -> Self {
        if !env::is_root() {
            warn!("Running without root privileges; physical addresses \
                are replaced by virtual addresses");
            return Self::Virtual;
        }
        match PageMap::open() {
            Ok(pm) => {
                debug!("Using {} (page size {:#x})", PageMap::PATH, pm.page_size());
                Self::Physical(pm)
            },
            Err(e) => {
                warn!("{}; falling back to virtual addresses", e);
                Self::Virtual
            },
        }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, Self::Physical(_))
    }

    /// Granularity at which translations change.
    pub fn page_size(&self) -> usize {
        match self {
            Self::Physical(pm) => pm.page_size(),
            Self::Virtual => env::page_size(),
        }
    }

    /// Translate `vaddr` into the address used for classification.
    ///
    /// A permission failure permanently downgrades this resolver to
    /// [`AddressResolver::Virtual`]. A non-resident page is an error.
    pub fn translate(&mut self, vaddr: usize) -> Result<usize> {
        let res = match self {
            Self::Virtual => return Ok(vaddr),
            Self::Physical(pm) => pm.resolve(vaddr),
        };
        match res {
            Err(PchaseError::PermissionDenied { reason }) => {
                warn!("{}; falling back to virtual addresses", reason);
                *self = Self::Virtual;
                Ok(vaddr)
            },
            other => other,
        }
    }
}
