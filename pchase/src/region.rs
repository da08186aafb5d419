//! Index-addressed memory region backing the pointer chains.
//!
//! The region is divided into `num_elements()` elements of `unit_size()`
//! bytes. Every element is a small array of 4-byte slots:
//!
//! ```text
//!  element e (unit_size bytes)
//!  +----------+----------+-------- ... --+
//!  | next idx | sentinel |    padding    |
//!  +----------+----------+-------- ... --+
//! ```
//!
//! Elements are only ever named by index. The next-index slot can only be
//! written through [`Region::set_next`], which rejects out-of-range values
//! and needs exclusive access, so following any stored index always stays
//! inside the mapping, even while the region is shared with workers.

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{PchaseError, Result};

/// Width of one slot (and of a stored element index).
pub const INDEX_WIDTH: usize = std::mem::size_of::<u32>();

/// Element size used by most programs: one cache line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Log2 of the hugepage size requested with `MAP_HUGETLB` (2MiB).
const HUGEPAGE_BITS: u8 = 21;

/// Options used to map a [`Region`].
#[derive(Clone, Copy, Debug)]
pub struct RegionOptions {
    pub size: usize,
    pub unit_size: usize,
    pub hugepage: bool,
}

impl RegionOptions {
    pub fn new(size: usize, unit_size: usize) -> Self {
        Self { size, unit_size, hugepage: false }
    }

    pub fn hugepage(mut self, x: bool) -> Self {
        self.hugepage = x;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_size < 2 * INDEX_WIDTH || self.unit_size % INDEX_WIDTH != 0 {
            return Err(PchaseError::invalid(format!(
                "unit size {} must be a multiple of {} and hold at least two slots",
                self.unit_size, INDEX_WIDTH)));
        }
        if self.size < self.unit_size {
            return Err(PchaseError::invalid(format!(
                "region size {} is smaller than one unit ({})",
                self.size, self.unit_size)));
        }
        if self.size / self.unit_size > u32::MAX as usize {
            return Err(PchaseError::invalid(format!(
                "region of {} bytes has too many elements for 32-bit indices",
                self.size)));
        }
        Ok(())
    }

    /// Map the region.
    pub fn map(self) -> Result<Region> {
        Region::new(self)
    }
}

/// An exclusively-owned, page-aligned anonymous mapping.
pub struct Region {
    map: MmapMut,
    base: *mut u32,
    size: usize,
    unit_size: usize,
    slots: usize,
    elems: usize,
    hugepage: bool,
}

// SAFETY: the mapping is owned by the region and lives as long as it does.
// Concurrent users only ever touch disjoint elements (chains are disjoint by
// construction) and all accesses go through raw pointers, never references.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub fn new(opts: RegionOptions) -> Result<Self> {
        opts.validate()?;
        let mut mmap_opts = MmapOptions::new();
        mmap_opts.len(opts.size).populate();
        if opts.hugepage {
            mmap_opts.huge(Some(HUGEPAGE_BITS));
        }
        let mut map = mmap_opts.map_anon().map_err(|source| {
            PchaseError::AllocationFailure {
                size: opts.size,
                hugepage: opts.hugepage,
                source,
            }
        })?;

        // Touch every page so it is resident before anyone asks the
        // pagemap about it.
        map.fill(0);

        let base = map.as_mut_ptr() as *mut u32;
        let res = Self {
            map,
            base,
            size: opts.size,
            unit_size: opts.unit_size,
            slots: opts.unit_size / INDEX_WIDTH,
            elems: opts.size / opts.unit_size,
            hugepage: opts.hugepage,
        };
        debug!("mapped {:#x} bytes at {:#018x} ({} elements of {}B{})",
            res.size, res.base_addr(), res.elems, res.unit_size,
            if res.hugepage { ", hugetlb" } else { "" });
        Ok(res)
    }

    pub fn base_addr(&self) -> usize { self.base as usize }
    pub fn len_bytes(&self) -> usize { self.size }
    pub fn unit_size(&self) -> usize { self.unit_size }
    pub fn num_elements(&self) -> usize { self.elems }

    /// Virtual address of element `elem`.
    pub fn vaddr(&self, elem: usize) -> usize {
        self.base_addr() + elem * self.unit_size
    }

    /// Element containing the byte at `offset` from the base.
    pub fn element_at(&self, offset: usize) -> Option<usize> {
        let elem = offset / self.unit_size;
        (elem < self.elems).then_some(elem)
    }

    pub fn contains(&self, elem: u32) -> bool {
        (elem as usize) < self.elems
    }

    fn slot_ptr(&self, elem: u32, slot: usize) -> *mut u32 {
        debug_assert!(self.contains(elem) && slot < self.slots);
        // SAFETY: callers guarantee `elem < elems` and `slot < slots`, so the
        // offset stays within the mapping.
        unsafe { self.base.add(elem as usize * self.slots + slot) }
    }

    /// Read the next-index slot of `elem`.
    pub fn next(&self, elem: u32) -> u32 {
        assert!(self.contains(elem), "element {} out of range", elem);
        // SAFETY: bounds checked above.
        unsafe { self.load_next_unchecked(elem) }
    }

    /// Link `elem` to `next`.
    pub fn set_next(&mut self, elem: u32, next: u32) {
        assert!(self.contains(elem) && self.contains(next),
            "link {} -> {} out of range ({} elements)", elem, next, self.elems);
        // SAFETY: bounds checked above.
        unsafe { self.slot_ptr(elem, 0).write_volatile(next) }
    }

    /// Read the sentinel slot of `elem`.
    pub fn sentinel(&self, elem: u32) -> u32 {
        assert!(self.contains(elem), "element {} out of range", elem);
        // SAFETY: bounds checked above.
        unsafe { self.slot_ptr(elem, 1).read_volatile() }
    }

    /// Load the next index of `elem` without a bounds check.
    ///
    /// # Safety
    ///
    /// `elem` must be a valid element index. Any value previously returned by
    /// this function satisfies that, since next slots only hold valid indices.
    #[inline(always)]
    pub(crate) unsafe fn load_next_unchecked(&self, elem: u32) -> u32 {
        self.base.add(elem as usize * self.slots).read_volatile()
    }

    /// Store into the sentinel slot of `elem` without a bounds check.
    ///
    /// # Safety
    ///
    /// Same contract as [`Region::load_next_unchecked`].
    #[inline(always)]
    pub(crate) unsafe fn store_sentinel_unchecked(&self, elem: u32, value: u32) {
        self.base.add(elem as usize * self.slots + 1).write_volatile(value)
    }

    /// First offset at or after `offset` that is not part of a next-index
    /// slot. Bytes past the last element are returned unchanged.
    pub(crate) fn payload_offset(&self, offset: usize) -> usize {
        if offset >= self.elems * self.unit_size {
            return offset;
        }
        match offset % self.unit_size {
            r if r < INDEX_WIDTH => offset + (INDEX_WIDTH - r),
            _ => offset,
        }
    }

    /// Read the byte at `offset`.
    pub(crate) fn read_byte(&self, offset: usize) -> u8 {
        assert!(offset < self.size);
        // SAFETY: bounds checked above.
        unsafe { (self.base as *const u8).add(offset).read_volatile() }
    }

    /// Write the byte at `offset`, which must not fall into a next-index slot.
    pub(crate) fn write_byte(&self, offset: usize, value: u8) {
        assert!(offset < self.size);
        assert_eq!(self.payload_offset(offset), offset,
            "write at {:#x} would clobber a next-index slot", offset);
        // SAFETY: bounds checked above.
        unsafe { (self.base as *mut u8).add(offset).write_volatile(value) }
    }

    /// Reset every element to zero (unlinked).
    pub fn clear(&mut self) {
        self.map.fill(0);
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#018x}", self.base_addr()))
            .field("size", &self.size)
            .field("unit_size", &self.unit_size)
            .field("elems", &self.elems)
            .field("hugepage", &self.hugepage)
            .finish()
    }
}
