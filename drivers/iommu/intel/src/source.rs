//! # Page Sources
//!
//! Memory handed to a device for DMA is described by a [`PageSource`]: a
//! byte-addressed object that resolves page offsets to host frames. Sources
//! that are physically contiguous report their base, which lets the mapper
//! derive every frame arithmetically instead of looking each one up.

use crate::addresses::PhysicalAddress;
use crate::PAGE_SIZE;

/// Memory that can back a DMA mapping
pub trait PageSource {
    /// Size of the source in bytes
    fn size(&self) -> u64;

    /// Host frame backing the page at byte `offset`
    ///
    /// `None` if the page is not resident or cannot be pinned.
    fn lookup(&self, offset: u64) -> Option<PhysicalAddress>;

    /// Base frame if the whole source is physically contiguous
    fn contiguous_base(&self) -> Option<PhysicalAddress> {
        None
    }
}

/// A physically contiguous run of pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousPages {
    base: PhysicalAddress,
    size: u64,
}

impl ContiguousPages {
    /// Describe `size` bytes starting at the page-aligned `base`
    pub const fn new(base: PhysicalAddress, size: u64) -> Self {
        Self { base, size }
    }
}

impl PageSource for ContiguousPages {
    fn size(&self) -> u64 {
        self.size
    }

    fn lookup(&self, offset: u64) -> Option<PhysicalAddress> {
        if offset >= self.size {
            return None;
        }
        Some(self.base.offset(offset & !(PAGE_SIZE - 1)))
    }

    fn contiguous_base(&self) -> Option<PhysicalAddress> {
        Some(self.base)
    }
}

// =============================================================================
// Mapping Backings
// =============================================================================

/// Frame resolution strategy for one map request
pub(crate) trait MappingBacking {
    /// Frame for the `page`-th page of the request
    fn frame(&self, page: u64) -> Option<PhysicalAddress>;
}

/// Resolves each page through the source
pub(crate) struct PagedBacking<'a> {
    source: &'a dyn PageSource,
    offset: u64,
}

impl<'a> PagedBacking<'a> {
    pub(crate) fn new(source: &'a dyn PageSource, offset: u64) -> Self {
        Self { source, offset }
    }
}

impl MappingBacking for PagedBacking<'_> {
    fn frame(&self, page: u64) -> Option<PhysicalAddress> {
        let offset = page.checked_mul(PAGE_SIZE)?.checked_add(self.offset)?;
        self.source.lookup(offset)
    }
}

/// Derives frames from a contiguous base
pub(crate) struct ContiguousBacking {
    base: PhysicalAddress,
}

impl ContiguousBacking {
    pub(crate) fn new(base: PhysicalAddress, offset: u64) -> Self {
        Self { base: base.offset(offset) }
    }
}

impl MappingBacking for ContiguousBacking {
    fn frame(&self, page: u64) -> Option<PhysicalAddress> {
        Some(self.base.offset(page.checked_mul(PAGE_SIZE)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_lookup() {
        let pages = ContiguousPages::new(PhysicalAddress::new(0x10_0000), 3 * PAGE_SIZE);
        assert_eq!(pages.lookup(0x1800), Some(PhysicalAddress::new(0x10_1000)));
        assert_eq!(pages.lookup(3 * PAGE_SIZE), None);
        assert_eq!(pages.contiguous_base(), Some(PhysicalAddress::new(0x10_0000)));
    }

    #[test]
    fn test_backings_agree() {
        let pages = ContiguousPages::new(PhysicalAddress::new(0x40_0000), 8 * PAGE_SIZE);
        let paged = PagedBacking::new(&pages, 2 * PAGE_SIZE);
        let contiguous = ContiguousBacking::new(PhysicalAddress::new(0x40_0000), 2 * PAGE_SIZE);
        for page in 0..6 {
            assert_eq!(paged.frame(page), contiguous.frame(page));
        }
        assert_eq!(paged.frame(6), None);
    }
}
