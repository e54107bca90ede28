//! # Address Types
//!
//! Type-safe host physical addresses and device (I/O virtual) addresses.

use core::fmt;
use core::ops::{Add, Sub};

use crate::second_level::{Level, TableIndex};
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Physical address bits the second-level and context entry formats can hold
pub const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;

// =============================================================================
// Physical Address
// =============================================================================

/// A host physical address
///
/// Masked to the 52 bits the VT-d table formats can carry.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    /// Create a new physical address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr & PHYS_ADDR_MASK)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if the address is aligned to the translation granule
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Frame number (address >> 12)
    #[inline]
    pub const fn frame_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Add a byte offset to this address
    #[inline]
    pub const fn offset(self, offset: u64) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.0
    }
}

// =============================================================================
// I/O Virtual Address
// =============================================================================

/// A device-visible DMA address
///
/// Translated by the second-level page table of the device's context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Iova(u64);

impl Iova {
    /// Create a new device address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check alignment against a power-of-two boundary
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Page number within the address space
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Index into the table at `level` for this address
    #[inline]
    pub const fn table_index(self, level: Level) -> TableIndex {
        TableIndex::new_truncate((self.0 >> level.shift()) as u16)
    }

    /// Offset by `bytes`, `None` on overflow
    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iova({:#x})", self.0)
    }
}

impl fmt::Display for Iova {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for Iova {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Iova> for Iova {
    type Output = u64;

    #[inline]
    fn sub(self, rhs: Iova) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<Iova> for u64 {
    #[inline]
    fn from(addr: Iova) -> Self {
        addr.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_address_masking() {
        let addr = PhysicalAddress::new(0xFFF0_0000_0000_1000);
        assert_eq!(addr.as_u64(), 0x0000_0000_0000_1000);
        assert!(addr.is_page_aligned());
        assert!(!PhysicalAddress::new(0x1001).is_page_aligned());
        assert_eq!(PhysicalAddress::new(0x5000).frame_number(), 5);
    }

    #[test]
    fn test_iova_table_indices() {
        // PML4 = 1, PDPT = 2, PD = 3, PT = 4, offset = 0x123
        let iova = Iova::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x123);
        assert_eq!(iova.table_index(Level::Pml4).as_usize(), 1);
        assert_eq!(iova.table_index(Level::Pdpt).as_usize(), 2);
        assert_eq!(iova.table_index(Level::Pd).as_usize(), 3);
        assert_eq!(iova.table_index(Level::Pt).as_usize(), 4);
        assert!(!iova.is_aligned(PAGE_SIZE));
    }

    #[test]
    fn test_iova_arithmetic() {
        let base = Iova::new(0x4000);
        assert_eq!((base + 0x1000).as_u64(), 0x5000);
        assert_eq!(Iova::new(0x9000) - base, 0x5000);
        assert_eq!(Iova::new(u64::MAX).checked_add(1), None);
    }
}
