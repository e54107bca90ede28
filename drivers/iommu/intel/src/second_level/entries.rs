//! # Second-Level Page Table Entries
//!
//! ## SL-PTE Format
//!
//! ```text
//! 63 62  61  52 51                  12 11  10 9 8 7  6   5 3 2 1 0
//! +--+-+------+----------------------+---+--+-+-+--+----+---+-+-+-+
//! |  |TM| ign |   ADDR (frame/table)  |SNP|  |D|A|PS|IPAT|EMT|X|W|R|
//! +--+-+------+----------------------+---+--+-+-+--+----+---+-+-+-+
//! ```
//!
//! An entry is present when R or W is set. Intermediate entries carry R|W
//! so that the leaf alone decides the effective permissions.

use core::fmt;

use crate::addresses::PhysicalAddress;

bitflags::bitflags! {
    /// Second-level entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlFlags: u64 {
        /// Read permission
        const READ = 1 << 0;
        /// Write permission
        const WRITE = 1 << 1;
        /// Execute permission (honored with SLEE in extended contexts)
        const EXECUTE = 1 << 2;
        /// Superpage (PS) in a non-leaf level
        const SUPERPAGE = 1 << 7;
        /// Accessed (hardware-set when A/D tracking is enabled)
        const ACCESSED = 1 << 8;
        /// Dirty (hardware-set when A/D tracking is enabled)
        const DIRTY = 1 << 9;
        /// Snoop behavior for this page
        const SNOOP = 1 << 11;

        /// Flags for an entry pointing at the next-level table
        const TABLE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Second-level page table entry (64-bit)
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SlPte(u64);

impl SlPte {
    /// Address field mask (bits 12-51)
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Create an empty (not present) entry
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create from raw bits
    #[inline]
    pub const fn from_raw(bits: u64) -> Self {
        Self(bits)
    }

    /// Create a leaf entry mapping a 4 KiB frame
    #[inline]
    pub const fn new_leaf(frame: PhysicalAddress, flags: SlFlags) -> Self {
        Self((frame.as_u64() & Self::ADDR_MASK) | flags.bits())
    }

    /// Create an entry pointing at a next-level table
    #[inline]
    pub const fn new_table(table: PhysicalAddress) -> Self {
        Self((table.as_u64() & Self::ADDR_MASK) | SlFlags::TABLE.bits())
    }

    /// Get the raw bits
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Physical address held by the entry
    #[inline]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & Self::ADDR_MASK)
    }

    /// Flag bits
    #[inline]
    pub const fn flags(self) -> SlFlags {
        SlFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    /// Present: readable or writable
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & SlFlags::TABLE.bits() != 0
    }

    /// Superpage bit set
    #[inline]
    pub const fn is_superpage(self) -> bool {
        self.0 & SlFlags::SUPERPAGE.bits() != 0
    }
}

impl Default for SlPte {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SlPte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlPte")
            .field("address", &self.address())
            .field("flags", &self.flags())
            .finish()
    }
}
