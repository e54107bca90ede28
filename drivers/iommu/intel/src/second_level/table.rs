//! # Second-Level Table Structure
//!
//! The 4 KiB table page shared by every level of the second-level tree,
//! plus level and index helpers.

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr;

use super::entries::SlPte;
use crate::PAGE_SIZE;

/// Entries per table page
pub const ENTRIES_PER_TABLE: usize = 512;

/// Deepest tree supported (5-level, 57-bit)
pub const MAX_LEVELS: usize = 5;

// =============================================================================
// Table Index
// =============================================================================

/// A validated index into a table page (0-511)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Create a new table index
    ///
    /// # Panics
    ///
    /// Panics if the index is >= 512.
    #[inline]
    pub const fn new(index: u16) -> Self {
        assert!(index < ENTRIES_PER_TABLE as u16);
        Self(index)
    }

    /// Create a new table index, truncating to the valid range
    #[inline]
    pub const fn new_truncate(index: u16) -> Self {
        Self(index & 0x1FF)
    }

    /// Get the index as usize
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableIndex({})", self.0)
    }
}

impl fmt::Display for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Level
// =============================================================================

/// Level of a table page in the second-level tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Leaf tables mapping 4 KiB pages
    Pt   = 1,
    /// Page directory
    Pd   = 2,
    /// Page directory pointer table
    Pdpt = 3,
    /// Level 4 (root of a 48-bit tree)
    Pml4 = 4,
    /// Level 5 (root of a 57-bit tree)
    Pml5 = 5,
}

impl Level {
    /// Bit position of the lowest address bit indexing this level
    #[inline]
    pub const fn shift(self) -> u32 {
        12 + 9 * (self as u32 - 1)
    }

    /// The level below, `None` for leaf tables
    #[inline]
    pub const fn next_lower(self) -> Option<Level> {
        match self {
            Level::Pml5 => Some(Level::Pml4),
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Number of tables on a root-to-leaf path starting at this level
    #[inline]
    pub const fn depth(self) -> usize {
        self as usize
    }

    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            Level::Pml5 => "PML5",
            Level::Pml4 => "PML4",
            Level::Pdpt => "PDPT",
            Level::Pd => "PD",
            Level::Pt => "PT",
        }
    }
}

// =============================================================================
// Table Page
// =============================================================================

/// A second-level table page (512 entries, 4096 bytes)
///
/// Entries are accessed with volatile reads and writes: the IOMMU may walk
/// any table that is linked into a published tree.
#[repr(C, align(4096))]
pub struct SlPageTable {
    entries: [SlPte; ENTRIES_PER_TABLE],
}

impl SlPageTable {
    /// Create a new empty table
    #[inline]
    pub const fn new() -> Self {
        Self {
            entries: [SlPte::empty(); ENTRIES_PER_TABLE],
        }
    }

    /// Read an entry
    #[inline]
    pub fn read(&self, index: TableIndex) -> SlPte {
        // Safety: the index is in bounds and the entry is an aligned u64
        unsafe { ptr::read_volatile(&self.entries[index.as_usize()]) }
    }

    /// Write an entry with a single aligned store
    #[inline]
    pub fn write(&mut self, index: TableIndex, entry: SlPte) {
        // Safety: the index is in bounds and the entry is an aligned u64
        unsafe { ptr::write_volatile(&mut self.entries[index.as_usize()], entry) }
    }

    /// Zero every entry
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            // Safety: each entry is an aligned u64
            unsafe { ptr::write_volatile(entry, SlPte::empty()) }
        }
    }

    /// Get the number of present entries
    pub fn count_present(&self) -> usize {
        (0..ENTRIES_PER_TABLE as u16)
            .filter(|&i| self.read(TableIndex::new(i)).is_present())
            .count()
    }

    /// Check if no entry is present
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count_present() == 0
    }

    /// Iterate over present entries with their indices
    pub fn iter_present(&self) -> impl Iterator<Item = (TableIndex, SlPte)> + '_ {
        (0..ENTRIES_PER_TABLE as u16)
            .map(move |i| (TableIndex::new(i), self.read(TableIndex::new(i))))
            .filter(|(_, e)| e.is_present())
    }
}

impl Default for SlPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlPageTable")
            .field("present_entries", &self.count_present())
            .field("address", &format_args!("{:p}", self))
            .finish()
    }
}

static_assertions::const_assert_eq!(size_of::<SlPageTable>(), PAGE_SIZE as usize);
static_assertions::const_assert_eq!(align_of::<SlPageTable>(), PAGE_SIZE as usize);
static_assertions::const_assert_eq!(size_of::<SlPte>(), 8);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PhysicalAddress;
    use crate::second_level::entries::SlFlags;

    #[test]
    fn test_table_index() {
        assert_eq!(TableIndex::new(100).as_usize(), 100);
        assert_eq!(TableIndex::new_truncate(600).as_usize(), 600 & 0x1FF);
    }

    #[test]
    fn test_level_shifts() {
        assert_eq!(Level::Pt.shift(), 12);
        assert_eq!(Level::Pd.shift(), 21);
        assert_eq!(Level::Pdpt.shift(), 30);
        assert_eq!(Level::Pml4.shift(), 39);
        assert_eq!(Level::Pml5.shift(), 48);
        assert_eq!(Level::Pml4.next_lower(), Some(Level::Pdpt));
        assert_eq!(Level::Pt.next_lower(), None);
        assert_eq!(Level::Pml4.depth(), 4);
    }

    #[test]
    fn test_table_read_write() {
        let mut table = Box::new(SlPageTable::new());
        assert!(table.is_empty());

        let idx = TableIndex::new(42);
        table.write(idx, SlPte::new_leaf(PhysicalAddress::new(0x1000), SlFlags::READ | SlFlags::WRITE));
        assert_eq!(table.count_present(), 1);
        assert_eq!(table.read(idx).address().as_u64(), 0x1000);
        assert_eq!(table.iter_present().next().map(|(i, _)| i), Some(idx));

        table.zero();
        assert!(table.is_empty());
    }
}
