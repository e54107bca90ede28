//! # Second-Level Page Table
//!
//! The translation tree the IOMMU walks for requests-without-PASID:
//!
//! ```text
//!   IOVA [47:39]       [38:30]       [29:21]       [20:12]     [11:0]
//!        PML4  ------> PDPT  ------> PD  --------> PT -------> frame
//! ```
//!
//! ## Population
//!
//! Tables are created lazily on the path to a new leaf. Every missing table
//! on the path is allocated and zeroed before any of them is linked, so a
//! failed allocation leaves the tree untouched.
//!
//! ## Reclamation
//!
//! Each table page lives in an arena keyed by its physical frame, next to a
//! count of its present entries. Removing the last entry of a non-root table
//! unlinks it from its parent. Unlinked tables are handed back as
//! [`StaleTables`] and must not be freed until the IOTLB no longer holds
//! translations through them; [`SecondLevelPageTable::reclaim`] frees them.

mod entries;
mod table;

pub use entries::{SlFlags, SlPte};
pub use table::{Level, SlPageTable, TableIndex, ENTRIES_PER_TABLE, MAX_LEVELS};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use crate::addresses::{Iova, PhysicalAddress};
use crate::error::{IommuError, IommuResult};
use crate::types::Permissions;

// =============================================================================
// Table Page Allocation
// =============================================================================

/// A 4 KiB table page: its physical address and a CPU mapping of it
pub struct TablePage {
    phys: PhysicalAddress,
    virt: NonNull<SlPageTable>,
}

impl TablePage {
    /// Wrap an allocated table page
    ///
    /// # Safety
    ///
    /// `virt` must be a valid, exclusively owned CPU mapping of the page at
    /// `phys`, and `phys` must be 4 KiB aligned.
    #[inline]
    pub const unsafe fn new(phys: PhysicalAddress, virt: NonNull<SlPageTable>) -> Self {
        Self { phys, virt }
    }

    /// Physical address of the page
    #[inline]
    pub const fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    /// CPU mapping of the page
    #[inline]
    pub const fn as_ptr(&self) -> NonNull<SlPageTable> {
        self.virt
    }

    #[inline]
    fn table(&self) -> &SlPageTable {
        // Safety: guaranteed by the constructor contract
        unsafe { self.virt.as_ref() }
    }

    #[inline]
    fn table_mut(&mut self) -> &mut SlPageTable {
        // Safety: guaranteed by the constructor contract
        unsafe { self.virt.as_mut() }
    }
}

// Safety: a TablePage is the unique handle to its memory.
unsafe impl Send for TablePage {}

impl fmt::Debug for TablePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablePage")
            .field("phys", &self.phys)
            .field("virt", &self.virt)
            .finish()
    }
}

/// Source of hardware-page-aligned memory for translation tables
pub trait TablePageAllocator: Send + Sync {
    /// Allocate one zeroed 4 KiB page
    fn allocate(&self) -> Option<TablePage>;

    /// Return a page to the allocator
    ///
    /// # Safety
    ///
    /// `page` must come from [`TablePageAllocator::allocate`] on this
    /// allocator, and no hardware cache may still reference it.
    unsafe fn free(&self, page: TablePage);
}

/// Tables unlinked from the tree but possibly still cached by hardware
#[must_use = "stale tables must be reclaimed after IOTLB invalidation"]
#[derive(Debug, Default)]
pub struct StaleTables(Vec<TablePage>);

impl StaleTables {
    /// Create an empty set
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of pending pages
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if nothing is pending
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Table Arena
// =============================================================================

struct TableNode {
    page: TablePage,
    level: Level,
    /// Present entries in this table
    live: u16,
}

// =============================================================================
// Second-Level Page Table
// =============================================================================

/// A second-level translation tree
pub struct SecondLevelPageTable {
    allocator: Arc<dyn TablePageAllocator>,
    root: PhysicalAddress,
    top_level: Level,
    nodes: HashMap<u64, TableNode>,
    allow_execute: bool,
    allow_snoop: bool,
    mapped_pages: u64,
}

impl SecondLevelPageTable {
    /// Create a tree with an empty root at `top_level`
    pub fn new(
        allocator: Arc<dyn TablePageAllocator>,
        top_level: Level,
        allow_execute: bool,
        allow_snoop: bool,
    ) -> IommuResult<Self> {
        let mut page = allocator.allocate().ok_or(IommuError::AllocationFailure)?;
        page.table_mut().zero();
        let root = page.physical_address();

        let mut nodes = HashMap::new();
        nodes.insert(root.as_u64(), TableNode { page, level: top_level, live: 0 });

        Ok(Self {
            allocator,
            root,
            top_level,
            nodes,
            allow_execute,
            allow_snoop,
            mapped_pages: 0,
        })
    }

    /// Physical address of the root table
    #[inline]
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Level of the root table
    #[inline]
    pub fn top_level(&self) -> Level {
        self.top_level
    }

    /// Number of table pages, root included
    #[inline]
    pub fn table_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf translations
    #[inline]
    pub fn mapped_pages(&self) -> u64 {
        self.mapped_pages
    }

    /// Leaf flags for the requested permissions
    ///
    /// Execute and snoop are dropped when the format cannot express them.
    pub fn leaf_flags(&self, perms: Permissions) -> IommuResult<SlFlags> {
        if !perms.intersects(Permissions::READ_WRITE) {
            return Err(IommuError::InvalidArgument);
        }

        let mut flags = SlFlags::empty();
        if perms.contains(Permissions::READ) {
            flags |= SlFlags::READ;
        }
        if perms.contains(Permissions::WRITE) {
            flags |= SlFlags::WRITE;
        }
        if perms.contains(Permissions::EXECUTE) {
            if self.allow_execute {
                flags |= SlFlags::EXECUTE;
            } else {
                log::warn!("VT-d: execute permission not supported by context format, dropped");
            }
        }
        if perms.contains(Permissions::SNOOP) {
            if self.allow_snoop {
                flags |= SlFlags::SNOOP;
            } else {
                log::warn!("VT-d: snoop control not supported, dropped");
            }
        }
        Ok(flags)
    }

    #[inline]
    fn node(&self, table: PhysicalAddress) -> Option<&TableNode> {
        self.nodes.get(&table.as_u64())
    }

    /// Write `entry` into a table, keeping its live count in step
    fn set_entry(&mut self, table: PhysicalAddress, index: TableIndex, entry: SlPte) {
        let Some(node) = self.nodes.get_mut(&table.as_u64()) else {
            return;
        };
        let was_present = node.page.table().read(index).is_present();
        node.page.table_mut().write(index, entry);
        match (was_present, entry.is_present()) {
            (false, true) => node.live += 1,
            (true, false) => node.live -= 1,
            _ => {},
        }
    }

    /// Install a 4 KiB translation
    ///
    /// Fails with `AllocationFailure` if a missing table cannot be allocated
    /// (the tree is unchanged) and `AlreadyMapped` if a translation exists.
    pub fn map_page(&mut self, iova: Iova, frame: PhysicalAddress, flags: SlFlags) -> IommuResult<()> {
        if !iova.is_aligned(crate::PAGE_SIZE) || !frame.is_page_aligned() {
            return Err(IommuError::Misaligned);
        }

        // Descend through existing tables
        let mut table = self.root;
        let mut level = self.top_level;
        while let Some(next) = level.next_lower() {
            let Some(node) = self.node(table) else {
                return Err(IommuError::AlreadyMapped);
            };
            let entry = node.page.table().read(iova.table_index(level));
            if !entry.is_present() {
                break;
            }
            if entry.is_superpage() {
                return Err(IommuError::AlreadyMapped);
            }
            table = entry.address();
            level = next;
        }

        if level == Level::Pt {
            let present = self
                .node(table)
                .map(|n| n.page.table().read(iova.table_index(Level::Pt)).is_present())
                .unwrap_or(true);
            if present {
                return Err(IommuError::AlreadyMapped);
            }
        }

        // Allocate every missing table before publishing any of them
        let missing = level.depth() - 1;
        let mut fresh: ArrayVec<TablePage, MAX_LEVELS> = ArrayVec::new();
        for _ in 0..missing {
            match self.allocator.allocate() {
                Some(mut page) => {
                    page.table_mut().zero();
                    fresh.push(page);
                },
                None => {
                    for page in fresh {
                        // Safety: never linked, so never visible to hardware
                        unsafe { self.allocator.free(page) };
                    }
                    return Err(IommuError::AllocationFailure);
                },
            }
        }

        for page in fresh {
            let Some(next) = level.next_lower() else {
                break;
            };
            let child = page.physical_address();
            self.nodes.insert(child.as_u64(), TableNode { page, level: next, live: 0 });
            self.set_entry(table, iova.table_index(level), SlPte::new_table(child));
            table = child;
            level = next;
        }
        debug_assert_eq!(level, Level::Pt);

        self.set_entry(table, iova.table_index(Level::Pt), SlPte::new_leaf(frame, flags));
        self.mapped_pages += 1;
        Ok(())
    }

    /// Remove a 4 KiB translation, returning the frame it mapped
    ///
    /// Tables left empty are unlinked and appended to `stale`.
    pub fn unmap_page(&mut self, iova: Iova, stale: &mut StaleTables) -> IommuResult<PhysicalAddress> {
        if !iova.is_aligned(crate::PAGE_SIZE) {
            return Err(IommuError::Misaligned);
        }

        // Record the path so empty tables can be unlinked bottom-up
        let mut path: ArrayVec<PhysicalAddress, MAX_LEVELS> = ArrayVec::new();
        let mut table = self.root;
        let mut level = self.top_level;
        loop {
            let node = self.node(table).ok_or(IommuError::NotMapped)?;
            let entry = node.page.table().read(iova.table_index(level));
            if !entry.is_present() {
                return Err(IommuError::NotMapped);
            }
            path.push(table);
            match level.next_lower() {
                Some(next) => {
                    if entry.is_superpage() {
                        return Err(IommuError::NotMapped);
                    }
                    table = entry.address();
                    level = next;
                },
                None => break,
            }
        }

        let Some(leaf_table) = path.pop() else {
            return Err(IommuError::NotMapped);
        };
        let frame = self
            .node(leaf_table)
            .map(|n| n.page.table().read(iova.table_index(Level::Pt)).address())
            .ok_or(IommuError::NotMapped)?;
        self.set_entry(leaf_table, iova.table_index(Level::Pt), SlPte::empty());
        self.mapped_pages -= 1;

        // Unlink empty tables, never the root
        let mut child = leaf_table;
        while let Some(parent) = path.pop() {
            let Some(node) = self.node(child) else {
                break;
            };
            if node.live != 0 {
                break;
            }
            let parent_level = match self.node(parent) {
                Some(p) => p.level,
                None => break,
            };
            self.set_entry(parent, iova.table_index(parent_level), SlPte::empty());
            if let Some(node) = self.nodes.remove(&child.as_u64()) {
                stale.0.push(node.page);
            }
            child = parent;
        }

        Ok(frame)
    }

    /// Free tables unlinked by [`Self::unmap_page`]
    ///
    /// Must only be called once the IOTLB holds no translation through them.
    pub fn reclaim(&mut self, stale: StaleTables) {
        for page in stale.0 {
            // Safety: the page came from our allocator, was unlinked from the
            // tree, and the caller has invalidated the IOTLB.
            unsafe { self.allocator.free(page) };
        }
    }

    /// Software walk of the tree
    pub fn translate(&self, iova: Iova) -> Option<(PhysicalAddress, SlFlags)> {
        let mut table = self.root;
        let mut level = self.top_level;
        loop {
            let entry = self.node(table)?.page.table().read(iova.table_index(level));
            if !entry.is_present() {
                return None;
            }
            match level.next_lower() {
                Some(next) if !entry.is_superpage() => {
                    table = entry.address();
                    level = next;
                },
                Some(_) => return None,
                None => {
                    let offset = iova.as_u64() & (crate::PAGE_SIZE - 1);
                    return Some((entry.address().offset(offset), entry.flags()));
                },
            }
        }
    }

    /// Dump the tree through the log facade
    #[cfg(feature = "debug")]
    pub fn dump(&self) {
        const INDENT: [&str; MAX_LEVELS] = ["", "  ", "    ", "      ", "        "];

        fn dump_level(pt: &SecondLevelPageTable, table: PhysicalAddress, depth: usize) {
            let Some(node) = pt.node(table) else {
                return;
            };
            let prefix = INDENT[depth.min(MAX_LEVELS - 1)];
            for (idx, entry) in node.page.table().iter_present() {
                log::debug!(
                    "{}{} [{}]: {:#x} {:?}",
                    prefix,
                    node.level.name(),
                    idx,
                    entry.address().as_u64(),
                    entry.flags()
                );
                if node.level != Level::Pt {
                    dump_level(pt, entry.address(), depth + 1);
                }
            }
        }

        log::debug!(
            "Second-level table dump (root: {:#x}, {} tables, {} pages)",
            self.root.as_u64(),
            self.table_count(),
            self.mapped_pages
        );
        dump_level(self, self.root, 0);
    }
}

impl Drop for SecondLevelPageTable {
    fn drop(&mut self) {
        for (_, node) in self.nodes.drain() {
            // Safety: the owner invalidated every hardware reference to this
            // tree before dropping it.
            unsafe { self.allocator.free(node.page) };
        }
    }
}

impl fmt::Debug for SecondLevelPageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondLevelPageTable")
            .field("root", &self.root)
            .field("top_level", &self.top_level)
            .field("tables", &self.nodes.len())
            .field("mapped_pages", &self.mapped_pages)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HeapTableAllocator;
    use crate::PAGE_SIZE;

    fn new_table(alloc: &Arc<HeapTableAllocator>) -> SecondLevelPageTable {
        SecondLevelPageTable::new(alloc.clone(), Level::Pml4, false, false).unwrap()
    }

    fn frame(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(0x8000_0000 + n * PAGE_SIZE)
    }

    #[test]
    fn test_lazy_population() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);
        assert_eq!(pt.table_count(), 1);

        pt.map_page(Iova::new(0), frame(0), SlFlags::READ).unwrap();
        // PML4 + PDPT + PD + PT
        assert_eq!(pt.table_count(), 4);
        assert_eq!(alloc.live_pages(), 4);

        assert_eq!(pt.translate(Iova::new(0x10)), Some((frame(0).offset(0x10), SlFlags::READ)));
        assert_eq!(pt.translate(Iova::new(PAGE_SIZE)), None);
    }

    #[test]
    fn test_shared_tables_freed_with_last_leaf() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);

        pt.map_page(Iova::new(0), frame(0), SlFlags::READ).unwrap();
        pt.map_page(Iova::new(PAGE_SIZE), frame(1), SlFlags::WRITE).unwrap();
        assert_eq!(pt.table_count(), 4);

        let mut stale = StaleTables::new();
        assert_eq!(pt.unmap_page(Iova::new(0), &mut stale), Ok(frame(0)));
        assert!(stale.is_empty());
        assert_eq!(pt.table_count(), 4);
        assert!(pt.translate(Iova::new(PAGE_SIZE)).is_some());

        assert_eq!(pt.unmap_page(Iova::new(PAGE_SIZE), &mut stale), Ok(frame(1)));
        assert_eq!(stale.len(), 3);
        assert_eq!(pt.table_count(), 1);
        // Unlinked but not yet freed
        assert_eq!(alloc.live_pages(), 4);

        pt.reclaim(stale);
        assert_eq!(alloc.live_pages(), 1);
        assert_eq!(pt.mapped_pages(), 0);
    }

    #[test]
    fn test_distant_mappings_use_separate_tables() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);

        pt.map_page(Iova::new(0), frame(0), SlFlags::READ).unwrap();
        // Different PML4 slot: a whole new PDPT/PD/PT path
        pt.map_page(Iova::new(1 << 39), frame(1), SlFlags::READ).unwrap();
        assert_eq!(pt.table_count(), 7);

        let mut stale = StaleTables::new();
        pt.unmap_page(Iova::new(1 << 39), &mut stale).unwrap();
        assert_eq!(stale.len(), 3);
        pt.reclaim(stale);
        assert_eq!(pt.table_count(), 4);
        assert!(pt.translate(Iova::new(0)).is_some());
    }

    #[test]
    fn test_double_map_rejected() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);

        pt.map_page(Iova::new(0x5000), frame(0), SlFlags::READ).unwrap();
        assert_eq!(
            pt.map_page(Iova::new(0x5000), frame(1), SlFlags::READ),
            Err(IommuError::AlreadyMapped)
        );
        assert_eq!(pt.translate(Iova::new(0x5000)).map(|(p, _)| p), Some(frame(0)));
    }

    #[test]
    fn test_unmap_missing_page() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);
        let mut stale = StaleTables::new();

        assert_eq!(pt.unmap_page(Iova::new(0), &mut stale), Err(IommuError::NotMapped));
        pt.map_page(Iova::new(0), frame(0), SlFlags::READ).unwrap();
        assert_eq!(pt.unmap_page(Iova::new(PAGE_SIZE), &mut stale), Err(IommuError::NotMapped));
        assert_eq!(pt.unmap_page(Iova::new(0x10), &mut stale), Err(IommuError::Misaligned));
        assert!(stale.is_empty());
    }

    #[test]
    fn test_allocation_failure_leaves_tree_unchanged() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let mut pt = new_table(&alloc);

        // Two of the three missing tables can be allocated
        alloc.set_remaining(Some(2));
        assert_eq!(
            pt.map_page(Iova::new(0), frame(0), SlFlags::READ),
            Err(IommuError::AllocationFailure)
        );
        assert_eq!(pt.table_count(), 1);
        assert_eq!(alloc.live_pages(), 1);
        assert_eq!(pt.translate(Iova::new(0)), None);

        alloc.set_remaining(None);
        pt.map_page(Iova::new(0), frame(0), SlFlags::READ).unwrap();
        assert_eq!(pt.table_count(), 4);
    }

    #[test]
    fn test_leaf_flags() {
        let alloc = Arc::new(HeapTableAllocator::new());
        let legacy = SecondLevelPageTable::new(alloc.clone(), Level::Pml4, false, false).unwrap();
        let extended = SecondLevelPageTable::new(alloc.clone(), Level::Pml4, true, true).unwrap();

        let rwx = Permissions::READ_WRITE | Permissions::EXECUTE | Permissions::SNOOP;
        assert_eq!(legacy.leaf_flags(rwx), Ok(SlFlags::READ | SlFlags::WRITE));
        assert_eq!(
            extended.leaf_flags(rwx),
            Ok(SlFlags::READ | SlFlags::WRITE | SlFlags::EXECUTE | SlFlags::SNOOP)
        );
        assert_eq!(legacy.leaf_flags(Permissions::EXECUTE), Err(IommuError::InvalidArgument));
    }

    #[test]
    fn test_drop_frees_every_table() {
        let alloc = Arc::new(HeapTableAllocator::new());
        {
            let mut pt = new_table(&alloc);
            for i in 0..4 {
                pt.map_page(Iova::new(i << 30), frame(i), SlFlags::READ).unwrap();
            }
            assert!(alloc.live_pages() > 1);
        }
        assert_eq!(alloc.live_pages(), 0);
    }
}
