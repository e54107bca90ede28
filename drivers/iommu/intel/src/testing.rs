//! Test doubles: heap-backed table pages, a recording parent IOMMU, paged
//! sources and heap-allocated context slots.

use std::boxed::Box;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::vec::Vec;

use spin::Mutex;

use crate::addresses::{Iova, PhysicalAddress};
use crate::parent::{IommuCapabilities, IommuParent, InvalidationError};
use crate::second_level::{SlPageTable, TablePage, TablePageAllocator};
use crate::source::PageSource;
use crate::types::{Bdf, DomainId};
use crate::PAGE_SIZE;

// =============================================================================
// Table Pages
// =============================================================================

struct HeapState {
    next_phys: u64,
    live: BTreeMap<u64, usize>,
    remaining: Option<usize>,
}

/// Table page allocator backed by boxed pages with synthetic physical
/// addresses
pub struct HeapTableAllocator {
    state: Mutex<HeapState>,
}

impl HeapTableAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_phys: 0x1000_0000,
                live: BTreeMap::new(),
                remaining: None,
            }),
        }
    }

    /// Pages allocated and not yet freed
    pub fn live_pages(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Allow only `n` more allocations (`None` for unlimited)
    pub fn set_remaining(&self, n: Option<usize>) {
        self.state.lock().remaining = n;
    }
}

impl TablePageAllocator for HeapTableAllocator {
    fn allocate(&self) -> Option<TablePage> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let phys = state.next_phys;
        state.next_phys += PAGE_SIZE;
        let virt = Box::into_raw(Box::new(SlPageTable::new()));
        state.live.insert(phys, virt as usize);
        let virt = NonNull::new(virt)?;
        // Safety: freshly boxed page, uniquely owned
        Some(unsafe { TablePage::new(PhysicalAddress::new(phys), virt) })
    }

    unsafe fn free(&self, page: TablePage) {
        let mut state = self.state.lock();
        let ptr = state
            .live
            .remove(&page.physical_address().as_u64())
            .expect("free of unknown table page");
        assert_eq!(ptr, page.as_ptr().as_ptr() as usize, "table page address mismatch");
        // Safety: allocated by Box::into_raw above
        drop(unsafe { Box::from_raw(page.as_ptr().as_ptr()) });
    }
}

impl Drop for HeapTableAllocator {
    fn drop(&mut self) {
        for (_, ptr) in std::mem::take(&mut self.state.lock().live) {
            // Safety: every live entry came from Box::into_raw
            drop(unsafe { Box::from_raw(ptr as *mut SlPageTable) });
        }
    }
}

// =============================================================================
// Parent IOMMU
// =============================================================================

/// A recorded invalidation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    ContextCache(DomainId, Bdf),
    IotlbDomain(DomainId),
    IotlbPages(DomainId, Iova, u8),
}

/// Parent IOMMU that records invalidations
///
/// Each record carries the allocator's live page count at the time of the
/// request, so tests can check ordering against table reclamation.
pub struct MockParent {
    caps: IommuCapabilities,
    allocator: Arc<HeapTableAllocator>,
    log: Mutex<Vec<(Invalidation, usize)>>,
    fail: AtomicBool,
}

impl MockParent {
    /// CAP: 48-bit only, PSI with MAMV 9; ECAP: ECS
    pub fn caps() -> IommuCapabilities {
        IommuCapabilities::from_registers((47 << 16) | (0b00100 << 8) | (1 << 39) | (9 << 48), 1 << 24)
    }

    pub fn new() -> Arc<Self> {
        Self::with_caps(Self::caps())
    }

    pub fn with_caps(caps: IommuCapabilities) -> Arc<Self> {
        Arc::new(Self {
            caps,
            allocator: Arc::new(HeapTableAllocator::new()),
            log: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn allocator(&self) -> &Arc<HeapTableAllocator> {
        &self.allocator
    }

    /// Make the next invalidation fail
    pub fn fail_next_invalidation(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Drain the recorded invalidations
    pub fn take_log(&self) -> Vec<(Invalidation, usize)> {
        std::mem::take(&mut *self.log.lock())
    }

    fn record(&self, inv: Invalidation) -> Result<(), InvalidationError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(InvalidationError::Timeout);
        }
        self.log.lock().push((inv, self.allocator.live_pages()));
        Ok(())
    }
}

impl IommuParent for MockParent {
    fn capabilities(&self) -> &IommuCapabilities {
        &self.caps
    }

    fn table_allocator(&self) -> Arc<dyn TablePageAllocator> {
        self.allocator.clone()
    }

    fn invalidate_context_cache_device(&self, domain: DomainId, bdf: Bdf) -> Result<(), InvalidationError> {
        self.record(Invalidation::ContextCache(domain, bdf))
    }

    fn invalidate_iotlb_domain(&self, domain: DomainId) -> Result<(), InvalidationError> {
        self.record(Invalidation::IotlbDomain(domain))
    }

    fn invalidate_iotlb_pages(&self, domain: DomainId, iova: Iova, order: u8) -> Result<(), InvalidationError> {
        self.record(Invalidation::IotlbPages(domain, iova, order))
    }
}

// =============================================================================
// Page Sources
// =============================================================================

/// Source with an explicit frame per page; `None` entries are holes
pub struct PagedSource {
    pages: Vec<Option<PhysicalAddress>>,
}

impl PagedSource {
    /// `count` resident pages at distinct, non-adjacent frames
    pub fn resident(count: usize) -> Self {
        Self::from_pages((0..count).map(|i| Some(Self::frame(i))).collect())
    }

    pub fn from_pages(pages: Vec<Option<PhysicalAddress>>) -> Self {
        Self { pages }
    }

    /// Frame used for page `i` of a resident source
    pub fn frame(i: usize) -> PhysicalAddress {
        PhysicalAddress::new(0x2_0000_0000 + (i as u64) * 2 * PAGE_SIZE)
    }
}

impl PageSource for PagedSource {
    fn size(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    fn lookup(&self, offset: u64) -> Option<PhysicalAddress> {
        self.pages.get((offset / PAGE_SIZE) as usize).copied().flatten()
    }
}

// =============================================================================
// Context Slots
// =============================================================================

/// A heap-allocated context entry standing in for a context table slot
///
/// Must outlive any device context created on it.
pub struct TestSlot<T> {
    ptr: *mut T,
}

impl<T: Copy + Default> TestSlot<T> {
    pub fn new() -> Self {
        Self { ptr: Box::into_raw(Box::new(T::default())) }
    }

    pub fn with(value: T) -> Self {
        Self { ptr: Box::into_raw(Box::new(value)) }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr
    }

    pub fn read(&self) -> T {
        // Safety: owned, live allocation
        unsafe { std::ptr::read_volatile(self.ptr) }
    }
}

impl<T> Drop for TestSlot<T> {
    fn drop(&mut self) {
        // Safety: allocated by Box::into_raw in the constructor
        drop(unsafe { Box::from_raw(self.ptr) });
    }
}
