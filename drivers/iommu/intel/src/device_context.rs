//! # Device Context
//!
//! Translation state for one PCI function: the hardware context entry, the
//! second-level tree it points at, and the allocator for the device address
//! space.
//!
//! ## Lifecycle
//!
//! ```text
//!   create_*          second_level_map / second_level_unmap          drop
//!  ----------> [published] <-------------------------------> ------------->
//!   root alloc,                                               clear entry,
//!   encode, publish last                                      context cache +
//!                                                             IOTLB flush,
//!                                                             free tables
//! ```
//!
//! ## Unmap Ordering
//!
//! Leaves are cleared and empty tables unlinked first. The IOTLB is then
//! invalidated for the range, and only after that are the unlinked tables
//! freed and the address range made available again.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use arrayvec::ArrayVec;

use crate::addresses::{Iova, PhysicalAddress};
use crate::context_entry::{ContextEntry, ContextFormat, ContextSlot, ExtendedContextEntry, MAX_DOMAIN_ID};
use crate::error::{IommuError, IommuResult};
use crate::iova::{FitPolicy, IovaAllocator, Region};
use crate::parent::{IommuParent, InvalidationError};
use crate::second_level::{SecondLevelPageTable, SlFlags, StaleTables};
use crate::source::{ContiguousBacking, MappingBacking, PageSource, PagedBacking};
use crate::types::{Bdf, DomainId, Permissions};
use crate::{align_up, PAGE_SHIFT};

/// Page-selective requests issued for one range before a domain flush is
/// used instead
pub const MAX_PSI_REQUESTS: usize = 16;

/// Result of a successful map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Device address of the first byte
    pub device_address: Iova,
    /// Bytes mapped from the start of the request
    pub mapped_len: u64,
}

/// Per-device translation state
pub struct DeviceContext {
    parent: Arc<dyn IommuParent>,
    slot: ContextSlot,
    second_level_pt: SecondLevelPageTable,
    region_alloc: IovaAllocator,
    /// Granted regions keyed by base address; every page in them is mapped
    allocated_regions: BTreeMap<u64, Region>,
    bdf: Bdf,
    domain_id: DomainId,
}

impl DeviceContext {
    /// Create a context on an extended context table slot
    ///
    /// # Safety
    ///
    /// `entry` must point at the device's entry in the parent's extended
    /// context table, stay valid for the lifetime of the returned context, and
    /// be written by nothing else while that context exists.
    pub unsafe fn create_extended(
        bdf: Bdf,
        domain_id: DomainId,
        parent: Arc<dyn IommuParent>,
        entry: *mut ExtendedContextEntry,
    ) -> IommuResult<Self> {
        if !parent.capabilities().extended_context {
            log::warn!("VT-d: extended contexts not supported, cannot bind {}", bdf);
            return Err(IommuError::Unsupported);
        }
        // Safety: forwarded from the caller
        let slot = unsafe { ContextSlot::extended(entry)? };
        Self::create(bdf, domain_id, parent, slot)
    }

    /// Create a context on a legacy context table slot
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::create_extended`], for a legacy table.
    pub unsafe fn create_legacy(
        bdf: Bdf,
        domain_id: DomainId,
        parent: Arc<dyn IommuParent>,
        entry: *mut ContextEntry,
    ) -> IommuResult<Self> {
        // Safety: forwarded from the caller
        let slot = unsafe { ContextSlot::legacy(entry)? };
        Self::create(bdf, domain_id, parent, slot)
    }

    fn create(bdf: Bdf, domain_id: DomainId, parent: Arc<dyn IommuParent>, mut slot: ContextSlot) -> IommuResult<Self> {
        if slot.is_present() {
            log::warn!("VT-d: context entry for {} already present", bdf);
            return Err(IommuError::AlreadyBound);
        }
        if domain_id.as_u32() > MAX_DOMAIN_ID {
            return Err(IommuError::InvalidDomainId);
        }

        let format = slot.format();
        let width = format.address_width();
        let caps = *parent.capabilities();
        if !caps.supports_width(width) {
            log::warn!("VT-d: {}-bit address width not supported, cannot bind {}", width.bits(), bdf);
            return Err(IommuError::Unsupported);
        }
        let top_level = width.top_level().ok_or(IommuError::Unsupported)?;

        // The tree can express the full format width, but inputs above MGAW
        // fault in hardware.
        let aspace = format.aspace_size().min(caps.max_address_span());
        if aspace < format.minimum_contiguity() {
            log::warn!("VT-d: {}-bit MGAW too small, cannot bind {}", caps.max_address_width, bdf);
            return Err(IommuError::Unsupported);
        }
        if aspace < format.aspace_size() {
            log::debug!("VT-d: {} limited to {}-bit device addresses", bdf, caps.max_address_width);
        }
        let policy = if cfg!(feature = "best_fit") {
            FitPolicy::BestFit
        } else {
            FitPolicy::FirstFit
        };
        let region_alloc = IovaAllocator::new(0, aspace, format.minimum_contiguity(), policy)?;

        let second_level_pt = SecondLevelPageTable::new(
            parent.table_allocator(),
            top_level,
            format.supports_execute(),
            caps.snoop_control,
        )?;
        let entry = format.encode(domain_id, second_level_pt.root(), width)?;

        // Publishing is the last step: once present, the hardware may walk
        // the tree at any time.
        slot.publish(&entry)?;

        let ctx = Self {
            parent,
            slot,
            second_level_pt,
            region_alloc,
            allocated_regions: BTreeMap::new(),
            bdf,
            domain_id,
        };

        if caps.caching_mode {
            ctx.invalidate_context_cache();
        }

        log::info!(
            "VT-d: bound {} to domain {} ({:?} context, root {})",
            bdf,
            domain_id,
            format,
            ctx.second_level_pt.root()
        );
        Ok(ctx)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Translation granule of the active format
    #[inline]
    pub fn minimum_contiguity(&self) -> u64 {
        self.format().minimum_contiguity()
    }

    /// Size of the device address space
    #[inline]
    pub fn aspace_size(&self) -> u64 {
        self.format().aspace_size()
    }

    /// Requester identity
    #[inline]
    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    /// Check the requester identity
    #[inline]
    pub fn is_bdf(&self, bus: u8, dev_func: u8) -> bool {
        self.bdf == Bdf::new(bus, dev_func)
    }

    /// Domain of this context
    #[inline]
    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    /// Active context entry format
    #[inline]
    pub fn format(&self) -> ContextFormat {
        self.slot.format()
    }

    /// Software walk of the device's translation
    pub fn translate(&self, iova: Iova) -> Option<(PhysicalAddress, SlFlags)> {
        self.second_level_pt.translate(iova)
    }

    /// Granted regions as `(base, length)`, in address order
    pub fn granted_regions(&self) -> impl Iterator<Item = (Iova, u64)> + '_ {
        self.allocated_regions.values().map(|r| (r.base(), r.size()))
    }

    /// Unallocated device address space in bytes
    pub fn free_address_space(&self) -> u64 {
        self.region_alloc.free_bytes()
    }

    /// Table pages held by the second-level tree
    pub fn table_pages(&self) -> usize {
        self.second_level_pt.table_count()
    }

    /// Dump the translation tree through the log facade
    #[cfg(feature = "debug")]
    pub fn dump(&self) {
        log::debug!("VT-d: context {} domain {}", self.bdf, self.domain_id);
        self.second_level_pt.dump();
    }

    // =========================================================================
    // Map / Unmap
    // =========================================================================

    /// Map `size` bytes of `source` starting at `offset`
    ///
    /// On success the first `mapped_len` bytes (at most `size`) are mapped.
    /// A short result means a later page could not be resolved or needed a
    /// table that could not be allocated; nothing past it is mapped.
    pub fn second_level_map(
        &mut self,
        source: &dyn PageSource,
        offset: u64,
        size: u64,
        perms: Permissions,
    ) -> IommuResult<Mapping> {
        let granule = self.minimum_contiguity();
        if offset % granule != 0 {
            return Err(IommuError::Misaligned);
        }
        if size == 0 {
            return Err(IommuError::InvalidArgument);
        }
        let end = offset.checked_add(size).ok_or(IommuError::InvalidArgument)?;
        if end > source.size() {
            return Err(IommuError::InvalidArgument);
        }
        let flags = self.second_level_pt.leaf_flags(perms)?;
        let rounded = align_up(size, granule).ok_or(IommuError::InvalidArgument)?;

        let mut region = self.region_alloc.allocate(rounded, granule)?;
        let base = region.base();
        let pages = rounded / granule;

        let (mapped, failure) = match source.contiguous_base() {
            Some(phys) => self.map_pages(&ContiguousBacking::new(phys, offset), base, pages, flags),
            None => self.map_pages(&PagedBacking::new(source, offset), base, pages, flags),
        };

        if mapped == 0 {
            self.region_alloc.release(region);
            let err = failure.unwrap_or(IommuError::NoBackingPages);
            log::debug!("VT-d: map of {:#x} bytes for {} failed: {}", size, self.bdf, err);
            return Err(err);
        }

        let mapped_bytes = mapped * granule;
        if let Some(tail) = region.split_off(mapped_bytes) {
            log::debug!(
                "VT-d: partial map for {}: {} of {} pages ({:?})",
                self.bdf,
                mapped,
                pages,
                failure
            );
            self.region_alloc.release(tail);
        }
        self.allocated_regions.insert(base.as_u64(), region);

        if self.parent.capabilities().caching_mode {
            self.flush_iotlb_range(base, mapped_bytes);
        }

        Ok(Mapping {
            device_address: base,
            mapped_len: mapped_bytes.min(size),
        })
    }

    /// Install leaves for `pages` consecutive pages, stopping at the first
    /// failure
    fn map_pages(
        &mut self,
        backing: &dyn MappingBacking,
        base: Iova,
        pages: u64,
        flags: SlFlags,
    ) -> (u64, Option<IommuError>) {
        for page in 0..pages {
            let Some(frame) = backing.frame(page) else {
                return (page, Some(IommuError::NoBackingPages));
            };
            let iova = base + (page << PAGE_SHIFT);
            if let Err(err) = self.second_level_pt.map_page(iova, frame, flags) {
                return (page, Some(err));
            }
        }
        (pages, None)
    }

    /// Unmap `size` bytes at `iova`
    ///
    /// The range must lie inside one granted region. The parts of the region
    /// outside the range stay granted.
    pub fn second_level_unmap(&mut self, iova: Iova, size: u64) -> IommuResult<()> {
        let granule = self.minimum_contiguity();
        if !iova.is_aligned(granule) {
            return Err(IommuError::Misaligned);
        }
        if size == 0 {
            return Err(IommuError::InvalidArgument);
        }
        let len = align_up(size, granule).ok_or(IommuError::InvalidArgument)?;

        let key = self
            .allocated_regions
            .range(..=iova.as_u64())
            .next_back()
            .filter(|(_, region)| region.contains(iova, len))
            .map(|(&base, _)| base)
            .ok_or(IommuError::NotMapped)?;

        let mut stale = StaleTables::new();
        for page in 0..len / granule {
            let addr = iova + (page << PAGE_SHIFT);
            if let Err(err) = self.second_level_pt.unmap_page(addr, &mut stale) {
                log::error!("VT-d: granted page {} of {} not mapped ({})", addr, self.bdf, err);
                panic!("VT-d: granted region not fully mapped");
            }
        }

        self.flush_iotlb_range(iova, len);
        self.second_level_pt.reclaim(stale);

        let mut region = self.allocated_regions.remove(&key).ok_or(IommuError::NotMapped)?;
        let mut middle = match region.split_off(iova - region.base()) {
            Some(rest) => {
                self.allocated_regions.insert(key, region);
                rest
            },
            None => region,
        };
        if let Some(tail) = middle.split_off(len) {
            self.allocated_regions.insert(tail.base().as_u64(), tail);
        }
        self.region_alloc.release(middle);

        log::debug!("VT-d: unmapped {}..{} for {}", iova, iova + len, self.bdf);
        Ok(())
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    fn check_invalidation(&self, what: &str, result: Result<(), InvalidationError>) {
        if let Err(err) = result {
            log::error!(
                "VT-d: {} invalidation failed for {} (domain {}): {}",
                what,
                self.bdf,
                self.domain_id,
                err
            );
            panic!("VT-d: {} invalidation failed: {}", what, err);
        }
    }

    fn invalidate_context_cache(&self) {
        #[cfg(feature = "iotlb_stats")]
        crate::parent::stats::record_context_cache();
        let result = self.parent.invalidate_context_cache_device(self.domain_id, self.bdf);
        self.check_invalidation("context cache", result);
    }

    fn flush_iotlb_domain(&self) {
        #[cfg(feature = "iotlb_stats")]
        crate::parent::stats::record_domain_flush();
        let result = self.parent.invalidate_iotlb_domain(self.domain_id);
        self.check_invalidation("IOTLB", result);
    }

    /// Invalidate the IOTLB for `[base, base + len)`
    fn flush_iotlb_range(&self, base: Iova, len: u64) {
        let caps = self.parent.capabilities();
        if !caps.page_selective_invalidation {
            return self.flush_iotlb_domain();
        }

        let pages = len >> PAGE_SHIFT;
        match psi_blocks(base.page_number(), pages, caps.max_invalidation_order) {
            Some(blocks) => {
                for (page, order) in blocks {
                    #[cfg(feature = "iotlb_stats")]
                    crate::parent::stats::record_page_flush();
                    let result = self
                        .parent
                        .invalidate_iotlb_pages(self.domain_id, Iova::new(page << PAGE_SHIFT), order);
                    self.check_invalidation("IOTLB", result);
                }
            },
            None => {
                log::warn!("VT-d: {} pages at {} need too many PSI requests, flushing domain", pages, base);
                self.flush_iotlb_domain();
            },
        }
    }
}

/// Split `count` pages at `first_page` into naturally aligned power-of-two
/// blocks of at most `2^max_order` pages
///
/// `None` if more than [`MAX_PSI_REQUESTS`] blocks are needed.
fn psi_blocks(first_page: u64, count: u64, max_order: u8) -> Option<ArrayVec<(u64, u8), MAX_PSI_REQUESTS>> {
    let mut blocks = ArrayVec::new();
    let mut page = first_page;
    let mut remaining = count;
    while remaining > 0 {
        let align_order = page.trailing_zeros();
        let size_order = 63 - remaining.leading_zeros();
        let order = align_order.min(size_order).min(max_order as u32);
        blocks.try_push((page, order as u8)).ok()?;
        page += 1u64 << order;
        remaining -= 1u64 << order;
    }
    Some(blocks)
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // The entry goes first so no new walks start; cached copies of it and
        // of translations through the tree are then flushed before the tree
        // is freed with the remaining fields.
        if self.slot.clear() {
            self.invalidate_context_cache();
            self.flush_iotlb_domain();
        }
        log::info!("VT-d: released context for {} (domain {})", self.bdf, self.domain_id);
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("bdf", &self.bdf)
            .field("domain_id", &self.domain_id)
            .field("format", &self.format())
            .field("regions", &self.allocated_regions.len())
            .field("second_level_pt", &self.second_level_pt)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
