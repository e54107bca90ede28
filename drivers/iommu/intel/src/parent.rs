//! # Parent IOMMU Interface
//!
//! A device context does not own the IOMMU: register access, the root and
//! context tables, domain id allocation and invalidation queues all live with
//! the parent. This module defines what a device context needs from it.

use alloc::sync::Arc;
use core::fmt;

use crate::addresses::Iova;
use crate::context_entry::AddressWidth;
use crate::second_level::TablePageAllocator;
use crate::types::{Bdf, DomainId};

// =============================================================================
// Capabilities
// =============================================================================

/// CAP register fields
mod cap_reg {
    pub const SAGAW_SHIFT: u32 = 8;
    pub const SAGAW_MASK: u64 = 0x1F;
    pub const MGAW_SHIFT: u32 = 16;
    pub const MGAW_MASK: u64 = 0x3F;
    pub const CM: u64 = 1 << 7;
    pub const PSI: u64 = 1 << 39;
    pub const MAMV_SHIFT: u32 = 48;
    pub const MAMV_MASK: u64 = 0x3F;
}

/// ECAP register fields
mod ecap_reg {
    pub const SC: u64 = 1 << 7;
    pub const ECS: u64 = 1 << 24;
}

/// Hardware features relevant to device contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuCapabilities {
    /// Maximum guest address width in bits (MGAW + 1)
    pub max_address_width: u32,
    /// Supported adjusted guest address widths, one bit per AW encoding
    pub supported_widths: u8,
    /// Extended context entries available (ECS)
    pub extended_context: bool,
    /// Page-selective IOTLB invalidation available (PSI)
    pub page_selective_invalidation: bool,
    /// Largest address mask for page-selective invalidation (MAMV)
    pub max_invalidation_order: u8,
    /// Not-present entries may be cached (CM)
    pub caching_mode: bool,
    /// Snoop control in second-level leaves (SC)
    pub snoop_control: bool,
}

impl IommuCapabilities {
    /// Decode the CAP and ECAP registers
    pub const fn from_registers(cap: u64, ecap: u64) -> Self {
        Self {
            max_address_width: ((cap >> cap_reg::MGAW_SHIFT) & cap_reg::MGAW_MASK) as u32 + 1,
            supported_widths: ((cap >> cap_reg::SAGAW_SHIFT) & cap_reg::SAGAW_MASK) as u8,
            extended_context: ecap & ecap_reg::ECS != 0,
            page_selective_invalidation: cap & cap_reg::PSI != 0,
            max_invalidation_order: ((cap >> cap_reg::MAMV_SHIFT) & cap_reg::MAMV_MASK) as u8,
            caching_mode: cap & cap_reg::CM != 0,
            snoop_control: ecap & ecap_reg::SC != 0,
        }
    }

    /// Bytes of device address space the hardware translates (`2^MGAW`)
    #[inline]
    pub const fn max_address_span(&self) -> u64 {
        if self.max_address_width >= 64 {
            u64::MAX
        } else {
            1 << self.max_address_width
        }
    }

    /// Check if second-level tables of `width` can be walked
    #[inline]
    pub const fn supports_width(&self, width: AddressWidth) -> bool {
        self.supported_widths & (1 << width.encoding()) != 0
    }
}

// =============================================================================
// Invalidation
// =============================================================================

/// Failure reported by the parent's invalidation machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationError {
    /// The request did not complete in time
    Timeout,
    /// The hardware reported an invalidation queue error
    HardwareFault,
}

impl fmt::Display for InvalidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "invalidation timed out"),
            Self::HardwareFault => write!(f, "invalidation hardware fault"),
        }
    }
}

/// Services the parent IOMMU provides to its device contexts
///
/// Every invalidation call returns once the hardware has completed it.
pub trait IommuParent: Send + Sync {
    /// Decoded hardware capabilities
    fn capabilities(&self) -> &IommuCapabilities;

    /// Allocator for second-level table pages
    fn table_allocator(&self) -> Arc<dyn TablePageAllocator>;

    /// Device-selective context-cache invalidation
    fn invalidate_context_cache_device(&self, domain: DomainId, bdf: Bdf) -> Result<(), InvalidationError>;

    /// Domain-selective IOTLB invalidation
    fn invalidate_iotlb_domain(&self, domain: DomainId) -> Result<(), InvalidationError>;

    /// Page-selective IOTLB invalidation of `2^order` pages at `iova`
    ///
    /// `iova` is aligned to the size of the block.
    fn invalidate_iotlb_pages(&self, domain: DomainId, iova: Iova, order: u8) -> Result<(), InvalidationError>;
}

// =============================================================================
// Invalidation Statistics
// =============================================================================

/// Invalidation request counters
#[cfg(feature = "iotlb_stats")]
pub mod stats {
    use core::sync::atomic::{AtomicU64, Ordering};

    static CONTEXT_CACHE_COUNT: AtomicU64 = AtomicU64::new(0);
    static DOMAIN_FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);
    static PAGE_FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);

    /// Count a context-cache invalidation
    pub fn record_context_cache() {
        CONTEXT_CACHE_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a domain-selective IOTLB invalidation
    pub fn record_domain_flush() {
        DOMAIN_FLUSH_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a page-selective IOTLB invalidation
    pub fn record_page_flush() {
        PAGE_FLUSH_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    /// (context cache, domain, page-selective) counts
    pub fn get_stats() -> (u64, u64, u64) {
        (
            CONTEXT_CACHE_COUNT.load(Ordering::Relaxed),
            DOMAIN_FLUSH_COUNT.load(Ordering::Relaxed),
            PAGE_FLUSH_COUNT.load(Ordering::Relaxed),
        )
    }

    /// Zero all counters
    pub fn reset_stats() {
        CONTEXT_CACHE_COUNT.store(0, Ordering::Relaxed);
        DOMAIN_FLUSH_COUNT.store(0, Ordering::Relaxed);
        PAGE_FLUSH_COUNT.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_decode() {
        // MGAW = 47, SAGAW = 39|48 bit, CM, PSI, MAMV = 9
        let cap = (47 << 16) | (0b00110 << 8) | (1 << 7) | (1 << 39) | (9 << 48);
        let ecap = (1 << 24) | (1 << 7);
        let caps = IommuCapabilities::from_registers(cap, ecap);

        assert_eq!(caps.max_address_width, 48);
        assert_eq!(caps.max_address_span(), 1 << 48);
        assert!(caps.supports_width(AddressWidth::Bits48));
        assert!(caps.supports_width(AddressWidth::Bits39));
        assert!(!caps.supports_width(AddressWidth::Bits57));
        assert!(caps.caching_mode);
        assert!(caps.page_selective_invalidation);
        assert_eq!(caps.max_invalidation_order, 9);
        assert!(caps.extended_context);
        assert!(caps.snoop_control);
    }

    #[test]
    fn test_capability_decode_minimal() {
        let caps = IommuCapabilities::from_registers(0b00100 << 8, 0);
        assert!(caps.supports_width(AddressWidth::Bits48));
        assert!(!caps.extended_context);
        assert!(!caps.caching_mode);
        assert!(!caps.page_selective_invalidation);
        assert!(!caps.snoop_control);
        assert_eq!(caps.max_address_span(), 1 << 1);
        assert_eq!(IommuCapabilities::from_registers(63 << 16, 0).max_address_span(), u64::MAX);
    }
}
