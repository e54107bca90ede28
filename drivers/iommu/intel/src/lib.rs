//! # Intel VT-d Device Contexts
//!
//! Per-device DMA translation for Intel VT-d IOMMUs. A [`DeviceContext`]
//! binds one PCI function to a domain and owns everything the hardware
//! needs to translate that function's requests:
//!
//! ```text
//!  +----------------------+        +-----------------------------+
//!  | Root / context table | -----> | Context entry (legacy/ext.) |
//!  |  (owned by parent)   |        |  DID | AW | SLPTPTR | P     |
//!  +----------------------+        +--------------+--------------+
//!                                                 |
//!                                                 v
//!                                  +-----------------------------+
//!                                  | Second-level page table     |
//!                                  |  PML4 -> PDPT -> PD -> PT   |
//!                                  +--------------+--------------+
//!                                                 |
//!                                                 v
//!                                        host physical pages
//! ```
//!
//! ## Components
//!
//! - [`iova`]: interval allocator for the device address space
//! - [`second_level`]: the hardware-walked translation tree
//! - [`context_entry`]: context entry encodings and the hardware slot
//! - [`device_context`]: map/unmap orchestration and lifecycle
//! - [`registry`]: the parent-owned BDF to context collection
//!
//! ## Hardware Hygiene
//!
//! Translation structures are read by the IOMMU asynchronously. Entries are
//! written with single aligned volatile stores, a context entry becomes
//! present only after every other word is written, and table memory is freed
//! only after the IOTLB has been invalidated for the affected range.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod addresses;
pub mod context_entry;
pub mod device_context;
pub mod error;
pub mod iova;
pub mod parent;
pub mod registry;
pub mod second_level;
pub mod source;
pub mod types;

#[cfg(test)]
mod testing;

pub use addresses::{Iova, PhysicalAddress};
pub use context_entry::{
    AddressWidth, ContextEncoding, ContextEntry, ContextFormat, ContextSlot, EncodedEntry, ExtendedContextEntry,
};
pub use device_context::{DeviceContext, Mapping};
pub use error::{IommuError, IommuResult};
pub use iova::{FitPolicy, IovaAllocator, Region};
pub use parent::{IommuCapabilities, IommuParent, InvalidationError};
pub use registry::DeviceContextRegistry;
pub use second_level::{SecondLevelPageTable, TablePage, TablePageAllocator};
pub use source::{ContiguousPages, PageSource};
pub use types::{Bdf, DomainId, Permissions};

/// Translation granule shift (4 KiB)
pub const PAGE_SHIFT: u32 = 12;

/// Translation granule in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `value` up to `align` (a power of two), `None` on overflow
#[inline]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}
