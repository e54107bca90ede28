//! Core identifiers and DMA permission flags.

use core::fmt;

// ============================================================================
// BDF
// ============================================================================

/// PCI requester identity (bus, device, function)
///
/// `dev_func` packs the device number in bits 7:3 and the function in 2:0,
/// which is also the index of the function's entry in its bus context table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    bus: u8,
    dev_func: u8,
}

impl Bdf {
    /// Create from a bus number and packed device/function
    #[inline]
    pub const fn new(bus: u8, dev_func: u8) -> Self {
        Self { bus, dev_func }
    }

    /// Create from separate device (0-31) and function (0-7) numbers
    #[inline]
    pub const fn from_parts(bus: u8, device: u8, function: u8) -> Self {
        Self::new(bus, ((device & 0x1F) << 3) | (function & 0x7))
    }

    /// Bus number
    #[inline(always)]
    pub const fn bus(&self) -> u8 {
        self.bus
    }

    /// Packed device/function
    #[inline(always)]
    pub const fn dev_func(&self) -> u8 {
        self.dev_func
    }

    /// Device number
    #[inline(always)]
    pub const fn device(&self) -> u8 {
        self.dev_func >> 3
    }

    /// Function number
    #[inline(always)]
    pub const fn function(&self) -> u8 {
        self.dev_func & 0x7
    }

    /// Source ID as carried in DMA requests: (bus << 8) | dev_func
    #[inline]
    pub const fn source_id(&self) -> u16 {
        ((self.bus as u16) << 8) | self.dev_func as u16
    }
}

impl fmt::Debug for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bdf({})", self)
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device(), self.function())
    }
}

// ============================================================================
// DOMAIN ID
// ============================================================================

/// Domain identifier
///
/// Assigned by the parent IOMMU. Devices in the same domain may alias
/// translations in hardware; the hardware field is 16 bits wide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DomainId(u32);

impl DomainId {
    /// Create a new domain identifier
    #[inline(always)]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw value
    #[inline(always)]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainId({})", self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// PERMISSIONS
// ============================================================================

bitflags::bitflags! {
    /// Access rights requested for a DMA mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Device may read
        const READ = 1 << 0;
        /// Device may write
        const WRITE = 1 << 1;
        /// Device may fetch instructions (extended contexts only)
        const EXECUTE = 1 << 2;
        /// Force snooping of processor caches (needs snoop control)
        const SNOOP = 1 << 3;

        /// Bidirectional DMA buffer
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

// ============================================================================
// TESTS
// ============================================================================
