//! Error types for device context operations.

use core::fmt;

/// Recoverable IOMMU errors
///
/// Invariant violations (duplicate contexts, failed invalidation, corrupt
/// allocator state) are not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// The hardware context entry is already present
    AlreadyBound,
    /// No free IOVA range of the requested size
    OutOfAddressSpace,
    /// The page source could not supply the first page of the request
    NoBackingPages,
    /// No memory for translation table pages
    AllocationFailure,
    /// Range is not covered by a granted mapping
    NotMapped,
    /// Address or offset not aligned to the translation granule
    Misaligned,
    /// A translation already exists at the target address
    AlreadyMapped,
    /// Domain ID does not fit the hardware field
    InvalidDomainId,
    /// Feature not supported by the parent IOMMU
    Unsupported,
    /// Invalid argument (empty range, out of bounds, overflow)
    InvalidArgument,
}

impl IommuError {
    /// Check if the error is caused by exhausted resources
    #[inline]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfAddressSpace | Self::AllocationFailure)
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyBound => write!(f, "context entry already present"),
            Self::OutOfAddressSpace => write!(f, "out of device address space"),
            Self::NoBackingPages => write!(f, "no backing pages"),
            Self::AllocationFailure => write!(f, "translation table allocation failed"),
            Self::NotMapped => write!(f, "range not mapped"),
            Self::Misaligned => write!(f, "misaligned address"),
            Self::AlreadyMapped => write!(f, "address already mapped"),
            Self::InvalidDomainId => write!(f, "domain id out of range"),
            Self::Unsupported => write!(f, "unsupported by hardware"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Result type for IOMMU operations
pub type IommuResult<T> = Result<T, IommuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(IommuError::NotMapped.to_string(), "range not mapped");
        assert!(IommuError::OutOfAddressSpace.to_string().contains("address space"));
    }

    #[test]
    fn test_error_exhaustion() {
        assert!(IommuError::OutOfAddressSpace.is_exhaustion());
        assert!(IommuError::AllocationFailure.is_exhaustion());
        assert!(!IommuError::Misaligned.is_exhaustion());
    }
}
