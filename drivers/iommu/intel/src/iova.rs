//! # IOVA Allocator
//!
//! Hands out disjoint, granule-aligned ranges of a device address space.
//!
//! Free space is kept as a map of `start -> length` ranges that never touch:
//! releasing a region coalesces it with both neighbours. A granted range is
//! represented by a [`Region`] token that cannot be cloned, so the same range
//! cannot be returned twice through safe code.

use alloc::collections::BTreeMap;
use core::fmt;

use crate::addresses::Iova;
use crate::error::{IommuError, IommuResult};
use crate::align_up;

/// Free range selection strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FitPolicy {
    /// Lowest-addressed range that fits
    #[default]
    FirstFit,
    /// Smallest range that fits
    BestFit,
}

// =============================================================================
// Region
// =============================================================================

/// A granted range of device address space
#[must_use = "a dropped region leaks its address space"]
#[derive(PartialEq, Eq)]
pub struct Region {
    base: u64,
    size: u64,
}

impl Region {
    pub(crate) const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// First address of the region
    #[inline]
    pub const fn base(&self) -> Iova {
        Iova::new(self.base)
    }

    /// Length in bytes
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last address
    #[inline]
    pub const fn end(&self) -> Iova {
        Iova::new(self.base + self.size)
    }

    /// Check if `[addr, addr + len)` lies inside the region
    pub fn contains(&self, addr: Iova, len: u64) -> bool {
        let start = addr.as_u64();
        match start.checked_add(len) {
            Some(end) => start >= self.base && end <= self.base + self.size,
            None => false,
        }
    }

    /// Split at byte offset `at`
    ///
    /// `self` keeps `[base, base + at)` and the returned region covers the
    /// remainder. `None` if `at` does not fall strictly inside the region.
    pub fn split_off(&mut self, at: u64) -> Option<Region> {
        if at == 0 || at >= self.size {
            return None;
        }
        let tail = Region::new(self.base + at, self.size - at);
        self.size = at;
        Some(tail)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({:#x}..{:#x})", self.base, self.base + self.size)
    }
}

// =============================================================================
// Allocator
// =============================================================================

/// Interval allocator over `[base, base + size)`
pub struct IovaAllocator {
    base: u64,
    size: u64,
    granule: u64,
    policy: FitPolicy,
    /// Free ranges: start -> length
    free: BTreeMap<u64, u64>,
}

impl IovaAllocator {
    /// Create an allocator with the whole range free
    ///
    /// `granule` must be a power of two, and `base` and `size` multiples of it.
    pub fn new(base: u64, size: u64, granule: u64, policy: FitPolicy) -> IommuResult<Self> {
        if !granule.is_power_of_two() || base % granule != 0 || size % granule != 0 || size == 0 {
            return Err(IommuError::InvalidArgument);
        }
        base.checked_add(size).ok_or(IommuError::InvalidArgument)?;

        let mut free = BTreeMap::new();
        free.insert(base, size);
        Ok(Self { base, size, granule, policy, free })
    }

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// The size is rounded up to the granule and the alignment raised to at
    /// least the granule.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> IommuResult<Region> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(IommuError::InvalidArgument);
        }
        let size = align_up(size, self.granule).ok_or(IommuError::InvalidArgument)?;
        let alignment = alignment.max(self.granule);

        let mut chosen: Option<(u64, u64, u64)> = None;
        for (&start, &len) in self.free.iter() {
            let Some(candidate) = align_up(start, alignment) else {
                continue;
            };
            let fits = candidate
                .checked_add(size)
                .map(|end| end <= start + len)
                .unwrap_or(false);
            if !fits {
                continue;
            }
            match self.policy {
                FitPolicy::FirstFit => {
                    chosen = Some((start, len, candidate));
                    break;
                },
                FitPolicy::BestFit => {
                    if chosen.map_or(true, |(_, best, _)| len < best) {
                        chosen = Some((start, len, candidate));
                    }
                },
            }
        }

        let (start, len, base) = chosen.ok_or(IommuError::OutOfAddressSpace)?;
        self.free.remove(&start);
        if base > start {
            self.free.insert(start, base - start);
        }
        let end = base + size;
        let free_end = start + len;
        if end < free_end {
            self.free.insert(end, free_end - end);
        }

        Ok(Region::new(base, size))
    }

    /// Return a region to the free pool
    ///
    /// # Panics
    ///
    /// Panics if the region is outside the managed range or overlaps free
    /// space: the accounting is corrupt.
    pub fn release(&mut self, region: Region) {
        let Region { base, size } = region;
        let end = base + size;

        if base < self.base || end > self.base + self.size {
            log::error!("IOVA: release of {:#x}..{:#x} outside managed range", base, end);
            panic!("IOVA: release outside managed range");
        }

        let prev = self.free.range(..=base).next_back().map(|(&s, &l)| (s, l));
        let next = self.free.range(base..).next().map(|(&s, &l)| (s, l));

        if let Some((s, l)) = prev {
            if s + l > base {
                log::error!("IOVA: release of {:#x}..{:#x} overlaps free space", base, end);
                panic!("IOVA: double release");
            }
        }
        if let Some((s, _)) = next {
            if s < end {
                log::error!("IOVA: release of {:#x}..{:#x} overlaps free space", base, end);
                panic!("IOVA: double release");
            }
        }

        let mut start = base;
        let mut len = size;
        if let Some((s, l)) = prev {
            if s + l == base {
                self.free.remove(&s);
                start = s;
                len += l;
            }
        }
        if let Some((s, l)) = next {
            if s == end {
                self.free.remove(&s);
                len += l;
            }
        }
        self.free.insert(start, len);
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }

    /// Bytes currently granted
    pub fn allocated_bytes(&self) -> u64 {
        self.size - self.free_bytes()
    }

    /// Number of disjoint free ranges
    #[inline]
    pub fn free_ranges(&self) -> usize {
        self.free.len()
    }

    /// Largest free range in bytes
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }
}

impl fmt::Debug for IovaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IovaAllocator")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("policy", &self.policy)
            .field("free_ranges", &self.free.len())
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
