//! # Context Entries
//!
//! A context entry tells the IOMMU how to translate requests from one PCI
//! function. Two formats exist:
//!
//! ## Legacy (128-bit)
//!
//! ```text
//! lo:  63            12 11   4 3  2  1   0
//!     +----------------+------+----+---+---+
//!     |    SLPTPTR     | rsvd | TT |FPD| P |
//!     +----------------+------+----+---+---+
//! hi:  63     24 23      8 7   3 2    0
//!     +---------+---------+------+-----+
//!     |  rsvd   |   DID   | rsvd | AW  |
//!     +---------+---------+------+-----+
//! ```
//!
//! ## Extended (256-bit)
//!
//! Adds PASID, nested translation and memory type fields across four words.
//! Only second-level translation is configured here: PASID and nesting stay
//! disabled, and SLEE enables the execute bit in second-level leaves.
//!
//! ## Publication
//!
//! The word holding the present bit is written last, after a release fence,
//! so the hardware never observes a present entry with stale fields. Clearing
//! reverses the order.

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, Ordering};

use crate::addresses::PhysicalAddress;
use crate::error::{IommuError, IommuResult};
use crate::second_level::Level;
use crate::types::DomainId;
use crate::PAGE_SIZE;

/// Largest domain id the DID field holds
pub const MAX_DOMAIN_ID: u32 = 0xFFFF;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PRESENT: u64 = 1 << 0;
const DID_SHIFT: u32 = 8;
const DID_MASK: u64 = 0xFFFF << DID_SHIFT;
const AW_MASK: u64 = 0x7;

// =============================================================================
// Address Width
// =============================================================================

/// Adjusted guest address width (AW / SAGAW encoding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AddressWidth {
    /// 3-level, 30 bits
    Bits30 = 0,
    /// 3-level, 39 bits
    Bits39 = 1,
    /// 4-level, 48 bits
    Bits48 = 2,
    /// 5-level, 57 bits
    Bits57 = 3,
    /// 6-level, 64 bits
    Bits64 = 4,
}

impl AddressWidth {
    /// Width in bits
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits30 => 30,
            Self::Bits39 => 39,
            Self::Bits48 => 48,
            Self::Bits57 => 57,
            Self::Bits64 => 64,
        }
    }

    /// Encoding in the AW field
    #[inline]
    pub const fn encoding(self) -> u64 {
        self as u64
    }

    /// Decode the AW field
    pub const fn from_encoding(aw: u64) -> Option<Self> {
        match aw {
            0 => Some(Self::Bits30),
            1 => Some(Self::Bits39),
            2 => Some(Self::Bits48),
            3 => Some(Self::Bits57),
            4 => Some(Self::Bits64),
            _ => None,
        }
    }

    /// Root level of the second-level tree for this width
    ///
    /// `None` for the widths this driver does not build trees for.
    pub const fn top_level(self) -> Option<Level> {
        match self {
            Self::Bits39 => Some(Level::Pdpt),
            Self::Bits48 => Some(Level::Pml4),
            Self::Bits57 => Some(Level::Pml5),
            Self::Bits30 | Self::Bits64 => None,
        }
    }
}

// =============================================================================
// Encoding Interface
// =============================================================================

/// Operations shared by both context entry formats
pub trait ContextEncoding: Sized + Copy {
    /// Entry size in bytes
    const SIZE: usize;

    /// Encode a present entry for second-level translation
    fn encode(domain: DomainId, root: PhysicalAddress, width: AddressWidth) -> IommuResult<Self>;

    /// Raw words, word 0 holding the present bit
    fn words(&self) -> &[u64];

    /// Present bit
    fn is_present(&self) -> bool {
        self.words()[0] & PRESENT != 0
    }

    /// Domain id field
    fn domain_id(&self) -> DomainId;

    /// Second-level page table pointer
    fn second_level_root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.words()[0] & ADDR_MASK)
    }

    /// Address width field
    fn address_width(&self) -> Option<AddressWidth>;
}

fn check_fields(domain: DomainId, root: PhysicalAddress) -> IommuResult<()> {
    if domain.as_u32() > MAX_DOMAIN_ID {
        return Err(IommuError::InvalidDomainId);
    }
    if !root.is_page_aligned() {
        return Err(IommuError::Misaligned);
    }
    Ok(())
}

// =============================================================================
// Legacy Context Entry
// =============================================================================

/// Legacy translation types (TT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyTranslation {
    /// Untranslated requests only, device TLB disabled
    UntranslatedOnly = 0b00,
    /// All requests, device TLB enabled
    DeviceTlb = 0b01,
    /// Pass-through
    PassThrough = 0b10,
}

/// Legacy 128-bit context entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ContextEntry {
    words: [u64; 2],
}

impl ContextEntry {
    /// Fault processing disable
    pub const FPD: u64 = 1 << 1;
    /// Translation type shift
    pub const TT_SHIFT: u32 = 2;
    /// Translation type mask
    pub const TT_MASK: u64 = 0x3 << Self::TT_SHIFT;

    /// A non-present entry
    pub const fn empty() -> Self {
        Self { words: [0; 2] }
    }

    /// Low word
    #[inline]
    pub const fn lo(&self) -> u64 {
        self.words[0]
    }

    /// High word
    #[inline]
    pub const fn hi(&self) -> u64 {
        self.words[1]
    }

    /// Translation type field
    pub const fn translation_type(&self) -> u64 {
        (self.words[0] & Self::TT_MASK) >> Self::TT_SHIFT
    }
}

impl ContextEncoding for ContextEntry {
    const SIZE: usize = 16;

    fn encode(domain: DomainId, root: PhysicalAddress, width: AddressWidth) -> IommuResult<Self> {
        check_fields(domain, root)?;

        let lo = PRESENT
            | ((LegacyTranslation::UntranslatedOnly as u64) << Self::TT_SHIFT)
            | (root.as_u64() & ADDR_MASK);
        let hi = width.encoding() | ((domain.as_u32() as u64) << DID_SHIFT);
        Ok(Self { words: [lo, hi] })
    }

    fn words(&self) -> &[u64] {
        &self.words
    }

    fn domain_id(&self) -> DomainId {
        DomainId::new(((self.words[1] & DID_MASK) >> DID_SHIFT) as u32)
    }

    fn address_width(&self) -> Option<AddressWidth> {
        AddressWidth::from_encoding(self.words[1] & AW_MASK)
    }
}

impl fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEntry")
            .field("lo", &format_args!("{:#018x}", self.words[0]))
            .field("hi", &format_args!("{:#018x}", self.words[1]))
            .finish()
    }
}

// =============================================================================
// Extended Context Entry
// =============================================================================

/// Extended translation types (T)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtendedTranslation {
    /// Host mode, device TLB disabled
    HostModeNoDeviceTlb = 0b000,
    /// Host mode, device TLB enabled
    HostModeDeviceTlb = 0b001,
    /// Pass-through
    PassThrough = 0b010,
    /// Guest mode, device TLB disabled
    GuestModeNoDeviceTlb = 0b100,
    /// Guest mode, device TLB enabled
    GuestModeDeviceTlb = 0b101,
}

/// Extended 256-bit context entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ExtendedContextEntry {
    words: [u64; 4],
}

impl ExtendedContextEntry {
    // Word 0
    /// Fault processing disable
    pub const FPD: u64 = 1 << 1;
    /// Translation type shift
    pub const T_SHIFT: u32 = 2;
    /// Translation type mask
    pub const T_MASK: u64 = 0x7 << Self::T_SHIFT;
    /// Extended memory type shift
    pub const EMT_SHIFT: u32 = 5;
    /// Deferred invalidate enable
    pub const DINVE: u64 = 1 << 8;
    /// Page request enable
    pub const PRE: u64 = 1 << 9;
    /// Nested translation enable
    pub const NESTE: u64 = 1 << 10;
    /// PASID enable
    pub const PASIDE: u64 = 1 << 11;

    // Word 1
    /// Page global enable
    pub const PGE: u64 = 1 << 3;
    /// No-execute enable
    pub const NXE: u64 = 1 << 4;
    /// Write protect enable
    pub const WPE: u64 = 1 << 5;
    /// Cache disable
    pub const CD: u64 = 1 << 6;
    /// Extended memory type enable
    pub const EMTE: u64 = 1 << 7;
    /// Supervisor mode execute protection
    pub const SMEP: u64 = 1 << 24;
    /// Extended accessed flag enable
    pub const EAFE: u64 = 1 << 25;
    /// Execute requests enable
    pub const ERE: u64 = 1 << 26;
    /// Second-level execute enable
    pub const SLEE: u64 = 1 << 27;
    /// Page attribute table shift
    pub const PAT_SHIFT: u32 = 32;

    // Word 2
    /// PASID table size mask
    pub const PTS_MASK: u64 = 0xF;

    /// A non-present entry
    pub const fn empty() -> Self {
        Self { words: [0; 4] }
    }

    /// Raw word `index` (0-3)
    #[inline]
    pub const fn word(&self, index: usize) -> u64 {
        self.words[index]
    }

    /// Translation type field
    pub const fn translation_type(&self) -> u64 {
        (self.words[0] & Self::T_MASK) >> Self::T_SHIFT
    }

    /// Second-level execute enable
    pub const fn second_level_execute(&self) -> bool {
        self.words[1] & Self::SLEE != 0
    }

    /// PASID support enabled
    pub const fn pasid_enabled(&self) -> bool {
        self.words[0] & Self::PASIDE != 0
    }

    /// Nested translation enabled
    pub const fn nested(&self) -> bool {
        self.words[0] & Self::NESTE != 0
    }
}

impl ContextEncoding for ExtendedContextEntry {
    const SIZE: usize = 32;

    fn encode(domain: DomainId, root: PhysicalAddress, width: AddressWidth) -> IommuResult<Self> {
        check_fields(domain, root)?;

        let w0 = PRESENT
            | ((ExtendedTranslation::HostModeNoDeviceTlb as u64) << Self::T_SHIFT)
            | (root.as_u64() & ADDR_MASK);
        let w1 = width.encoding() | ((domain.as_u32() as u64) << DID_SHIFT) | Self::SLEE;
        Ok(Self { words: [w0, w1, 0, 0] })
    }

    fn words(&self) -> &[u64] {
        &self.words
    }

    fn domain_id(&self) -> DomainId {
        DomainId::new(((self.words[1] & DID_MASK) >> DID_SHIFT) as u32)
    }

    fn address_width(&self) -> Option<AddressWidth> {
        AddressWidth::from_encoding(self.words[1] & AW_MASK)
    }
}

impl fmt::Debug for ExtendedContextEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedContextEntry")
            .field("w0", &format_args!("{:#018x}", self.words[0]))
            .field("w1", &format_args!("{:#018x}", self.words[1]))
            .field("w2", &format_args!("{:#018x}", self.words[2]))
            .field("w3", &format_args!("{:#018x}", self.words[3]))
            .finish()
    }
}

static_assertions::const_assert_eq!(size_of::<ContextEntry>(), 16);
static_assertions::const_assert_eq!(size_of::<ExtendedContextEntry>(), 32);

// =============================================================================
// Format
// =============================================================================

/// Context entry format of a device context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFormat {
    /// 128-bit entries
    Legacy,
    /// 256-bit entries (ECS)
    Extended,
}

/// An encoded entry of either format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedEntry {
    /// Legacy entry
    Legacy(ContextEntry),
    /// Extended entry
    Extended(ExtendedContextEntry),
}

impl EncodedEntry {
    /// Raw words, word 0 holding the present bit
    pub fn words(&self) -> &[u64] {
        match self {
            Self::Legacy(e) => e.words(),
            Self::Extended(e) => e.words(),
        }
    }

    /// Format of the entry
    pub const fn format(&self) -> ContextFormat {
        match self {
            Self::Legacy(_) => ContextFormat::Legacy,
            Self::Extended(_) => ContextFormat::Extended,
        }
    }
}

impl ContextFormat {
    /// Encode an entry in this format
    pub fn encode(self, domain: DomainId, root: PhysicalAddress, width: AddressWidth) -> IommuResult<EncodedEntry> {
        match self {
            Self::Legacy => ContextEntry::encode(domain, root, width).map(EncodedEntry::Legacy),
            Self::Extended => ExtendedContextEntry::encode(domain, root, width).map(EncodedEntry::Extended),
        }
    }

    /// Translation granule
    #[inline]
    pub const fn minimum_contiguity(self) -> u64 {
        PAGE_SIZE
    }

    /// Adjusted guest address width used by device contexts
    #[inline]
    pub const fn address_width(self) -> AddressWidth {
        AddressWidth::Bits48
    }

    /// Size of the device address space
    #[inline]
    pub const fn aspace_size(self) -> u64 {
        1 << self.address_width().bits()
    }

    /// Whether second-level leaves may carry the execute bit
    #[inline]
    pub const fn supports_execute(self) -> bool {
        matches!(self, Self::Extended)
    }

    /// Bytes per entry
    pub const fn entry_size(self) -> usize {
        match self {
            Self::Legacy => ContextEntry::SIZE,
            Self::Extended => ExtendedContextEntry::SIZE,
        }
    }
}

// =============================================================================
// Hardware Slot
// =============================================================================

/// The hardware-visible context entry of one device
///
/// Points into a context table owned by the parent IOMMU.
pub enum ContextSlot {
    /// Slot in an extended context table
    Extended(NonNull<ExtendedContextEntry>),
    /// Slot in a legacy context table
    Legacy(NonNull<ContextEntry>),
}

// Safety: the slot is written only by its owning device context.
unsafe impl Send for ContextSlot {}

impl ContextSlot {
    /// Wrap an extended context table slot
    ///
    /// # Safety
    ///
    /// `entry` must be a valid, 32-byte aligned entry in a live extended
    /// context table, written by nothing else while the slot exists.
    pub unsafe fn extended(entry: *mut ExtendedContextEntry) -> IommuResult<Self> {
        NonNull::new(entry).map(Self::Extended).ok_or(IommuError::InvalidArgument)
    }

    /// Wrap a legacy context table slot
    ///
    /// # Safety
    ///
    /// `entry` must be a valid, 16-byte aligned entry in a live legacy
    /// context table, written by nothing else while the slot exists.
    pub unsafe fn legacy(entry: *mut ContextEntry) -> IommuResult<Self> {
        NonNull::new(entry).map(Self::Legacy).ok_or(IommuError::InvalidArgument)
    }

    /// Format of the table this slot lives in
    pub const fn format(&self) -> ContextFormat {
        match self {
            Self::Extended(_) => ContextFormat::Extended,
            Self::Legacy(_) => ContextFormat::Legacy,
        }
    }

    fn base(&self) -> *mut u64 {
        match self {
            Self::Extended(p) => p.as_ptr().cast(),
            Self::Legacy(p) => p.as_ptr().cast(),
        }
    }

    fn word_count(&self) -> usize {
        self.format().entry_size() / size_of::<u64>()
    }

    fn read_word(&self, index: usize) -> u64 {
        // Safety: index < word_count and the slot is valid per the
        // constructor contract
        unsafe { ptr::read_volatile(self.base().add(index)) }
    }

    fn write_word(&mut self, index: usize, value: u64) {
        // Safety: as in `read_word`
        unsafe { ptr::write_volatile(self.base().add(index), value) }
    }

    /// Present bit of the hardware entry
    pub fn is_present(&self) -> bool {
        self.read_word(0) & PRESENT != 0
    }

    /// Current hardware contents
    pub fn read(&self) -> EncodedEntry {
        match self {
            Self::Extended(_) => {
                let mut entry = ExtendedContextEntry::empty();
                for (i, word) in entry.words.iter_mut().enumerate() {
                    *word = self.read_word(i);
                }
                EncodedEntry::Extended(entry)
            },
            Self::Legacy(_) => {
                let mut entry = ContextEntry::empty();
                for (i, word) in entry.words.iter_mut().enumerate() {
                    *word = self.read_word(i);
                }
                EncodedEntry::Legacy(entry)
            },
        }
    }

    /// Write `entry`, present word last
    ///
    /// Fails with `InvalidArgument` if the entry format differs from the slot.
    pub fn publish(&mut self, entry: &EncodedEntry) -> IommuResult<()> {
        if entry.format() != self.format() {
            return Err(IommuError::InvalidArgument);
        }
        let words = entry.words();
        for (i, &word) in words.iter().enumerate().skip(1) {
            self.write_word(i, word);
        }
        fence(Ordering::Release);
        self.write_word(0, words[0]);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Clear the entry, present word first
    ///
    /// Returns whether the entry was present.
    pub fn clear(&mut self) -> bool {
        let was_present = self.is_present();
        self.write_word(0, 0);
        fence(Ordering::SeqCst);
        for i in 1..self.word_count() {
            self.write_word(i, 0);
        }
        was_present
    }
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("format", &self.format())
            .field("address", &self.base())
            .field("present", &self.is_present())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: PhysicalAddress = PhysicalAddress::new(0x1234_5000);

    #[test]
    fn test_legacy_layout() {
        let entry = ContextEntry::encode(DomainId::new(0xBEEF), ROOT, AddressWidth::Bits48).unwrap();
        assert_eq!(entry.lo(), 0x1234_5000 | 1);
        assert_eq!(entry.hi(), (0xBEEF << 8) | 2);
        assert_eq!(entry.translation_type(), 0);
        assert!(entry.is_present());
        assert_eq!(entry.domain_id(), DomainId::new(0xBEEF));
        assert_eq!(entry.second_level_root(), ROOT);
        assert_eq!(entry.address_width(), Some(AddressWidth::Bits48));
    }

    #[test]
    fn test_extended_layout() {
        let entry = ExtendedContextEntry::encode(DomainId::new(7), ROOT, AddressWidth::Bits48).unwrap();
        assert_eq!(entry.word(0), 0x1234_5000 | 1);
        assert_eq!(entry.word(1), (7 << 8) | 2 | ExtendedContextEntry::SLEE);
        assert_eq!(entry.word(2), 0);
        assert_eq!(entry.word(3), 0);
        assert_eq!(entry.translation_type(), ExtendedTranslation::HostModeNoDeviceTlb as u64);
        assert!(entry.second_level_execute());
        assert!(!entry.pasid_enabled());
        assert!(!entry.nested());
        assert_eq!(entry.domain_id(), DomainId::new(7));
    }

    #[test]
    fn test_field_checks() {
        assert_eq!(
            ContextEntry::encode(DomainId::new(0x1_0000), ROOT, AddressWidth::Bits48),
            Err(IommuError::InvalidDomainId)
        );
        assert_eq!(
            ExtendedContextEntry::encode(DomainId::new(1), PhysicalAddress::new(0x1234_5800), AddressWidth::Bits48),
            Err(IommuError::Misaligned)
        );
    }

    #[test]
    fn test_format_queries() {
        for format in [ContextFormat::Legacy, ContextFormat::Extended] {
            assert_eq!(format.minimum_contiguity(), PAGE_SIZE);
            assert_eq!(format.aspace_size(), 1 << 48);
            assert_eq!(format.address_width().top_level(), Some(Level::Pml4));
        }
        assert!(!ContextFormat::Legacy.supports_execute());
        assert_eq!(ContextFormat::Extended.entry_size(), 32);

        let encoded = ContextFormat::Extended.encode(DomainId::new(3), ROOT, AddressWidth::Bits48).unwrap();
        assert_eq!(encoded.format(), ContextFormat::Extended);
        assert_eq!(encoded.words().len(), 4);
    }

    #[test]
    fn test_slot_publish_and_clear() {
        let mut raw = Box::new(ExtendedContextEntry::empty());
        let mut slot = unsafe { ContextSlot::extended(&mut *raw).unwrap() };
        assert!(!slot.is_present());

        let entry = ContextFormat::Extended.encode(DomainId::new(9), ROOT, AddressWidth::Bits48).unwrap();
        slot.publish(&entry).unwrap();
        assert!(slot.is_present());
        assert_eq!(slot.read(), entry);

        assert!(slot.clear());
        assert!(!slot.clear());
        assert_eq!(slot.read(), EncodedEntry::Extended(ExtendedContextEntry::empty()));
        drop(slot);
        assert_eq!(*raw, ExtendedContextEntry::empty());
    }

    #[test]
    fn test_slot_rejects_mismatched_format() {
        let mut raw = Box::new(ContextEntry::empty());
        let mut slot = unsafe { ContextSlot::legacy(&mut *raw).unwrap() };
        let entry = ContextFormat::Extended.encode(DomainId::new(1), ROOT, AddressWidth::Bits48).unwrap();
        assert_eq!(slot.publish(&entry), Err(IommuError::InvalidArgument));
        assert!(!slot.is_present());
        assert!(unsafe { ContextSlot::legacy(core::ptr::null_mut()) }.is_err());
    }
}
