//! Hash buckets and their packed entry words.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;

/// A bucket slot packed into one CAS-able u64.
///
/// Layout, low to high bits:
/// - address (48): log address of the newest record for this tag
/// - tag (14): hash fragment disambiguating keys without a log read
/// - reserved (1)
/// - tentative (1): the slot is claimed but not yet published
///
/// An all-zero word is an empty slot; a live entry is never all-zero
/// because [`Address::INVALID`] is nonzero.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketEntry(u64);

impl BucketEntry {
    /// The empty slot value.
    pub const EMPTY: Self = Self(0);

    /// Bits in the tag field.
    pub const TAG_BITS: u32 = 14;

    const ADDRESS_MASK: u64 = (1 << Address::TOTAL_BITS) - 1;
    const TAG_SHIFT: u32 = Address::TOTAL_BITS;
    const TAG_MASK: u64 = (1 << Self::TAG_BITS) - 1;
    const TENTATIVE_BIT: u64 = 1 << 63;

    /// Pack an entry.
    #[inline]
    pub const fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut word = address.raw() & Self::ADDRESS_MASK;
        word |= ((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            word |= Self::TENTATIVE_BIT;
        }
        Self(word)
    }

    /// Reinterpret a raw word (snapshot recovery).
    #[inline]
    pub const fn from_control(word: u64) -> Self {
        Self(word)
    }

    /// The raw word.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Whether the slot is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The packed address.
    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_raw(self.0 & Self::ADDRESS_MASK)
    }

    /// The packed tag.
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    /// Whether the slot is claimed but unpublished.
    #[inline]
    pub const fn is_tentative(&self) -> bool {
        self.0 & Self::TENTATIVE_BIT != 0
    }
}

impl std::fmt::Debug for BucketEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .field("tentative", &self.is_tentative())
            .finish()
    }
}

/// Atomic cell holding a [`BucketEntry`].
#[repr(transparent)]
pub struct AtomicBucketEntry(AtomicU64);

impl AtomicBucketEntry {
    /// An empty cell.
    #[inline]
    pub const fn empty() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Load the entry.
    #[inline]
    pub fn load(&self, order: Ordering) -> BucketEntry {
        BucketEntry(self.0.load(order))
    }

    /// Store an entry.
    #[inline]
    pub fn store(&self, entry: BucketEntry, order: Ordering) {
        self.0.store(entry.0, order);
    }

    /// CAS from `current` to `new`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: BucketEntry,
        new: BucketEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<BucketEntry, BucketEntry> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(BucketEntry)
            .map_err(BucketEntry)
    }
}

impl Default for AtomicBucketEntry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Index of a spill bucket inside the pool; 0 is "no overflow".
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SpillIndex(u64);

impl SpillIndex {
    /// The "no overflow bucket" value.
    pub const NONE: Self = Self(0);

    /// Build from a 1-based pool index.
    #[inline]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// The raw 1-based index.
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Whether this names a spill bucket.
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Atomic cell holding a [`SpillIndex`].
#[repr(transparent)]
pub struct AtomicSpillIndex(AtomicU64);

impl AtomicSpillIndex {
    /// A cell holding [`SpillIndex::NONE`].
    #[inline]
    pub const fn none() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Load the index.
    #[inline]
    pub fn load(&self, order: Ordering) -> SpillIndex {
        SpillIndex(self.0.load(order))
    }

    /// Store an index.
    #[inline]
    pub fn store(&self, index: SpillIndex, order: Ordering) {
        self.0.store(index.0, order);
    }

    /// CAS from `current` to `new`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: SpillIndex,
        new: SpillIndex,
        success: Ordering,
        failure: Ordering,
    ) -> Result<SpillIndex, SpillIndex> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(SpillIndex)
            .map_err(SpillIndex)
    }
}

impl Default for AtomicSpillIndex {
    fn default() -> Self {
        Self::none()
    }
}

/// One cache line of index state: seven entry slots plus an overflow link.
#[repr(C, align(64))]
pub struct Bucket {
    /// The entry slots.
    pub slots: [AtomicBucketEntry; Bucket::SLOTS],
    /// Link to the spill bucket extending this chain.
    pub overflow: AtomicSpillIndex,
}

impl Bucket {
    /// Entry slots per bucket.
    pub const SLOTS: usize = 7;

    /// A bucket with every slot empty.
    pub const fn new() -> Self {
        Self {
            slots: [
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
                AtomicBucketEntry::empty(),
            ],
            overflow: AtomicSpillIndex::none(),
        }
    }

    /// Reset every slot and the overflow link.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(BucketEntry::EMPTY, Ordering::Release);
        }
        self.overflow.store(SpillIndex::NONE, Ordering::Release);
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(std::mem::size_of::<Bucket>() == 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack() {
        let e = BucketEntry::new(Address::new(9, 512), 0x1abc, false);
        assert_eq!(e.address(), Address::new(9, 512));
        assert_eq!(e.tag(), 0x1abc);
        assert!(!e.is_tentative());
        assert!(!e.is_empty());
    }

    #[test]
    fn tentative_bit() {
        let e = BucketEntry::new(Address::INVALID, 3, true);
        assert!(e.is_tentative());
        assert_eq!(e.tag(), 3);
        assert_eq!(e.address(), Address::INVALID);
    }

    #[test]
    fn tag_is_masked() {
        let e = BucketEntry::new(Address::INVALID, u16::MAX, false);
        assert_eq!(e.tag(), (1 << BucketEntry::TAG_BITS) - 1);
    }

    #[test]
    fn empty_entry_is_all_zero() {
        assert!(BucketEntry::EMPTY.is_empty());
        // An entry holding the invalid address is still distinguishable
        // from an empty slot.
        assert!(!BucketEntry::new(Address::INVALID, 0, false).is_empty());
    }

    #[test]
    fn bucket_cas() {
        let bucket = Bucket::new();
        let newer = BucketEntry::new(Address::new(1, 0), 7, false);
        assert!(bucket.slots[0]
            .compare_exchange(
                BucketEntry::EMPTY,
                newer,
                Ordering::AcqRel,
                Ordering::Acquire
            )
            .is_ok());
        assert_eq!(bucket.slots[0].load(Ordering::Acquire), newer);
        // Stale CAS fails.
        assert!(bucket.slots[0]
            .compare_exchange(
                BucketEntry::EMPTY,
                newer,
                Ordering::AcqRel,
                Ordering::Acquire
            )
            .is_err());
    }
}
