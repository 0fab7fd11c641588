//! Logical addresses into the hybrid log.
//!
//! An address is 48 bits: a page number in the high bits and a byte offset
//! within the page in the low 25 bits. The upper 16 bits of the containing
//! word are left for the hash index to pack a tag next to an address in a
//! single CAS-able u64.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Sub;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};

/// A 48-bit logical address: `page << OFFSET_BITS | offset`.
///
/// Pages may be configured smaller than the 32 MiB the offset field can
/// express; offsets within a page never exceed the configured page size, so
/// address order still tracks allocation order.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// Bits used by the whole address.
    pub const TOTAL_BITS: u32 = 48;
    /// Bits used by the in-page offset.
    pub const OFFSET_BITS: u32 = 25;
    /// Bits used by the page number.
    pub const PAGE_BITS: u32 = Self::TOTAL_BITS - Self::OFFSET_BITS;

    /// Largest in-page offset.
    pub const MAX_OFFSET: u32 = (1 << Self::OFFSET_BITS) - 1;
    /// Largest page number.
    pub const MAX_PAGE: u32 = (1 << Self::PAGE_BITS) - 1;

    /// The reserved "no address" value.
    ///
    /// This is 1 rather than 0 so that a zeroed hash bucket slot (empty) can
    /// be told apart from a live entry whose address field is invalid.
    pub const INVALID: Self = Self(1);

    /// Build an address from a page number and an in-page offset.
    #[inline]
    pub const fn new(page: u32, offset: u32) -> Self {
        debug_assert!(page <= Self::MAX_PAGE);
        debug_assert!(offset <= Self::MAX_OFFSET);
        Self(((page as u64) << Self::OFFSET_BITS) | offset as u64)
    }

    /// Reinterpret a raw 48-bit word as an address.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The page number.
    #[inline]
    pub const fn page(&self) -> u32 {
        (self.0 >> Self::OFFSET_BITS) as u32 & Self::MAX_PAGE
    }

    /// The byte offset within the page.
    #[inline]
    pub const fn offset(&self) -> u32 {
        (self.0 & Self::MAX_OFFSET as u64) as u32
    }

    /// The raw 48-bit word.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Whether this is the reserved invalid value.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Whether this address may be dereferenced or chased.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }

    /// The first address of the page this address lies in.
    #[inline]
    pub const fn page_start(&self) -> Self {
        Self::new(self.page(), 0)
    }

    /// The address `bytes` further along the log.
    #[inline]
    pub const fn offset_by(&self, bytes: u32) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}:{})", self.page(), self.offset())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.offset())
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Address {
    type Output = u64;

    /// Byte distance between two addresses (in raw address space).
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(a: Address) -> u64 {
        a.0
    }
}

// Addresses persist in checkpoint metadata as their raw 48-bit word.
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Address)
    }
}

/// A shared, atomically updated [`Address`] cell.
#[repr(transparent)]
pub struct AtomicAddress(AtomicU64);

impl AtomicAddress {
    /// Create a cell holding `address`.
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self(AtomicU64::new(address.0))
    }

    /// Load the current address.
    #[inline]
    pub fn load(&self, order: MemOrdering) -> Address {
        Address(self.0.load(order))
    }

    /// Store `address`.
    #[inline]
    pub fn store(&self, address: Address, order: MemOrdering) {
        self.0.store(address.0, order);
    }

    /// CAS from `current` to `new`.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: MemOrdering,
        failure: MemOrdering,
    ) -> Result<Address, Address> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Monotonically raise the cell to `target`. Returns true if this call
    /// (rather than a racing one) performed the raise.
    pub fn advance_to(&self, target: Address) -> bool {
        loop {
            let current = self.load(MemOrdering::Acquire);
            if target <= current {
                return false;
            }
            if self
                .compare_exchange(current, target, MemOrdering::AcqRel, MemOrdering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicAddress({})", self.load(MemOrdering::Relaxed))
    }
}

/// The log tail as a packed `(page, offset)` word.
///
/// The offset field here is wider than [`Address::OFFSET_BITS`]: reserving
/// space is a plain `fetch_add`, so under contention the offset may
/// transiently run far past the page size. Threads that observe an
/// overflowed offset lose the reservation and take the new-page path; the
/// extra width keeps the overflow from corrupting the page number.
#[derive(Clone, Copy, Default)]
pub struct TailOffset(u64);

impl TailOffset {
    const OFFSET_FIELD_BITS: u32 = 64 - Address::PAGE_BITS;
    const OFFSET_FIELD_MASK: u64 = (1 << Self::OFFSET_FIELD_BITS) - 1;

    /// Build from a page and an (unclamped) offset.
    #[inline]
    pub const fn new(page: u32, offset: u64) -> Self {
        Self(((page as u64) << Self::OFFSET_FIELD_BITS) | (offset & Self::OFFSET_FIELD_MASK))
    }

    /// The page number.
    #[inline]
    pub const fn page(&self) -> u32 {
        (self.0 >> Self::OFFSET_FIELD_BITS) as u32
    }

    /// The offset, possibly beyond the page size after an overflowing
    /// reservation.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_FIELD_MASK
    }
}

impl From<Address> for TailOffset {
    #[inline]
    fn from(a: Address) -> Self {
        Self::new(a.page(), a.offset() as u64)
    }
}

impl fmt::Debug for TailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TailOffset({}:{})", self.page(), self.offset())
    }
}

/// Atomically updated [`TailOffset`] used for lock-free tail reservation.
pub struct AtomicTailOffset(AtomicU64);

impl AtomicTailOffset {
    /// Create from an address.
    pub fn new(address: Address) -> Self {
        Self(AtomicU64::new(TailOffset::from(address).0))
    }

    /// Load the current tail.
    #[inline]
    pub fn load(&self, order: MemOrdering) -> TailOffset {
        TailOffset(self.0.load(order))
    }

    /// Reset the tail to `address`. Only used during initialization and
    /// recovery, never concurrently with reservations.
    pub fn store_address(&self, address: Address, order: MemOrdering) {
        self.0.store(TailOffset::from(address).0, order);
    }

    /// Reserve `bytes` at the current tail, returning the pre-reservation
    /// tail. The caller must check whether the reservation fits the page.
    #[inline]
    pub fn reserve(&self, bytes: u32) -> TailOffset {
        TailOffset(self.0.fetch_add(bytes as u64, MemOrdering::AcqRel))
    }

    /// Try to advance from `old_page` to `old_page + 1` with a zero offset.
    ///
    /// Returns `(advanced, won)`: `advanced` is true once any thread has
    /// moved past `old_page`; `won` is true only for the thread whose CAS
    /// installed the new page (that thread owns the page-transition work).
    pub fn try_new_page(&self, old_page: u32) -> (bool, bool) {
        debug_assert!(old_page < Address::MAX_PAGE);
        let observed = self.load(MemOrdering::Acquire);
        if observed.page() != old_page {
            return (observed.page() > old_page, false);
        }
        let next = TailOffset::new(old_page + 1, 0);
        match self.0.compare_exchange(
            observed.0,
            next.0,
            MemOrdering::AcqRel,
            MemOrdering::Acquire,
        ) {
            Ok(_) => (true, true),
            Err(actual) => (TailOffset(actual).page() > old_page, false),
        }
    }
}
