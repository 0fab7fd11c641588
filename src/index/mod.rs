//! The lock-free hash index.
//!
//! A fixed array of cache-line buckets maps the low bits of a key hash to a
//! chain of entry slots; each slot packs a log address next to a 14-bit tag
//! taken from the high hash bits. Lookups scan the chain for the tag;
//! writers linearise through a CAS on the owning slot. The array never
//! resizes; chains grow through spill buckets.

mod bucket;
mod overflow;
mod table;

pub use bucket::{AtomicBucketEntry, Bucket, BucketEntry, SpillIndex};
pub use overflow::SpillPool;
pub use table::BucketArray;

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::status::Status;

/// A key hash split into its index roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHash(u64);

impl KeyHash {
    /// Wrap a 64-bit hash.
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self(hash)
    }

    /// Bucket index for a table of `size` buckets (power of two).
    #[inline]
    pub const fn bucket_index(&self, size: u64) -> u64 {
        self.0 & (size - 1)
    }

    /// The tag: high hash bits, masked to the entry's tag width.
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> 48) & ((1 << BucketEntry::TAG_BITS) - 1)) as u16
    }
}

/// Result of probing the index for a hash.
pub struct FindSlot {
    /// The entry observed in the slot (empty when not found).
    pub entry: BucketEntry,
    /// The slot the entry was read from, for the follow-up CAS.
    pub slot: Option<*const AtomicBucketEntry>,
}

impl FindSlot {
    fn not_found() -> Self {
        Self {
            entry: BucketEntry::EMPTY,
            slot: None,
        }
    }

    /// Whether a published entry was found.
    #[inline]
    pub fn found(&self) -> bool {
        self.slot.is_some() && !self.entry.is_empty()
    }
}

/// Occupancy counters for diagnostics and checkpoint metadata.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Buckets in the base array.
    pub table_size: u64,
    /// Slots scanned (base plus spill).
    pub total_slots: u64,
    /// Slots holding a published entry.
    pub used_slots: u64,
    /// Spill buckets in use.
    pub spill_buckets: u64,
}

/// The hash index: bucket array plus spill pool.
pub struct HashIndex {
    table: BucketArray,
    spill: SpillPool,
}

impl HashIndex {
    /// Build an index with `table_size` buckets (power of two).
    pub fn new(table_size: u64) -> Result<Self, Status> {
        Ok(Self {
            table: BucketArray::new(table_size)?,
            spill: SpillPool::new(),
        })
    }

    /// Number of base buckets.
    #[inline]
    pub fn size(&self) -> u64 {
        self.table.size()
    }

    /// Look up the published entry for `hash`.
    pub fn find_entry(&self, hash: KeyHash) -> FindSlot {
        let bucket = self.table.bucket_at(hash.bucket_index(self.table.size()));
        self.find_in_chain(bucket, hash.tag())
    }

    /// Look up `hash`, creating a published placeholder entry (with the
    /// invalid address) if none exists.
    ///
    /// Creation is two-phase: a tentative entry is CASed into a free slot,
    /// the chain is re-scanned for a racing same-tag insert, and only then
    /// is the entry published. A racer that sees our tentative entry treats
    /// the slot as unreadable and retries its own insert.
    pub fn find_or_create_entry(&self, hash: KeyHash) -> FindSlot {
        let tag = hash.tag();
        loop {
            let bucket = self.table.bucket_at(hash.bucket_index(self.table.size()));

            let found = self.find_in_chain(bucket, tag);
            if found.found() {
                return found;
            }

            let free = match self.free_slot_in_chain(bucket) {
                Some(slot) => slot,
                None => match self.append_spill_bucket(bucket) {
                    Some(slot) => slot,
                    None => continue,
                },
            };

            let tentative = BucketEntry::new(Address::INVALID, tag, true);
            let cell = unsafe { &*free };
            if cell
                .compare_exchange(
                    BucketEntry::EMPTY,
                    tentative,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if self.conflicting_tag_in_chain(bucket, tag, free) {
                cell.store(BucketEntry::EMPTY, Ordering::Release);
                continue;
            }

            let published = BucketEntry::new(Address::INVALID, tag, false);
            cell.store(published, Ordering::Release);
            return FindSlot {
                entry: published,
                slot: Some(free),
            };
        }
    }

    /// CAS `slot` from `expected` to an entry for `new_address`.
    ///
    /// This is the linearisation point for writers on a key. A failure
    /// means another writer won; the caller restarts from the lookup.
    pub fn try_update(
        &self,
        slot: *const AtomicBucketEntry,
        expected: BucketEntry,
        new_address: Address,
        tag: u16,
    ) -> Status {
        let next = BucketEntry::new(new_address, tag, false);
        let cell = unsafe { &*slot };
        match cell.compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Status::Ok,
            Err(_) => Status::Aborted,
        }
    }

    /// Drop every entry whose address fell below `begin`. Called after the
    /// log's begin address advances.
    pub fn garbage_collect(&self, begin: Address) -> u64 {
        let mut removed = 0;
        self.for_each_bucket(|bucket| {
            for slot in &bucket.slots {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_empty() || entry.is_tentative() {
                    continue;
                }
                let address = entry.address();
                if address.is_valid() && address < begin {
                    if slot
                        .compare_exchange(
                            entry,
                            BucketEntry::EMPTY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        removed += 1;
                    }
                }
            }
        });
        removed
    }

    /// Wipe tentative leftovers. Run once after restoring a snapshot.
    pub fn clear_tentative(&self) {
        self.for_each_bucket(|bucket| {
            for slot in &bucket.slots {
                if slot.load(Ordering::Acquire).is_tentative() {
                    slot.store(BucketEntry::EMPTY, Ordering::Release);
                }
            }
        });
    }

    /// Reset the index to empty.
    pub fn clear(&self) {
        self.table.clear();
        self.spill.clear();
    }

    /// Occupancy statistics.
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            table_size: self.table.size(),
            spill_buckets: self.spill.len() as u64,
            ..IndexStats::default()
        };
        self.for_each_bucket(|bucket| {
            for slot in &bucket.slots {
                stats.total_slots += 1;
                if !slot.load(Ordering::Relaxed).is_empty() {
                    stats.used_slots += 1;
                }
            }
        });
        stats
    }

    // ---- chain helpers ------------------------------------------------------

    fn find_in_chain(&self, base: &Bucket, tag: u16) -> FindSlot {
        let mut bucket_ptr: *const Bucket = base;
        loop {
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.slots {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && !entry.is_tentative() && entry.tag() == tag {
                    return FindSlot {
                        entry,
                        slot: Some(slot as *const _),
                    };
                }
            }
            match self.next_in_chain(bucket) {
                Some(next) => bucket_ptr = next,
                None => return FindSlot::not_found(),
            }
        }
    }

    fn free_slot_in_chain(&self, base: &Bucket) -> Option<*const AtomicBucketEntry> {
        let mut bucket_ptr: *const Bucket = base;
        loop {
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.slots {
                if slot.load(Ordering::Acquire).is_empty() {
                    return Some(slot as *const _);
                }
            }
            bucket_ptr = self.next_in_chain(bucket)?;
        }
    }

    fn conflicting_tag_in_chain(
        &self,
        base: &Bucket,
        tag: u16,
        ours: *const AtomicBucketEntry,
    ) -> bool {
        let mut bucket_ptr: *const Bucket = base;
        loop {
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.slots {
                let slot_ptr = slot as *const AtomicBucketEntry;
                if slot_ptr == ours {
                    continue;
                }
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && !entry.is_tentative() && entry.tag() == tag {
                    return true;
                }
            }
            match self.next_in_chain(bucket) {
                Some(next) => bucket_ptr = next,
                None => return false,
            }
        }
    }

    /// Attach a fresh spill bucket to the end of `base`'s chain and hand
    /// back its first slot. A lost CAS releases the bucket and follows the
    /// winner instead.
    fn append_spill_bucket(&self, base: &Bucket) -> Option<*const AtomicBucketEntry> {
        let mut bucket_ptr: *const Bucket = base;
        loop {
            let bucket = unsafe { &*bucket_ptr };
            let link = bucket.overflow.load(Ordering::Acquire);
            if !link.is_none() {
                bucket_ptr = self.spill.bucket_ptr(link)?;
                continue;
            }

            let (index, new_ptr) = self.spill.allocate();
            match bucket.overflow.compare_exchange(
                SpillIndex::NONE,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let new_bucket = unsafe { &*new_ptr };
                    return Some(&new_bucket.slots[0] as *const _);
                }
                Err(actual) => {
                    self.spill.release(index);
                    if actual.is_none() {
                        continue;
                    }
                    bucket_ptr = self.spill.bucket_ptr(actual)?;
                }
            }
        }
    }

    fn next_in_chain(&self, bucket: &Bucket) -> Option<*const Bucket> {
        let link = bucket.overflow.load(Ordering::Acquire);
        if link.is_none() {
            None
        } else {
            self.spill.bucket_ptr(link)
        }
    }

    fn for_each_bucket(&self, mut f: impl FnMut(&Bucket)) {
        for i in 0..self.table.size() {
            let mut bucket_ptr: *const Bucket = self.table.bucket_at(i);
            loop {
                let bucket = unsafe { &*bucket_ptr };
                f(bucket);
                match self.next_in_chain(bucket) {
                    Some(next) => bucket_ptr = next,
                    None => break,
                }
            }
        }
    }

    // ---- snapshot I/O -------------------------------------------------------

    /// Write the bucket array and spill pool to `path`.
    ///
    /// Format: `table_size: u64 | spill_count: u64 | base buckets | spill
    /// buckets`, each bucket as seven entry words plus the overflow word,
    /// little-endian. The write races concurrent updates by design; a fuzzy
    /// snapshot is made consistent at recovery by the log rescan.
    pub fn write_snapshot(&self, path: &Path) -> io::Result<()> {
        self.write_snapshot_clamped(path, |address| address)
    }

    /// [`write_snapshot`](Self::write_snapshot) with every live entry's
    /// address mapped through `clamp` first; an invalid result writes the
    /// slot as empty. The checkpoint uses this to pin a racing snapshot to
    /// its cut: entries that already point past the cut are rewritten to
    /// their newest ancestor below it.
    pub fn write_snapshot_clamped(
        &self,
        path: &Path,
        clamp: impl Fn(Address) -> Address,
    ) -> io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);

        let spill_snapshot = self.spill.snapshot();

        writer.write_all(&self.table.size().to_le_bytes())?;
        writer.write_all(&(spill_snapshot.len() as u64).to_le_bytes())?;

        for i in 0..self.table.size() {
            Self::write_bucket(&mut writer, self.table.bucket_at(i), &clamp)?;
        }
        for ptr in spill_snapshot {
            Self::write_bucket(&mut writer, unsafe { &*ptr }, &clamp)?;
        }
        writer.flush()
    }

    fn write_bucket(
        writer: &mut impl Write,
        bucket: &Bucket,
        clamp: &impl Fn(Address) -> Address,
    ) -> io::Result<()> {
        for slot in &bucket.slots {
            let entry = slot.load(Ordering::Relaxed);
            let word = if entry.is_empty() || entry.is_tentative() {
                0
            } else {
                let address = clamp(entry.address());
                if address.is_valid() {
                    BucketEntry::new(address, entry.tag(), false).control()
                } else {
                    0
                }
            };
            writer.write_all(&word.to_le_bytes())?;
        }
        let link = bucket.overflow.load(Ordering::Relaxed).get();
        writer.write_all(&link.to_le_bytes())
    }

    /// Drop every published entry whose address is at or above `cut`.
    /// Recovery runs this after restoring a snapshot as a backstop; a
    /// snapshot written through the clamp holds no such entries.
    pub fn drop_above(&self, cut: Address) -> u64 {
        let mut removed = 0;
        self.for_each_bucket(|bucket| {
            for slot in &bucket.slots {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_empty() || entry.is_tentative() {
                    continue;
                }
                let address = entry.address();
                if address.is_valid() && address >= cut {
                    if slot
                        .compare_exchange(
                            entry,
                            BucketEntry::EMPTY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        removed += 1;
                    }
                }
            }
        });
        removed
    }

    /// Restore the index from a snapshot written by
    /// [`write_snapshot`](Self::write_snapshot). The table size must match.
    pub fn read_snapshot(&self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(1 << 20, file);

        let mut word = [0u8; 8];
        reader.read_exact(&mut word)?;
        let table_size = u64::from_le_bytes(word);
        reader.read_exact(&mut word)?;
        let spill_count = u64::from_le_bytes(word);

        if table_size != self.table.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "index snapshot has {table_size} buckets, store configured {}",
                    self.table.size()
                ),
            ));
        }

        self.spill.restore_count(spill_count);

        for i in 0..table_size {
            Self::read_bucket(&mut reader, self.table.bucket_at(i))?;
        }
        for i in 0..spill_count {
            let ptr = self
                .spill
                .bucket_ptr(SpillIndex::new(i + 1))
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "spill bucket missing"))?;
            Self::read_bucket(&mut reader, unsafe { &*ptr })?;
        }

        self.clear_tentative();
        Ok(())
    }

    fn read_bucket(reader: &mut impl Read, bucket: &Bucket) -> io::Result<()> {
        let mut word = [0u8; 8];
        for slot in &bucket.slots {
            reader.read_exact(&mut word)?;
            slot.store(
                BucketEntry::from_control(u64::from_le_bytes(word)),
                Ordering::Release,
            );
        }
        reader.read_exact(&mut word)?;
        bucket
            .overflow
            .store(SpillIndex::new(u64::from_le_bytes(word)), Ordering::Release);
        Ok(())
    }
}

unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_for_bucket(index: u64, tag: u16, size: u64) -> KeyHash {
        KeyHash::new((index & (size - 1)) | ((tag as u64) << 48))
    }

    #[test]
    fn create_then_find() {
        let index = HashIndex::new(64).unwrap();
        let hash = KeyHash::new(0xdead_beef_cafe_f00d);

        assert!(!index.find_entry(hash).found());
        let created = index.find_or_create_entry(hash);
        assert!(created.found());
        assert_eq!(created.entry.address(), Address::INVALID);

        let found = index.find_entry(hash);
        assert!(found.found());
        assert_eq!(found.entry.tag(), hash.tag());
    }

    #[test]
    fn update_entry_address() {
        let index = HashIndex::new(64).unwrap();
        let hash = KeyHash::new(0x1234_5678_9abc_def0);
        let created = index.find_or_create_entry(hash);
        let slot = created.slot.unwrap();

        let addr = Address::new(3, 200);
        assert_eq!(
            index.try_update(slot, created.entry, addr, hash.tag()),
            Status::Ok
        );
        assert_eq!(index.find_entry(hash).entry.address(), addr);

        // A stale expected value loses.
        assert_eq!(
            index.try_update(slot, created.entry, Address::new(4, 0), hash.tag()),
            Status::Aborted
        );
    }

    #[test]
    fn chain_grows_through_spill_buckets() {
        let index = HashIndex::new(2).unwrap();
        // More distinct tags into one bucket than its seven slots.
        for tag in 1..=20u16 {
            let hash = hash_for_bucket(0, tag, 2);
            assert!(index.find_or_create_entry(hash).found());
        }
        for tag in 1..=20u16 {
            let hash = hash_for_bucket(0, tag, 2);
            assert!(index.find_entry(hash).found(), "tag {tag} lost");
        }
        assert!(index.stats().spill_buckets > 0);
    }

    #[test]
    fn garbage_collect_drops_old_entries() {
        let index = HashIndex::new(64).unwrap();
        let hash = KeyHash::new(0x42);
        let created = index.find_or_create_entry(hash);
        index
            .try_update(created.slot.unwrap(), created.entry, Address::new(0, 64), hash.tag());

        assert_eq!(index.garbage_collect(Address::new(1, 0)), 1);
        assert!(!index.find_entry(hash).found());
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = std::env::temp_dir().join("stratakv-index-snap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("index.dat");

        let index = HashIndex::new(32).unwrap();
        let mut expected = Vec::new();
        for i in 0..100u64 {
            let hash = KeyHash::new(i | (i << 48));
            let created = index.find_or_create_entry(hash);
            let addr = Address::new(0, (i as u32 + 1) * 64);
            index.try_update(created.slot.unwrap(), created.entry, addr, hash.tag());
            expected.push((hash, addr));
        }
        index.write_snapshot(&path).unwrap();

        let restored = HashIndex::new(32).unwrap();
        restored.read_snapshot(&path).unwrap();
        for (hash, addr) in expected {
            let found = restored.find_entry(hash);
            assert!(found.found());
            assert_eq!(found.entry.address(), addr);
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn clamped_snapshot_rewrites_high_entries() {
        let dir = std::env::temp_dir().join("stratakv-index-clamp-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("index.dat");

        let index = HashIndex::new(16).unwrap();
        let low = KeyHash::new(1 | (1u64 << 48));
        let high = KeyHash::new(2 | (2u64 << 48));
        let cut = Address::new(1, 0);

        let a = index.find_or_create_entry(low);
        index.try_update(a.slot.unwrap(), a.entry, Address::new(0, 64), low.tag());
        let b = index.find_or_create_entry(high);
        index.try_update(b.slot.unwrap(), b.entry, Address::new(2, 0), high.tag());

        // Entries at or past the cut map to their sub-cut ancestor; this
        // one has none, so it drops out of the snapshot.
        index
            .write_snapshot_clamped(&path, |address| {
                if address >= cut {
                    Address::INVALID
                } else {
                    address
                }
            })
            .unwrap();

        let restored = HashIndex::new(16).unwrap();
        restored.read_snapshot(&path).unwrap();
        assert_eq!(restored.find_entry(low).entry.address(), Address::new(0, 64));
        assert!(!restored.find_entry(high).found());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn drop_above_removes_high_entries() {
        let index = HashIndex::new(16).unwrap();
        let low = KeyHash::new(1 | (1u64 << 48));
        let high = KeyHash::new(2 | (2u64 << 48));

        let a = index.find_or_create_entry(low);
        index.try_update(a.slot.unwrap(), a.entry, Address::new(0, 64), low.tag());
        let b = index.find_or_create_entry(high);
        index.try_update(b.slot.unwrap(), b.entry, Address::new(3, 0), high.tag());

        assert_eq!(index.drop_above(Address::new(1, 0)), 1);
        assert!(index.find_entry(low).found());
        assert!(!index.find_entry(high).found());
    }

    #[test]
    fn concurrent_creates_yield_one_slot_per_tag() {
        use std::sync::Arc;
        let index = Arc::new(HashIndex::new(8).unwrap());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                for tag in 1..=50u16 {
                    let hash = hash_for_bucket(0, tag, 8);
                    assert!(index.find_or_create_entry(hash).found());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Exactly one published slot per tag.
        let stats = index.stats();
        assert_eq!(stats.used_slots, 50);
    }
}
