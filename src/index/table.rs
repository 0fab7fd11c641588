//! The fixed bucket array behind the hash index.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::constants::CACHE_LINE_BYTES;
use crate::index::bucket::Bucket;
use crate::status::Status;
use crate::utility::is_power_of_two;

/// A cache-line-aligned, zero-initialized array of [`Bucket`]s.
///
/// The array is sized once at construction and never resized; a zeroed
/// bucket is a valid empty bucket, so no per-bucket initialization runs.
pub struct BucketArray {
    buckets: NonNull<Bucket>,
    size: u64,
}

impl BucketArray {
    /// Allocate an array of `size` buckets (power of two).
    pub fn new(size: u64) -> Result<Self, Status> {
        if !is_power_of_two(size) || size > i32::MAX as u64 {
            return Err(Status::Corruption);
        }
        let layout = Layout::from_size_align(
            size as usize * std::mem::size_of::<Bucket>(),
            CACHE_LINE_BYTES,
        )
        .map_err(|_| Status::OutOfMemory)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let buckets = NonNull::new(ptr as *mut Bucket).ok_or(Status::OutOfMemory)?;
        Ok(Self { buckets, size })
    }

    /// Number of buckets.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The bucket at `index`.
    #[inline]
    pub fn bucket_at(&self, index: u64) -> &Bucket {
        debug_assert!(index < self.size);
        unsafe { &*self.buckets.as_ptr().add(index as usize) }
    }

    /// Reset every bucket to empty.
    pub fn clear(&self) {
        for i in 0..self.size {
            self.bucket_at(i).reset();
        }
    }
}

impl Drop for BucketArray {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(
            self.size as usize * std::mem::size_of::<Bucket>(),
            CACHE_LINE_BYTES,
        )
        .expect("valid layout");
        unsafe { dealloc(self.buckets.as_ptr() as *mut u8, layout) };
    }
}

unsafe impl Send for BucketArray {}
unsafe impl Sync for BucketArray {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::bucket::BucketEntry;
    use std::sync::atomic::Ordering;

    #[test]
    fn zeroed_buckets_are_empty() {
        let table = BucketArray::new(64).unwrap();
        assert_eq!(table.size(), 64);
        for i in 0..64 {
            let bucket = table.bucket_at(i);
            for slot in &bucket.slots {
                assert!(slot.load(Ordering::Relaxed).is_empty());
            }
            assert!(bucket.overflow.load(Ordering::Relaxed).is_none());
        }
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(BucketArray::new(100).is_err());
        assert!(BucketArray::new(0).is_err());
    }

    #[test]
    fn clear_resets() {
        let table = BucketArray::new(8).unwrap();
        let entry = BucketEntry::new(crate::address::Address::new(1, 0), 5, false);
        table.bucket_at(3).slots[2].store(entry, Ordering::Release);
        table.clear();
        assert!(table.bucket_at(3).slots[2].load(Ordering::Relaxed).is_empty());
    }
}
