//! Spill buckets extending overloaded bucket chains.

use parking_lot::{Mutex, RwLock};

use crate::index::bucket::{Bucket, SpillIndex};

/// Pool of heap-allocated spill buckets.
///
/// Buckets are boxed individually so their pointers stay stable while the
/// backing vector grows; chains can therefore hold raw pointers across the
/// pool lock. Indices are 1-based so that a zeroed overflow word means
/// "no spill bucket".
pub struct SpillPool {
    buckets: RwLock<Vec<*mut Bucket>>,
    free_list: Mutex<Vec<SpillIndex>>,
}

impl SpillPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Number of buckets ever allocated (live plus free-listed).
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether the pool holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a reset spill bucket, returning its index and a stable
    /// pointer.
    pub fn allocate(&self) -> (SpillIndex, *const Bucket) {
        if let Some(index) = self.free_list.lock().pop() {
            if let Some(ptr) = self.bucket_ptr(index) {
                unsafe { (*ptr).reset() };
                return (index, ptr);
            }
        }
        let boxed = Box::into_raw(Box::new(Bucket::new()));
        let mut buckets = self.buckets.write();
        buckets.push(boxed);
        let index = SpillIndex::new(buckets.len() as u64);
        (index, boxed as *const Bucket)
    }

    /// Return an *unlinked* bucket to the pool, e.g. after losing the CAS
    /// that would have attached it to a chain.
    pub fn release(&self, index: SpillIndex) {
        if index.is_none() {
            return;
        }
        self.free_list.lock().push(index);
    }

    /// Stable pointer to the spill bucket at `index`.
    pub fn bucket_ptr(&self, index: SpillIndex) -> Option<*const Bucket> {
        if index.is_none() {
            return None;
        }
        let buckets = self.buckets.read();
        buckets
            .get(index.get() as usize - 1)
            .copied()
            .map(|p| p as *const Bucket)
    }

    /// Snapshot of every bucket pointer, in index order, for checkpointing.
    pub fn snapshot(&self) -> Vec<*const Bucket> {
        self.buckets
            .read()
            .iter()
            .copied()
            .map(|p| p as *const Bucket)
            .collect()
    }

    /// Grow the pool to exactly `count` buckets, all reset. Used when
    /// restoring an index snapshot.
    pub fn restore_count(&self, count: u64) {
        let mut buckets = self.buckets.write();
        for ptr in buckets.drain(..) {
            unsafe { drop(Box::from_raw(ptr)) };
        }
        self.free_list.lock().clear();
        for _ in 0..count {
            buckets.push(Box::into_raw(Box::new(Bucket::new())));
        }
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.restore_count(0);
    }
}

impl Default for SpillPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SpillPool {
    fn drop(&mut self) {
        let buckets = self.buckets.get_mut();
        for ptr in buckets.drain(..) {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

unsafe impl Send for SpillPool {}
unsafe impl Sync for SpillPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_one_based() {
        let pool = SpillPool::new();
        let (a, _) = pool.allocate();
        let (b, _) = pool.allocate();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);
        assert!(pool.bucket_ptr(SpillIndex::NONE).is_none());
    }

    #[test]
    fn released_bucket_is_reused() {
        let pool = SpillPool::new();
        let (a, _) = pool.allocate();
        let (b, _) = pool.allocate();
        pool.release(b);
        let (c, _) = pool.allocate();
        assert_eq!(c, b);
        assert_ne!(c, a);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn restore_count_resets() {
        let pool = SpillPool::new();
        pool.allocate();
        pool.restore_count(5);
        assert_eq!(pool.len(), 5);
        for i in 1..=5 {
            assert!(pool.bucket_ptr(SpillIndex::new(i)).is_some());
        }
    }
}
