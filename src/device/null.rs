//! A device that discards writes. For tests and memory-only stores.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::SyncStorageDevice;

/// Accepts every write, returns zeroes for every read.
///
/// Useful when the working set fits in memory and persistence is not
/// needed; also the default device in unit tests.
pub struct NullDevice {
    high_water: AtomicU64,
}

impl NullDevice {
    /// Create a null device.
    pub fn new() -> Self {
        Self {
            high_water: AtomicU64::new(0),
        }
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStorageDevice for NullDevice {
    fn read_at(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let end = offset + buf.len() as u64;
        self.high_water.fetch_max(end, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush_all(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_below_sync(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }

    fn byte_size(&self) -> io::Result<u64> {
        Ok(self.high_water.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_advance_size_reads_are_zero() {
        let dev = NullDevice::new();
        assert_eq!(dev.write_at(100, &[1, 2, 3]).unwrap(), 3);
        assert_eq!(dev.byte_size().unwrap(), 103);

        let mut buf = [0xffu8; 4];
        assert_eq!(dev.read_at(100, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 0, 0, 0]);
    }
}
