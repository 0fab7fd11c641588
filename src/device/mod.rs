//! Pluggable log devices.
//!
//! The allocator and checkpoint machinery talk to stable storage through
//! [`StorageDevice`], an async trait driven by the background I/O workers.
//! Simple synchronous backends implement [`SyncStorageDevice`] and are
//! lifted by a blanket impl.

mod file;
mod null;

pub use file::{FileDevice, SegmentedFileDevice};
pub use null::NullDevice;

use std::future::Future;
use std::io;
use std::pin::Pin;

/// A boxed future returned by device operations.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Asynchronous page-granular storage.
///
/// Contract: writes of aligned, page-sized buffers are atomic with respect
/// to crash, and a read after a completed write observes the written bytes.
/// No cross-offset ordering is promised beyond what completions establish.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> IoFuture<'_, usize>;

    /// Write `buf` at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> IoFuture<'_, usize>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> IoFuture<'_, ()>;

    /// Release storage below `offset`; reads below it become undefined.
    /// Backs the log's begin-address shift.
    fn truncate_below(&self, offset: u64) -> IoFuture<'_, ()>;

    /// Current device size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Reserve backing storage up front. No-op by default.
    fn preallocate(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Required I/O alignment.
    fn alignment(&self) -> usize {
        512
    }
}

/// Synchronous storage; lifted into [`StorageDevice`] by the blanket impl.
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush to stable storage.
    fn flush_all(&self) -> io::Result<()>;

    /// Release storage below `offset`.
    fn truncate_below_sync(&self, offset: u64) -> io::Result<()>;

    /// Current size in bytes.
    fn byte_size(&self) -> io::Result<u64>;

    /// Reserve backing storage up front. No-op by default.
    fn preallocate_sync(&self, _len: u64) -> io::Result<()> {
        Ok(())
    }

    /// Required I/O alignment.
    fn alignment(&self) -> usize {
        512
    }
}

impl<T: SyncStorageDevice> StorageDevice for T {
    fn read(&self, offset: u64, buf: &mut [u8]) -> IoFuture<'_, usize> {
        let result = self.read_at(offset, buf);
        Box::pin(async move { result })
    }

    fn write(&self, offset: u64, buf: &[u8]) -> IoFuture<'_, usize> {
        let result = self.write_at(offset, buf);
        Box::pin(async move { result })
    }

    fn flush(&self) -> IoFuture<'_, ()> {
        let result = self.flush_all();
        Box::pin(async move { result })
    }

    fn truncate_below(&self, offset: u64) -> IoFuture<'_, ()> {
        let result = self.truncate_below_sync(offset);
        Box::pin(async move { result })
    }

    fn size(&self) -> io::Result<u64> {
        self.byte_size()
    }

    fn preallocate(&self, len: u64) -> io::Result<()> {
        self.preallocate_sync(len)
    }

    fn alignment(&self) -> usize {
        SyncStorageDevice::alignment(self)
    }
}
