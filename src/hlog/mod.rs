//! The hybrid log allocator.
//!
//! Owns the logical address space and the in-memory page ring. The tail is
//! reserved lock-free; pages crossed by the read-only boundary are closed
//! and streamed to the device by a background worker; the head only
//! advances over the contiguous flushed prefix, and frame recycling is
//! deferred through the epoch so no reader ever sees a page change under
//! its pointer.

mod flush;
mod frame;

pub use frame::{FrameState, OpenOutcome, PageRing};

use std::future::Future;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam::channel::Sender;
use tracing::info;

use crate::address::{Address, AtomicAddress, AtomicTailOffset};
use crate::device::StorageDevice;
use crate::epoch::EpochManager;
use crate::status::Status;
use flush::{FlushMsg, FlushWorker};

/// Run a small async I/O task to completion on the calling thread. Cold
/// paths only (checkpoint, recovery, begin truncation).
pub(crate) fn block_on_io<T>(fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    let rt = tokio::runtime::Builder::new_current_thread().build()?;
    rt.block_on(fut)
}

/// Log geometry, all in pages of `page_size` bytes.
#[derive(Debug, Clone)]
pub struct LogLayout {
    /// Bytes per page (power of two, at most 1 << 25).
    pub page_size: usize,
    /// In-memory frames (power of two).
    pub frame_count: u32,
    /// Pages kept mutable behind the tail.
    pub mutable_pages: u32,
}

impl LogLayout {
    /// Derive a layout from bit widths: `memory_bits` of buffer split into
    /// `1 << (memory_bits - page_bits)` pages, with `mutable_fraction` of
    /// them left mutable.
    pub fn from_bits(page_bits: u32, memory_bits: u32, mutable_fraction: f64) -> Self {
        debug_assert!(page_bits <= Address::OFFSET_BITS);
        debug_assert!(memory_bits > page_bits);
        let frame_count = 1u32 << (memory_bits - page_bits);
        let mutable_pages =
            ((frame_count as f64 * mutable_fraction) as u32).clamp(1, frame_count - 1);
        Self {
            page_size: 1 << page_bits,
            frame_count,
            mutable_pages,
        }
    }
}

/// State shared between the allocator facade, the flush worker, and
/// epoch-deferred eviction actions.
pub(crate) struct LogInner<D: StorageDevice> {
    layout: LogLayout,
    device: Arc<D>,
    ring: PageRing,
    epoch: Arc<EpochManager>,

    tail: AtomicTailOffset,
    read_only: AtomicAddress,
    head: AtomicAddress,
    begin: AtomicAddress,
    flushed_until: AtomicAddress,

    /// Next page the flush submission scan will consider.
    flush_scan_from: AtomicU32,
    pending_flushes: AtomicU64,
    faulted: AtomicBool,
    flush_tx: OnceLock<Sender<FlushMsg>>,
}

impl<D: StorageDevice> LogInner<D> {
    pub(crate) fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub(crate) fn fault(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Flush worker callback: a page's bytes reached the device.
    pub(crate) fn note_page_flushed(&self, page: u32) {
        self.ring
            .try_transition(page, FrameState::FlushSubmitted, FrameState::Flushed);
        self.advance_flushed_until();
    }

    pub(crate) fn note_flush_retired(&self) {
        self.pending_flushes.fetch_sub(1, Ordering::AcqRel);
    }

    /// Advance `flushed_until` across the contiguous prefix of flushed
    /// pages, capped at the read-only boundary.
    fn advance_flushed_until(&self) {
        loop {
            let current = self.flushed_until.load(Ordering::Acquire);
            let cap = self.read_only.load(Ordering::Acquire);
            if current >= cap {
                return;
            }
            let page = current.page();
            if self.ring.state_of(page) != FrameState::Flushed {
                return;
            }
            let mut next = Address::new(page + 1, 0);
            if next > cap {
                next = cap;
            }
            if !self.flushed_until.advance_to(next) {
                // Lost the race; re-evaluate from the new value.
                continue;
            }
        }
    }

    /// Close and submit every full page below the read-only boundary that
    /// has not been handed to the flush worker yet.
    fn submit_closed_pages(&self) {
        let ro_page = self.read_only.load(Ordering::Acquire).page();
        loop {
            let page = self.flush_scan_from.load(Ordering::Acquire);
            if page >= ro_page {
                return;
            }
            if self
                .flush_scan_from
                .compare_exchange(page, page + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // This thread owns submitting `page`. Frames restored by
            // recovery are already Flushed; skip them.
            if self
                .ring
                .try_transition(page, FrameState::Open, FrameState::FlushSubmitted)
            {
                if let Some(bytes) = self.ring.copy_page(page) {
                    self.pending_flushes.fetch_add(1, Ordering::AcqRel);
                    if let Some(tx) = self.flush_tx.get() {
                        if tx.send(FlushMsg::Page { page, bytes }).is_err() {
                            self.pending_flushes.fetch_sub(1, Ordering::AcqRel);
                            self.fault();
                        }
                    }
                } else {
                    self.ring
                        .try_transition(page, FrameState::FlushSubmitted, FrameState::Open);
                }
            } else {
                self.advance_flushed_until();
            }
        }
    }

    /// Raise the read-only boundary to `target` (page-granular). The pages
    /// crossed are submitted for flush only after every thread has observed
    /// an epoch past the shift, so no in-flight record write can be torn by
    /// the page copy.
    fn shift_read_only(self: &Arc<Self>, target: Address) {
        debug_assert_eq!(target.offset(), 0);
        if self.read_only.advance_to(target) {
            let inner = Arc::clone(self);
            self.epoch.bump_with_action(move || inner.submit_closed_pages());
        }
    }

    /// Advance the head through the flushed prefix toward `target`,
    /// deferring frame recycling until no reader can hold the pages.
    fn shift_head(self: &Arc<Self>, target: Address) -> Address {
        let mut capped = target;
        let flushed = self.flushed_until.load(Ordering::Acquire);
        if capped > flushed {
            capped = flushed;
        }
        let old = self.head.load(Ordering::Acquire);
        if capped <= old || !self.head.advance_to(capped) {
            return self.head.load(Ordering::Acquire);
        }

        let inner = Arc::clone(self);
        let from_page = old.page();
        let to_page = capped.page();
        self.epoch.bump_with_action(move || {
            for page in from_page..to_page {
                inner.ring.release(page);
            }
        });
        capped
    }
}

/// The hybrid log allocator over device `D`.
pub struct HybridLog<D: StorageDevice> {
    inner: Arc<LogInner<D>>,
    worker: FlushWorker,
}

impl<D: StorageDevice> HybridLog<D> {
    /// Create a log with the given layout, device, and epoch manager.
    pub fn new(
        layout: LogLayout,
        device: Arc<D>,
        epoch: Arc<EpochManager>,
    ) -> Result<Self, Status> {
        let ring =
            PageRing::new(layout.frame_count, layout.page_size).ok_or(Status::OutOfMemory)?;
        let inner = Arc::new(LogInner {
            layout,
            device,
            ring,
            epoch,
            tail: AtomicTailOffset::new(Address::new(0, 0)),
            read_only: AtomicAddress::new(Address::new(0, 0)),
            head: AtomicAddress::new(Address::new(0, 0)),
            begin: AtomicAddress::new(Address::new(0, 0)),
            flushed_until: AtomicAddress::new(Address::new(0, 0)),
            flush_scan_from: AtomicU32::new(0),
            pending_flushes: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            flush_tx: OnceLock::new(),
        });
        let (worker, tx) = FlushWorker::spawn(Arc::clone(&inner));
        inner.flush_tx.set(tx).ok().expect("flush channel set once");

        let log = Self { inner, worker };
        // The first tail page must be resident before any reservation.
        assert_eq!(log.inner.ring.try_open(0), OpenOutcome::Opened);
        Ok(log)
    }

    /// Bytes per page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.inner.layout.page_size
    }

    /// In-memory frames.
    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.inner.ring.count()
    }

    /// Current tail address.
    #[inline]
    pub fn tail_address(&self) -> Address {
        let t = self.inner.tail.load(Ordering::Acquire);
        let offset = t.offset().min(self.inner.layout.page_size as u64) as u32;
        Address::new(t.page(), offset)
    }

    /// Current read-only boundary.
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.inner.read_only.load(Ordering::Acquire)
    }

    /// Current head boundary.
    #[inline]
    pub fn head_address(&self) -> Address {
        self.inner.head.load(Ordering::Acquire)
    }

    /// Current begin boundary.
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.inner.begin.load(Ordering::Acquire)
    }

    /// Address below which every page is on the device.
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.inner.flushed_until.load(Ordering::Acquire)
    }

    /// Whether a fatal device error has poisoned the log.
    #[inline]
    pub fn is_faulted(&self) -> bool {
        self.inner.is_faulted()
    }

    /// Whether `address` falls in the mutable region.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.read_only_address()
    }

    /// Reserve `size` bytes at the tail.
    ///
    /// Returns [`Status::NeedsRefresh`] when the ring has no recyclable
    /// frame for the next page; the caller must refresh its epoch (letting
    /// evictions run) and retry. Records never span pages: an overflowing
    /// reservation abandons the remainder of the page, which stays zeroed.
    pub fn allocate(&self, size: u32) -> Result<Address, Status> {
        debug_assert!(size as usize <= self.inner.layout.page_size);
        if self.inner.is_faulted() {
            return Err(Status::StoreFaulted);
        }
        loop {
            let slot = self.inner.tail.reserve(size);
            let page = slot.page();
            let end = slot.offset() + size as u64;
            if end <= self.inner.layout.page_size as u64 {
                return Ok(Address::new(page, slot.offset() as u32));
            }

            // Page overflow: the next page must be open before the tail may
            // move onto it, so no reservation lands in an unzeroed frame.
            let next = page + 1;
            match self.inner.ring.try_open(next) {
                OpenOutcome::Opened | OpenOutcome::AlreadyOpen => {
                    let (advanced, won) = self.inner.tail.try_new_page(page);
                    if advanced && won {
                        self.after_tail_page_turn(next);
                    }
                }
                OpenOutcome::Opening => {
                    std::hint::spin_loop();
                }
                OpenOutcome::Occupied => {
                    self.make_room_for(next);
                    return Err(Status::NeedsRefresh);
                }
            }
        }
    }

    /// Resolve an in-memory address to a pointer.
    ///
    /// `None` means the address lies below the head (or its frame was
    /// recycled while the caller raced a head shift): take the device read
    /// path.
    #[inline]
    pub fn try_get(&self, address: Address) -> Option<NonNull<u8>> {
        if address < self.head_address() {
            return None;
        }
        let ptr = self
            .inner
            .ring
            .page_ptr(address.page(), address.offset() as usize)?;
        NonNull::new(ptr)
    }

    /// Raise the read-only boundary to the start of `target`'s page and
    /// schedule flushes for the pages crossed.
    pub fn shift_read_only(&self, target: Address) {
        self.inner.shift_read_only(target.page_start());
    }

    /// Advance the head toward `target`; the result is capped by the
    /// flushed prefix. Frame recycling is epoch-deferred.
    pub fn shift_head(&self, target: Address) -> Address {
        self.inner.shift_head(target.page_start())
    }

    /// Truncate the log logically and release device space below `target`.
    pub fn shift_begin(&self, target: Address) -> io::Result<()> {
        if self.inner.begin.advance_to(target) {
            let device = Arc::clone(&self.inner.device);
            let offset = target.page_start().raw();
            block_on_io(async move { device.truncate_below(offset).await })?;
            info!(begin = %target, "log begin shifted");
        }
        Ok(())
    }

    /// Drive flushing and head movement so the frame for `page` can be
    /// recycled. Called on allocation backpressure.
    fn make_room_for(&self, page: u32) {
        let layout = &self.inner.layout;
        // The frame's previous occupant must drop below the head.
        let head_target_page = page.saturating_sub(layout.frame_count) + 1;
        let ro_policy_page = page.saturating_sub(layout.mutable_pages);
        let ro_target = Address::new(ro_policy_page.max(head_target_page), 0);
        self.inner.shift_read_only(ro_target);
        self.inner.shift_head(Address::new(head_target_page, 0));
    }

    /// Post-page-turn bookkeeping done by the thread that installed the
    /// new tail page: keep the read-only boundary trailing the tail.
    fn after_tail_page_turn(&self, new_page: u32) {
        let layout = &self.inner.layout;
        if new_page > layout.mutable_pages {
            self.inner
                .shift_read_only(Address::new(new_page - layout.mutable_pages, 0));
        }
    }

    /// Block until every full page strictly below `target` is on the
    /// device. The caller must have shifted the read-only boundary at least
    /// to `target`'s page start.
    pub fn wait_flushed_until(&self, target: Address) -> Result<(), Status> {
        let goal = target.page_start();
        while self.flushed_until_address() < goal {
            if self.inner.is_faulted() {
                return Err(Status::StoreFaulted);
            }
            // Deferred flush submissions may still be parked on the epoch.
            self.inner.epoch.drain_ready();
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Number of flushes submitted but not yet retired.
    pub fn pending_flushes(&self) -> u64 {
        self.inner.pending_flushes.load(Ordering::Acquire)
    }

    /// Copy the first `len` bytes of `page`, if resident.
    pub fn copy_page_prefix(&self, page: u32, len: usize) -> Option<Vec<u8>> {
        let mut bytes = self.inner.ring.copy_page(page)?;
        bytes.truncate(len);
        Some(bytes)
    }

    /// Synchronously write the resident prefix of `page` up to `len` bytes
    /// to the device. Checkpoint path for the partial tail page.
    pub fn persist_page_prefix(&self, page: u32, len: usize) -> io::Result<()> {
        let bytes = self.copy_page_prefix(page, len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("page {page} not resident"))
        })?;
        let device = Arc::clone(&self.inner.device);
        let offset = Address::new(page, 0).raw();
        block_on_io(async move { device.write(offset, &bytes).await })?;
        Ok(())
    }

    /// Read one record header word straight from the device. Cold path for
    /// chain walks that race an eviction: the page was flushed before the
    /// head crossed it, so the header is durable. Pages reach the device as
    /// raw memory copies, hence the native-endian decode.
    pub fn read_record_header(&self, address: Address) -> io::Result<u64> {
        let device = Arc::clone(&self.inner.device);
        let mut buf = [0u8; 8];
        block_on_io(async { device.read(address.raw(), &mut buf).await })?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Read a full page from the device into `buf`.
    pub fn read_page_from_device(&self, page: u32, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.inner.layout.page_size);
        let device = Arc::clone(&self.inner.device);
        let offset = Address::new(page, 0).raw();
        block_on_io(async { device.read(offset, buf).await })?;
        Ok(())
    }

    /// Reset every boundary for recovery and make the tail page resident.
    ///
    /// Pages in `[head, tail]` are reloaded from the device; the tail page
    /// frame is reopened for writing with its recovered prefix intact.
    pub fn restore(&self, begin: Address, head: Address, tail: Address) -> io::Result<()> {
        let page_size = self.inner.layout.page_size;

        self.inner.begin.store(begin, Ordering::Release);
        self.inner.head.store(head, Ordering::Release);
        self.inner.read_only.store(tail.page_start(), Ordering::Release);
        self.inner
            .flushed_until
            .store(tail.page_start(), Ordering::Release);
        self.inner
            .flush_scan_from
            .store(tail.page(), Ordering::Release);
        self.inner.tail.store_address(tail, Ordering::Release);

        // Drop the bootstrap page 0 frame if recovery moved past it.
        if tail.page() != 0 || head.page() != 0 {
            self.inner.ring.release(0);
        }

        let mut buf = vec![0u8; page_size];
        for page in head.page()..=tail.page() {
            self.read_page_from_device(page, &mut buf)?;
            self.inner.ring.release(page);
            if !self.inner.ring.install_page(page, &buf) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("frame for page {page} not recyclable during recovery"),
                ));
            }
        }
        // The tail page takes in-place writes again.
        self.inner
            .ring
            .try_transition(tail.page(), FrameState::Flushed, FrameState::Open);
        Ok(())
    }

    /// Replace a restored page's contents (snapshot-overlay recovery). A
    /// page that was open for writes stays open.
    pub fn reinstall_page(&self, page: u32, bytes: &[u8]) -> io::Result<()> {
        let was_open = self.inner.ring.state_of(page) == FrameState::Open;
        self.inner.ring.release(page);
        if !self.inner.ring.install_page(page, bytes) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("frame for page {page} not reinstallable"),
            ));
        }
        if was_open {
            self.inner
                .ring
                .try_transition(page, FrameState::Flushed, FrameState::Open);
        }
        Ok(())
    }

    /// Stop the flush worker, draining queued pages first.
    pub fn shutdown(&self) {
        while self.pending_flushes() > 0 && !self.inner.is_faulted() {
            self.inner.epoch.drain_ready();
            std::thread::yield_now();
        }
        self.worker.stop();
    }
}

impl<D: StorageDevice> Drop for HybridLog<D> {
    fn drop(&mut self) {
        self.worker.stop();
    }
}
