//! The ring of in-memory page frames.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::utility::AlignedBytes;

/// Lifecycle of a frame with respect to the page it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// No page resident; the frame may be claimed.
    Free = 0,
    /// A claimant is zeroing the frame; not yet readable.
    Opening = 1,
    /// The resident page is writable (tail page) or readable.
    Open = 2,
    /// The page was handed to the flush worker.
    FlushSubmitted = 3,
    /// The page's bytes are on the device; eviction may release the frame.
    Flushed = 4,
}

impl FrameState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => FrameState::Free,
            1 => FrameState::Opening,
            2 => FrameState::Open,
            3 => FrameState::FlushSubmitted,
            _ => FrameState::Flushed,
        }
    }
}

/// Packed frame status: owning page number in the high bits, state in the
/// low byte, updated in one CAS so owner and state can never disagree.
struct Frame {
    bytes: AlignedBytes,
    control: AtomicU64,
}

impl Frame {
    const STATE_MASK: u64 = 0xff;
    const PAGE_SHIFT: u32 = 8;

    fn pack(page: u32, state: FrameState) -> u64 {
        ((page as u64) << Self::PAGE_SHIFT) | state as u64
    }

    fn load(&self) -> (u32, FrameState) {
        let word = self.control.load(Ordering::Acquire);
        (
            (word >> Self::PAGE_SHIFT) as u32,
            FrameState::from_bits((word & Self::STATE_MASK) as u8),
        )
    }
}

/// A circular buffer of `count` pre-allocated page frames; page `p` maps to
/// frame `p & (count - 1)`.
pub struct PageRing {
    frames: Box<[Frame]>,
    page_size: usize,
}

impl PageRing {
    /// Allocate `count` frames (power of two) of `page_size` bytes each.
    pub fn new(count: u32, page_size: usize) -> Option<Self> {
        debug_assert!(crate::utility::is_power_of_two(count as u64));
        debug_assert!(crate::utility::is_power_of_two(page_size as u64));
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(Frame {
                bytes: AlignedBytes::zeroed(page_size, page_size)?,
                control: AtomicU64::new(Frame::pack(0, FrameState::Free)),
            });
        }
        Some(Self {
            frames: frames.into_boxed_slice(),
            page_size,
        })
    }

    /// Number of frames.
    #[inline]
    pub fn count(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Bytes per page.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    fn frame_for(&self, page: u32) -> &Frame {
        &self.frames[(page as usize) & (self.frames.len() - 1)]
    }

    /// State of the frame slot for `page`, from the page's point of view:
    /// `Free` when the frame holds a different page.
    pub fn state_of(&self, page: u32) -> FrameState {
        let (owner, state) = self.frame_for(page).load();
        if state == FrameState::Free || owner == page {
            state
        } else {
            FrameState::Free
        }
    }

    /// Outcome of [`try_open`](Self::try_open).
    pub fn try_open(&self, page: u32) -> OpenOutcome {
        let frame = self.frame_for(page);
        let (owner, state) = frame.load();
        if state != FrameState::Free {
            if owner == page {
                return match state {
                    FrameState::Opening => OpenOutcome::Opening,
                    _ => OpenOutcome::AlreadyOpen,
                };
            }
            return OpenOutcome::Occupied;
        }
        let free_word = frame.control.load(Ordering::Acquire);
        if FrameState::from_bits((free_word & Frame::STATE_MASK) as u8) != FrameState::Free {
            return OpenOutcome::Occupied;
        }
        if frame
            .control
            .compare_exchange(
                free_word,
                Frame::pack(page, FrameState::Opening),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return OpenOutcome::Occupied;
        }
        // Sole claimant: publish Open only after the bytes are clean so a
        // reservation on this page never observes stale contents.
        unsafe { frame.bytes.clear() };
        frame
            .control
            .store(Frame::pack(page, FrameState::Open), Ordering::Release);
        OpenOutcome::Opened
    }

    /// Transition `page`'s frame from `from` to `to`. Returns false if the
    /// frame is not in `from` for that page.
    pub fn try_transition(&self, page: u32, from: FrameState, to: FrameState) -> bool {
        let frame = self.frame_for(page);
        frame
            .control
            .compare_exchange(
                Frame::pack(page, from),
                Frame::pack(page, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Release `page`'s frame back to `Free`. Only valid once no reader can
    /// hold a pointer into it (epoch-deferred).
    pub fn release(&self, page: u32) {
        let frame = self.frame_for(page);
        let (owner, state) = frame.load();
        if owner != page || state == FrameState::Free {
            return;
        }
        frame
            .control
            .store(Frame::pack(0, FrameState::Free), Ordering::Release);
    }

    /// Pointer to byte `offset` of `page`, if the page is resident.
    pub fn page_ptr(&self, page: u32, offset: usize) -> Option<*mut u8> {
        debug_assert!(offset < self.page_size);
        let frame = self.frame_for(page);
        let (owner, state) = frame.load();
        if owner == page && matches!(state, FrameState::Open | FrameState::FlushSubmitted | FrameState::Flushed)
        {
            Some(unsafe { frame.bytes.as_ptr().add(offset) })
        } else {
            None
        }
    }

    /// Copy `page`'s bytes out (for flush submission or snapshots).
    ///
    /// The copy races in-place updates in the mutable region by design;
    /// callers only invoke it on pages already closed for writes.
    pub fn copy_page(&self, page: u32) -> Option<Vec<u8>> {
        let frame = self.frame_for(page);
        let (owner, state) = frame.load();
        if owner != page || state == FrameState::Free || state == FrameState::Opening {
            return None;
        }
        let mut out = vec![0u8; self.page_size];
        unsafe {
            std::ptr::copy_nonoverlapping(frame.bytes.as_ptr(), out.as_mut_ptr(), self.page_size);
        }
        Some(out)
    }

    /// Install `bytes` as the contents of `page` (recovery reload). The
    /// frame ends in the `Flushed` state: resident and already on device.
    pub fn install_page(&self, page: u32, bytes: &[u8]) -> bool {
        debug_assert!(bytes.len() <= self.page_size);
        let frame = self.frame_for(page);
        let (_, state) = frame.load();
        if state != FrameState::Free {
            return false;
        }
        frame.control.store(
            Frame::pack(page, FrameState::Opening),
            Ordering::Release,
        );
        unsafe {
            frame.bytes.clear();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), frame.bytes.as_ptr(), bytes.len());
        }
        frame
            .control
            .store(Frame::pack(page, FrameState::Flushed), Ordering::Release);
        true
    }
}

/// Result of attempting to claim a frame for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// This call claimed and zeroed the frame.
    Opened,
    /// The page was already open.
    AlreadyOpen,
    /// Another thread is zeroing the frame for this page.
    Opening,
    /// The frame still holds an earlier page.
    Occupied,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_write_then_read() {
        let ring = PageRing::new(4, 4096).unwrap();
        assert_eq!(ring.try_open(0), OpenOutcome::Opened);
        assert_eq!(ring.try_open(0), OpenOutcome::AlreadyOpen);
        assert_eq!(ring.state_of(0), FrameState::Open);

        let ptr = ring.page_ptr(0, 128).unwrap();
        unsafe { *ptr = 0xab };
        let copied = ring.copy_page(0).unwrap();
        assert_eq!(copied[128], 0xab);
    }

    #[test]
    fn frame_reuse_blocked_until_release() {
        let ring = PageRing::new(4, 4096).unwrap();
        assert_eq!(ring.try_open(0), OpenOutcome::Opened);
        // Page 4 shares frame 0.
        assert_eq!(ring.try_open(4), OpenOutcome::Occupied);

        assert!(ring.try_transition(0, FrameState::Open, FrameState::FlushSubmitted));
        assert!(ring.try_transition(0, FrameState::FlushSubmitted, FrameState::Flushed));
        ring.release(0);
        assert_eq!(ring.state_of(0), FrameState::Free);
        assert_eq!(ring.try_open(4), OpenOutcome::Opened);
        // The recycled frame was zeroed.
        let ptr = ring.page_ptr(4, 128).unwrap();
        assert_eq!(unsafe { *ptr }, 0);
    }

    #[test]
    fn state_of_other_owner_is_free() {
        let ring = PageRing::new(4, 4096).unwrap();
        ring.try_open(1);
        assert_eq!(ring.state_of(5), FrameState::Free);
        assert!(ring.page_ptr(5, 0).is_none());
    }

    #[test]
    fn install_page_for_recovery() {
        let ring = PageRing::new(4, 4096).unwrap();
        let bytes = vec![7u8; 4096];
        assert!(ring.install_page(2, &bytes));
        assert_eq!(ring.state_of(2), FrameState::Flushed);
        let ptr = ring.page_ptr(2, 100).unwrap();
        assert_eq!(unsafe { *ptr }, 7);
    }
}
