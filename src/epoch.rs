//! Epoch-based protection and deferred reclamation.
//!
//! Every thread that touches the store holds a slot in a fixed table and
//! periodically republishes the global epoch into it. The minimum over all
//! active slots bounds what any thread can still observe, so memory (page
//! frames) and boundary shifts are reclaimed by actions deferred until that
//! minimum has moved past the epoch at which the resource was retired.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};
use crate::status::Status;

/// Epoch value meaning "slot not active".
pub const UNPROTECTED: u64 = 0;

const DRAIN_LIST_SIZE: usize = 256;

// ---- thread slot allocation -------------------------------------------------

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);
static FREE_SLOTS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();
static SLOT_GENERATIONS: OnceLock<Vec<AtomicU64>> = OnceLock::new();

fn free_slots() -> &'static Mutex<Vec<usize>> {
    FREE_SLOTS.get_or_init(|| Mutex::new(Vec::new()))
}

fn slot_generations() -> &'static [AtomicU64] {
    SLOT_GENERATIONS
        .get_or_init(|| (0..MAX_THREADS).map(|_| AtomicU64::new(0)).collect())
        .as_slice()
}

struct SlotGuard {
    slot: usize,
    generation: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(gens) = SLOT_GENERATIONS.get() {
            gens[self.slot].fetch_add(1, Ordering::AcqRel);
        }
        free_slots().lock().push(self.slot);
    }
}

thread_local! {
    static THREAD_SLOT: RefCell<Option<SlotGuard>> = const { RefCell::new(None) };
}

/// The calling thread's epoch slot, allocated on first use and recycled
/// when the thread exits.
pub fn thread_slot() -> Result<usize, Status> {
    try_thread_slot().ok_or(Status::TooManyThreads)
}

fn try_thread_slot() -> Option<usize> {
    THREAD_SLOT.with(|cell| {
        let mut cell = cell.borrow_mut();
        if let Some(guard) = cell.as_ref() {
            return Some(guard.slot);
        }
        let guard = allocate_slot()?;
        let slot = guard.slot;
        *cell = Some(guard);
        Some(slot)
    })
}

/// Generation tag of the calling thread's slot. Changes when a slot is
/// recycled to a new thread, so stale I/O completions can be discarded.
pub fn thread_slot_generation() -> u64 {
    THREAD_SLOT.with(|cell| cell.borrow().as_ref().map_or(0, |g| g.generation))
}

fn allocate_slot() -> Option<SlotGuard> {
    let guard = |slot: usize| SlotGuard {
        slot,
        generation: slot_generations()[slot].load(Ordering::Acquire),
    };
    if let Some(slot) = free_slots().lock().pop() {
        return Some(guard(slot));
    }
    match NEXT_SLOT.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
        (n < MAX_THREADS).then_some(n + 1)
    }) {
        Ok(slot) => Some(guard(slot)),
        // Exhausted; a slot may have been returned since the first check.
        Err(_) => free_slots().lock().pop().map(guard),
    }
}

// ---- epoch table ------------------------------------------------------------

#[repr(C, align(64))]
struct SlotEntry {
    local_epoch: AtomicU64,
    phase_done: AtomicU32,
    _pad: [u8; CACHE_LINE_BYTES - 12],
}

impl SlotEntry {
    const fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(UNPROTECTED),
            phase_done: AtomicU32::new(0),
            _pad: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

type Action = Box<dyn FnOnce() + Send + 'static>;

/// One deferred action, guarded by a trigger-epoch word that doubles as a
/// free/locked marker.
struct DeferredAction {
    trigger: AtomicU64,
    action: UnsafeCell<Option<Action>>,
}

impl DeferredAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            trigger: AtomicU64::new(Self::FREE),
            action: UnsafeCell::new(None),
        }
    }

    /// Run the action if its trigger epoch matches and is safe.
    fn try_run(&self, expected: u64) -> bool {
        if self
            .trigger
            .compare_exchange(expected, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let action = unsafe { (*self.action.get()).take() };
        self.trigger.store(Self::FREE, Ordering::Release);
        if let Some(a) = action {
            a();
        }
        true
    }

    /// Install `action` into a free slot with the given trigger epoch.
    fn try_install(&self, trigger: u64, action: Action) -> Result<(), Action> {
        if self
            .trigger
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(action);
        }
        unsafe { *self.action.get() = Some(action) };
        self.trigger.store(trigger, Ordering::Release);
        Ok(())
    }

    /// Replace a ready action with a new one, running the old action.
    fn try_replace(&self, expected: u64, trigger: u64, action: Action) -> Result<(), Action> {
        if self
            .trigger
            .compare_exchange(expected, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(action);
        }
        let old = unsafe { (*self.action.get()).replace(action) };
        self.trigger.store(trigger, Ordering::Release);
        if let Some(a) = old {
            a();
        }
        Ok(())
    }
}

unsafe impl Send for DeferredAction {}
unsafe impl Sync for DeferredAction {}

/// The store-scoped epoch manager.
///
/// Each store owns one; several stores in a process coexist because the
/// thread-slot table only names slots, and every manager keeps its own
/// per-slot epochs.
pub struct EpochManager {
    table: Box<[SlotEntry]>,
    drain_list: Box<[DeferredAction]>,
    drain_count: AtomicU32,
    /// The global epoch.
    pub current: AtomicU64,
    /// Cached min-over-active-slots minus one.
    pub safe: AtomicU64,
}

impl EpochManager {
    /// Create a manager with the global epoch at 1.
    pub fn new() -> Self {
        Self {
            table: (0..MAX_THREADS).map(|_| SlotEntry::new()).collect(),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| DeferredAction::new()).collect(),
            drain_count: AtomicU32::new(0),
            current: AtomicU64::new(1),
            safe: AtomicU64::new(0),
        }
    }

    /// Publish the global epoch into `slot`, making the thread a tracked
    /// reader. Returns the published epoch.
    #[inline]
    pub fn protect(&self, slot: usize) -> u64 {
        debug_assert!(slot < MAX_THREADS);
        let epoch = self.current.load(Ordering::Acquire);
        self.table[slot].local_epoch.store(epoch, Ordering::Release);
        epoch
    }

    /// [`protect`](Self::protect), then run any deferred actions that have
    /// become safe. This is the session refresh path.
    #[inline]
    pub fn protect_and_drain(&self, slot: usize) -> u64 {
        let epoch = self.protect(slot);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Mark `slot` inactive so it no longer holds back the safe epoch.
    #[inline]
    pub fn unprotect(&self, slot: usize) {
        debug_assert!(slot < MAX_THREADS);
        self.table[slot]
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Whether `slot` currently publishes an epoch.
    #[inline]
    pub fn is_protected(&self, slot: usize) -> bool {
        self.table[slot].local_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    /// Increment the global epoch, returning the new value.
    pub fn bump(&self) -> u64 {
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next);
        }
        next
    }

    /// Increment the global epoch and defer `action` until every slot has
    /// observed an epoch past the pre-bump value.
    pub fn bump_with_action<F>(&self, action: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_SWEEPS: usize = 500;

        let trigger = self.bump() - 1;
        let mut pending: Action = Box::new(action);
        let mut idx = 0usize;
        let mut sweeps = 0usize;
        loop {
            let slot = &self.drain_list[idx];
            let observed = slot.trigger.load(Ordering::Acquire);

            if observed == DeferredAction::FREE {
                match slot.try_install(trigger, pending) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return trigger + 1;
                    }
                    Err(returned) => pending = returned,
                }
            } else if observed != DeferredAction::LOCKED
                && observed <= self.safe.load(Ordering::Acquire)
            {
                match slot.try_replace(observed, trigger, pending) {
                    Ok(()) => return trigger + 1,
                    Err(returned) => pending = returned,
                }
            }

            idx = (idx + 1) % DRAIN_LIST_SIZE;
            if idx == 0 {
                sweeps += 1;
                if sweeps >= MAX_SWEEPS {
                    tracing::warn!("epoch drain list saturated; running action inline");
                    pending();
                    return trigger + 1;
                }
            }
        }
    }

    /// Recompute the safe epoch and run any ready deferred actions, without
    /// touching any slot. For wait loops outside a protected region.
    pub fn drain_ready(&self) {
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.current.load(Ordering::Acquire));
        }
    }

    /// Recompute the safe epoch and run every deferred action whose trigger
    /// it has reached.
    fn drain(&self, current: u64) {
        self.recompute_safe(current);
        let safe = self.safe.load(Ordering::Acquire);
        for slot in self.drain_list.iter() {
            let trigger = slot.trigger.load(Ordering::Acquire);
            if trigger == DeferredAction::FREE
                || trigger == DeferredAction::LOCKED
                || trigger > safe
            {
                continue;
            }
            if slot.try_run(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Recompute the safe epoch as (min over active slots) - 1, capped by
    /// `current`.
    pub fn recompute_safe(&self, current: u64) -> u64 {
        let mut oldest = current;
        for entry in self.table.iter() {
            let e = entry.local_epoch.load(Ordering::Acquire);
            if e != UNPROTECTED && e < oldest {
                oldest = e;
            }
        }
        let safe = oldest.saturating_sub(1);
        self.safe.store(safe, Ordering::Release);
        safe
    }

    /// Whether `epoch` is at or below the cached safe epoch.
    #[inline]
    pub fn is_safe(&self, epoch: u64) -> bool {
        epoch <= self.safe.load(Ordering::Acquire)
    }

    /// Block (yielding) until `target` becomes safe. Used by shutdown and
    /// checkpoint paths, never by the hot path.
    pub fn wait_until_safe(&self, target: u64) {
        loop {
            let current = self.current.load(Ordering::Acquire);
            self.recompute_safe(current);
            if self.is_safe(target) {
                if self.drain_count.load(Ordering::Acquire) > 0 {
                    self.drain(current);
                }
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Clear every slot's phase marker before a new checkpoint phase.
    pub fn reset_phase_markers(&self) {
        for entry in self.table.iter() {
            entry.phase_done.store(0, Ordering::Release);
        }
    }

    /// Record that `slot` has acknowledged `phase`; returns true once every
    /// active slot has.
    pub fn mark_phase_done(&self, slot: usize, phase: u32) -> bool {
        debug_assert!(slot < MAX_THREADS);
        self.table[slot].phase_done.store(phase, Ordering::Release);
        for (i, entry) in self.table.iter().enumerate() {
            if i == slot {
                continue;
            }
            let active = entry.local_epoch.load(Ordering::Acquire) != UNPROTECTED;
            if active && entry.phase_done.load(Ordering::Acquire) != phase {
                return false;
            }
        }
        true
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn protect_publishes_epoch() {
        let mgr = EpochManager::new();
        assert!(!mgr.is_protected(0));
        assert_eq!(mgr.protect(0), 1);
        assert!(mgr.is_protected(0));
        mgr.unprotect(0);
        assert!(!mgr.is_protected(0));
    }

    #[test]
    fn bump_increments() {
        let mgr = EpochManager::new();
        assert_eq!(mgr.bump(), 2);
        assert_eq!(mgr.current.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn safe_epoch_lags_active_readers() {
        let mgr = EpochManager::new();
        mgr.current.store(5, Ordering::Relaxed);
        mgr.protect(0);
        mgr.recompute_safe(10);
        assert!(mgr.is_safe(4));
        assert!(!mgr.is_safe(5));
        mgr.unprotect(0);
        mgr.recompute_safe(10);
        assert!(mgr.is_safe(9));
    }

    #[test]
    fn deferred_action_runs_when_safe() {
        let mgr = Arc::new(EpochManager::new());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        mgr.bump_with_action(move || flag.store(true, Ordering::Release));
        assert!(!fired.load(Ordering::Acquire));
        // No slot is protected, so the next refresh drains it.
        mgr.protect_and_drain(0);
        assert!(fired.load(Ordering::Acquire));
        mgr.unprotect(0);
    }

    #[test]
    fn deferred_action_blocked_by_old_reader() {
        let mgr = Arc::new(EpochManager::new());
        mgr.protect(1); // old reader at epoch 1
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        mgr.bump_with_action(move || flag.store(true, Ordering::Release));
        mgr.protect_and_drain(0);
        assert!(!fired.load(Ordering::Acquire));
        // The old reader catches up; now the action may run.
        mgr.protect_and_drain(1);
        mgr.protect_and_drain(0);
        assert!(fired.load(Ordering::Acquire));
        mgr.unprotect(0);
        mgr.unprotect(1);
    }

    #[test]
    fn phase_markers() {
        let mgr = EpochManager::new();
        mgr.protect(0);
        mgr.protect(1);
        mgr.reset_phase_markers();
        assert!(!mgr.mark_phase_done(0, 1));
        assert!(mgr.mark_phase_done(1, 1));
        mgr.unprotect(0);
        mgr.unprotect(1);
    }

    #[test]
    fn slots_recycle_across_threads() {
        for _ in 0..(MAX_THREADS * 2) {
            std::thread::spawn(|| {
                let slot = thread_slot().unwrap();
                assert!(slot < MAX_THREADS);
            })
            .join()
            .unwrap();
        }
    }
}
