//! Sessions: per-thread handles with a pending-operation queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::address::Address;
use crate::constants::REFRESH_INTERVAL_OPS;
use crate::device::StorageDevice;
use crate::epoch;
use crate::record::{Key, Record, Value};
use crate::status::Status;
use crate::store::contexts::{
    ClosureRmwContext, ReadContext, RmwContext, UpsertContext,
};
use crate::store::core::{KvStore, ReadOutcome, RmwResume};
use crate::store::pending::ReadCompletion;

/// A finished asynchronous operation, tagged with the serial its issue
/// returned so the caller can rejoin it.
#[derive(Debug)]
pub enum CompletedOp<K, V> {
    /// A read that had gone to the device.
    Read {
        /// Issue-time serial.
        serial: u64,
        /// The key read.
        key: K,
        /// Final status: `Ok`, `NotFound`, or an error.
        status: Status,
        /// The value, when found.
        value: Option<V>,
    },
    /// A read-modify-write that had gone to the device.
    Rmw {
        /// Issue-time serial.
        serial: u64,
        /// The key modified.
        key: K,
        /// Final status.
        status: Status,
    },
}

type BoxedUpdater<V> = Box<dyn FnMut(&mut V) -> bool + Send>;

enum PendingWork<V> {
    Read,
    Rmw {
        initial: V,
        update: BoxedUpdater<V>,
    },
}

struct PendingOp<K, V> {
    serial: u64,
    key: K,
    /// First on-device address the in-memory walk reached. The chain at
    /// and below the anchor is immutable.
    anchor: Address,
    /// Address of the record read currently in flight.
    awaiting: Address,
    work: PendingWork<V>,
}

/// A per-thread handle onto a [`KvStore`].
///
/// Sessions are not `Sync`; each thread opens its own. The session owns an
/// epoch slot, refreshes it on a cadence, and carries the FIFO of
/// operations suspended on device I/O.
pub struct Session<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    store: Arc<KvStore<K, V, D>>,
    id: u32,
    slot: usize,
    generation: u64,
    serial: Arc<AtomicU64>,
    pending: VecDeque<PendingOp<K, V>>,
    ops_since_refresh: u64,
    /// `wait` argument of the most recent `complete_pending` call.
    last_complete_wait: Option<bool>,
    disposed: bool,
}

impl<K, V, D> Session<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    pub(crate) fn new(
        store: Arc<KvStore<K, V, D>>,
        id: u32,
        slot: usize,
        serial: Arc<AtomicU64>,
    ) -> Self {
        store.epoch().protect(slot);
        let generation = epoch::thread_slot_generation();
        Self {
            store,
            id,
            slot,
            generation,
            serial,
            pending: VecDeque::new(),
            ops_since_refresh: 0,
            last_complete_wait: None,
            disposed: false,
        }
    }

    /// This session's id (stable across checkpoints).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Serial of the most recently issued operation.
    pub fn last_issued_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Operations currently suspended on device I/O.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Republish this thread's epoch, run ready reclamation, and
    /// acknowledge any checkpoint phase in progress. Issued automatically
    /// every [`REFRESH_INTERVAL_OPS`] operations.
    pub fn refresh(&mut self) {
        let epoch = self.store.epoch();
        epoch.protect_and_drain(self.slot);
        let state = self.store.system_state();
        if state.phase != crate::checkpoint::Phase::Rest {
            epoch.mark_phase_done(self.slot, state.phase as u32);
        }
        self.ops_since_refresh = 0;
    }

    #[inline]
    fn before_op(&mut self) -> u64 {
        self.ops_since_refresh += 1;
        if self.ops_since_refresh >= REFRESH_INTERVAL_OPS {
            self.refresh();
        }
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Read `key`. `Err(Status::Pending)` means the operation was queued;
    /// its result arrives from [`complete_pending`](Self::complete_pending)
    /// under the serial returned by
    /// [`last_issued_serial`](Self::last_issued_serial).
    pub fn read(&mut self, key: &K) -> Result<Option<V>, Status> {
        let serial = self.before_op();
        match self.store.internal_read(self.slot, key)? {
            ReadOutcome::Found(value) => Ok(Some(value)),
            ReadOutcome::NotFound => Ok(None),
            ReadOutcome::OnDevice(address) => {
                self.enqueue(serial, *key, address, PendingWork::Read)?;
                Err(Status::Pending)
            }
        }
    }

    /// Read through a caller-supplied context.
    pub fn read_with<C: ReadContext<K, V>>(&mut self, ctx: &mut C) -> Status {
        let key = *ctx.key();
        match self.read(&key) {
            Ok(Some(value)) => {
                ctx.visit(&value);
                Status::Ok
            }
            Ok(None) => Status::NotFound,
            Err(status) => status,
        }
    }

    /// Insert or overwrite `key`.
    pub fn upsert(&mut self, key: K, value: V) -> Status {
        self.before_op();
        self.store.internal_upsert(self.slot, key, value)
    }

    /// Upsert through a caller-supplied context.
    pub fn upsert_with<C: UpsertContext<K, V>>(&mut self, ctx: &C) -> Status {
        self.before_op();
        self.store
            .internal_upsert(self.slot, *ctx.key(), *ctx.value())
    }

    /// Append a tombstone for `key`.
    pub fn delete(&mut self, key: &K) -> Status {
        self.before_op();
        self.store.internal_delete(self.slot, key)
    }

    /// Read-modify-write: apply `update` to the live value, installing
    /// `initial` when the key is absent. `update` returning false refuses
    /// the in-place path and forces a copy-update at the tail.
    pub fn rmw<F>(&mut self, key: K, initial: V, update: F) -> Status
    where
        F: FnMut(&mut V) -> bool + Send + 'static,
    {
        let serial = self.before_op();
        let mut ctx = ClosureRmwContext {
            key,
            initial,
            update,
        };
        match self.store.internal_rmw(self.slot, &mut ctx) {
            Ok(status) => status,
            Err(address) => {
                let work = PendingWork::Rmw {
                    initial: ctx.initial,
                    update: Box::new(ctx.update),
                };
                match self.enqueue(serial, key, address, work) {
                    Ok(()) => Status::Pending,
                    Err(status) => status,
                }
            }
        }
    }

    /// RMW through a caller-supplied context. The context is consumed so
    /// the operation can suspend on device I/O.
    pub fn rmw_with<C>(&mut self, mut ctx: C) -> Status
    where
        C: RmwContext<K, V> + 'static,
    {
        let serial = self.before_op();
        match self.store.internal_rmw(self.slot, &mut ctx) {
            Ok(status) => status,
            Err(address) => {
                let key = *ctx.key();
                let initial = ctx.initial();
                let mut boxed = ctx;
                let update: BoxedUpdater<V> =
                    Box::new(move |value| boxed.update_in_place(value));
                match self.enqueue(serial, key, address, PendingWork::Rmw { initial, update }) {
                    Ok(()) => Status::Pending,
                    Err(status) => status,
                }
            }
        }
    }

    fn enqueue(
        &mut self,
        serial: u64,
        key: K,
        address: Address,
        work: PendingWork<V>,
    ) -> Result<(), Status> {
        if !self
            .store
            .submit_record_read(self.slot, self.generation, serial, address)
        {
            return Err(Status::StoreFaulted);
        }
        self.pending.push_back(PendingOp {
            serial,
            key,
            anchor: address,
            awaiting: address,
            work,
        });
        Ok(())
    }

    /// Drain I/O completions and finish their suspended operations.
    ///
    /// With `wait` set, blocks (refreshing the epoch so the store keeps
    /// making progress) until the pending queue is empty.
    pub fn complete_pending(&mut self, wait: bool) -> Vec<CompletedOp<K, V>> {
        self.last_complete_wait = Some(wait);
        let mut out = Vec::new();
        loop {
            for completion in self.store.drain_completions(self.slot, self.generation) {
                self.handle_completion(completion, &mut out);
            }
            if self.pending.is_empty() || !wait {
                break;
            }
            if self.store.is_faulted() {
                while let Some(op) = self.pending.pop_front() {
                    out.push(match op.work {
                        PendingWork::Read => CompletedOp::Read {
                            serial: op.serial,
                            key: op.key,
                            status: Status::StoreFaulted,
                            value: None,
                        },
                        PendingWork::Rmw { .. } => CompletedOp::Rmw {
                            serial: op.serial,
                            key: op.key,
                            status: Status::StoreFaulted,
                        },
                    });
                }
                break;
            }
            self.refresh();
            std::thread::yield_now();
        }
        out
    }

    fn handle_completion(
        &mut self,
        completion: ReadCompletion,
        out: &mut Vec<CompletedOp<K, V>>,
    ) {
        let Some(idx) = self
            .pending
            .iter()
            .position(|op| op.serial == completion.serial && op.awaiting == completion.address)
        else {
            // A stale or duplicate completion; nothing waits on it.
            return;
        };
        let Some(mut op) = self.pending.remove(idx) else {
            return;
        };

        let bytes = match completion.result {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(serial = op.serial, "pending record read failed: {e}");
                out.push(match op.work {
                    PendingWork::Read => CompletedOp::Read {
                        serial: op.serial,
                        key: op.key,
                        status: Status::IoError,
                        value: None,
                    },
                    PendingWork::Rmw { .. } => CompletedOp::Rmw {
                        serial: op.serial,
                        key: op.key,
                        status: Status::IoError,
                    },
                });
                return;
            }
        };

        // Walk the on-device chain one hop at a time.
        let resolved: Option<V> = match Record::<K, V>::read_from_bytes(&bytes) {
            Some((header, record_key, record_value)) => {
                if !header.is_invalid() && record_key == op.key {
                    if header.is_tombstone() {
                        None
                    } else {
                        Some(record_value)
                    }
                } else {
                    let previous = header.previous_address();
                    let begin = self.store.hlog().begin_address();
                    if previous.is_valid() && previous >= begin {
                        // Another hop below the head.
                        op.awaiting = previous;
                        if self
                            .store
                            .submit_record_read(self.slot, self.generation, op.serial, previous)
                        {
                            self.pending.push_back(op);
                        } else {
                            out.push(match op.work {
                                PendingWork::Read => CompletedOp::Read {
                                    serial: op.serial,
                                    key: op.key,
                                    status: Status::StoreFaulted,
                                    value: None,
                                },
                                PendingWork::Rmw { .. } => CompletedOp::Rmw {
                                    serial: op.serial,
                                    key: op.key,
                                    status: Status::StoreFaulted,
                                },
                            });
                        }
                        return;
                    }
                    None
                }
            }
            None => None,
        };

        match op.work {
            PendingWork::Read => {
                let status = if resolved.is_some() {
                    Status::Ok
                } else {
                    Status::NotFound
                };
                if let Some(value) = resolved {
                    // Optionally migrate the cold hit back to the tail so
                    // the next read stays in memory.
                    if self.store.config().copy_reads_to_tail {
                        self.store.internal_upsert(self.slot, op.key, value);
                    }
                }
                out.push(CompletedOp::Read {
                    serial: op.serial,
                    key: op.key,
                    status,
                    value: resolved,
                });
            }
            PendingWork::Rmw { initial, update } => {
                let mut ctx = ClosureRmwContext {
                    key: op.key,
                    initial,
                    update,
                };
                match self
                    .store
                    .resume_rmw(self.slot, &mut ctx, op.anchor, resolved)
                {
                    RmwResume::Done(status) => out.push(CompletedOp::Rmw {
                        serial: op.serial,
                        key: op.key,
                        status,
                    }),
                    RmwResume::Reanchor(address) => {
                        // Newer records were evicted past us; resolve again
                        // from the new anchor.
                        op.anchor = address;
                        op.awaiting = address;
                        op.work = PendingWork::Rmw {
                            initial: ctx.initial,
                            update: ctx.update,
                        };
                        if self
                            .store
                            .submit_record_read(self.slot, self.generation, op.serial, address)
                        {
                            self.pending.push_back(op);
                        } else {
                            out.push(CompletedOp::Rmw {
                                serial: op.serial,
                                key: op.key,
                                status: Status::StoreFaulted,
                            });
                        }
                    }
                }
            }
        }
    }
}

impl<K, V, D> Session<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    /// Close the session explicitly.
    ///
    /// Fails with [`Status::PendingOnClose`] when operations are still
    /// queued and the most recent [`complete_pending`](Self::complete_pending)
    /// call was a non-blocking poll; the session stays open so the caller
    /// can drain and retry. Otherwise any remaining operations are drained
    /// (`Drop` does the same, silently) and the epoch slot is released.
    /// A disposed session must not issue further operations.
    pub fn dispose(&mut self) -> Status {
        if self.disposed {
            return Status::Ok;
        }
        if !self.pending.is_empty() {
            if self.last_complete_wait == Some(false) {
                return Status::PendingOnClose;
            }
            let _ = self.complete_pending(true);
        }
        self.disposed = true;
        self.store.drop_session(self.id);
        self.store.epoch().unprotect(self.slot);
        Status::Ok
    }
}

impl<K, V, D> Drop for Session<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if !self.pending.is_empty() && !self.store.is_faulted() {
            let _ = self.complete_pending(true);
        }
        self.store.drop_session(self.id);
        self.store.epoch().unprotect(self.slot);
    }
}
