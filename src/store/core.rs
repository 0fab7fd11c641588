//! The store: operation engine, checkpoint coordinator, recovery.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    self, checkpoint_dir, AtomicPhase, CheckpointArtifacts, CheckpointToken, IndexMetadata,
    LogMetadata, Phase, SessionRecord, SystemState,
};
use crate::device::StorageDevice;
use crate::epoch::{self, EpochManager};
use crate::hlog::HybridLog;
use crate::index::{FindSlot, HashIndex, KeyHash};
use crate::record::{Key, Record, RecordHeader, Value};
use crate::scan::LogScan;
use crate::status::Status;
use crate::store::config::CheckpointKind;
use crate::store::contexts::RmwContext;
use crate::store::pending::{PendingIo, ReadCompletion, ReadRequest};
use crate::store::{KvConfig, Session};

const RMW_LOCK_STRIPES: usize = 64;

/// Where a chain walk for a key ended up.
pub(crate) enum ChainHit {
    /// The newest record for the key, resident in memory.
    Found {
        /// Record address.
        address: Address,
        /// Record pointer, valid while the caller's epoch is protected.
        ptr: NonNull<u8>,
    },
    /// The walk reached an address below the head.
    OnDevice(Address),
    /// The chain holds no record for the key.
    Miss,
}

/// Result of a read that may have gone asynchronous.
pub(crate) enum ReadOutcome<V> {
    Found(V),
    NotFound,
    OnDevice(Address),
}

/// Result of an RMW attempt resumed after device I/O.
pub(crate) enum RmwResume {
    Done(Status),
    /// The chain gained a newer evicted record; re-resolve from here.
    Reanchor(Address),
}

/// A concurrent key-value store over a hybrid log.
pub struct KvStore<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    config: KvConfig,
    epoch: Arc<EpochManager>,
    index: HashIndex,
    hlog: HybridLog<D>,
    pending: PendingIo<D>,
    state: AtomicPhase,
    faulted: AtomicBool,
    rmw_locks: Box<[Mutex<()>]>,
    next_session_id: AtomicU32,
    session_serials: Mutex<HashMap<u32, Arc<AtomicU64>>>,
    recovered_sessions: Mutex<Vec<SessionRecord>>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, D> KvStore<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    /// Create an empty store.
    pub fn new(config: KvConfig, device: D) -> Result<Self, Status> {
        let config = config.validated().map_err(|e| {
            warn!("rejected store configuration: {e}");
            Status::Corruption
        })?;
        let device = Arc::new(device);
        if config.preallocate_log {
            if let Err(e) = device.preallocate(config.segment_size()) {
                warn!("log preallocation failed: {e}");
                return Err(Status::IoError);
            }
        }

        let epoch = Arc::new(EpochManager::new());
        let index = HashIndex::new(config.table_size)?;
        let hlog = HybridLog::new(config.log_layout(), Arc::clone(&device), Arc::clone(&epoch))?;
        let pending = PendingIo::new(Arc::clone(&device));

        Ok(Self {
            config,
            epoch,
            index,
            hlog,
            pending,
            state: AtomicPhase::default(),
            faulted: AtomicBool::new(false),
            rmw_locks: (0..RMW_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            next_session_id: AtomicU32::new(0),
            session_serials: Mutex::new(HashMap::new()),
            recovered_sessions: Mutex::new(Vec::new()),
            _marker: PhantomData,
        })
    }

    /// The store's epoch manager.
    pub fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    /// The store's configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// The underlying hybrid log.
    pub fn hlog(&self) -> &HybridLog<D> {
        &self.hlog
    }

    /// Index occupancy statistics.
    pub fn index_stats(&self) -> crate::index::IndexStats {
        self.index.stats()
    }

    /// Current checkpoint phase and version.
    pub fn system_state(&self) -> SystemState {
        self.state.load(Ordering::Acquire)
    }

    /// Whether a fatal error has poisoned the store.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire) || self.hlog.is_faulted()
    }

    /// Per-session watermarks restored by [`KvStore::recover`].
    pub fn recovered_sessions(&self) -> Vec<SessionRecord> {
        self.recovered_sessions.lock().clone()
    }

    /// Open a session. Each thread should hold its own.
    pub fn start_session(self: &Arc<Self>) -> Result<Session<K, V, D>, Status> {
        let slot = epoch::thread_slot()?;
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        let serial = Arc::new(AtomicU64::new(0));
        self.session_serials.lock().insert(id, Arc::clone(&serial));
        Ok(Session::new(Arc::clone(self), id, slot, serial))
    }

    pub(crate) fn drop_session(&self, id: u32) {
        self.session_serials.lock().remove(&id);
    }

    pub(crate) fn drain_completions(&self, slot: usize, generation: u64) -> Vec<ReadCompletion> {
        self.pending.drain(slot, generation)
    }

    pub(crate) fn submit_record_read(
        &self,
        slot: usize,
        generation: u64,
        serial: u64,
        address: Address,
    ) -> bool {
        self.pending.submit(ReadRequest {
            slot,
            generation,
            serial,
            address,
            len: Record::<K, V>::size() as usize,
        })
    }

    #[inline]
    fn version_tag(&self) -> u16 {
        (self.system_state().version & 0x1fff) as u16
    }

    #[inline]
    fn rmw_lock(&self, hash: KeyHash) -> &Mutex<()> {
        &self.rmw_locks[(hash.tag() as usize) % RMW_LOCK_STRIPES]
    }

    /// Shift the log's begin address, dropping index entries below it.
    pub fn truncate_below(&self, target: Address) -> Status {
        if self.is_faulted() {
            return Status::StoreFaulted;
        }
        if let Err(e) = self.hlog.shift_begin(target) {
            warn!("begin shift failed: {e}");
            return Status::IoError;
        }
        self.index.garbage_collect(self.hlog.begin_address());
        Status::Ok
    }

    // ---- chain walks --------------------------------------------------------

    /// Follow `previous_address` links from `address` looking for `key`.
    fn trace_key(&self, key: &K, mut address: Address) -> ChainHit {
        let begin = self.hlog.begin_address();
        loop {
            if !address.is_valid() || address < begin {
                return ChainHit::Miss;
            }
            let Some(ptr) = self.hlog.try_get(address) else {
                return ChainHit::OnDevice(address);
            };
            let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
            if !record.header.is_invalid() && unsafe { record.key() } == key {
                return ChainHit::Found { address, ptr };
            }
            address = record.header.previous_address();
        }
    }

    /// Like [`trace_key`](Self::trace_key) but confined to the mutable
    /// region; used to decide in-place eligibility.
    fn find_in_mutable(
        &self,
        key: &K,
        mut address: Address,
        read_only: Address,
    ) -> Option<(Address, NonNull<u8>)> {
        loop {
            if !address.is_valid() || address < read_only {
                return None;
            }
            let ptr = self.hlog.try_get(address)?;
            let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
            if !record.header.is_invalid() && unsafe { record.key() } == key {
                return Some((address, ptr));
            }
            address = record.header.previous_address();
        }
    }

    /// Seal the mutable-region record a tail append just superseded, so an
    /// in-place updater that passed its eligibility check before the index
    /// CAS cannot land a write afterwards. Addresses are never reused, so
    /// re-resolving by address is safe even if the record evicted while
    /// the append was waiting on allocation.
    fn seal_superseded(&self, superseded: Option<Address>) {
        if let Some(address) = superseded {
            if let Some(ptr) = self.hlog.try_get(address) {
                let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                record.header.seal();
            }
        }
    }

    // ---- operations ---------------------------------------------------------

    /// Point read. `OnDevice` means the caller must go through the pending
    /// path.
    pub(crate) fn internal_read(&self, slot: usize, key: &K) -> Result<ReadOutcome<V>, Status> {
        if self.is_faulted() {
            return Err(Status::StoreFaulted);
        }
        let hash = KeyHash::new(key.key_hash());
        let found = self.index.find_entry(hash);
        if !found.found() {
            return Ok(ReadOutcome::NotFound);
        }
        match self.trace_key(key, found.entry.address()) {
            ChainHit::Found { address, ptr } => {
                let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                if record.header.is_tombstone() {
                    return Ok(ReadOutcome::NotFound);
                }
                let value = unsafe { *record.value() };
                if self.config.copy_reads_to_tail && address < self.hlog.read_only_address() {
                    self.copy_to_tail(slot, key, &value, hash, &found);
                }
                Ok(ReadOutcome::Found(value))
            }
            ChainHit::OnDevice(address) => Ok(ReadOutcome::OnDevice(address)),
            ChainHit::Miss => Ok(ReadOutcome::NotFound),
        }
    }

    /// Resume a read below its immutable anchor; the chain down there can
    /// no longer change.
    pub(crate) fn resume_read(&self, key: &K, address: Address) -> Result<ReadOutcome<V>, Status> {
        if self.is_faulted() {
            return Err(Status::StoreFaulted);
        }
        match self.trace_key(key, address) {
            ChainHit::Found { ptr, .. } => {
                let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                if record.header.is_tombstone() {
                    Ok(ReadOutcome::NotFound)
                } else {
                    Ok(ReadOutcome::Found(unsafe { *record.value() }))
                }
            }
            ChainHit::OnDevice(a) => Ok(ReadOutcome::OnDevice(a)),
            ChainHit::Miss => Ok(ReadOutcome::NotFound),
        }
    }

    /// Blind upsert.
    pub(crate) fn internal_upsert(&self, slot: usize, key: K, value: V) -> Status {
        loop {
            if self.is_faulted() {
                return Status::StoreFaulted;
            }
            let hash = KeyHash::new(key.key_hash());
            let found = self.index.find_or_create_entry(hash);
            let Some(slot_ptr) = found.slot else {
                return Status::IndexSaturated;
            };

            // In-place when the newest record for the key is mutable and
            // carries the current checkpoint version.
            let read_only = self.hlog.read_only_address();
            let head = found.entry.address();
            let mut superseded = None;
            if head.is_valid() && head >= read_only {
                if let Some((address, ptr)) = self.find_in_mutable(&key, head, read_only) {
                    let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                    if !record.header.is_tombstone()
                        && !record.header.is_sealed()
                        && record.header.version() == self.version_tag()
                    {
                        unsafe { std::ptr::write(record.value_mut(), value) };
                        return Status::Ok;
                    }
                    superseded = Some(address);
                }
            }

            match self.append_record(slot, &found, hash, |dst, prev, version| unsafe {
                Record::<K, V>::write(dst, prev, version, false, key, value);
            }) {
                AppendOutcome::Installed => {
                    self.seal_superseded(superseded);
                    return Status::Ok;
                }
                AppendOutcome::LostRace => continue,
                AppendOutcome::Failed(status) => return status,
            }
        }
    }

    /// Tombstone append.
    pub(crate) fn internal_delete(&self, slot: usize, key: &K) -> Status {
        loop {
            if self.is_faulted() {
                return Status::StoreFaulted;
            }
            let hash = KeyHash::new(key.key_hash());
            let found = self.index.find_entry(hash);
            if !found.found() {
                return Status::NotFound;
            }

            let read_only = self.hlog.read_only_address();
            let head = found.entry.address();
            let mut superseded = None;
            if head.is_valid() && head >= read_only {
                if let Some((address, _)) = self.find_in_mutable(key, head, read_only) {
                    superseded = Some(address);
                }
            }

            let key = *key;
            match self.append_record(slot, &found, hash, |dst, prev, version| unsafe {
                Record::<K, V>::write_tombstone(dst, prev, version, key);
            }) {
                AppendOutcome::Installed => {
                    self.seal_superseded(superseded);
                    return Status::Ok;
                }
                AppendOutcome::LostRace => continue,
                AppendOutcome::Failed(status) => return status,
            }
        }
    }

    /// Read-modify-write. Mutators on the same key serialise through a
    /// stripe lock so increments survive the in-place/copy boundary.
    pub(crate) fn internal_rmw<C>(&self, slot: usize, ctx: &mut C) -> Result<Status, Address>
    where
        C: RmwContext<K, V>,
    {
        loop {
            if self.is_faulted() {
                return Ok(Status::StoreFaulted);
            }
            let key = *ctx.key();
            let hash = KeyHash::new(key.key_hash());
            let _guard = self.rmw_lock(hash).lock();

            let found = self.index.find_or_create_entry(hash);
            let Some(_) = found.slot else {
                return Ok(Status::IndexSaturated);
            };

            let read_only = self.hlog.read_only_address();
            let head = found.entry.address();
            let mut superseded = None;
            if head.is_valid() && head >= read_only {
                if let Some((address, ptr)) = self.find_in_mutable(&key, head, read_only) {
                    let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                    if !record.header.is_tombstone()
                        && !record.header.is_sealed()
                        && record.header.version() == self.version_tag()
                    {
                        let value = unsafe { &mut *record.value_mut() };
                        if ctx.update_in_place(value) {
                            return Ok(Status::Ok);
                        }
                        // Updater refused (e.g. growth); fall through to a
                        // copy-update at the tail.
                    }
                    superseded = Some(address);
                }
            }

            // Find the current value for the copy-update.
            let old = match self.trace_key(&key, found.entry.address()) {
                ChainHit::Found { ptr, .. } => {
                    let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                    if record.header.is_tombstone() {
                        None
                    } else {
                        Some(unsafe { *record.value() })
                    }
                }
                ChainHit::OnDevice(address) => return Err(address),
                ChainHit::Miss => None,
            };

            let next = match old {
                Some(ref v) => ctx.update_copy(v),
                None => ctx.initial(),
            };
            match self.append_record(slot, &found, hash, |dst, prev, version| unsafe {
                Record::<K, V>::write(dst, prev, version, false, key, next);
            }) {
                AppendOutcome::Installed => {
                    self.seal_superseded(superseded);
                    return Ok(Status::Ok);
                }
                AppendOutcome::LostRace => continue,
                AppendOutcome::Failed(status) => return Ok(status),
            }
        }
    }

    /// Finish an RMW whose old value was fetched from the device.
    ///
    /// `anchor` is the first on-device address the original walk reached;
    /// the chain at and below it is immutable, so `old` stays valid as
    /// long as a fresh walk reaches the same anchor.
    pub(crate) fn resume_rmw<C>(
        &self,
        slot: usize,
        ctx: &mut C,
        anchor: Address,
        old: Option<V>,
    ) -> RmwResume
    where
        C: RmwContext<K, V>,
    {
        loop {
            if self.is_faulted() {
                return RmwResume::Done(Status::StoreFaulted);
            }
            let key = *ctx.key();
            let hash = KeyHash::new(key.key_hash());
            let _guard = self.rmw_lock(hash).lock();

            let found = self.index.find_or_create_entry(hash);
            let read_only = self.hlog.read_only_address();
            let head = found.entry.address();
            let mut superseded = None;
            if head.is_valid() && head >= read_only {
                if let Some((address, ptr)) = self.find_in_mutable(&key, head, read_only) {
                    let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                    if !record.header.is_tombstone()
                        && !record.header.is_sealed()
                        && record.header.version() == self.version_tag()
                    {
                        let value = unsafe { &mut *record.value_mut() };
                        if ctx.update_in_place(value) {
                            return RmwResume::Done(Status::Ok);
                        }
                    }
                    superseded = Some(address);
                }
            }

            let current_old = match self.trace_key(&key, found.entry.address()) {
                ChainHit::Found { ptr, .. } => {
                    let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                    if record.header.is_tombstone() {
                        None
                    } else {
                        Some(unsafe { *record.value() })
                    }
                }
                ChainHit::OnDevice(address) if address == anchor => old,
                ChainHit::OnDevice(address) => return RmwResume::Reanchor(address),
                ChainHit::Miss => None,
            };

            let next = match current_old {
                Some(ref v) => ctx.update_copy(v),
                None => ctx.initial(),
            };
            match self.append_record(slot, &found, hash, |dst, prev, version| unsafe {
                Record::<K, V>::write(dst, prev, version, false, key, next);
            }) {
                AppendOutcome::Installed => {
                    self.seal_superseded(superseded);
                    return RmwResume::Done(Status::Ok);
                }
                AppendOutcome::LostRace => continue,
                AppendOutcome::Failed(status) => return RmwResume::Done(status),
            }
        }
    }

    // ---- append plumbing ----------------------------------------------------

    /// Allocate, write, and CAS a record into the index.
    fn append_record(
        &self,
        slot: usize,
        found: &FindSlot,
        hash: KeyHash,
        write: impl FnOnce(*mut u8, Address, u16),
    ) -> AppendOutcome {
        let Some(slot_ptr) = found.slot else {
            return AppendOutcome::Failed(Status::IndexSaturated);
        };
        let address = match self.allocate_record(slot) {
            Ok(a) => a,
            Err(status) => return AppendOutcome::Failed(status),
        };
        let Some(ptr) = self.hlog.try_get(address) else {
            // The tail cannot be evicted; a miss here means the log state
            // is corrupt.
            self.faulted.store(true, Ordering::Release);
            return AppendOutcome::Failed(Status::Corruption);
        };
        write(ptr.as_ptr(), found.entry.address(), self.version_tag());

        match self
            .index
            .try_update(slot_ptr, found.entry, address, hash.tag())
        {
            Status::Ok => AppendOutcome::Installed,
            _ => {
                // Another writer won the slot; the orphaned record must be
                // skipped by every future chain walk.
                let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                record.header.set_invalid();
                AppendOutcome::LostRace
            }
        }
    }

    /// Allocate with backpressure: refresh the epoch and retry while the
    /// ring recycles frames.
    fn allocate_record(&self, slot: usize) -> Result<Address, Status> {
        let size = Record::<K, V>::size();
        loop {
            match self.hlog.allocate(size) {
                Ok(address) => return Ok(address),
                Err(Status::NeedsRefresh) => {
                    if self.is_faulted() {
                        return Err(Status::StoreFaulted);
                    }
                    self.epoch.protect_and_drain(slot);
                    std::thread::yield_now();
                }
                Err(status) => return Err(status),
            }
        }
    }

    /// Best-effort copy of a read hit from the immutable region to the
    /// tail. A lost CAS just abandons the copy.
    fn copy_to_tail(&self, slot: usize, key: &K, value: &V, hash: KeyHash, found: &FindSlot) {
        let key = *key;
        let value = *value;
        let _ = self.append_record(slot, found, hash, |dst, prev, version| unsafe {
            Record::<K, V>::write(dst, prev, version, false, key, value);
        });
    }

    // ---- checkpoint ---------------------------------------------------------

    /// Run a checkpoint of the configured kind into `base_dir`.
    ///
    /// Drives `Rest → Prepare → InProgress → WaitPending → WaitFlush →
    /// PersistenceCallback → Rest` without stopping other sessions; each
    /// phase gate waits for every active session to refresh past it.
    pub fn checkpoint(&self, base_dir: &Path) -> Result<CheckpointToken, Status> {
        if self.is_faulted() {
            return Err(Status::StoreFaulted);
        }
        let rest = self.system_state();
        if rest.phase != Phase::Rest {
            return Err(Status::Aborted);
        }
        let prepare = SystemState {
            version: rest.version,
            phase: Phase::Prepare,
        };
        if self.state.compare_exchange(rest, prepare).is_err() {
            return Err(Status::Aborted);
        }
        let token = Uuid::new_v4();
        info!(%token, version = rest.version, "checkpoint started");

        let result = self.run_checkpoint_phases(base_dir, token, rest.version);
        // Whatever happened, leave the phase machine at rest.
        let version = self.system_state().version;
        self.state.store(
            SystemState {
                version,
                phase: Phase::Rest,
            },
            Ordering::Release,
        );
        result.map(|_| token)
    }

    fn run_checkpoint_phases(
        &self,
        base_dir: &Path,
        token: CheckpointToken,
        old_version: u32,
    ) -> Result<(), Status> {
        self.epoch.reset_phase_markers();
        self.await_phase(Phase::Prepare)?;

        // InProgress: advance the version, then take the cut. Records
        // appended after this carry the new version and are excluded from
        // the checkpoint's in-place region.
        let new_version = old_version + 1;
        self.state.store(
            SystemState {
                version: new_version,
                phase: Phase::InProgress,
            },
            Ordering::Release,
        );
        let cut = self.hlog.tail_address();

        self.state.store(
            SystemState {
                version: new_version,
                phase: Phase::WaitPending,
            },
            Ordering::Release,
        );
        self.await_phase(Phase::WaitPending)?;

        let sessions: Vec<SessionRecord> = self
            .session_serials
            .lock()
            .iter()
            .map(|(&session_id, serial)| SessionRecord {
                session_id,
                serial: serial.load(Ordering::Acquire),
            })
            .collect();

        let dir = checkpoint_dir(base_dir, token);
        std::fs::create_dir_all(&dir).map_err(|e| {
            warn!("checkpoint dir creation failed: {e}");
            Status::IoError
        })?;

        // Index snapshot, pinned to the cut: live sessions keep appending
        // past the cut while the buckets are scanned, so any entry already
        // above it is rewritten to its newest ancestor below the cut.
        // Records above the cut are usually still resident; one that
        // evicted mid-walk is read back off the device.
        let index_stats = self.index.stats();
        let begin = self.hlog.begin_address();
        self.index
            .write_snapshot_clamped(&dir.join(checkpoint::INDEX_SNAPSHOT_FILE), |mut address| {
                while address.is_valid() && address >= cut {
                    let previous = match self.hlog.try_get(address) {
                        Some(ptr) => {
                            let record = unsafe { Record::<K, V>::from_ptr(ptr.as_ptr()) };
                            record.header.previous_address()
                        }
                        None => match self.hlog.read_record_header(address) {
                            Ok(control) => RecordHeader::from_control(control).previous_address(),
                            Err(_) => return Address::INVALID,
                        },
                    };
                    address = previous;
                }
                if address.is_valid() && address >= begin {
                    address
                } else {
                    Address::INVALID
                }
            })
            .map_err(|e| {
                warn!("index snapshot failed: {e}");
                Status::IoError
            })?;
        let index_snapshot_address = cut;

        self.state.store(
            SystemState {
                version: new_version,
                phase: Phase::WaitFlush,
            },
            Ordering::Release,
        );

        let snapshot_start_page = match self.config.checkpoint_kind {
            CheckpointKind::FuzzyLog => {
                self.persist_log_below(cut)?;
                None
            }
            CheckpointKind::Snapshot => {
                self.persist_log_below(cut)?;
                Some(self.write_side_snapshot(&dir, cut)?)
            }
            CheckpointKind::IndexOnly => None,
        };

        self.state.store(
            SystemState {
                version: new_version,
                phase: Phase::PersistenceCallback,
            },
            Ordering::Release,
        );

        let artifacts = CheckpointArtifacts {
            log: LogMetadata {
                token,
                kind: self.config.checkpoint_kind,
                version: new_version,
                begin_address: self.hlog.begin_address(),
                head_address: self.hlog.head_address(),
                cut_address: cut,
                flushed_address: self.hlog.flushed_until_address(),
                index_snapshot_address,
                snapshot_start_page,
            },
            index: Some(IndexMetadata {
                token,
                table_size: index_stats.table_size,
                spill_buckets: index_stats.spill_buckets,
                entries: index_stats.used_slots,
            }),
            sessions,
        };
        checkpoint::write_checkpoint(base_dir, &artifacts).map_err(|e| {
            warn!("checkpoint metadata write failed: {e}");
            Status::IoError
        })?;
        info!(%token, cut = %cut, "checkpoint committed");
        Ok(())
    }

    /// Make every byte below `cut` durable on the main log device.
    fn persist_log_below(&self, cut: Address) -> Result<(), Status> {
        self.hlog.shift_read_only(cut);
        // The flush submissions are parked on the epoch; keep refreshing
        // this thread's slot (it may hold a live session) so they run.
        let my_slot = epoch::thread_slot()?;
        let goal = cut.page_start();
        while self.hlog.flushed_until_address() < goal {
            if self.is_faulted() {
                return Err(Status::StoreFaulted);
            }
            if self.epoch.is_protected(my_slot) {
                self.epoch.protect_and_drain(my_slot);
            }
            self.epoch.drain_ready();
            std::thread::yield_now();
        }
        if cut.offset() > 0 {
            self.hlog
                .persist_page_prefix(cut.page(), cut.offset() as usize)
                .map_err(|e| {
                    warn!("tail page persist failed: {e}");
                    Status::IoError
                })?;
        }
        Ok(())
    }

    /// Write the resident pages `[head_page, cut]` into `snapshot.dat`.
    /// Returns the first page captured.
    fn write_side_snapshot(&self, dir: &Path, cut: Address) -> Result<u32, Status> {
        use std::io::Write;

        let start_page = self.hlog.head_address().page();
        let file = std::fs::File::create(dir.join(checkpoint::SNAPSHOT_FILE)).map_err(|e| {
            warn!("snapshot file creation failed: {e}");
            Status::IoError
        })?;
        let mut writer = std::io::BufWriter::new(file);
        let page_size = self.hlog.page_size();
        for page in start_page..=cut.page() {
            let bytes = self
                .hlog
                .copy_page_prefix(page, page_size)
                .ok_or(Status::IoError)?;
            writer.write_all(&bytes).map_err(|_| Status::IoError)?;
        }
        writer.flush().map_err(|_| Status::IoError)?;
        Ok(start_page)
    }

    /// Wait until every active session has refreshed during `phase`.
    fn await_phase(&self, phase: Phase) -> Result<(), Status> {
        let my_slot = epoch::thread_slot()?;
        loop {
            if self.is_faulted() {
                return Err(Status::StoreFaulted);
            }
            if self.epoch.is_protected(my_slot) {
                self.epoch.protect_and_drain(my_slot);
            }
            self.epoch.drain_ready();
            if self.epoch.mark_phase_done(my_slot, phase as u32) {
                return Ok(());
            }
            std::thread::yield_now();
        }
    }

    // ---- recovery -----------------------------------------------------------

    /// Rebuild a store from the checkpoint `token` (or the latest) under
    /// `base_dir`.
    pub fn recover(
        base_dir: &Path,
        token: Option<CheckpointToken>,
        config: KvConfig,
        device: D,
    ) -> Result<Self, Status> {
        let token = match token.or_else(|| checkpoint::find_latest(base_dir)) {
            Some(t) => t,
            None => return Err(Status::NotFound),
        };
        checkpoint::validate_checkpoint(base_dir, token).map_err(|e| {
            warn!(%token, "checkpoint validation failed: {e}");
            Status::Corruption
        })?;
        let artifacts = checkpoint::read_checkpoint(base_dir, token).map_err(|e| {
            warn!(%token, "checkpoint read failed: {e}");
            Status::Corruption
        })?;
        let meta = artifacts.log.clone();
        info!(%token, cut = %meta.cut_address, "recovery started");

        let store = Self::new(config, device)?;
        let cut = meta.cut_address;

        // Keep as much of the tail resident as the ring allows.
        let frame_count = store.hlog.frame_count();
        let head_page = (cut.page() + 1)
            .saturating_sub(frame_count)
            .max(meta.begin_address.page());
        let head = Address::new(head_page, 0);

        store
            .hlog
            .restore(meta.begin_address, head, cut)
            .map_err(|e| {
                warn!("log restore failed: {e}");
                Status::Corruption
            })?;
        if let Some(start_page) = meta.snapshot_start_page {
            store.overlay_side_snapshot(
                &checkpoint_dir(base_dir, token),
                start_page,
                head,
                cut,
            )?;
        }

        // Index: restore the snapshot when present, then patch the fuzzy
        // window; otherwise rebuild the whole index from the log.
        let dir = checkpoint_dir(base_dir, token);
        let snapshot_path = dir.join(checkpoint::INDEX_SNAPSHOT_FILE);
        let rescan_from = if artifacts.index.is_some() && snapshot_path.is_file() {
            store.index.read_snapshot(&snapshot_path).map_err(|e| {
                warn!("index snapshot restore failed: {e}");
                Status::Corruption
            })?;
            // Snapshots are clamped at write time; anything above the cut
            // here points into the truncated tail and must not survive.
            let dropped = store.index.drop_above(cut);
            if dropped > 0 {
                warn!(dropped, "index snapshot held entries above the cut");
            }
            // The snapshot raced appends in [snapshot_address, cut); also
            // cover a memory-span of slack for safety.
            let floor_page = cut
                .page()
                .saturating_sub(frame_count)
                .max(meta.begin_address.page());
            let floor = Address::new(floor_page, 0);
            meta.index_snapshot_address
                .page_start()
                .min(floor)
                .max(meta.begin_address)
        } else {
            meta.begin_address
        };
        store.replay_into_index(rescan_from, cut)?;

        store.state.store(
            SystemState {
                version: meta.version,
                phase: Phase::Rest,
            },
            Ordering::Release,
        );
        *store.recovered_sessions.lock() = artifacts.sessions;
        info!(%token, "recovery complete");
        Ok(store)
    }

    /// Load pages captured in `snapshot.dat` over the restored ring.
    fn overlay_side_snapshot(
        &self,
        dir: &Path,
        start_page: u32,
        head: Address,
        cut: Address,
    ) -> Result<(), Status> {
        use std::io::Read;

        let file = std::fs::File::open(dir.join(checkpoint::SNAPSHOT_FILE))
            .map_err(|_| Status::Corruption)?;
        let mut reader = std::io::BufReader::new(file);
        let page_size = self.hlog.page_size();
        let mut buf = vec![0u8; page_size];
        for page in start_page..=cut.page() {
            if reader.read_exact(&mut buf).is_err() {
                return Err(Status::Corruption);
            }
            if page < head.page() {
                continue;
            }
            // Re-install over whatever the device restore produced.
            self.hlog.reinstall_page(page, &buf).map_err(|e| {
                warn!("snapshot overlay failed for page {page}: {e}");
                Status::Corruption
            })?;
        }
        Ok(())
    }

    /// Replay `[from, to)` into the index, keeping the newest address per
    /// hash slot.
    fn replay_into_index(&self, from: Address, to: Address) -> Result<(), Status> {
        let mut scan = LogScan::<K, V, D>::new(&self.hlog, from, to);
        for record in scan.by_ref() {
            if record.invalid {
                continue;
            }
            let hash = KeyHash::new(record.key.key_hash());
            loop {
                let found = self.index.find_or_create_entry(hash);
                let Some(slot_ptr) = found.slot else {
                    return Err(Status::IndexSaturated);
                };
                let current = found.entry.address();
                if current.is_valid() && current >= record.address {
                    break;
                }
                if self
                    .index
                    .try_update(slot_ptr, found.entry, record.address, hash.tag())
                    == Status::Ok
                {
                    break;
                }
            }
        }
        if let Some(e) = scan.into_error() {
            warn!("index replay scan failed: {e}");
            return Err(Status::Corruption);
        }
        Ok(())
    }
}

enum AppendOutcome {
    Installed,
    LostRace,
    Failed(Status),
}

impl<K, V, D> Drop for KvStore<K, V, D>
where
    K: Key,
    V: Value,
    D: StorageDevice,
{
    fn drop(&mut self) {
        self.hlog.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    fn test_store() -> Arc<KvStore<u64, u64, NullDevice>> {
        let config = KvConfig {
            table_size: 1024,
            page_size_bits: 14,
            memory_size_bits: 20,
            ..KvConfig::default()
        };
        Arc::new(KvStore::new(config, NullDevice::new()).unwrap())
    }

    #[test]
    fn starts_at_rest() {
        let store = test_store();
        let state = store.system_state();
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, Phase::Rest);
        assert!(!store.is_faulted());
    }

    #[test]
    fn upsert_then_read() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        assert_eq!(session.upsert(42, 4200), Status::Ok);
        assert_eq!(session.read(&42).unwrap(), Some(4200));
        assert_eq!(session.read(&43).unwrap(), None);
    }

    #[test]
    fn upsert_overwrites_in_place() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        session.upsert(1, 10);
        session.upsert(1, 20);
        assert_eq!(session.read(&1).unwrap(), Some(20));
        // Both writes hit the mutable region; the second was in place, so
        // the tail did not grow by a second record.
        let tail = store.hlog().tail_address();
        assert_eq!(u64::from(tail), Record::<u64, u64>::size() as u64);
    }

    #[test]
    fn delete_appends_tombstone() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        session.upsert(7, 70);
        assert_eq!(session.delete(&7), Status::Ok);
        assert_eq!(session.read(&7).unwrap(), None);
        // Deleting a missing key reports NotFound.
        assert_eq!(session.delete(&999), Status::NotFound);
    }

    #[test]
    fn rmw_applies_initial_and_updates() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        let bump = |v: &mut u64| {
            *v += 1;
            true
        };
        assert_eq!(session.rmw(5, 100, bump), Status::Ok);
        assert_eq!(session.read(&5).unwrap(), Some(100));
        assert_eq!(session.rmw(5, 100, bump), Status::Ok);
        assert_eq!(session.read(&5).unwrap(), Some(101));
    }

    #[test]
    fn rmw_refusal_copies_to_tail() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        session.upsert(9, 1);
        let tail_before = store.hlog().tail_address();
        // An updater that refuses the in-place path (and, per the updater
        // contract, leaves the value untouched when refusing).
        assert_eq!(session.rmw(9, 0, |_v: &mut u64| false), Status::Ok);
        assert_eq!(session.read(&9).unwrap(), Some(1));
        // The refusal forced a fresh record at the tail.
        assert!(store.hlog().tail_address() > tail_before);
    }

    #[test]
    fn superseded_record_is_sealed() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        // First record in the store lands at 0:0.
        session.upsert(9, 1);
        // A refused in-place update supersedes it with a tail copy.
        assert_eq!(session.rmw(9, 0, |_v: &mut u64| false), Status::Ok);

        let ptr = store.hlog().try_get(Address::new(0, 0)).unwrap();
        let record = unsafe { Record::<u64, u64>::from_ptr(ptr.as_ptr()) };
        assert!(record.header.is_sealed());
        // The successor still serves the key.
        assert_eq!(session.read(&9).unwrap(), Some(1));
    }

    #[test]
    fn stats_reflect_inserts() {
        let store = test_store();
        let mut session = store.start_session().unwrap();
        for i in 0..50u64 {
            session.upsert(i, i);
        }
        assert!(store.index_stats().used_slots >= 50);
        assert!(store.hlog().tail_address() > Address::new(0, 0));
    }
}
