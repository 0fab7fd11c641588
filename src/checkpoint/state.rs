//! Checkpoint phase machine and metadata records.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::checkpoint::CheckpointToken;
use crate::store::CheckpointKind;

/// Phases of a non-blocking checkpoint, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// Normal operation.
    #[default]
    Rest = 0,
    /// Sessions are being told a checkpoint is starting.
    Prepare = 1,
    /// The version has advanced; the cut is being taken.
    InProgress = 2,
    /// Waiting for operations in flight at the cut to drain.
    WaitPending = 3,
    /// Waiting for the log below the cut to become durable.
    WaitFlush = 4,
    /// Writing metadata and invoking the persistence callback.
    PersistenceCallback = 5,
}

impl Phase {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Phase::Prepare,
            2 => Phase::InProgress,
            3 => Phase::WaitPending,
            4 => Phase::WaitFlush,
            5 => Phase::PersistenceCallback,
            _ => Phase::Rest,
        }
    }
}

/// Checkpoint version plus phase, read and advanced as one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// The checkpoint version (monotonic across checkpoints).
    pub version: u32,
    /// The current phase.
    pub phase: Phase,
}

impl SystemState {
    /// Initial state: version 1, at rest.
    pub const fn initial() -> Self {
        Self {
            version: 1,
            phase: Phase::Rest,
        }
    }
}

/// Atomic cell for [`SystemState`].
pub struct AtomicPhase(AtomicU64);

impl AtomicPhase {
    fn pack(state: SystemState) -> u64 {
        (state.version as u64) | ((state.phase as u64) << 32)
    }

    /// Cell holding `state`.
    pub fn new(state: SystemState) -> Self {
        Self(AtomicU64::new(Self::pack(state)))
    }

    /// Load the state.
    pub fn load(&self, order: Ordering) -> SystemState {
        let word = self.0.load(order);
        SystemState {
            version: word as u32,
            phase: Phase::from_bits((word >> 32) as u8),
        }
    }

    /// Store `state`.
    pub fn store(&self, state: SystemState, order: Ordering) {
        self.0.store(Self::pack(state), order);
    }

    /// CAS the whole state; only one coordinator wins each transition.
    pub fn compare_exchange(
        &self,
        current: SystemState,
        new: SystemState,
    ) -> Result<SystemState, SystemState> {
        self.0
            .compare_exchange(
                Self::pack(current),
                Self::pack(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|w| SystemState {
                version: w as u32,
                phase: Phase::from_bits((w >> 32) as u8),
            })
            .map_err(|w| SystemState {
                version: w as u32,
                phase: Phase::from_bits((w >> 32) as u8),
            })
    }
}

impl Default for AtomicPhase {
    fn default() -> Self {
        Self::new(SystemState::initial())
    }
}

/// Log-side checkpoint metadata, persisted as `log.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Checkpoint token.
    pub token: CheckpointToken,
    /// Checkpoint flavour.
    pub kind: CheckpointKind,
    /// Version the checkpoint committed.
    pub version: u32,
    /// Begin address at the cut.
    pub begin_address: Address,
    /// Head address at the cut.
    pub head_address: Address,
    /// The cut: tail address when the checkpoint entered `InProgress`.
    pub cut_address: Address,
    /// Durable prefix of the main log when the checkpoint committed.
    pub flushed_address: Address,
    /// Address the index snapshot is consistent at (entries above it were
    /// clamped to their newest ancestor below it at write time). Recovery
    /// still rescans `[min(this, cut - memory span), cut)` defensively.
    pub index_snapshot_address: Address,
    /// First page captured in `snapshot.dat` (snapshot kind only).
    pub snapshot_start_page: Option<u32>,
}

/// Index-side checkpoint metadata, persisted as `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Checkpoint token.
    pub token: CheckpointToken,
    /// Buckets in the base array.
    pub table_size: u64,
    /// Spill buckets captured.
    pub spill_buckets: u64,
    /// Published entries captured.
    pub entries: u64,
}

/// One session's committed-operation watermark, persisted in `cpr.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub session_id: u32,
    /// Highest operation serial the session had issued at the cut.
    pub serial: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cell_round_trips() {
        let cell = AtomicPhase::default();
        let state = cell.load(Ordering::Acquire);
        assert_eq!(state.version, 1);
        assert_eq!(state.phase, Phase::Rest);

        let next = SystemState {
            version: 2,
            phase: Phase::InProgress,
        };
        cell.store(next, Ordering::Release);
        assert_eq!(cell.load(Ordering::Acquire), next);
    }

    #[test]
    fn phase_transition_has_single_winner() {
        let cell = AtomicPhase::default();
        let rest = cell.load(Ordering::Acquire);
        let prepare = SystemState {
            version: rest.version,
            phase: Phase::Prepare,
        };
        assert!(cell.compare_exchange(rest, prepare).is_ok());
        assert!(cell.compare_exchange(rest, prepare).is_err());
    }
}
