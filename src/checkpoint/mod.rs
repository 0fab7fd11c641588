//! Checkpoint coordination: phases, metadata, on-disk layout.

mod files;
mod state;

pub use files::{
    checkpoint_dir, find_latest, list_checkpoints, read_checkpoint, validate_checkpoint,
    write_checkpoint, CheckpointArtifacts,
};
pub use state::{
    AtomicPhase, IndexMetadata, LogMetadata, Phase, SessionRecord, SystemState,
};

use uuid::Uuid;

/// Identifier of one checkpoint.
pub type CheckpointToken = Uuid;

/// File name of the index snapshot inside a checkpoint directory.
pub const INDEX_SNAPSHOT_FILE: &str = "index.dat";
/// File name of the log metadata.
pub const LOG_META_FILE: &str = "log.json";
/// File name of the index metadata.
pub const INDEX_META_FILE: &str = "index.json";
/// File name of the per-session recovery records (bincode).
pub const CPR_FILE: &str = "cpr.bin";
/// File name of the mutable-region side snapshot (snapshot kind only).
pub const SNAPSHOT_FILE: &str = "snapshot.dat";
