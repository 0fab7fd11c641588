//! Checkpoint directory layout and metadata (de)serialization.
//!
//! Every checkpoint lives in `<base>/<token>/` holding `log.json`,
//! `index.json`, `index.dat`, `cpr.json`, and for snapshot checkpoints
//! `snapshot.dat`. Metadata is JSON so an operator can inspect it; the
//! index snapshot is raw bucket words.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::checkpoint::{
    CheckpointToken, IndexMetadata, LogMetadata, SessionRecord, CPR_FILE, INDEX_META_FILE,
    LOG_META_FILE,
};

/// The directory of checkpoint `token` under `base`.
pub fn checkpoint_dir(base: &Path, token: CheckpointToken) -> PathBuf {
    base.join(token.to_string())
}

/// Everything written for (or read back from) one checkpoint, minus the
/// raw index snapshot which the index writes itself.
#[derive(Debug, Clone)]
pub struct CheckpointArtifacts {
    /// Log metadata.
    pub log: LogMetadata,
    /// Index metadata, absent when no index snapshot was taken.
    pub index: Option<IndexMetadata>,
    /// Per-session watermarks.
    pub sessions: Vec<SessionRecord>,
}

/// Persist metadata for a checkpoint. `log.json` is written last and acts
/// as the commit record: a directory without it is ignored by discovery.
pub fn write_checkpoint(base: &Path, artifacts: &CheckpointArtifacts) -> io::Result<()> {
    let dir = checkpoint_dir(base, artifacts.log.token);
    fs::create_dir_all(&dir)?;

    write_bincode(&dir.join(CPR_FILE), &artifacts.sessions)?;
    if let Some(index) = &artifacts.index {
        write_json(&dir.join(INDEX_META_FILE), index)?;
    }
    write_json(&dir.join(LOG_META_FILE), &artifacts.log)?;
    debug!(token = %artifacts.log.token, "checkpoint metadata committed");
    Ok(())
}

/// Read a checkpoint's metadata back.
pub fn read_checkpoint(base: &Path, token: CheckpointToken) -> io::Result<CheckpointArtifacts> {
    let dir = checkpoint_dir(base, token);
    let log: LogMetadata = read_json(&dir.join(LOG_META_FILE))?;
    if log.token != token {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("checkpoint {token} metadata names token {}", log.token),
        ));
    }
    let index = match read_json::<IndexMetadata>(&dir.join(INDEX_META_FILE)) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };
    let sessions = match read_bincode::<Vec<SessionRecord>>(&dir.join(CPR_FILE)) {
        Ok(records) => records,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    Ok(CheckpointArtifacts {
        log,
        index,
        sessions,
    })
}

/// Tokens of every committed checkpoint under `base`.
pub fn list_checkpoints(base: &Path) -> Vec<CheckpointToken> {
    let mut tokens = Vec::new();
    let Ok(entries) = fs::read_dir(base) else {
        return tokens;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Ok(token) = name.parse::<CheckpointToken>() else {
            continue;
        };
        if entry.path().join(LOG_META_FILE).is_file() {
            tokens.push(token);
        }
    }
    tokens
}

/// The committed checkpoint with the highest version under `base`.
pub fn find_latest(base: &Path) -> Option<CheckpointToken> {
    let mut best: Option<(u32, CheckpointToken)> = None;
    for token in list_checkpoints(base) {
        let Ok(artifacts) = read_checkpoint(base, token) else {
            continue;
        };
        let candidate = (artifacts.log.version, token);
        // Tie-break on token so discovery is deterministic.
        if best.map_or(true, |b| candidate.0 > b.0 || (candidate.0 == b.0 && candidate.1 > b.1)) {
            best = Some(candidate);
        }
    }
    best.map(|(_, token)| token)
}

/// Check that a checkpoint directory holds every file its metadata claims.
pub fn validate_checkpoint(base: &Path, token: CheckpointToken) -> io::Result<()> {
    let artifacts = read_checkpoint(base, token)?;
    let dir = checkpoint_dir(base, token);
    if artifacts.index.is_some() && !dir.join(crate::checkpoint::INDEX_SNAPSHOT_FILE).is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "index metadata present but index.dat missing",
        ));
    }
    if artifacts.log.snapshot_start_page.is_some()
        && !dir.join(crate::checkpoint::SNAPSHOT_FILE).is_file()
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "snapshot checkpoint missing snapshot.dat",
        ));
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let file = File::open(path)?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_bincode<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes =
        bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, bytes)
}

fn read_bincode<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<T> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::store::CheckpointKind;
    use uuid::Uuid;

    fn artifacts(version: u32) -> CheckpointArtifacts {
        CheckpointArtifacts {
            log: LogMetadata {
                token: Uuid::new_v4(),
                kind: CheckpointKind::FuzzyLog,
                version,
                begin_address: Address::new(0, 0),
                head_address: Address::new(0, 0),
                cut_address: Address::new(1, 512),
                flushed_address: Address::new(1, 0),
                index_snapshot_address: Address::new(1, 256),
                snapshot_start_page: None,
            },
            index: Some(IndexMetadata {
                token: Uuid::nil(),
                table_size: 1024,
                spill_buckets: 0,
                entries: 42,
            }),
            sessions: vec![SessionRecord {
                session_id: 0,
                serial: 99,
            }],
        }
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = artifacts(3);
        a.index.as_mut().unwrap().token = a.log.token;
        write_checkpoint(dir.path(), &a).unwrap();

        let restored = read_checkpoint(dir.path(), a.log.token).unwrap();
        assert_eq!(restored.log.cut_address, Address::new(1, 512));
        assert_eq!(restored.log.version, 3);
        assert_eq!(restored.index.unwrap().entries, 42);
        assert_eq!(restored.sessions[0].serial, 99);
    }

    #[test]
    fn latest_prefers_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        let older = artifacts(1);
        let newer = artifacts(2);
        write_checkpoint(dir.path(), &older).unwrap();
        write_checkpoint(dir.path(), &newer).unwrap();

        assert_eq!(find_latest(dir.path()), Some(newer.log.token));
        assert_eq!(list_checkpoints(dir.path()).len(), 2);
    }

    #[test]
    fn uncommitted_directory_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        // A directory with a token name but no log.json is a torn
        // checkpoint and must not surface.
        let token = Uuid::new_v4();
        std::fs::create_dir_all(checkpoint_dir(dir.path(), token)).unwrap();
        assert!(list_checkpoints(dir.path()).is_empty());
        assert_eq!(find_latest(dir.path()), None);
    }
}
