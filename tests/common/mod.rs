//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use stratakv::device::{FileDevice, NullDevice};
use stratakv::store::{KvConfig, KvStore};

/// A memory-only store: generous buffer, nothing evicts.
pub fn memory_store() -> Arc<KvStore<u64, u64, NullDevice>> {
    let config = KvConfig {
        table_size: 4096,
        page_size_bits: 14,
        memory_size_bits: 22,
        ..KvConfig::default()
    };
    Arc::new(KvStore::new(config, NullDevice::new()).unwrap())
}

/// A file-backed store with a tiny buffer so eviction kicks in quickly.
pub fn tiny_file_store(dir: &std::path::Path) -> Arc<KvStore<u64, u64, FileDevice>> {
    let config = KvConfig {
        table_size: 1024,
        page_size_bits: 10,
        memory_size_bits: 11,
        mutable_fraction: 0.5,
        ..KvConfig::default()
    };
    let device = FileDevice::open(dir.join("hlog.dat")).unwrap();
    Arc::new(KvStore::new(config, device).unwrap())
}

/// A file-backed store sized so recovery keeps everything resident.
pub fn file_store(dir: &std::path::Path, config: KvConfig) -> Arc<KvStore<u64, u64, FileDevice>> {
    let device = FileDevice::open(dir.join("hlog.dat")).unwrap();
    Arc::new(KvStore::new(config, device).unwrap())
}

/// Default config for checkpoint/recovery suites.
pub fn durable_config() -> KvConfig {
    KvConfig {
        table_size: 4096,
        page_size_bits: 12,
        memory_size_bits: 18,
        ..KvConfig::default()
    }
}
