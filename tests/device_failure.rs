//! Fatal device errors must poison the store, not corrupt it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stratakv::device::SyncStorageDevice;
use stratakv::status::Status;
use stratakv::store::{KvConfig, KvStore};

/// A device whose writes fail on demand.
struct BrokenDevice {
    broken: Arc<AtomicBool>,
}

impl SyncStorageDevice for BrokenDevice {
    fn read_at(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_at(&self, _offset: u64, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::Acquire) {
            Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
        } else {
            Ok(buf.len())
        }
    }

    fn flush_all(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_below_sync(&self, _offset: u64) -> io::Result<()> {
        Ok(())
    }

    fn byte_size(&self) -> io::Result<u64> {
        Ok(0)
    }
}

#[test]
fn failed_flushes_poison_the_store() {
    let broken = Arc::new(AtomicBool::new(true));
    let config = KvConfig {
        table_size: 256,
        page_size_bits: 10,
        memory_size_bits: 11,
        mutable_fraction: 0.5,
        ..KvConfig::default()
    };
    let store = Arc::new(
        KvStore::<u64, u64, _>::new(
            config,
            BrokenDevice {
                broken: Arc::clone(&broken),
            },
        )
        .unwrap(),
    );
    let mut session = store.start_session().unwrap();

    // Writing past the two-page buffer forces flushes, which fail until
    // the retry budget runs out and the store faults.
    let mut saw_fault = false;
    for i in 0..100_000u64 {
        match session.upsert(i, i) {
            Status::Ok => {}
            Status::StoreFaulted => {
                saw_fault = true;
                break;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert!(saw_fault, "store never faulted despite failing device");
    assert!(store.is_faulted());

    // Every subsequent operation reports the fault.
    assert_eq!(session.upsert(1, 1), Status::StoreFaulted);
    assert_eq!(session.read(&1).unwrap_err(), Status::StoreFaulted);
    assert_eq!(session.delete(&1), Status::StoreFaulted);

    // Checkpoints never complete on a faulted store.
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(store.checkpoint(dir.path()).unwrap_err(), Status::StoreFaulted);

    // Dropping the session (dispose) must still work.
    drop(session);
}

#[test]
fn healthy_device_keeps_store_clean() {
    let broken = Arc::new(AtomicBool::new(false));
    let config = KvConfig {
        table_size: 256,
        page_size_bits: 10,
        memory_size_bits: 12,
        ..KvConfig::default()
    };
    let store = Arc::new(
        KvStore::<u64, u64, _>::new(
            config,
            BrokenDevice {
                broken: Arc::clone(&broken),
            },
        )
        .unwrap(),
    );
    let mut session = store.start_session().unwrap();
    for i in 0..500u64 {
        assert_eq!(session.upsert(i, i), Status::Ok);
    }
    assert!(!store.is_faulted());
}
