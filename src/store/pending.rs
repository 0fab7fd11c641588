//! Background record reads for operations that fell below the head.
//!
//! A single worker thread owns a small runtime and services read requests
//! from every session; completions are routed back to the issuing session's
//! epoch slot. Requests are deduplicated per (slot, serial), not address:
//! two sessions may legitimately read the same record concurrently.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::address::Address;
use crate::device::StorageDevice;

pub(crate) struct ReadRequest {
    pub slot: usize,
    pub generation: u64,
    pub serial: u64,
    pub address: Address,
    pub len: usize,
}

pub(crate) struct ReadCompletion {
    pub generation: u64,
    pub serial: u64,
    pub address: Address,
    pub result: io::Result<Vec<u8>>,
}

enum IoMsg {
    Read(ReadRequest),
    Shutdown,
}

/// Store-wide pending-read service.
pub(crate) struct PendingIo<D: StorageDevice> {
    tx: Sender<IoMsg>,
    completions: Arc<Mutex<HashMap<usize, Vec<ReadCompletion>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    _marker: std::marker::PhantomData<D>,
}

impl<D: StorageDevice> PendingIo<D> {
    pub(crate) fn new(device: Arc<D>) -> Self {
        let (tx, rx) = unbounded::<IoMsg>();
        let completions: Arc<Mutex<HashMap<usize, Vec<ReadCompletion>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::clone(&completions);
        let worker = thread::Builder::new()
            .name("stratakv-io".into())
            .spawn(move || worker_loop(device, rx, sink))
            .expect("spawn io worker");
        Self {
            tx,
            completions,
            worker: Mutex::new(Some(worker)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Queue a record read. Returns false if the worker is gone (store
    /// shutting down or faulted).
    pub(crate) fn submit(&self, request: ReadRequest) -> bool {
        self.tx.send(IoMsg::Read(request)).is_ok()
    }

    /// Take every completion routed to `slot` whose generation matches the
    /// current occupant. Stale-generation completions are dropped.
    pub(crate) fn drain(&self, slot: usize, generation: u64) -> Vec<ReadCompletion> {
        let mut map = self.completions.lock();
        match map.remove(&slot) {
            Some(list) => list
                .into_iter()
                .filter(|c| c.generation == generation)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl<D: StorageDevice> Drop for PendingIo<D> {
    fn drop(&mut self) {
        let _ = self.tx.send(IoMsg::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<D: StorageDevice>(
    device: Arc<D>,
    rx: Receiver<IoMsg>,
    sink: Arc<Mutex<HashMap<usize, Vec<ReadCompletion>>>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!("pending-io worker could not start a runtime: {e}");
            return;
        }
    };

    while let Ok(msg) = rx.recv() {
        let request = match msg {
            IoMsg::Read(r) => r,
            IoMsg::Shutdown => break,
        };
        let mut buf = vec![0u8; request.len];
        let result = rt.block_on(async {
            let n = device.read(request.address.raw(), &mut buf).await?;
            if n != request.len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short record read: wanted {}, got {n}", request.len),
                ));
            }
            Ok(buf)
        });
        sink.lock()
            .entry(request.slot)
            .or_default()
            .push(ReadCompletion {
                generation: request.generation,
                serial: request.serial,
                address: request.address,
                result,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FileDevice;

    #[test]
    fn read_round_trips_through_worker() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FileDevice::open(dir.path().join("log.dat")).unwrap());
        crate::device::SyncStorageDevice::write_at(&*device, 64, b"pending bytes").unwrap();

        let io = PendingIo::new(Arc::clone(&device));
        assert!(io.submit(ReadRequest {
            slot: 3,
            generation: 9,
            serial: 1,
            address: Address::from_raw(64),
            len: 13,
        }));

        let completions = loop {
            let got = io.drain(3, 9);
            if !got.is_empty() {
                break got;
            }
            std::thread::yield_now();
        };
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].serial, 1);
        assert_eq!(completions[0].result.as_ref().unwrap(), b"pending bytes");
    }

    #[test]
    fn stale_generation_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FileDevice::open(dir.path().join("log.dat")).unwrap());
        crate::device::SyncStorageDevice::write_at(&*device, 0, &[0u8; 8]).unwrap();

        let io = PendingIo::new(device);
        io.submit(ReadRequest {
            slot: 0,
            generation: 1,
            serial: 1,
            address: Address::from_raw(0),
            len: 8,
        });
        // Wait for the completion to land, then drain with a newer
        // generation: the stale completion must not surface.
        while io.completions.lock().get(&0).map_or(0, |v| v.len()) == 0 {
            std::thread::yield_now();
        }
        assert!(io.drain(0, 2).is_empty());
        assert!(io.completions.lock().get(&0).is_none());
    }
}
