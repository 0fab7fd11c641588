//! Background page flushing.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::device::StorageDevice;
use crate::hlog::LogInner;

pub(crate) enum FlushMsg {
    Page { page: u32, bytes: Vec<u8> },
    Shutdown,
}

/// Owns the flush worker thread and its submission channel.
pub(crate) struct FlushWorker {
    tx: Sender<FlushMsg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlushWorker {
    const MAX_ATTEMPTS: u32 = 5;

    pub(crate) fn spawn<D: StorageDevice>(inner: Arc<LogInner<D>>) -> (Self, Sender<FlushMsg>) {
        let (tx, rx) = unbounded::<FlushMsg>();
        let handle = thread::Builder::new()
            .name("stratakv-flush".into())
            .spawn(move || worker_loop(inner, rx))
            .expect("spawn flush worker");
        let worker = Self {
            tx: tx.clone(),
            handle: Mutex::new(Some(handle)),
        };
        (worker, tx)
    }

    pub(crate) fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.tx.send(FlushMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<D: StorageDevice>(inner: Arc<LogInner<D>>, rx: Receiver<FlushMsg>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("flush worker could not start a runtime: {e}");
            inner.fault();
            return;
        }
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            FlushMsg::Page { page, bytes } => {
                let ok = rt.block_on(write_with_retries(&inner, page, &bytes));
                if ok {
                    inner.note_page_flushed(page);
                } else {
                    inner.fault();
                }
                inner.note_flush_retired();
            }
            FlushMsg::Shutdown => break,
        }
    }
}

async fn write_with_retries<D: StorageDevice>(
    inner: &LogInner<D>,
    page: u32,
    bytes: &[u8],
) -> bool {
    let offset = crate::address::Address::new(page, 0).raw();
    let mut backoff = Duration::from_millis(1);
    for attempt in 1..=FlushWorker::MAX_ATTEMPTS {
        match inner.device().write(offset, bytes).await {
            Ok(written) if written == bytes.len() => {
                debug!(page, "page flushed");
                return true;
            }
            Ok(written) => {
                warn!(page, written, expected = bytes.len(), "short page write");
            }
            Err(e) => {
                warn!(page, attempt, "page flush failed: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff *= 2;
    }
    error!(page, "page flush failed after retries; faulting store");
    false
}
