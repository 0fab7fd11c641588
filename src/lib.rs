//! stratakv - a concurrent key-value store for datasets larger than memory.
//!
//! The store is organised around a *hybrid log*: an append-only log whose
//! tail lives in memory and is mutable in place, whose middle is in-memory
//! but read-only, and whose head has been flushed to a log device. A
//! lock-free hash index maps key hashes to log addresses, and an epoch
//! protocol lets readers chase those addresses without locks while pages
//! flush and evict underneath them.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use stratakv::device::NullDevice;
//! use stratakv::store::{KvConfig, KvStore};
//!
//! let store = KvStore::<u64, u64, _>::new(KvConfig::default(), NullDevice::new())?;
//! let mut session = store.start_session();
//! session.upsert(7, 42);
//! assert_eq!(session.read(&7).unwrap(), Some(42));
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod checkpoint;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod record;
pub mod scan;
pub mod status;
pub mod store;
mod utility;

pub use address::{Address, AtomicAddress};
pub use record::{Key, Record, RecordHeader, Value};
pub use status::Status;
pub use store::{KvConfig, KvStore, Session};

/// Constants shared across the crate.
pub mod constants {
    /// Size of a cache line in bytes.
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads that may hold epoch slots concurrently.
    pub const MAX_THREADS: usize = 96;

    /// Number of chunks an index snapshot is split into on disk.
    pub const INDEX_SNAPSHOT_CHUNKS: usize = 64;

    /// Default refresh cadence, in operations, suggested to sessions.
    pub const REFRESH_INTERVAL_OPS: u64 = 256;
}
