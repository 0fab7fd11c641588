//! Status codes returned by store operations.

use std::fmt;

/// Public status of a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// The operation completed.
    #[default]
    Ok = 0,
    /// The operation went asynchronous; the result arrives through
    /// `Session::complete_pending`.
    Pending = 1,
    /// The key does not exist (or its newest record is a tombstone).
    NotFound = 2,
    /// The in-memory buffer is full; the caller must refresh its epoch so
    /// boundary shifts can progress, then retry.
    NeedsRefresh = 3,
    /// An allocation failed.
    OutOfMemory = 4,
    /// A device read or write failed beyond the retry budget.
    IoError = 5,
    /// Persistent metadata failed validation.
    Corruption = 6,
    /// The operation lost a race and was not retried.
    Aborted = 7,
    /// A bucket chain could not accept another entry.
    IndexSaturated = 8,
    /// The store hit a fatal error earlier; all operations now fail.
    StoreFaulted = 9,
    /// More threads than epoch slots tried to use the store.
    TooManyThreads = 10,
    /// A session was disposed while operations were still in flight and
    /// the last completion call was a non-blocking poll.
    PendingOnClose = 11,
}

impl Status {
    /// The operation completed successfully.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// The operation is waiting on device I/O.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Statuses that indicate a hard failure rather than a logical outcome.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory
                | Status::IoError
                | Status::Corruption
                | Status::IndexSaturated
                | Status::StoreFaulted
        )
    }

    /// Short name for logs and assertions.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::NeedsRefresh => "NeedsRefresh",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::IndexSaturated => "IndexSaturated",
            Status::StoreFaulted => "StoreFaulted",
            Status::TooManyThreads => "TooManyThreads",
            Status::PendingOnClose => "PendingOnClose",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Status::Ok.is_ok());
        assert!(Status::Pending.is_pending());
        assert!(!Status::NotFound.is_fatal());
        assert!(Status::IoError.is_fatal());
        assert!(Status::StoreFaulted.is_fatal());
        assert!(!Status::NeedsRefresh.is_fatal());
    }

    #[test]
    fn display_matches_name() {
        assert_eq!(Status::NeedsRefresh.to_string(), "NeedsRefresh");
        assert_eq!(Status::PendingOnClose.to_string(), "PendingOnClose");
    }
}
