//! Worker-to-scheduler events.
//!
//! Workers never touch the catalog or the scheduler directly: everything
//! they have to say travels through one bounded queue as a tagged event, and
//! the scheduler reflects it back into the catalog.

use std::fmt;

/// Capacity of the event bus. Workers block on a full bus, so this bounds
/// scheduler lag rather than dropping events.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Catalog error text for a checksum algorithm the engine cannot verify.
pub const UNSUPPORTED_CHECKSUM_TYPE: &str = "UNSUPPORTED_CHECKSUM_TYPE";

/// Catalog error text for a target file that could not be created.
pub const FILE_CREATION_ERROR: &str = "FILE_CREATION_ERROR";

/// Catalog error text for a completed download whose MD5 did not match.
pub const CHECKSUM_MISMATCH_ERROR: &str = "CHECKSUM_MISMATCH_ERROR";

/// Classification of terminal failures, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The catalog row asked for a checksum algorithm other than MD5.
    UnsupportedChecksum,
    /// The GET failed: connection, status, redirects, timeout.
    Transport,
    /// The target file could not be created.
    FileCreation,
    /// The downloaded bytes did not hash to the expected checksum.
    ChecksumMismatch,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UnsupportedChecksum => "unsupported_checksum",
            Self::Transport => "transport",
            Self::FileCreation => "file_creation",
            Self::ChecksumMismatch => "checksum_mismatch",
        };
        write!(f, "{label}")
    }
}

/// One worker event.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The GET succeeded; payload is the Content-Length when the server sent
    /// one.
    Length(Option<u64>),
    /// Instantaneous rate for the last chunk, KiB/s. Logged, never persisted.
    Speed(f64),
    /// Download complete and checksum verified; payload is the average rate
    /// in KiB/s.
    Done(f64),
    /// The worker stopped cooperatively or mid-stream; the transfer goes
    /// back to `waiting` for the next pass.
    Aborted(String),
    /// Terminal failure; `msg` is recorded as the row's `error_msg`.
    Error { kind: FailureKind, msg: String },
}

/// An event stamped with the transfer it belongs to.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub transfer_id: i64,
    pub event: TransferEvent,
}
