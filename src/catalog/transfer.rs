//! Transfer and model row types and status definitions.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting to be dispatched. The initial state, and the state a transfer
    /// is reset to when it is interrupted so the next run retries it.
    Waiting,
    /// Currently being downloaded.
    Running,
    /// Downloaded and checksum-verified.
    Done,
    /// Terminally failed; `error_msg` carries the reason.
    Error,
}

impl TransferStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid transfer status: {s}")),
        }
    }
}

/// One remote file to fetch, as read from the catalog joined with its model.
///
/// Rows are snapshots: the engine works from the copy it read and writes
/// status transitions back by `transfer_id`.
#[derive(Debug, Clone, FromRow)]
pub struct Transfer {
    /// Monotonic primary key; the metadata reader's watermark.
    pub transfer_id: i64,
    /// Owning model name (foreign key into `model`).
    pub model: String,
    /// Opaque upstream identifier, unique across the federation.
    pub tracking_id: String,
    /// Expected checksum, hex.
    pub checksum: String,
    /// Checksum algorithm name. Only MD5 is supported; anything else fails
    /// the transfer.
    pub checksum_type: String,
    /// Absolute HTTP(S) source URL.
    pub location: String,
    /// Target path relative to the configured base directory.
    pub local_image: String,
    /// Current lifecycle status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Failure reason for `error` rows.
    pub error_msg: Option<String>,
    /// Download start, seconds since the Unix epoch.
    pub start_date: Option<f64>,
    /// Download end, seconds since the Unix epoch.
    pub end_date: Option<f64>,
    /// `end_date - start_date`, seconds.
    pub duration: Option<f64>,
    /// Bytes received per second over the whole transfer.
    pub rate: Option<f64>,
    /// Expected file size in bytes, when the pipeline recorded one.
    pub size: Option<i64>,
    /// Climate variable carried by the file (pipeline metadata).
    pub variable: Option<String>,
    /// Source host, from the joined model row. The unit of per-host
    /// concurrency.
    pub datanode: String,
}

impl Transfer {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Waiting` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.status_str.parse().unwrap_or(TransferStatus::Waiting)
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {{ id: {}, location: {}, status: {} }}",
            self.transfer_id,
            self.location,
            self.status()
        )
    }
}

/// A model row: coarse grouping of transfers by institute/model/data node.
/// Read-only to the engine.
#[derive(Debug, Clone, FromRow)]
pub struct Model {
    /// Model name, primary key.
    pub name: String,
    /// Hostname of the serving data node.
    pub datanode: String,
    /// Originating institute.
    pub institute: Option<String>,
}

/// Fields for inserting a new waiting transfer (the metadata pipeline seam).
#[derive(Debug, Clone)]
pub struct NewTransfer<'a> {
    pub model: &'a str,
    pub tracking_id: &'a str,
    pub checksum: &'a str,
    pub checksum_type: &'a str,
    pub location: &'a str,
    pub local_image: &'a str,
    pub size: Option<i64>,
    pub variable: Option<&'a str>,
}

/// Timing figures computed at finalization and stamped on terminal rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferTimings {
    /// Seconds since the Unix epoch.
    pub start_date: f64,
    /// Seconds since the Unix epoch.
    pub end_date: f64,
    /// `end_date - start_date`, seconds.
    pub duration: f64,
    /// Bytes per second over the whole transfer; 0 when duration is 0.
    pub rate: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_status_as_str() {
        assert_eq!(TransferStatus::Waiting.as_str(), "waiting");
        assert_eq!(TransferStatus::Running.as_str(), "running");
        assert_eq!(TransferStatus::Done.as_str(), "done");
        assert_eq!(TransferStatus::Error.as_str(), "error");
    }

    #[test]
    fn test_transfer_status_round_trip() {
        for status in [
            TransferStatus::Waiting,
            TransferStatus::Running,
            TransferStatus::Done,
            TransferStatus::Error,
        ] {
            let parsed: TransferStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_transfer_status_invalid_string_rejected() {
        let result: Result<TransferStatus, _> = "pending".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_transfer_status_display_matches_as_str() {
        assert_eq!(TransferStatus::Done.to_string(), "done");
    }
}
