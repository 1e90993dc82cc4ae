//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::session::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};

/// Starting per-host worker cap for each newly sighted data node.
pub const DEFAULT_THREADS_PER_HOST: usize = 3;

/// Global concurrent-worker cap across all hosts.
pub const DEFAULT_MAX_TOTAL_THREADS: usize = 100;

/// Seconds between metadata-reader catalog scans.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Per-dispatch ramp delay, to avoid a thundering herd of fresh sessions.
pub const DEFAULT_DISPATCH_RAMP_MS: u64 = 200;

/// Grace period for workers to observe their abort flag during urgent
/// shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

/// Engine configuration.
///
/// `new()` fills everything except the two required paths with defaults;
/// callers override fields with struct-update syntax.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the catalog database.
    pub database_file: PathBuf,
    /// Root directory downloaded files land under (`base_path/local_image`).
    pub base_path: PathBuf,
    /// Username for credential acquisition.
    pub username: String,
    /// Password for credential acquisition.
    pub password: String,
    /// Host to authenticate against.
    pub auth_server: String,
    /// Starting `max_concurrent` for each new host slot.
    pub initial_threads_per_host: usize,
    /// Global concurrency cap.
    pub max_total_threads: usize,
    /// Client certificate PEM; `None` builds sessions without an identity.
    pub credentials_pem: Option<PathBuf>,
    /// Verify server TLS certificates. Off by default, matching the
    /// federation tooling this replaces.
    pub tls_verify: bool,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
    /// Time between metadata-reader scans for new waiting rows.
    pub metadata_poll_interval: Duration,
    /// Sleep after each worker dispatch.
    pub dispatch_ramp: Duration,
    /// How long urgent shutdown waits for workers to notice their abort flag.
    pub shutdown_grace: Duration,
    /// Exit cleanly once a scan finds no new rows and nothing is in flight.
    /// Turn off to keep polling as a daemon.
    pub exit_when_idle: bool,
}

impl Config {
    /// Creates a configuration with defaults for everything but the two
    /// required paths.
    #[must_use]
    pub fn new(database_file: PathBuf, base_path: PathBuf) -> Self {
        Self {
            database_file,
            base_path,
            username: String::new(),
            password: String::new(),
            auth_server: String::new(),
            initial_threads_per_host: DEFAULT_THREADS_PER_HOST,
            max_total_threads: DEFAULT_MAX_TOTAL_THREADS,
            credentials_pem: default_credentials_path(),
            tls_verify: false,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            metadata_poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            dispatch_ramp: Duration::from_millis(DEFAULT_DISPATCH_RAMP_MS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            exit_when_idle: true,
        }
    }
}

/// `${HOME}/.esg/credentials.pem`, or `None` when HOME is unset.
#[must_use]
pub fn default_credentials_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".esg").join("credentials.pem"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::new(PathBuf::from("catalog.db"), PathBuf::from("/data/incoming"));
        assert_eq!(config.initial_threads_per_host, 3);
        assert_eq!(config.max_total_threads, 100);
        assert!(!config.tls_verify);
        assert!(config.exit_when_idle);
        assert_eq!(config.metadata_poll_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_default_credentials_path_under_home() {
        if let Some(path) = default_credentials_path() {
            assert!(path.ends_with(".esg/credentials.pem"));
        }
    }
}
