//! Shared utilities for engine integration tests: seeded catalogs, engine
//! configs with test-friendly timings, and a concurrency-probing responder.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use esgf_fetch::{AuthError, Catalog, Config, Database, Logon, Model, NewTransfer};
use tempfile::TempDir;
use wiremock::{Request, Respond, ResponseTemplate};

/// Logon stub for tests: a credential always exists.
pub struct AlwaysLoggedOn;

#[async_trait::async_trait]
impl Logon for AlwaysLoggedOn {
    fn is_logged_on(&self) -> bool {
        true
    }

    async fn logon(&self, _: &str, _: &str, _: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Creates a file-backed catalog in the temp dir.
pub async fn setup_catalog(temp_dir: &TempDir) -> Catalog {
    let db = Database::new(&temp_dir.path().join("catalog.db"))
        .await
        .expect("create catalog database");
    Catalog::new(db)
}

/// Engine config pointing at the temp dir, with timings scaled down so tests
/// run in seconds: fast metadata polling, near-zero dispatch ramp, short
/// shutdown grace.
pub fn fast_config(temp_dir: &TempDir) -> Config {
    Config {
        credentials_pem: None,
        metadata_poll_interval: Duration::from_millis(200),
        dispatch_ramp: Duration::from_millis(5),
        shutdown_grace: Duration::from_millis(700),
        ..Config::new(
            temp_dir.path().join("catalog.db"),
            temp_dir.path().join("incoming"),
        )
    }
}

/// Base directory downloads land under for a `fast_config`.
#[allow(dead_code)]
pub fn base_path(temp_dir: &TempDir) -> PathBuf {
    temp_dir.path().join("incoming")
}

pub async fn seed_model(catalog: &Catalog, name: &str, datanode: &str) {
    catalog
        .insert_model(&Model {
            name: name.to_string(),
            datanode: datanode.to_string(),
            institute: Some("TEST".to_string()),
        })
        .await
        .expect("insert model");
}

pub async fn seed_transfer(
    catalog: &Catalog,
    model: &str,
    tracking_id: &str,
    checksum: &str,
    location: &str,
    local_image: &str,
) -> i64 {
    catalog
        .insert_transfer(&NewTransfer {
            model,
            tracking_id,
            checksum,
            checksum_type: "MD5",
            location,
            local_image,
            size: None,
            variable: Some("tasmax"),
        })
        .await
        .expect("insert transfer")
}

/// Hex MD5 of a body, for seeding matching checksums.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Responder that tracks how many requests are inside their response window
/// at once.
///
/// Each response is held for `hold` before the body is sent, and the live
/// counter is released exactly when the hold elapses, so the measured window
/// is a subset of the request's true active time: the recorded peak never
/// exceeds the real concurrency, but any burst above a cap shows up in it.
#[allow(dead_code)]
pub struct ConcurrencyProbe {
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    hold: Duration,
    body: Vec<u8>,
}

#[allow(dead_code)]
impl ConcurrencyProbe {
    pub fn new(hold: Duration, body: Vec<u8>) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            hold,
            body,
        }
    }

    /// Highest number of simultaneously held responses observed so far.
    pub fn peak_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }
}

impl Respond for ConcurrencyProbe {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_live, Ordering::SeqCst);

        let live = Arc::clone(&self.live);
        let hold = self.hold;
        std::thread::spawn(move || {
            std::thread::sleep(hold);
            live.fetch_sub(1, Ordering::SeqCst);
        });

        ResponseTemplate::new(200)
            .set_delay(self.hold)
            .set_body_bytes(self.body.clone())
    }
}
