//! The download engine.
//!
//! One scheduler task owns all engine state: it pulls waiting rows from the
//! metadata reader, dispatches workers subject to per-host and global caps,
//! drains the event bus, and reflects outcomes back into the catalog.
//! Workers talk to it only through the event bus; it talks to workers only
//! through their shared state and join handles.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::auth::{AuthError, Logon};
use crate::catalog::{Catalog, CatalogError, Transfer};
use crate::config::Config;
use crate::session::{SessionError, SessionFactory};
use crate::writer::FileWriter;

use super::event::{EVENT_QUEUE_CAPACITY, EventEnvelope, TransferEvent};
use super::host::HostSlot;
use super::worker::{self, WorkerState};

/// Dispatch-loop tick.
const TICK: Duration = Duration::from_millis(100);

/// Fatal engine failures. Per-transfer failures never appear here; they are
/// recorded in the catalog and the engine keeps going.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Could not establish a usable credential at startup.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Could not build authenticated sessions.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The catalog rejected a read or write.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// A concurrency cap was configured as zero.
    #[error("invalid concurrency value {value}: must be at least 1")]
    InvalidConcurrency {
        /// The offending value.
        value: usize,
    },
}

/// Cancellation token threaded through the engine.
///
/// The signal installer (or a test) calls [`request_stop`]; the scheduler
/// and the metadata reader poll it. `urgent` is the SIGTERM path: abort
/// in-flight workers and reset their rows instead of draining.
///
/// [`request_stop`]: ShutdownHandle::request_stop
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    stop_now: Arc<AtomicBool>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            stop_now: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stops the engine. With `urgent`, in-flight transfers are aborted and
    /// reset to `waiting`; otherwise the engine drains them first.
    pub fn request_stop(&self, urgent: bool) {
        if urgent {
            self.stop_now.store(true, Ordering::SeqCst);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_now(&self) -> bool {
        self.stop_now.load(Ordering::SeqCst)
    }
}

/// The bulk downloader.
///
/// # Example
///
/// ```no_run
/// use std::path::PathBuf;
/// use std::sync::Arc;
/// use esgf_fetch::{Catalog, Config, CredentialFile, Database, Downloader};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::new(PathBuf::from("synchro_data.db"), PathBuf::from("/data/incoming"));
/// let db = Database::new(&config.database_file).await?;
/// let logon = Arc::new(CredentialFile::new(PathBuf::from("/home/user/.esg/credentials.pem")));
/// let downloader = Downloader::new(config, Catalog::new(db), logon)?;
/// downloader.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Downloader {
    config: Config,
    catalog: Catalog,
    logon: Arc<dyn Logon>,
    shutdown: ShutdownHandle,
}

impl Downloader {
    /// Creates the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if either cap is zero.
    pub fn new(
        config: Config,
        catalog: Catalog,
        logon: Arc<dyn Logon>,
    ) -> Result<Self, EngineError> {
        for value in [config.initial_threads_per_host, config.max_total_threads] {
            if value == 0 {
                return Err(EngineError::InvalidConcurrency { value });
            }
        }
        Ok(Self {
            config,
            catalog,
            logon,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Returns the handle the signal installer (or a test) uses to stop this
    /// engine.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the engine until the backlog drains or a stop is requested.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Auth`] / [`EngineError::Session`] for startup
    /// failures and [`EngineError::Catalog`] when a store failure forced the
    /// engine down. Per-transfer failures are recorded in the catalog, not
    /// returned.
    #[instrument(skip(self), fields(database = %self.config.database_file.display()))]
    pub async fn run(&self) -> Result<(), EngineError> {
        let writer = Arc::new(FileWriter::start(2 * self.config.max_total_threads));

        if let Err(e) = self.ensure_logged_on().await {
            writer.shutdown().await;
            return Err(e.into());
        }

        let sessions = match SessionFactory::from_config(&self.config) {
            Ok(factory) => factory,
            Err(e) => {
                writer.shutdown().await;
                return Err(e.into());
            }
        };
        // Probe once so a bad certificate fails startup, not the first host.
        if let Err(e) = sessions.make_session() {
            writer.shutdown().await;
            return Err(e.into());
        }

        let (meta_tx, meta_rx) = mpsc::channel(8);
        let reader = tokio::spawn(metadata_reader(
            self.catalog.clone(),
            self.config.metadata_poll_interval,
            self.shutdown.clone(),
            meta_tx,
        ));

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let mut engine = Engine {
            config: &self.config,
            catalog: self.catalog.clone(),
            shutdown: self.shutdown.clone(),
            sessions,
            writer,
            meta_rx,
            event_rx,
            event_tx,
            hosts: HashMap::new(),
            host_order: Vec::new(),
            rr_cursor: 0,
            active: HashMap::new(),
            in_flight_total: 0,
            scans_seen: false,
            last_scan_empty: false,
            fatal: None,
            shutting_down: false,
        };

        let result = engine.run_loop().await;

        if let Err(e) = reader.await {
            warn!(error = %e, "metadata reader panicked");
        }

        result
    }

    async fn ensure_logged_on(&self) -> Result<(), AuthError> {
        if self.logon.is_logged_on() {
            debug!("already logged on");
            return Ok(());
        }
        info!(auth_server = %self.config.auth_server, "acquiring credentials");
        self.logon
            .logon(
                &self.config.username,
                &self.config.password,
                &self.config.auth_server,
            )
            .await?;
        if self.logon.is_logged_on() {
            Ok(())
        } else {
            Err(AuthError::NoAuth)
        }
    }
}

/// Scans the catalog for new waiting rows and feeds them to the scheduler,
/// one batch per scan (empty scans included, so the scheduler can tell an
/// exhausted backlog from a scan that has not happened yet).
///
/// The watermark advances over `transfer_id`s only: rows an operator resets
/// back to `waiting` behind the watermark are not rediscovered within this
/// run. Restarting the engine picks them up.
async fn metadata_reader(
    catalog: Catalog,
    interval: Duration,
    shutdown: ShutdownHandle,
    tx: mpsc::Sender<Vec<Transfer>>,
) {
    let mut last_seen = 0i64;
    while shutdown.is_running() {
        match catalog.list_new_waiting(last_seen).await {
            Ok(rows) => {
                if let Some(max_id) = rows.iter().map(|t| t.transfer_id).max() {
                    last_seen = max_id;
                }
                debug!(count = rows.len(), last_seen, "metadata scan");
                if tx.send(rows).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "catalog read failed; stopping engine");
                shutdown.request_stop(false);
                break;
            }
        }

        // Sleep in short slices so a stop request is observed promptly.
        let deadline = Instant::now() + interval;
        while shutdown.is_running() && Instant::now() < deadline {
            sleep(Duration::from_millis(250).min(interval)).await;
        }
    }
    debug!("metadata reader exiting");
}

/// How a transfer left the active map.
enum Terminal {
    Done,
    Waiting,
    Error(String),
}

struct ActiveTransfer {
    transfer: Transfer,
    target: PathBuf,
    state: Arc<WorkerState>,
    join: JoinHandle<()>,
}

/// All mutable engine state, owned by the scheduler task for the duration
/// of one `run()`.
struct Engine<'a> {
    config: &'a Config,
    catalog: Catalog,
    shutdown: ShutdownHandle,
    sessions: SessionFactory,
    writer: Arc<FileWriter>,
    meta_rx: mpsc::Receiver<Vec<Transfer>>,
    event_rx: mpsc::Receiver<EventEnvelope>,
    event_tx: mpsc::Sender<EventEnvelope>,
    hosts: HashMap<String, HostSlot>,
    host_order: Vec<String>,
    rr_cursor: usize,
    active: HashMap<i64, ActiveTransfer>,
    in_flight_total: usize,
    scans_seen: bool,
    last_scan_empty: bool,
    fatal: Option<CatalogError>,
    shutting_down: bool,
}

impl Engine<'_> {
    async fn run_loop(&mut self) -> Result<(), EngineError> {
        info!(
            threads_per_host = self.config.initial_threads_per_host,
            max_total = self.config.max_total_threads,
            "engine running"
        );

        while self.shutdown.is_running() {
            self.drain_metadata();
            self.dispatch().await;
            self.adjust_host_caps();
            self.drain_events(false).await;

            if self.idle() {
                info!("backlog drained; exiting");
                self.shutdown.request_stop(false);
                break;
            }
            sleep(TICK).await;
        }

        if self.shutdown.stop_now() {
            self.urgent_shutdown().await;
        } else {
            self.quiescent_drain().await;
        }

        match self.fatal.take() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// A catalog failure outside shutdown forces the engine down urgently.
    fn record_fatal(&mut self, error: CatalogError) {
        error!(error = %error, "fatal catalog failure; forcing shutdown");
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        if !self.shutting_down {
            self.shutting_down = true;
            self.shutdown.request_stop(true);
        }
    }

    /// Moves newly scanned transfers into their host slots, creating slots
    /// on first sighting of a data node.
    fn drain_metadata(&mut self) {
        while let Ok(batch) = self.meta_rx.try_recv() {
            self.scans_seen = true;
            self.last_scan_empty = batch.is_empty();
            for transfer in batch {
                let datanode = transfer.datanode.clone();
                if !self.hosts.contains_key(&datanode) {
                    match self.sessions.make_session() {
                        Ok(session) => {
                            info!(%datanode, "new host sighted");
                            self.hosts.insert(
                                datanode.clone(),
                                HostSlot::new(
                                    datanode.clone(),
                                    self.config.initial_threads_per_host,
                                    session,
                                ),
                            );
                            self.host_order.push(datanode.clone());
                        }
                        Err(e) => {
                            error!(%datanode, error = %e, "cannot build session; leaving transfers waiting");
                            continue;
                        }
                    }
                }
                if let Some(host) = self.hosts.get_mut(&datanode) {
                    debug!(
                        transfer_id = transfer.transfer_id,
                        %datanode,
                        "queued transfer"
                    );
                    host.pending.push_back(transfer);
                }
            }
        }
    }

    /// Starts workers round-robin across hosts, up to the per-host and
    /// global caps, with a short ramp sleep after each start.
    async fn dispatch(&mut self) {
        if self.host_order.is_empty() {
            return;
        }
        let host_count = self.host_order.len();
        for offset in 0..host_count {
            if !self.shutdown.is_running() {
                return;
            }
            let key = self.host_order[(self.rr_cursor + offset) % host_count].clone();
            loop {
                let Some(host) = self.hosts.get_mut(&key) else {
                    break;
                };
                if host.pending.is_empty()
                    || !host.has_capacity()
                    || self.in_flight_total >= self.config.max_total_threads
                {
                    break;
                }
                let Some(transfer) = host.pending.pop_front() else {
                    break;
                };
                let session = host.session.clone();
                host.in_flight += 1;
                self.in_flight_total += 1;

                let id = transfer.transfer_id;
                match self.catalog.mark_running(id).await {
                    Ok(()) => {}
                    Err(CatalogError::TransferNotFound(_)) => {
                        warn!(transfer_id = id, "row vanished before dispatch; skipping");
                        self.undo_dispatch_counters(&key);
                        continue;
                    }
                    Err(e) => {
                        self.undo_dispatch_counters(&key);
                        self.record_fatal(e);
                        return;
                    }
                }

                let state = Arc::new(WorkerState::new());
                let target = self.config.base_path.join(&transfer.local_image);
                debug!(transfer_id = id, url = %transfer.location, "starting worker");
                let join = tokio::spawn(worker::run_download(
                    transfer.clone(),
                    target.clone(),
                    session,
                    Arc::clone(&self.writer),
                    self.event_tx.clone(),
                    Arc::clone(&state),
                ));
                self.active.insert(
                    id,
                    ActiveTransfer {
                        transfer,
                        target,
                        state,
                        join,
                    },
                );

                // Keep the bus moving while ramping up.
                self.drain_events(false).await;
                if self.shutting_down {
                    return;
                }
                sleep(self.config.dispatch_ramp).await;
            }
        }
        self.rr_cursor = (self.rr_cursor + 1) % host_count;
    }

    fn undo_dispatch_counters(&mut self, datanode: &str) {
        if let Some(host) = self.hosts.get_mut(datanode) {
            host.in_flight = host.in_flight.saturating_sub(1);
        }
        self.in_flight_total = self.in_flight_total.saturating_sub(1);
    }

    /// Hook for dynamic per-host cap adjustment. Worker states keep a
    /// rolling chunk-rate window for this to consume.
    /// TODO: raise or lower `HostSlot::max_concurrent` from those windows.
    fn adjust_host_caps(&mut self) {}

    /// Applies every event currently on the bus without blocking.
    async fn drain_events(&mut self, during_shutdown: bool) {
        while let Ok(envelope) = self.event_rx.try_recv() {
            self.apply_event(envelope, during_shutdown).await;
        }
    }

    async fn apply_event(&mut self, envelope: EventEnvelope, during_shutdown: bool) {
        let id = envelope.transfer_id;
        match envelope.event {
            TransferEvent::Speed(kbps) => {
                trace!(transfer_id = id, kbps, "chunk rate");
            }
            TransferEvent::Length(length) => {
                if let Some(active) = self.active.get(&id) {
                    info!(
                        transfer_id = id,
                        content_length = length,
                        file = %active.target.display(),
                        "download started"
                    );
                }
            }
            TransferEvent::Done(avg_kbps) => {
                info!(transfer_id = id, avg_kbps, "transfer complete");
                self.finalize(id, Terminal::Done, during_shutdown).await;
            }
            TransferEvent::Aborted(reason) => {
                warn!(transfer_id = id, %reason, "transfer aborted; will retry next pass");
                self.finalize(id, Terminal::Waiting, during_shutdown).await;
            }
            TransferEvent::Error { kind, msg } => {
                warn!(transfer_id = id, %kind, %msg, "transfer failed");
                self.finalize(id, Terminal::Error(msg), during_shutdown)
                    .await;
            }
        }
    }

    /// Retires a transfer: join the worker, release its host and global
    /// slots, and write the terminal status with the worker's timings.
    async fn finalize(&mut self, id: i64, terminal: Terminal, during_shutdown: bool) {
        let Some(active) = self.active.remove(&id) else {
            warn!(transfer_id = id, "terminal event for unknown transfer");
            return;
        };

        // The terminal event is the worker's last word; join it before the
        // catalog write so the row never goes terminal with the task alive.
        if let Err(e) = active.join.await {
            warn!(transfer_id = id, error = %e, "worker task panicked");
        }

        if let Some(host) = self.hosts.get_mut(&active.transfer.datanode) {
            host.in_flight = host.in_flight.saturating_sub(1);
        }
        self.in_flight_total = self.in_flight_total.saturating_sub(1);

        let timings = active.state.timings();
        let result = match &terminal {
            Terminal::Done => self.catalog.mark_done(id, &timings).await,
            Terminal::Waiting => self.catalog.mark_waiting(id).await,
            Terminal::Error(msg) => self.catalog.mark_error(id, msg, &timings).await,
        };
        if let Err(e) = result {
            if during_shutdown {
                warn!(transfer_id = id, error = %e, "catalog update failed during shutdown");
            } else {
                self.record_fatal(e);
            }
        }
    }

    /// Whether the engine may exit: at least one scan has completed, the
    /// last one found nothing, and no work is queued or in flight.
    fn idle(&self) -> bool {
        self.config.exit_when_idle
            && self.scans_seen
            && self.last_scan_empty
            && self.in_flight_total == 0
            && self.active.is_empty()
            && self.hosts.values().all(|host| host.pending.is_empty())
    }

    /// SIGTERM path: drain the writer, abort workers, reset their rows, wait
    /// a bounded grace period, then remove leftover partial files.
    async fn urgent_shutdown(&mut self) {
        info!(active = self.active.len(), "urgent shutdown");
        self.writer.shutdown().await;

        // Transfers that finished before the signal stay finished.
        self.drain_events(true).await;

        let ids: Vec<i64> = self.active.keys().copied().collect();
        for id in ids {
            if let Some(active) = self.active.get(&id) {
                active.state.request_abort();
            }
            if let Err(e) = self.catalog.mark_waiting(id).await {
                warn!(transfer_id = id, error = %e, "could not reset transfer to waiting");
            }
        }

        // Bounded window for workers to observe the flag; keep applying
        // their farewell events so the bus never wedges them.
        let deadline = Instant::now() + self.config.shutdown_grace;
        while Instant::now() < deadline && !self.active.is_empty() {
            self.drain_events(true).await;
            sleep(Duration::from_millis(100)).await;
        }

        // No forced kill; whatever is still running loses its partial file
        // and its row is already back to waiting.
        for (id, active) in self.active.drain() {
            debug!(transfer_id = id, file = %active.target.display(), "removing partial file");
            let _ = tokio::fs::remove_file(&active.target).await;
        }
        self.in_flight_total = 0;
        for host in self.hosts.values_mut() {
            host.in_flight = 0;
        }
    }

    /// Non-urgent path: let in-flight transfers finish, then stop the
    /// writer.
    async fn quiescent_drain(&mut self) {
        info!(active = self.active.len(), "draining in-flight transfers");
        while !self.active.is_empty() {
            let received = timeout(Duration::from_millis(250), self.event_rx.recv()).await;
            match received {
                Ok(Some(envelope)) => self.apply_event(envelope, true).await,
                Ok(None) => break,
                Err(_) => {}
            }
        }
        self.writer.shutdown().await;
    }
}
