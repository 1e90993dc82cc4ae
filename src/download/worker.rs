//! Per-transfer download task.
//!
//! One worker runs per active transfer: it fetches the remote file with the
//! host session, streams chunks through the serialized writer, keeps a
//! running MD5, and reports everything that happens as events. Workers never
//! touch the catalog and never hold a scheduler reference.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Transfer, TransferTimings};
use crate::session;
use crate::writer::FileWriter;

use super::event::{
    CHECKSUM_MISMATCH_ERROR, EventEnvelope, FILE_CREATION_ERROR, FailureKind, TransferEvent,
    UNSUPPORTED_CHECKSUM_TYPE,
};

/// Samples kept in the rolling chunk-rate window.
const PERF_WINDOW_LEN: usize = 5;

/// Worker state shared with the scheduler.
///
/// The worker writes it as the download progresses; the scheduler reads it
/// at finalization and flips the abort flag during urgent shutdown. The
/// abort mutex also guards the open-for-write critical section so a late
/// abort cannot race a just-opened descriptor.
#[derive(Debug)]
pub struct WorkerState {
    abort: Mutex<bool>,
    data_size: AtomicU64,
    content_length: Mutex<Option<u64>>,
    start_date: Mutex<Option<f64>>,
    end_date: Mutex<Option<f64>>,
    perf_window: Mutex<VecDeque<f64>>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            abort: Mutex::new(false),
            data_size: AtomicU64::new(0),
            content_length: Mutex::new(None),
            start_date: Mutex::new(None),
            end_date: Mutex::new(None),
            perf_window: Mutex::new(VecDeque::with_capacity(PERF_WINDOW_LEN)),
        }
    }

    /// Asks the worker to stop at its next chunk boundary.
    pub fn request_abort(&self) {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn abort_requested(&self) -> bool {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes received so far.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    /// Content-Length the server reported, once known.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        *self
            .content_length
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mean of the rolling chunk-rate window, KiB/s. Input for the cap
    /// adjustment hook.
    #[must_use]
    pub fn avg_chunk_rate(&self) -> Option<f64> {
        let window = self
            .perf_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if window.is_empty() {
            None
        } else {
            Some(window.iter().sum::<f64>() / window.len() as f64)
        }
    }

    /// Timing figures for finalization. `rate` is bytes per second over the
    /// whole transfer, zero when no time elapsed.
    #[must_use]
    pub fn timings(&self) -> TransferTimings {
        let start = self
            .start_date
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(epoch_now);
        let end = self
            .end_date
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(start);
        let duration = end - start;
        let rate = if duration > 0.0 {
            self.data_size() as f64 / duration
        } else {
            0.0
        };
        TransferTimings {
            start_date: start,
            end_date: end,
            duration,
            rate,
        }
    }

    fn mark_start(&self) {
        *self
            .start_date
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(epoch_now());
    }

    fn mark_end(&self) {
        *self.end_date.lock().unwrap_or_else(PoisonError::into_inner) = Some(epoch_now());
    }

    fn set_content_length(&self, length: Option<u64>) {
        *self
            .content_length
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = length;
    }

    fn add_bytes(&self, n: u64) {
        self.data_size.fetch_add(n, Ordering::Relaxed);
    }

    fn push_chunk_rate(&self, kbps: f64) {
        let mut window = self
            .perf_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if window.len() == PERF_WINDOW_LEN {
            window.pop_front();
        }
        window.push_back(kbps);
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Opens the target inside the abort critical section. `Ok(None)` means the
/// abort flag won the race and nothing was opened.
fn open_target(state: &WorkerState, path: &Path) -> std::io::Result<Option<File>> {
    let guard = state.abort.lock().unwrap_or_else(PoisonError::into_inner);
    if *guard {
        return Ok(None);
    }
    File::create(path).map(Some)
}

/// Downloads one transfer. Emits exactly one terminal event
/// (`Done`/`Aborted`/`Error`) before returning.
#[instrument(
    skip(transfer, target, session, writer, events, state),
    fields(transfer_id = transfer.transfer_id, url = %transfer.location)
)]
pub async fn run_download(
    transfer: Transfer,
    target: PathBuf,
    session: Client,
    writer: Arc<FileWriter>,
    events: mpsc::Sender<EventEnvelope>,
    state: Arc<WorkerState>,
) {
    let id = transfer.transfer_id;
    info!(file = %target.display(), "initializing download");
    state.mark_start();

    if !transfer.checksum_type.eq_ignore_ascii_case("md5") {
        state.mark_end();
        send(
            &events,
            id,
            TransferEvent::Error {
                kind: FailureKind::UnsupportedChecksum,
                msg: UNSUPPORTED_CHECKSUM_TYPE.to_string(),
            },
        )
        .await;
        return;
    }

    let mut md5 = md5::Context::new();

    let response = match session::get_checked(&session, &transfer.location).await {
        Ok(response) => response,
        Err(e) => {
            state.mark_end();
            send(
                &events,
                id,
                TransferEvent::Error {
                    kind: FailureKind::Transport,
                    msg: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let length = response.content_length();
    state.set_content_length(length);
    send(&events, id, TransferEvent::Length(length)).await;

    // An existing directory is fine; only real IO failures count.
    if let Some(parent) = target.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, dir = %parent.display(), "cannot create parent directories");
            state.mark_end();
            send(
                &events,
                id,
                TransferEvent::Error {
                    kind: FailureKind::FileCreation,
                    msg: FILE_CREATION_ERROR.to_string(),
                },
            )
            .await;
            return;
        }
    }

    let file = match open_target(&state, &target) {
        Ok(Some(file)) => Arc::new(file),
        Ok(None) => {
            // Abort beat the open; nothing on disk to clean up.
            state.mark_end();
            send(
                &events,
                id,
                TransferEvent::Aborted("shutdown requested".to_string()),
            )
            .await;
            return;
        }
        Err(e) => {
            warn!(error = %e, file = %target.display(), "cannot create target file");
            state.mark_end();
            send(
                &events,
                id,
                TransferEvent::Error {
                    kind: FailureKind::FileCreation,
                    msg: FILE_CREATION_ERROR.to_string(),
                },
            )
            .await;
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut last_tick = Instant::now();
    let abort_reason = loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if writer
                    .enqueue(Arc::clone(&file), chunk.clone())
                    .await
                    .is_err()
                {
                    break Some("writer shut down".to_string());
                }
                md5.consume(&chunk);
                state.add_bytes(chunk.len() as u64);

                let elapsed = last_tick.elapsed().as_secs_f64().max(f64::EPSILON);
                last_tick = Instant::now();
                let kbps = chunk.len() as f64 / 1024.0 / elapsed;
                state.push_chunk_rate(kbps);
                send(&events, id, TransferEvent::Speed(kbps)).await;

                if state.abort_requested() {
                    break Some("shutdown requested".to_string());
                }
            }
            Some(Err(e)) => break Some(format!("stream error: {e}")),
            None => break None,
        }
    };

    if let Some(reason) = abort_reason {
        drop(stream);
        drop(file);
        let _ = tokio::fs::remove_file(&target).await;
        state.mark_end();
        send(&events, id, TransferEvent::Aborted(reason)).await;
        return;
    }

    // Hand the writer the close marker; the ack means every byte we
    // enqueued has been written and the descriptor is closed.
    match writer.enqueue_last(file, Bytes::new()).await {
        Ok(done) => {
            let _ = done.await;
        }
        Err(_) => {
            let _ = tokio::fs::remove_file(&target).await;
            state.mark_end();
            send(
                &events,
                id,
                TransferEvent::Aborted("writer shut down".to_string()),
            )
            .await;
            return;
        }
    }
    state.mark_end();

    let digest = format!("{:x}", md5.finalize());
    if !digest.eq_ignore_ascii_case(&transfer.checksum) {
        warn!(expected = %transfer.checksum, actual = %digest, "checksum mismatch");
        let _ = tokio::fs::remove_file(&target).await;
        send(
            &events,
            id,
            TransferEvent::Error {
                kind: FailureKind::ChecksumMismatch,
                msg: CHECKSUM_MISMATCH_ERROR.to_string(),
            },
        )
        .await;
        return;
    }

    let timings = state.timings();
    send(&events, id, TransferEvent::Done(timings.rate / 1024.0)).await;
}

async fn send(events: &mpsc::Sender<EventEnvelope>, transfer_id: i64, event: TransferEvent) {
    if events
        .send(EventEnvelope { transfer_id, event })
        .await
        .is_err()
    {
        debug!(transfer_id, "event bus closed; dropping event");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stub_transfer(checksum_type: &str) -> Transfer {
        Transfer {
            transfer_id: 7,
            model: "CanCM4".to_string(),
            tracking_id: "t7".to_string(),
            checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            checksum_type: checksum_type.to_string(),
            location: "http://127.0.0.1:1/never-contacted".to_string(),
            local_image: "out.nc".to_string(),
            status_str: "waiting".to_string(),
            error_msg: None,
            start_date: None,
            end_date: None,
            duration: None,
            rate: None,
            size: None,
            variable: None,
            datanode: "node1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unsupported_checksum_type_returns_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.nc");
        let writer = Arc::new(FileWriter::start(4));
        let (tx, mut rx) = mpsc::channel(8);
        let state = Arc::new(WorkerState::new());

        run_download(
            stub_transfer("SHA256"),
            target.clone(),
            Client::new(),
            Arc::clone(&writer),
            tx,
            state,
        )
        .await;

        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            TransferEvent::Error { kind, msg } => {
                assert_eq!(kind, FailureKind::UnsupportedChecksum);
                assert_eq!(msg, UNSUPPORTED_CHECKSUM_TYPE);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        // Early return: no further events, no file touched.
        assert!(rx.try_recv().is_err());
        assert!(!target.exists());
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_lowercase_md5_accepted_past_checksum_gate() {
        // md5 (lowercase) must pass the gate; the subsequent GET against an
        // unroutable address then fails as a transport error.
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.nc");
        let writer = Arc::new(FileWriter::start(4));
        let (tx, mut rx) = mpsc::channel(8);
        let state = Arc::new(WorkerState::new());

        run_download(
            stub_transfer("md5"),
            target,
            Client::new(),
            Arc::clone(&writer),
            tx,
            state,
        )
        .await;

        let envelope = rx.recv().await.unwrap();
        match envelope.event {
            TransferEvent::Error { kind, .. } => assert_eq!(kind, FailureKind::Transport),
            other => panic!("expected transport error, got {other:?}"),
        }
        writer.shutdown().await;
    }

    #[test]
    fn test_perf_window_keeps_last_five_samples() {
        let state = WorkerState::new();
        for kbps in [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0] {
            state.push_chunk_rate(kbps);
        }
        // Window holds 3..=7.
        assert_eq!(state.avg_chunk_rate(), Some(5.0));
    }

    #[test]
    fn test_timings_rate_is_bytes_per_second() {
        let state = WorkerState::new();
        *state.start_date.lock().unwrap() = Some(100.0);
        *state.end_date.lock().unwrap() = Some(110.0);
        state.add_bytes(10 * 1024 * 1024);

        let timings = state.timings();
        assert_eq!(timings.duration, 10.0);
        assert_eq!(timings.rate, 1024.0 * 1024.0);
    }

    #[test]
    fn test_timings_zero_duration_has_zero_rate() {
        let state = WorkerState::new();
        *state.start_date.lock().unwrap() = Some(100.0);
        *state.end_date.lock().unwrap() = Some(100.0);
        state.add_bytes(1024);

        assert_eq!(state.timings().rate, 0.0);
    }
}
