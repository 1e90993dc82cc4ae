//! Serialized file writer.
//!
//! Many transfers stream concurrently, but only one of them touches the disk
//! at a time: every worker enqueues its chunks here, and a single consumer
//! drains them in arrival order. The goal is to keep filesystem thrash to a
//! minimum while downloading.
//!
//! The queue is bounded; producers waiting for space is the only mechanism
//! pacing aggregate download speed against disk speed.
//!
//! Ordering: for any single file, chunks reach the disk in the order they
//! were enqueued (one worker owns a file, and the queue is FIFO). Nothing is
//! promised across distinct files.

use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The writer consumer has exited; no further chunks can be written.
#[derive(Debug, Error)]
#[error("writer is shut down")]
pub struct WriterClosed;

enum WriteRecord {
    Chunk {
        file: Arc<File>,
        bytes: Bytes,
        /// Close the file after this write and acknowledge on `done`.
        done: Option<oneshot::Sender<()>>,
    },
    Shutdown,
}

/// Single-consumer write serializer shared by all download workers.
pub struct FileWriter {
    tx: mpsc::Sender<WriteRecord>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl FileWriter {
    /// Starts the writer with a queue bounded at `max_queue_len` records.
    #[must_use]
    pub fn start(max_queue_len: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_queue_len.max(1));
        debug!(max_queue_len, "writer starting");
        let consumer = tokio::task::spawn_blocking(move || drain(rx));
        Self {
            tx,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Enqueues one chunk for `file`, waiting while the queue is full.
    ///
    /// The caller must not write to `file` itself after the first enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`WriterClosed`] if the writer has shut down.
    pub async fn enqueue(&self, file: Arc<File>, bytes: Bytes) -> Result<(), WriterClosed> {
        self.tx
            .send(WriteRecord::Chunk {
                file,
                bytes,
                done: None,
            })
            .await
            .map_err(|_| WriterClosed)
    }

    /// Enqueues the final chunk for `file`. The writer closes the file after
    /// writing it and signals the returned receiver, so the caller can
    /// observe that every byte it enqueued has been handed to the OS.
    ///
    /// # Errors
    ///
    /// Returns [`WriterClosed`] if the writer has shut down.
    pub async fn enqueue_last(
        &self,
        file: Arc<File>,
        bytes: Bytes,
    ) -> Result<oneshot::Receiver<()>, WriterClosed> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriteRecord::Chunk {
                file,
                bytes,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| WriterClosed)?;
        Ok(done_rx)
    }

    /// Drains everything already queued, then stops the consumer.
    ///
    /// The stop marker travels through the same FIFO queue as the data, so
    /// every record enqueued before this call is written first. Later
    /// enqueues fail with [`WriterClosed`].
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriteRecord::Shutdown).await;
        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "writer consumer panicked");
            }
        }
        debug!("writer exited");
    }
}

/// Consumer loop. Runs on a blocking thread; write errors are logged and do
/// not stop the drain (the owning worker detects corruption by checksum).
fn drain(mut rx: mpsc::Receiver<WriteRecord>) {
    while let Some(record) = rx.blocking_recv() {
        match record {
            WriteRecord::Chunk { file, bytes, done } => {
                if let Err(e) = (&*file).write_all(&bytes) {
                    error!(error = %e, "write failed");
                }
                if let Some(done) = done {
                    // Closing: this clone is the last strong handle by
                    // contract, the worker dropped its own before waiting.
                    drop(file);
                    let _ = done.send(());
                }
            }
            WriteRecord::Shutdown => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_target(dir: &tempfile::TempDir, name: &str) -> (Arc<File>, std::path::PathBuf) {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        (Arc::new(file), path)
    }

    #[tokio::test]
    async fn test_writes_appear_in_enqueue_order_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::start(16);
        let (a, a_path) = open_target(&dir, "a.bin");
        let (b, b_path) = open_target(&dir, "b.bin");

        // Interleave two files through the one queue.
        writer.enqueue(Arc::clone(&a), Bytes::from_static(b"a1")).await.unwrap();
        writer.enqueue(Arc::clone(&b), Bytes::from_static(b"b1")).await.unwrap();
        writer.enqueue(Arc::clone(&a), Bytes::from_static(b"a2")).await.unwrap();
        writer.enqueue(Arc::clone(&b), Bytes::from_static(b"b2")).await.unwrap();
        let a_done = writer.enqueue_last(a, Bytes::from_static(b"a3")).await.unwrap();
        let b_done = writer.enqueue_last(b, Bytes::new()).await.unwrap();
        a_done.await.unwrap();
        b_done.await.unwrap();

        assert_eq!(std::fs::read(a_path).unwrap(), b"a1a2a3");
        assert_eq!(std::fs::read(b_path).unwrap(), b"b1b2");
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_records_first() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::start(16);
        let (file, path) = open_target(&dir, "drain.bin");

        for _ in 0..8 {
            writer
                .enqueue(Arc::clone(&file), Bytes::from_static(b"chunk-"))
                .await
                .unwrap();
        }
        drop(file);
        writer.shutdown().await;

        assert_eq!(std::fs::read(path).unwrap().len(), 8 * 6);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::start(4);
        writer.shutdown().await;

        let (file, _path) = open_target(&dir, "late.bin");
        let result = writer.enqueue(file, Bytes::from_static(b"late")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_last_record_acknowledged_after_bytes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileWriter::start(4);
        let (file, path) = open_target(&dir, "acked.bin");

        let done = writer
            .enqueue_last(file, Bytes::from_static(b"payload"))
            .await
            .unwrap();
        done.await.unwrap();

        assert_eq!(std::fs::read(path).unwrap(), b"payload");
        writer.shutdown().await;
    }
}
