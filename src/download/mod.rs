//! The concurrent download engine.
//!
//! A single scheduler pulls waiting transfers from the catalog, fans them
//! out to per-host worker pools under a global cap, funnels every disk write
//! through one serialized writer, and folds worker events back into the
//! catalog. See [`Downloader`] for the entry point.

mod event;
mod host;
mod scheduler;
mod worker;

pub use event::{
    CHECKSUM_MISMATCH_ERROR, EVENT_QUEUE_CAPACITY, EventEnvelope, FILE_CREATION_ERROR, FailureKind,
    TransferEvent, UNSUPPORTED_CHECKSUM_TYPE,
};
pub use host::HostSlot;
pub use scheduler::{Downloader, EngineError, ShutdownHandle};
pub use worker::WorkerState;
