//! Per-host state.

use std::collections::VecDeque;

use reqwest::Client;

use crate::catalog::Transfer;

/// In-memory state for one data node: its worker cap, live worker count,
/// pending FIFO, and the authenticated session every worker on this host
/// shares.
///
/// Slots are created lazily the first time the scheduler sees a transfer for
/// a data node. Counters are mutated only by the scheduler task, on dispatch
/// and on event-driven finalization, so they need no lock of their own.
#[derive(Debug)]
pub struct HostSlot {
    /// Host key (data node hostname).
    pub datanode: String,
    /// Cap on concurrent workers for this host. Seeded from configuration;
    /// the adjustment hook may change it later.
    pub max_concurrent: usize,
    /// Workers currently running against this host.
    pub in_flight: usize,
    /// Transfers waiting for a slot, oldest first.
    pub pending: VecDeque<Transfer>,
    /// Authenticated session reused by every worker on this host.
    pub session: Client,
}

impl HostSlot {
    /// Creates a slot with an empty queue and no live workers.
    #[must_use]
    pub fn new(datanode: String, max_concurrent: usize, session: Client) -> Self {
        Self {
            datanode,
            max_concurrent,
            in_flight: 0,
            pending: VecDeque::new(),
            session,
        }
    }

    /// Whether another worker may start on this host.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.max_concurrent
    }
}
