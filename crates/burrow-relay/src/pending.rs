//! Correlation table for in-flight reverse-connection requests
//!
//! Every dial allocates a fresh id and parks a one-shot completion handle
//! here before the open-tunnel command is sent, so a data leg can never
//! arrive ahead of its entry. Entries are removed when claimed, timed out,
//! or the issuing dial unwinds.

use crate::demux::ReverseStream;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::oneshot;

/// Table of pending reverse-connection requests, keyed by tunnel id
///
/// Owns the id counter; ids start at 1 and are never reused while an entry
/// for them is still pending. Id 0 is never issued.
pub struct PendingTunnels {
    next_id: AtomicU32,
    table: DashMap<u32, oneshot::Sender<ReverseStream>>,
}

impl PendingTunnels {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            table: DashMap::new(),
        }
    }

    /// Allocate a fresh id and insert its completion handle
    ///
    /// Returns the id together with the receiver the dial awaits on.
    pub fn insert(&self) -> (u32, oneshot::Receiver<ReverseStream>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.table.insert(id, tx);
        (id, rx)
    }

    /// Claim the completion handle for `id`, removing the entry
    ///
    /// Returns `None` if the id was never issued, already fulfilled, or has
    /// expired. At most one caller can ever claim a given entry.
    pub fn claim(&self, id: u32) -> Option<oneshot::Sender<ReverseStream>> {
        self.table.remove(&id).map(|(_, tx)| tx)
    }

    /// Remove the entry for `id` if it is still pending
    ///
    /// Idempotent; used by the dial path to bound table size on every exit.
    pub fn remove(&self, id: u32) {
        self.table.remove(&id);
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for PendingTunnels {
    fn default() -> Self {
        Self::new()
    }
}
