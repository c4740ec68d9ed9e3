// src/stats.rs
// Lightweight per-relay counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Counters shared between the accept loop and connection tasks.
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    active: AtomicU64,
    failed: AtomicU64,
    bytes_to_remote: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub failed: u64,
    pub bytes_to_remote: u64,
    pub bytes_to_client: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    /// Count an accepted client; the returned guard keeps it "active" until dropped.
    pub(crate) fn connection_opened(self: &Arc<Self>) -> ActiveConnection {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            stats: Arc::clone(self),
        }
    }

    pub(crate) fn connection_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_to_remote(&self, n: u64) {
        self.bytes_to_remote.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_to_client(&self, n: u64) {
        self.bytes_to_client.fetch_add(n, Ordering::Relaxed);
    }
}

pub(crate) struct ActiveConnection {
    stats: Arc<RelayStats>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
