//! Session counters shared between the accept loop and session tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Live counters for one bridge instance.
///
/// Counters are monotonic except `active`. They survive `stop`/`start`
/// cycles of the same [`BridgeServer`](crate::BridgeServer).
#[derive(Debug, Default)]
pub struct BridgeStats {
    accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_client_to_upstream: AtomicU64,
    bytes_upstream_to_client: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_client_to_upstream: u64,
    pub bytes_upstream_to_client: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an accepted connection and return a guard that tracks it
    /// until the session ends.
    pub fn session_opened(self: &Arc<Self>) -> ActiveSession {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            stats: Arc::clone(self),
            finished: AtomicBool::new(false),
        }
    }

    pub fn record_bytes(&self, client_to_upstream: u64, upstream_to_client: u64) {
        self.bytes_client_to_upstream
            .fetch_add(client_to_upstream, Ordering::Relaxed);
        self.bytes_upstream_to_client
            .fetch_add(upstream_to_client, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_client_to_upstream: self.bytes_client_to_upstream.load(Ordering::Relaxed),
            bytes_upstream_to_client: self.bytes_upstream_to_client.load(Ordering::Relaxed),
        }
    }
}

/// Guard for one in-flight session.
///
/// Dropping it without calling [`finish`](Self::finish) counts the session
/// as failed, which covers sessions aborted by `stop`.
#[derive(Debug)]
pub struct ActiveSession {
    stats: Arc<BridgeStats>,
    finished: AtomicBool,
}

impl ActiveSession {
    /// Record the session outcome.
    pub fn finish(self, ok: bool) {
        self.record(ok);
    }

    fn record(&self, ok: bool) {
        if self.finished.swap(true, Ordering::Relaxed) {
            return;
        }
        let counter = if ok {
            &self.stats.completed
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.record(false);
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
