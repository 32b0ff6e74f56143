//! Session ids and process-wide relay counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pump::SessionReport;

/// Session ID generator for logging/metrics
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free counters shared by the acceptor and all session tasks.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    accepted: AtomicU64,
    upstream_failures: AtomicU64,
    completed: AtomicU64,
    active: AtomicU64,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub upstream_failures: u64,
    pub completed: u64,
    pub active: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a session active until the returned guard drops.
    pub fn session_started(self: &Arc<Self>) -> ActiveSession {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            metrics: Arc::clone(self),
        }
    }

    pub fn record_completed(&self, report: &SessionReport) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_upstream
            .fetch_add(report.client_to_upstream, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(report.upstream_to_client, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active-session gauge on drop
pub struct ActiveSession {
    metrics: Arc<RelayMetrics>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}
