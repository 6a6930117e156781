//! Health-signal interface between the exporter and the agent's health
//! reporter.
//!
//! The exporter only emits; aggregation and surfacing of these counters is
//! the health reporter's business. Calls are fire-and-forget and must not
//! block the consumer loops.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for exporter health signals.
pub trait HealthReporter: Send + Sync + 'static {
    /// `count` records were written to the stream.
    fn successful_send(&self, count: usize);

    /// A send or connect attempt failed with the given gRPC status label.
    fn grpc_error(&self, status: &str);

    /// A response or transport-level error occurred.
    fn response_error(&self);

    /// A single-record write exceeded the send timeout.
    fn send_timeout(&self);

    /// Records were dropped because they could not be requeued.
    fn items_dropped(&self, count: usize);
}

/// No-op reporter for embedders that do not track exporter health.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealthReporter;

impl HealthReporter for NoopHealthReporter {
    fn successful_send(&self, _count: usize) {}
    fn grpc_error(&self, _status: &str) {}
    fn response_error(&self) {}
    fn send_timeout(&self) {}
    fn items_dropped(&self, _count: usize) {}
}

/// Plain atomic-counter implementation of [`HealthReporter`].
#[derive(Debug, Default)]
pub struct HealthCounters {
    sent: AtomicU64,
    grpc_errors: AtomicU64,
    response_errors: AtomicU64,
    send_timeouts: AtomicU64,
    dropped: AtomicU64,
    statuses: Mutex<Vec<String>>,
}

/// Point-in-time copy of [`HealthCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Records written to a stream.
    pub sent: u64,
    /// Failures that carried a gRPC status.
    pub grpc_errors: u64,
    /// Response or transport-level errors.
    pub response_errors: u64,
    /// Sends that exceeded the send timeout.
    pub send_timeouts: u64,
    /// Records dropped on requeue overflow.
    pub dropped: u64,
}

impl HealthCounters {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters. Values may lag in-flight updates.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            grpc_errors: self.grpc_errors.load(Ordering::Relaxed),
            response_errors: self.response_errors.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Status labels observed so far, in arrival order.
    pub fn grpc_statuses(&self) -> Vec<String> {
        self.statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl HealthReporter for HealthCounters {
    fn successful_send(&self, count: usize) {
        let _ = self.sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn grpc_error(&self, status: &str) {
        let _ = self.grpc_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(status.to_string());
        }
    }

    fn response_error(&self) {
        let _ = self.response_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn send_timeout(&self) {
        let _ = self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn items_dropped(&self, count: usize) {
        let _ = self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }
}
