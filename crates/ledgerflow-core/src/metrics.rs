// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters updated by the scheduler.
#[derive(Debug, Default)]
pub struct FlowMetrics {
    in_flight: AtomicI64,
    started: AtomicU64,
    restored: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    checkpoints_written: AtomicU64,
    checkpoints_removed: AtomicU64,
    delivery_anomalies: AtomicU64,
    restore_failures: AtomicU64,
}

/// Point-in-time copy of [`FlowMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Flows currently live.
    pub in_flight: i64,
    /// Flows admitted through `add_flow`.
    pub started: u64,
    /// Flows brought back from checkpoints.
    pub restored: u64,
    /// Flows that reached a terminal state, successful or not.
    pub finished: u64,
    /// Subset of `finished` that ended with an error.
    pub failed: u64,
    /// Checkpoints persisted.
    pub checkpoints_written: u64,
    /// Checkpoints deleted.
    pub checkpoints_removed: u64,
    /// Messages delivered to an already consumed listener.
    pub delivery_anomalies: u64,
    /// Checkpoints that could not be restored.
    pub restore_failures: u64,
}

impl FlowMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            checkpoints_written: self.checkpoints_written.load(Ordering::Relaxed),
            checkpoints_removed: self.checkpoints_removed.load(Ordering::Relaxed),
            delivery_anomalies: self.delivery_anomalies.load(Ordering::Relaxed),
            restore_failures: self.restore_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn flow_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flow_restored(&self) {
        self.restored.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flow_finished(&self, failed: bool) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn checkpoint_written(&self) {
        self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn checkpoint_removed(&self) {
        self.checkpoints_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_anomaly(&self) {
        self.delivery_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn restore_failed(&self) {
        self.restore_failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_tracks_lifecycle() {
        let metrics = FlowMetrics::new();
        metrics.flow_started();
        metrics.flow_started();
        metrics.flow_restored();
        metrics.flow_finished(false);
        metrics.flow_finished(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.restored, 1);
        assert_eq!(snapshot.finished, 2);
        assert_eq!(snapshot.failed, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = FlowMetrics::new();
        metrics.checkpoint_written();
        metrics.delivery_anomaly();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["checkpoints_written"], 1);
        assert_eq!(json["delivery_anomalies"], 1);
        assert_eq!(json["restore_failures"], 0);
    }
}
