//! Drop/failure counters for the ingestion path.
//!
//! Rejected ticks and degraded subsystems are counted rather than fatal;
//! the counters surface through logs and [`Metrics::snapshot`].

use crate::error::BarError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, updated lock-free from the series writer tasks.
#[derive(Debug, Default)]
pub struct Metrics {
    invalid_ticks: AtomicU64,
    late_ticks: AtomicU64,
    backfill_failures: AtomicU64,
    corrupt_snapshots: AtomicU64,
    dropped_queued_ticks: AtomicU64,
}

impl Metrics {
    /// Count an error against the matching counter. Errors without a
    /// counter (internal guards, store I/O) are only logged by callers.
    pub fn record(&self, error: &BarError) {
        match error {
            BarError::InvalidTick { .. } => self.invalid_ticks.fetch_add(1, Ordering::Relaxed),
            BarError::LateTick { .. } => self.late_ticks.fetch_add(1, Ordering::Relaxed),
            BarError::BackfillUnavailable(_) => {
                self.backfill_failures.fetch_add(1, Ordering::Relaxed)
            }
            BarError::CorruptSnapshot(_) => self.corrupt_snapshots.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// Count a tick dropped from a bounded reconciliation queue.
    pub fn record_dropped_queued_tick(&self) {
        self.dropped_queued_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            invalid_ticks: self.invalid_ticks.load(Ordering::Relaxed),
            late_ticks: self.late_ticks.load(Ordering::Relaxed),
            backfill_failures: self.backfill_failures.load(Ordering::Relaxed),
            corrupt_snapshots: self.corrupt_snapshots.load(Ordering::Relaxed),
            dropped_queued_ticks: self.dropped_queued_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub invalid_ticks: u64,
    pub late_ticks: u64,
    pub backfill_failures: u64,
    pub corrupt_snapshots: u64,
    pub dropped_queued_ticks: u64,
}
