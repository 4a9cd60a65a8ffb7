//! Process-wide pipeline statistics.
//!
//! Counters only move forward and are updated with atomic increments, so they
//! can be read at any time without coordinating with dispatch.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Statistics {
    sequenced: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    matched: AtomicU64,
    start_millis: AtomicI64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequenced: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            start_millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// A job completed successfully.
    pub fn record_sequenced(&self) {
        self.sequenced.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was dropped before running (overflow or shutdown).
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A (event, sequencer) pair matched and a job was created for it.
    pub fn record_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_start_time(&self) {
        self.start_millis.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    #[must_use]
    pub fn nodes_sequenced(&self) -> u64 {
        self.sequenced.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn nodes_skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn jobs_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn jobs_matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    /// Jobs that ran to a terminal state (completed or failed).
    #[must_use]
    pub fn job_activity(&self) -> u64 {
        self.nodes_sequenced() + self.jobs_failed()
    }

    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        let millis = self.start_millis.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }
}

/// Read-only view of the pipeline counters and gauges at one instant.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub nodes_sequenced: u64,
    pub nodes_skipped: u64,
    pub jobs_failed: u64,
    pub job_activity: u64,
    pub jobs_matched: u64,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub start_time: DateTime<Utc>,
    pub dropped_outcomes: u64,
    pub workers_replaced: u64,
}
