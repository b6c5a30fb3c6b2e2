//! Process-wide counters for the proxy.
//!
//! Every update is a single relaxed atomic operation, so recording never
//! blocks and never fails. Counters are only reset by restarting the process.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bounds (inclusive, milliseconds) of the latency buckets. A final
/// overflow bucket catches everything slower.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1000, 5000];

#[derive(Debug)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        let buckets = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, bucket)| LatencyBucket {
                le_ms: LATENCY_BUCKETS_MS.get(i).copied(),
                count: bucket.load(Ordering::Relaxed),
            })
            .collect();

        LatencySnapshot {
            count,
            sum_ms,
            min_ms: (count > 0).then(|| self.min_ms.load(Ordering::Relaxed)),
            max_ms: (count > 0).then(|| self.max_ms.load(Ordering::Relaxed)),
            mean_ms: (count > 0).then(|| sum_ms as f64 / count as f64),
            buckets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyBucket {
    /// Inclusive upper bound; `None` for the overflow bucket
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub mean_ms: Option<f64>,
    pub buckets: Vec<LatencyBucket>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub started_at: DateTime<Utc>,
    pub jobs_submitted: u64,
    pub jobs_queued: u64,
    pub jobs_completed: u64,
    pub jobs_dropped: u64,
    pub jobs_timed_out: u64,
    pub jobs_orphaned: u64,
    pub worker_requests_sent: u64,
    pub worker_responses_received: u64,
    pub corrupt_frames: u64,
    pub workers_connected: u64,
    pub clients_connected: u64,
    pub job_latency: LatencySnapshot,
}

#[derive(Debug)]
pub struct StatCounter {
    started_at: DateTime<Utc>,
    jobs_submitted: AtomicU64,
    jobs_queued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_dropped: AtomicU64,
    jobs_timed_out: AtomicU64,
    jobs_orphaned: AtomicU64,
    worker_requests_sent: AtomicU64,
    worker_responses_received: AtomicU64,
    corrupt_frames: AtomicU64,
    workers_connected: AtomicU64,
    clients_connected: AtomicU64,
    job_latency: LatencyHistogram,
}

impl Default for StatCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatCounter {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            jobs_submitted: AtomicU64::new(0),
            jobs_queued: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_dropped: AtomicU64::new(0),
            jobs_timed_out: AtomicU64::new(0),
            jobs_orphaned: AtomicU64::new(0),
            worker_requests_sent: AtomicU64::new(0),
            worker_responses_received: AtomicU64::new(0),
            corrupt_frames: AtomicU64::new(0),
            workers_connected: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            job_latency: LatencyHistogram::new(),
        }
    }

    /// Add one job's round-trip time to the latency distribution.
    pub fn record_job_time(&self, ms: u64) {
        self.job_latency.record(ms);
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_queued(&self) {
        self.jobs_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_dropped(&self) {
        self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_timed_out(&self) {
        self.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_orphaned(&self) {
        self.jobs_orphaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_sent(&self) {
        self.worker_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_received(&self) {
        self.worker_responses_received
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_frame(&self) {
        self.corrupt_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_connected(&self) {
        self.workers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_disconnected(&self) {
        decrement(&self.workers_connected);
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        decrement(&self.clients_connected);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            started_at: self.started_at,
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_queued: self.jobs_queued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_dropped: self.jobs_dropped.load(Ordering::Relaxed),
            jobs_timed_out: self.jobs_timed_out.load(Ordering::Relaxed),
            jobs_orphaned: self.jobs_orphaned.load(Ordering::Relaxed),
            worker_requests_sent: self.worker_requests_sent.load(Ordering::Relaxed),
            worker_responses_received: self.worker_responses_received.load(Ordering::Relaxed),
            corrupt_frames: self.corrupt_frames.load(Ordering::Relaxed),
            workers_connected: self.workers_connected.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            job_latency: self.job_latency.snapshot(),
        }
    }

    /// Emit the current snapshot as a single structured log event.
    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        tracing::info!(
            jobs_submitted = snap.jobs_submitted,
            jobs_completed = snap.jobs_completed,
            jobs_dropped = snap.jobs_dropped,
            jobs_timed_out = snap.jobs_timed_out,
            worker_requests_sent = snap.worker_requests_sent,
            worker_responses_received = snap.worker_responses_received,
            workers_connected = snap.workers_connected,
            clients_connected = snap.clients_connected,
            latency_mean_ms = ?snap.job_latency.mean_ms,
            latency_max_ms = ?snap.job_latency.max_ms,
            "Proxy stats"
        );
    }
}

fn decrement(gauge: &AtomicU64) {
    // Saturate at zero
    let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}
