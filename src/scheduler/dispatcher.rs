use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::scheduler::job::{Job, JobId};
use crate::scheduler::queue::PendingQueue;
use crate::stats::StatCounter;
use crate::worker::{WorkerConnection, WorkerId, WorkerSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handed straight to an idle worker
    Assigned(WorkerId),
    /// No idle worker; waiting in the pending queue
    Queued,
}

/// Owns the worker pool and the pending queue.
///
/// Both collections live in one struct behind one lock (see
/// [`SharedDispatcher`](crate::scheduler::SharedDispatcher)), which keeps
/// the joint invariant: a job is either queued or held by exactly one
/// worker, never both. Every method is synchronous and does no I/O.
#[derive(Debug)]
pub struct JobDispatcher {
    /// Keyed by id; ids are allocated in registration order, so iteration
    /// order doubles as the idle-worker tie-break.
    workers: BTreeMap<WorkerId, WorkerConnection>,
    pending: PendingQueue,
    stats: Arc<StatCounter>,
    job_timeout: Option<Duration>,
    drop_orphaned_jobs: bool,
}

impl JobDispatcher {
    pub fn new(stats: Arc<StatCounter>) -> Self {
        Self::from_config(&ProxyConfig::default(), stats)
    }

    pub fn from_config(config: &ProxyConfig, stats: Arc<StatCounter>) -> Self {
        Self {
            workers: BTreeMap::new(),
            pending: PendingQueue::with_capacity(config.max_pending_jobs),
            stats,
            job_timeout: config.job_timeout(),
            drop_orphaned_jobs: config.drop_orphaned_jobs,
        }
    }

    /// Add a worker to the pool and immediately offer it queued work.
    /// Returns the job it picked up, if any.
    pub fn register(&mut self, worker: WorkerConnection) -> Option<JobId> {
        let worker_id = worker.id();
        tracing::info!(worker_id = %worker_id, addr = ?worker.addr(), "Worker registered");
        self.workers.insert(worker_id, worker);
        self.stats.worker_connected();
        self.try_allocate(worker_id)
    }

    /// Remove a worker from the pool. Any in-flight job is dropped, not
    /// re-queued, and returned for inspection.
    pub fn deregister(&mut self, worker_id: WorkerId) -> Option<Job> {
        let mut worker = self.workers.remove(&worker_id)?;
        self.stats.worker_disconnected();

        let dropped = worker.close();
        match &dropped {
            Some(job) => {
                self.stats.record_job_dropped();
                tracing::warn!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    "Worker disconnected while busy, job dropped"
                );
            }
            None => tracing::info!(worker_id = %worker_id, "Worker deregistered"),
        }
        dropped
    }

    /// Assign `job` to the first idle worker, or queue it. Never blocks.
    pub fn submit(&mut self, job: Job) -> Result<SubmitOutcome> {
        self.stats.record_job_submitted();
        let job_id = job.id;

        let job = match self.first_idle_worker() {
            Some(worker_id) => match self.assign_to(worker_id, job) {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Job assigned");
                    return Ok(SubmitOutcome::Assigned(worker_id));
                }
                Err(job) => job,
            },
            None => job,
        };

        match self.pending.push(job) {
            Ok(()) => {
                self.stats.record_job_queued();
                tracing::debug!(job_id = %job_id, pending = self.pending.len(), "Job queued");
                Ok(SubmitOutcome::Queued)
            }
            Err(_job) => {
                self.stats.record_job_dropped();
                tracing::warn!(job_id = %job_id, "Pending queue at capacity, job rejected");
                Err(ProxyError::QueueFull(self.pending.capacity()))
            }
        }
    }

    /// If `worker_id` is idle and work is queued, hand it the oldest job.
    ///
    /// With `drop_orphaned_jobs` set, queued jobs whose client has gone are
    /// discarded on the way.
    pub fn try_allocate(&mut self, worker_id: WorkerId) -> Option<JobId> {
        if !self.workers.get(&worker_id)?.is_idle() {
            return None;
        }

        while let Some(job) = self.pending.pop_front() {
            if self.drop_orphaned_jobs && job.is_orphaned() {
                self.stats.record_job_orphaned();
                tracing::info!(job_id = %job.id, "Client gone before dispatch, job discarded");
                continue;
            }

            let job_id = job.id;
            return match self.assign_to(worker_id, job) {
                Ok(()) => {
                    tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Queued job assigned");
                    Some(job_id)
                }
                Err(job) => {
                    self.pending.push_front(job);
                    None
                }
            };
        }
        None
    }

    /// Record a TASK_DONE from `worker_id`: route the result to the
    /// client, mark the worker idle, then offer it the next queued job.
    pub fn complete(&mut self, worker_id: WorkerId, result: Bytes) -> Result<JobId> {
        let worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or(ProxyError::WorkerNotFound(worker_id))?;
        let (job, elapsed) = worker.finish().ok_or(ProxyError::WorkerIdle(worker_id))?;

        self.stats.record_response_received();
        self.stats.record_job_time(elapsed.as_millis() as u64);
        self.stats.record_job_completed();

        if job.deliver(result) {
            tracing::debug!(
                job_id = %job.id,
                worker_id = %worker_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Job completed"
            );
        } else {
            tracing::debug!(job_id = %job.id, worker_id = %worker_id, "Job completed, no client to receive result");
        }

        self.try_allocate(worker_id);
        Ok(job.id)
    }

    /// Disconnect every busy worker whose job deadline has passed. Their
    /// jobs are dropped. Returns the affected `(worker, job)` pairs.
    pub fn expire(&mut self, now: Instant) -> Vec<(WorkerId, JobId)> {
        let expired: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.is_expired(now))
            .map(|w| w.id())
            .collect();

        expired
            .into_iter()
            .filter_map(|worker_id| {
                let job = self.deregister(worker_id)?;
                self.stats.record_job_timed_out();
                tracing::warn!(worker_id = %worker_id, job_id = %job.id, "Job deadline exceeded, worker disconnected");
                Some((worker_id, job.id))
            })
            .collect()
    }

    fn first_idle_worker(&self) -> Option<WorkerId> {
        self.workers.values().find(|w| w.is_idle()).map(|w| w.id())
    }

    fn assign_to(&mut self, worker_id: WorkerId, job: Job) -> std::result::Result<(), Job> {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(job);
        };
        worker.assign(job, self.job_timeout)?;
        self.stats.record_request_sent();
        Ok(())
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerConnection> {
        self.workers.get(&worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerConnection> {
        self.workers.values()
    }

    pub fn worker_summaries(&self, now: Instant) -> Vec<WorkerSummary> {
        self.workers.values().map(|w| w.summary(now)).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_idle()).count()
    }

    /// The worker currently holding `job_id`, if any
    pub fn assigned_worker(&self, job_id: JobId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.current_job_id() == Some(job_id))
            .map(|w| w.id())
    }

    pub fn is_queued(&self, job_id: JobId) -> bool {
        self.pending.contains(job_id)
    }

    pub fn pending_ids(&self) -> Vec<JobId> {
        self.pending.ids()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &Arc<StatCounter> {
        &self.stats
    }
}
