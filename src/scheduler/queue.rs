use std::collections::VecDeque;

use crate::scheduler::job::{Job, JobId};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// FIFO of jobs waiting for an idle worker. Insertion order is submission
/// order; the oldest job is always served first.
#[derive(Debug)]
pub struct PendingQueue {
    jobs: VecDeque<Job>,
    max_jobs: usize,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_jobs,
        }
    }

    /// Append a job. Hands the job back if the queue is at capacity.
    pub fn push(&mut self, job: Job) -> Result<(), Job> {
        if self.is_full() {
            return Err(job);
        }
        self.jobs.push_back(job);
        Ok(())
    }

    /// Return a job to the head of the queue after a failed hand-off.
    /// Ignores capacity so the job keeps its place.
    pub fn push_front(&mut self, job: Job) {
        self.jobs.push_front(job);
    }

    pub fn pop_front(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.iter().any(|j| j.id == id)
    }

    /// Ids in dispatch order
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    pub fn capacity(&self) -> usize {
        self.max_jobs
    }
}
