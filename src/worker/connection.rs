use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Frame;
use crate::scheduler::{Job, JobId};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl WorkerId {
    /// Allocate a fresh id. Ids grow monotonically, so ordering by id is
    /// ordering by registration.
    pub fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Serializable view of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub addr: Option<SocketAddr>,
    pub status: WorkerStatus,
    pub current_job: Option<JobId>,
    pub busy_for_ms: Option<u64>,
}

/// Dispatcher-side state of one connected worker.
///
/// `Idle` implies no current job; `Busy` implies a current job with a
/// recorded start time. Outbound frames go through an unbounded channel
/// drained by the connection's writer task, so assigning never waits on
/// the socket.
#[derive(Debug)]
pub struct WorkerConnection {
    id: WorkerId,
    addr: Option<SocketAddr>,
    status: WorkerStatus,
    current_job: Option<Job>,
    job_started: Option<Instant>,
    deadline: Option<Instant>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
}

impl WorkerConnection {
    pub fn new(id: WorkerId, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            id,
            addr: None,
            status: WorkerStatus::Idle,
            current_job: None,
            job_started: None,
            deadline: None,
            outbound,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    pub fn current_job(&self) -> Option<&Job> {
        self.current_job.as_ref()
    }

    pub fn current_job_id(&self) -> Option<JobId> {
        self.current_job.as_ref().map(|j| j.id)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token cancelled when the proxy wants this connection closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        self.job_started
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }

    /// Take ownership of `job` and send it to the worker as a TASK frame.
    ///
    /// Assigning to a busy worker is an invariant violation: it panics in
    /// debug builds and hands the job back untouched in release builds.
    pub fn assign(&mut self, job: Job, timeout: Option<Duration>) -> Result<(), Job> {
        if let Some(current) = &self.current_job {
            tracing::error!(
                worker_id = %self.id,
                job_id = %job.id,
                current_job_id = %current.id,
                "Refusing to assign a second job to a busy worker"
            );
            debug_assert!(
                false,
                "worker {} assigned job {} while busy with job {}",
                self.id, job.id, current.id
            );
            return Err(job);
        }

        if self.outbound.send(Frame::task(job.body.clone())).is_err() {
            // Writer is gone; the session will deregister us and drop the job.
            tracing::warn!(worker_id = %self.id, job_id = %job.id, "Worker writer closed during assignment");
        }

        let now = Instant::now();
        self.status = WorkerStatus::Busy;
        self.job_started = Some(now);
        self.deadline = timeout.map(|t| now + t);
        self.current_job = Some(job);
        Ok(())
    }

    /// Clear the in-flight job, returning it with its elapsed time.
    /// `None` if the worker was idle.
    pub fn finish(&mut self) -> Option<(Job, Duration)> {
        let job = self.current_job.take()?;
        let elapsed = self
            .job_started
            .take()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.deadline = None;
        self.status = WorkerStatus::Idle;
        Some((job, elapsed))
    }

    /// Signal the connection task to close and give up any in-flight job.
    pub fn close(&mut self) -> Option<Job> {
        self.shutdown.cancel();
        self.finish().map(|(job, _)| job)
    }

    pub fn summary(&self, now: Instant) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            addr: self.addr,
            status: self.status,
            current_job: self.current_job_id(),
            busy_for_ms: self.busy_for(now).map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    fn worker() -> (WorkerConnection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerConnection::new(WorkerId::next(), tx), rx)
    }

    #[test]
    fn new_worker_is_idle() {
        let (w, _rx) = worker();
        assert!(w.is_idle());
        assert!(w.current_job().is_none());
        assert!(w.busy_for(Instant::now()).is_none());
        assert!(!w.is_expired(Instant::now()));
    }

    #[test]
    fn assign_sends_task_frame_and_marks_busy() {
        let (mut w, mut rx) = worker();
        w.assign(Job::new(JobId(7), &b"work"[..]), None).unwrap();

        assert_eq!(w.status(), WorkerStatus::Busy);
        assert_eq!(w.current_job_id(), Some(JobId(7)));
        assert!(w.busy_for(Instant::now()).is_some());

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.command, Command::Task);
        assert_eq!(&frame.body[..], b"work");
    }

    #[test]
    fn finish_returns_job_and_goes_idle() {
        let (mut w, _rx) = worker();
        w.assign(Job::new(JobId(8), &b"work"[..]), None).unwrap();

        let (job, _elapsed) = w.finish().unwrap();
        assert_eq!(job.id, JobId(8));
        assert!(w.is_idle());
        assert!(w.current_job().is_none());
        assert!(w.finish().is_none());
    }

    #[test]
    fn deadline_expires() {
        let (mut w, _rx) = worker();
        w.assign(Job::new(JobId(9), &b""[..]), Some(Duration::from_millis(10)))
            .unwrap();

        let now = Instant::now();
        assert!(!w.is_expired(now));
        assert!(w.is_expired(now + Duration::from_millis(20)));
    }

    #[test]
    fn close_cancels_token_and_drops_job() {
        let (mut w, _rx) = worker();
        let token = w.shutdown_token();
        w.assign(Job::new(JobId(10), &b""[..]), None).unwrap();

        let dropped = w.close().unwrap();
        assert_eq!(dropped.id, JobId(10));
        assert!(token.is_cancelled());
        assert!(w.is_idle());
    }

    #[test]
    fn assign_survives_closed_writer() {
        let (mut w, rx) = worker();
        drop(rx);
        w.assign(Job::new(JobId(11), &b""[..]), None).unwrap();
        assert_eq!(w.current_job_id(), Some(JobId(11)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "while busy")]
    fn assign_to_busy_worker_panics_in_debug() {
        let (mut w, _rx) = worker();
        w.assign(Job::new(JobId(12), &b""[..]), None).unwrap();
        let _ = w.assign(Job::new(JobId(13), &b""[..]), None);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn assign_to_busy_worker_is_refused_in_release() {
        let (mut w, _rx) = worker();
        w.assign(Job::new(JobId(12), &b""[..]), None).unwrap();
        let rejected = w.assign(Job::new(JobId(13), &b""[..]), None).unwrap_err();
        assert_eq!(rejected.id, JobId(13));
        assert_eq!(w.current_job_id(), Some(JobId(12)));
    }

    #[test]
    fn summary_reflects_state() {
        let (mut w, _rx) = worker();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        w = w.with_addr(addr);
        w.assign(Job::new(JobId(14), &b""[..]), None).unwrap();

        let summary = w.summary(Instant::now());
        assert_eq!(summary.addr, Some(addr));
        assert_eq!(summary.status, WorkerStatus::Busy);
        assert_eq!(summary.current_job, Some(JobId(14)));
        assert!(summary.busy_for_ms.is_some());
    }
}
