use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Allocate a fresh, process-unique id.
    pub fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whatever owns a client connection and can accept job results for it.
///
/// Called while the dispatcher lock is held, so implementations must not
/// block (queue the bytes and return).
pub trait JobSink: Send + Sync {
    fn write_result(&self, body: Bytes);

    fn is_open(&self) -> bool {
        true
    }

    /// A job routed to this sink has left the proxy, delivered or not.
    fn job_released(&self) {}
}

/// Weak link from a job to its client. Dropping it tells the client the
/// job is gone.
struct ClientLink(Option<Weak<dyn JobSink>>);

impl ClientLink {
    fn upgrade(&self) -> Option<Arc<dyn JobSink>> {
        self.0.as_ref()?.upgrade()
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        // Release the weak reference before notifying
        let sink = self.0.take().and_then(|weak| weak.upgrade());
        if let Some(sink) = sink {
            sink.job_released();
        }
    }
}

/// A unit of work submitted by a client.
///
/// A job is not `Clone`: it lives either in the pending queue or in exactly
/// one worker's `current_job`, and moves between them.
pub struct Job {
    pub id: JobId,
    pub body: Bytes,
    pub submitted_at: Instant,
    client: Option<ClientLink>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("detached", &self.is_detached())
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}

impl Job {
    /// A job with nobody waiting for its result.
    pub fn new(id: JobId, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
            submitted_at: Instant::now(),
            client: None,
        }
    }

    /// A job whose result is routed back to `client`. Only a weak reference
    /// is kept; the job never extends the client's lifetime. The client's
    /// [`JobSink::job_released`] fires when the job is dropped.
    pub fn with_client<S: JobSink + 'static>(
        id: JobId,
        body: impl Into<Bytes>,
        client: &Arc<S>,
    ) -> Self {
        let weak: Weak<S> = Arc::downgrade(client);
        let client: Weak<dyn JobSink> = weak;
        Self {
            client: Some(ClientLink(Some(client))),
            ..Self::new(id, body)
        }
    }

    /// The originating client, if it is still connected.
    pub fn client(&self) -> Option<Arc<dyn JobSink>> {
        self.client
            .as_ref()?
            .upgrade()
            .filter(|client| client.is_open())
    }

    pub fn is_detached(&self) -> bool {
        self.client.is_none()
    }

    /// True when the job had a client and that client has gone away.
    pub fn is_orphaned(&self) -> bool {
        !self.is_detached() && self.client().is_none()
    }

    /// Hand `result` to the originating client. Returns false (and does
    /// nothing) if there is no live client.
    pub fn deliver(&self, result: Bytes) -> bool {
        match self.client() {
            Some(client) => {
                client.write_result(result);
                true
            }
            None => false,
        }
    }
}
