use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{pack, unpack, Command, Frame, Unpacked};
use crate::scheduler::SharedDispatcher;
use crate::stats::StatCounter;
use crate::worker::{WorkerConnection, WorkerId};

const READ_CHUNK: usize = 8 * 1024;

/// Connection-task state for one worker socket.
///
/// Owns the read buffer; everything that touches shared state goes through
/// the dispatcher lock, one completion at a time.
pub struct WorkerSession {
    id: WorkerId,
    dispatcher: SharedDispatcher,
    stats: Arc<StatCounter>,
    read_buffer: BytesMut,
    max_frame_len: usize,
}

impl WorkerSession {
    /// Register a new worker (initially idle) and let it pick up queued work.
    ///
    /// Returns the session plus the token the dispatcher cancels when it
    /// wants this connection closed.
    pub async fn on_connect(
        dispatcher: SharedDispatcher,
        stats: Arc<StatCounter>,
        outbound: mpsc::UnboundedSender<Frame>,
        addr: Option<SocketAddr>,
        max_frame_len: usize,
    ) -> (Self, CancellationToken) {
        let id = WorkerId::next();
        let mut conn = WorkerConnection::new(id, outbound);
        if let Some(addr) = addr {
            conn = conn.with_addr(addr);
        }
        let token = conn.shutdown_token();

        dispatcher.lock().await.register(conn);

        let session = Self {
            id,
            dispatcher,
            stats,
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            max_frame_len,
        };
        (session, token)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Bytes received but not yet parsed into a frame
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Append `data` and process every complete frame now in the buffer.
    /// Returns how many frames were handled.
    pub async fn on_bytes_received(&mut self, data: &[u8]) -> usize {
        self.read_buffer.extend_from_slice(data);

        let mut handled = 0;
        loop {
            match unpack(&self.read_buffer, self.max_frame_len) {
                Unpacked::NeedMore => break,
                Unpacked::Frame { frame, consumed } => {
                    self.read_buffer.advance(consumed);
                    self.handle_frame(frame).await;
                    handled += 1;
                }
                Unpacked::Corrupt(reason) => {
                    // No resync: drop everything and keep the connection open
                    tracing::warn!(
                        worker_id = %self.id,
                        discarded = self.read_buffer.len(),
                        reason = %reason,
                        "Corrupt frame from worker, discarding buffer"
                    );
                    self.read_buffer.clear();
                    self.stats.record_corrupt_frame();
                    break;
                }
            }
        }
        handled
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.command {
            Command::TaskDone => self.on_job_complete(frame.body).await,
            Command::Task => {
                tracing::warn!(worker_id = %self.id, "Unexpected TASK frame from worker, ignoring");
            }
        }
    }

    /// Forward a completion to the dispatcher, which routes the result and
    /// refills this worker from the queue.
    pub async fn on_job_complete(&mut self, result: Bytes) {
        let outcome = self.dispatcher.lock().await.complete(self.id, result);
        if let Err(e) = outcome {
            tracing::warn!(worker_id = %self.id, error = %e, "Ignoring TASK_DONE");
        }
    }

    /// Leave the pool. An in-flight job is dropped.
    pub async fn on_disconnect(self) {
        self.dispatcher.lock().await.deregister(self.id);
    }
}

/// Drive one accepted worker socket until it closes, the dispatcher
/// disconnects it, or `shutdown` fires.
pub async fn run_worker_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: SharedDispatcher,
    stats: Arc<StatCounter>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let (mut session, disconnect) =
        WorkerSession::on_connect(dispatcher, stats, tx, Some(addr), max_frame_len).await;
    let worker_id = session.id();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match pack(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Failed to encode frame");
                    break;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::warn!(worker_id = %worker_id, error = %e, "Write to worker failed");
                break;
            }
        }
    });

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = disconnect.cancelled() => {
                tracing::info!(worker_id = %worker_id, "Worker disconnected by proxy");
                break;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::info!(worker_id = %worker_id, addr = %addr, "Worker closed connection");
                    break;
                }
                Ok(n) => {
                    session.on_bytes_received(&buf[..n]).await;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Read from worker failed");
                    break;
                }
            }
        }
    }

    session.on_disconnect().await;
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_LEN;
    use crate::scheduler::{Job, JobDispatcher, JobId};
    use tokio::sync::Mutex;

    fn shared() -> (SharedDispatcher, Arc<StatCounter>) {
        let stats = Arc::new(StatCounter::new());
        let dispatcher = Arc::new(Mutex::new(JobDispatcher::new(stats.clone())));
        (dispatcher, stats)
    }

    async fn connect(
        dispatcher: &SharedDispatcher,
        stats: &Arc<StatCounter>,
    ) -> (WorkerSession, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (session, _token) = WorkerSession::on_connect(
            dispatcher.clone(),
            stats.clone(),
            tx,
            None,
            DEFAULT_MAX_FRAME_LEN,
        )
        .await;
        (session, rx)
    }

    #[tokio::test]
    async fn partial_frames_wait_for_more_bytes() {
        let (dispatcher, stats) = shared();
        let (mut session, mut rx) = connect(&dispatcher, &stats).await;
        dispatcher
            .lock()
            .await
            .submit(Job::new(JobId(1), &b"job"[..]))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().command, Command::Task);

        let done = pack(&Frame::task_done(&b"result"[..])).unwrap();
        assert_eq!(session.on_bytes_received(&done[..4]).await, 0);
        assert_eq!(session.buffered(), 4);
        assert!(!dispatcher.lock().await.worker(session.id()).unwrap().is_idle());

        assert_eq!(session.on_bytes_received(&done[4..]).await, 1);
        assert_eq!(session.buffered(), 0);
        assert!(dispatcher.lock().await.worker(session.id()).unwrap().is_idle());
    }

    #[tokio::test]
    async fn corrupt_bytes_clear_buffer_but_keep_worker() {
        let (dispatcher, stats) = shared();
        let (mut session, _rx) = connect(&dispatcher, &stats).await;

        session
            .on_bytes_received(&[0xff, 0xff, 0xff, 0xff, 2, 1, 2, 3])
            .await;
        assert_eq!(session.buffered(), 0);
        assert_eq!(stats.snapshot().corrupt_frames, 1);
        assert_eq!(dispatcher.lock().await.worker_count(), 1);
    }

    #[tokio::test]
    async fn two_completions_in_one_read_pull_two_jobs() {
        let (dispatcher, stats) = shared();
        let (mut session, mut rx) = connect(&dispatcher, &stats).await;
        {
            let mut d = dispatcher.lock().await;
            for i in 1..=3 {
                d.submit(Job::new(JobId(i), &b"job"[..])).unwrap();
            }
        }
        assert_eq!(rx.recv().await.unwrap().body, Bytes::from_static(b"job"));

        let mut wire = BytesMut::new();
        crate::protocol::pack_into(&Frame::task_done(&b"r1"[..]), &mut wire).unwrap();
        crate::protocol::pack_into(&Frame::task_done(&b"r2"[..]), &mut wire).unwrap();
        assert_eq!(session.on_bytes_received(&wire).await, 2);

        let d = dispatcher.lock().await;
        assert_eq!(d.pending_len(), 0);
        assert_eq!(d.worker(session.id()).unwrap().current_job_id(), Some(JobId(3)));
        assert_eq!(stats.snapshot().worker_responses_received, 2);
    }

    #[tokio::test]
    async fn stray_task_done_is_ignored() {
        let (dispatcher, stats) = shared();
        let (mut session, _rx) = connect(&dispatcher, &stats).await;

        let done = pack(&Frame::task_done(&b"nothing"[..])).unwrap();
        assert_eq!(session.on_bytes_received(&done).await, 1);
        assert_eq!(stats.snapshot().worker_responses_received, 0);
        assert!(dispatcher.lock().await.worker(session.id()).unwrap().is_idle());
    }

    #[tokio::test]
    async fn disconnect_deregisters() {
        let (dispatcher, stats) = shared();
        let (session, _rx) = connect(&dispatcher, &stats).await;
        assert_eq!(dispatcher.lock().await.worker_count(), 1);

        session.on_disconnect().await;
        assert_eq!(dispatcher.lock().await.worker_count(), 0);
        assert_eq!(stats.snapshot().workers_connected, 0);
    }
}
