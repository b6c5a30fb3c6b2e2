//! Client-facing side of the proxy.
//!
//! Clients use the same framing as workers. Each TASK frame a client sends
//! becomes a [`Job`]; its result comes back on the same connection as a
//! TASK_DONE frame whose body is the worker's result, byte for byte.
//! Results are written in completion order, not submission order, and
//! carry no job id.
//!
//! A client that shuts down its write side is still served: the session
//! stops reading but keeps the connection until every job it submitted has
//! been answered or dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};
use crate::protocol::{pack, Command, Frame, JobBoxCodec, DEFAULT_MAX_FRAME_LEN};
use crate::scheduler::{Job, JobId, JobSink, SharedDispatcher, SubmitOutcome};
use crate::stats::StatCounter;

/// Result sink for one client connection. Results are queued on a channel
/// drained by the connection's writer task.
#[derive(Debug)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<Frame>,
    outstanding: AtomicUsize,
    released: Notify,
}

impl ClientSink {
    pub fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            tx,
            outstanding: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Jobs submitted on this connection that have not yet been released
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn job_submitted(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Wait until every submitted job has been released.
    pub async fn drained(&self) {
        while self.outstanding() > 0 {
            self.released.notified().await;
        }
    }
}

impl JobSink for ClientSink {
    fn write_result(&self, body: Bytes) {
        // A send error means the writer is gone; the result has nowhere to go.
        let _ = self.tx.send(Frame::task_done(body));
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn job_released(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        // Single waiter; a stored permit covers a release that lands
        // between its check and its await.
        self.released.notify_one();
    }
}

/// Drive one accepted client socket until it closes or `shutdown` fires.
pub async fn run_client_connection(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: SharedDispatcher,
    stats: Arc<StatCounter>,
    max_frame_len: usize,
    shutdown: CancellationToken,
) {
    stats.client_connected();
    tracing::debug!(addr = %addr, "Client connected");

    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(
        reader,
        JobBoxCodec::new(max_frame_len).with_stats(stats.clone()),
    );
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let sink = Arc::new(ClientSink::new(tx));

    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match pack(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(addr = %addr, error = %e, "Failed to encode result");
                    continue;
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                tracing::debug!(addr = %addr, error = %e, "Write to client failed");
                break;
            }
        }
    });

    let read_eof = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break false,
            next = frames.next() => match next {
                Some(Ok(frame)) => submit_frame(&dispatcher, &sink, frame, addr).await,
                Some(Err(e)) => {
                    tracing::warn!(addr = %addr, error = %e, "Client stream error");
                    break false;
                }
                None => break true,
            }
        }
    };
    drop(frames);

    let mut writer_done = false;
    if read_eof {
        tracing::debug!(
            addr = %addr,
            outstanding = sink.outstanding(),
            "Client finished sending, awaiting results"
        );
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sink.drained() => {}
            _ = &mut writer_task => {
                tracing::debug!(addr = %addr, "Client stopped reading results");
                writer_done = true;
            }
        }
    }

    // Dropping the only strong reference orphans every job still in flight
    // and closes the result channel.
    drop(sink);
    if !writer_done {
        if read_eof && !shutdown.is_cancelled() {
            // Flush results already routed to this connection
            if let Err(e) = writer_task.await {
                tracing::warn!(addr = %addr, error = %e, "Client writer task failed");
            }
        } else {
            writer_task.abort();
        }
    }
    stats.client_disconnected();
    tracing::debug!(addr = %addr, "Client disconnected");
}

async fn submit_frame(
    dispatcher: &SharedDispatcher,
    sink: &Arc<ClientSink>,
    frame: Frame,
    addr: SocketAddr,
) {
    if frame.command != Command::Task {
        tracing::warn!(addr = %addr, command = %frame.command, "Unexpected frame from client, ignoring");
        return;
    }

    sink.job_submitted();
    let job = Job::with_client(JobId::next(), frame.body, sink);
    let job_id = job.id;
    match dispatcher.lock().await.submit(job) {
        Ok(SubmitOutcome::Assigned(worker_id)) => {
            tracing::debug!(job_id = %job_id, worker_id = %worker_id, "Client job assigned");
        }
        Ok(SubmitOutcome::Queued) => {
            tracing::debug!(job_id = %job_id, "Client job queued");
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, addr = %addr, error = %e, "Client job rejected");
        }
    }
}

/// Minimal client for submitting jobs through the proxy.
///
/// Results carry no job id and arrive in completion order, so keep one job
/// in flight per connection when results must be matched to jobs. Pipelined
/// [`send`](Self::send) calls are fine when any-order results are acceptable,
/// or when a single worker serves the connection.
pub struct JobClient {
    reader: FramedRead<OwnedReadHalf, JobBoxCodec>,
    writer: OwnedWriteHalf,
}

impl JobClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(reader, JobBoxCodec::new(DEFAULT_MAX_FRAME_LEN)),
            writer,
        })
    }

    /// Send a job without waiting for its result.
    pub async fn send(&mut self, body: impl Into<Bytes>) -> Result<()> {
        let bytes = pack(&Frame::task(body))?;
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Wait for the next result on this connection.
    pub async fn recv(&mut self) -> Result<Bytes> {
        while let Some(frame) = self.reader.next().await {
            let frame = frame?;
            if frame.command == Command::TaskDone {
                return Ok(frame.body);
            }
            tracing::warn!(command = %frame.command, "Unexpected frame from proxy, ignoring");
        }
        Err(ProxyError::ConnectionClosed)
    }

    /// Send one job and wait for its result.
    pub async fn submit(&mut self, body: impl Into<Bytes>) -> Result<Bytes> {
        self.send(body).await?;
        self.recv().await
    }
}
