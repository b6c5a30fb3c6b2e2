use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{pack, Command, Frame, JobBoxCodec, DEFAULT_MAX_FRAME_LEN};

/// Turns a job body into a result body.
pub trait JobHandler: Send + Sync {
    fn handle(&self, body: Bytes) -> Bytes;
}

/// Returns every job body unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl JobHandler for EchoHandler {
    fn handle(&self, body: Bytes) -> Bytes {
        body
    }
}

/// A worker process: connects to the proxy's worker port, runs each TASK
/// through a [`JobHandler`] and answers with TASK_DONE.
#[derive(Debug, Clone)]
pub struct WorkerRunner<H> {
    handler: H,
    delay: Option<Duration>,
    max_frame_len: usize,
}

impl<H: JobHandler> WorkerRunner<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            delay: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sleep this long before replying to each job
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Connect to `addr` and serve jobs until the proxy closes the
    /// connection or `shutdown` fires. Returns the number of jobs executed.
    pub async fn run(&self, addr: impl ToSocketAddrs, shutdown: CancellationToken) -> Result<u64> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        tracing::info!(proxy = %peer, "Worker connected to proxy");

        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, JobBoxCodec::new(self.max_frame_len));
        let mut executed = 0u64;

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = frames.next() => match next {
                    Some(frame) => frame?,
                    None => {
                        tracing::info!(proxy = %peer, "Proxy closed connection");
                        break;
                    }
                },
            };

            if frame.command != Command::Task {
                tracing::warn!(command = %frame.command, "Unexpected frame from proxy, ignoring");
                continue;
            }

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let result = self.handler.handle(frame.body);
            writer.write_all(&pack(&Frame::task_done(result))?).await?;
            executed += 1;
            tracing::debug!(executed, "Job executed");
        }

        Ok(executed)
    }
}
