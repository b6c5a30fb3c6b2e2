use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::client::run_client_connection;
use crate::config::ProxyConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::scheduler::{JobDispatcher, SharedDispatcher};
use crate::stats::StatCounter;
use crate::worker::run_worker_connection;

/// Owns the listeners, the dispatcher and the stat counter for the life of
/// the proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    dispatcher: SharedDispatcher,
    stats: Arc<StatCounter>,
    shutdown: CancellationToken,
    client_listener: TcpListener,
    worker_listener: TcpListener,
    stats_listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Bind every configured listener. Port 0 picks a free port; use the
    /// `*_addr` accessors to find out which.
    pub async fn bind(config: ProxyConfig, shutdown: CancellationToken) -> Result<Self> {
        let stats = Arc::new(StatCounter::new());
        let dispatcher = Arc::new(Mutex::new(JobDispatcher::from_config(
            &config,
            stats.clone(),
        )));

        let client_listener = TcpListener::bind(config.client_listen_addr).await?;
        let worker_listener = TcpListener::bind(config.worker_listen_addr).await?;
        let stats_listener = match config.stats_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        Ok(Self {
            config,
            dispatcher,
            stats,
            shutdown,
            client_listener,
            worker_listener,
            stats_listener,
        })
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    pub fn worker_addr(&self) -> Result<SocketAddr> {
        Ok(self.worker_listener.local_addr()?)
    }

    pub fn stats_addr(&self) -> Result<Option<SocketAddr>> {
        match &self.stats_listener {
            Some(listener) => Ok(Some(listener.local_addr()?)),
            None => Ok(None),
        }
    }

    pub fn dispatcher(&self) -> SharedDispatcher {
        self.dispatcher.clone()
    }

    pub fn stats(&self) -> Arc<StatCounter> {
        self.stats.clone()
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Spawns:
    /// 1. the worker accept loop (one task per worker connection)
    /// 2. the client accept loop (one task per client connection)
    /// 3. the deadline sweep, when a job timeout is configured
    /// 4. the periodic stats log, when enabled
    /// 5. the HTTP stats server, when enabled
    pub async fn run(self) -> Result<()> {
        tracing::info!(
            client_addr = %self.client_addr()?,
            worker_addr = %self.worker_addr()?,
            stats_addr = ?self.stats_addr()?,
            job_timeout_ms = ?self.config.job_timeout_ms,
            "Starting job proxy"
        );

        let mut tasks = Vec::new();

        if let Some(timeout) = self.config.job_timeout() {
            tracing::info!(timeout_ms = timeout.as_millis() as u64, "Job deadlines enabled");
            tasks.push(tokio::spawn(sweep_loop(
                self.dispatcher.clone(),
                Duration::from_millis(self.config.sweep_interval_ms.max(1)),
                self.shutdown.clone(),
            )));
        }

        if let Some(interval_ms) = self.config.stats_log_interval_ms {
            tasks.push(tokio::spawn(stats_log_loop(
                self.stats.clone(),
                Duration::from_millis(interval_ms.max(1)),
                self.shutdown.clone(),
            )));
        }

        if let Some(listener) = self.stats_listener {
            let state = DashboardState {
                dispatcher: self.dispatcher.clone(),
                stats: self.stats.clone(),
            };
            tasks.push(tokio::spawn(run_dashboard(
                listener,
                state,
                self.shutdown.clone(),
            )));
        }

        let max_frame_len = self.config.max_frame_len;

        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(accept_loop(
            self.worker_listener,
            "worker",
            self.shutdown.clone(),
            move |stream, addr| {
                run_worker_connection(
                    stream,
                    addr,
                    dispatcher.clone(),
                    stats.clone(),
                    max_frame_len,
                    shutdown.clone(),
                )
            },
        )));

        let dispatcher = self.dispatcher.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(accept_loop(
            self.client_listener,
            "client",
            self.shutdown.clone(),
            move |stream, addr| {
                run_client_connection(
                    stream,
                    addr,
                    dispatcher.clone(),
                    stats.clone(),
                    max_frame_len,
                    shutdown.clone(),
                )
            },
        )));

        self.shutdown.cancelled().await;
        tracing::info!("Shutting down job proxy");

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.stats.log_snapshot();
        Ok(())
    }
}

/// Accept connections until `shutdown`, spawning `handle` for each one.
async fn accept_loop<F, Fut>(
    listener: TcpListener,
    kind: &'static str,
    shutdown: CancellationToken,
    handle: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(kind, addr = %addr, "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(kind, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(handle(stream, addr));
                }
                Err(e) => {
                    tracing::warn!(kind, error = %e, "Accept failed");
                }
            }
        }
    }
}

/// Periodically disconnect workers whose job deadline has passed.
async fn sweep_loop(dispatcher: SharedDispatcher, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let expired = dispatcher.lock().await.expire(Instant::now());
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "Expired overdue jobs");
                }
            }
        }
    }
}

async fn stats_log_loop(stats: Arc<StatCounter>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    // The first tick fires immediately; skip it so the first report has data.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => stats.log_snapshot(),
        }
    }
}
