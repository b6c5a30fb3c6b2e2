use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

const DEFAULT_MAX_PENDING_JOBS: usize = 10_000;

/// Runtime configuration for a [`ProxyServer`](crate::server::ProxyServer).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address clients connect to when submitting jobs
    pub client_listen_addr: SocketAddr,
    /// Address worker processes connect to
    pub worker_listen_addr: SocketAddr,
    /// Address for the HTTP stats endpoint. Disabled when `None`.
    pub stats_addr: Option<SocketAddr>,
    /// Largest frame body accepted before the stream is treated as corrupt
    pub max_frame_len: usize,
    /// Upper bound on queued (unassigned) jobs
    pub max_pending_jobs: usize,
    /// Per-job deadline. A busy worker past its deadline is disconnected
    /// and its job dropped. No deadline when `None`.
    pub job_timeout_ms: Option<u64>,
    /// How often the deadline sweep runs
    pub sweep_interval_ms: u64,
    /// How often a stats snapshot is logged. Disabled when `None`.
    pub stats_log_interval_ms: Option<u64>,
    /// Discard queued jobs whose client has disconnected instead of
    /// dispatching them.
    pub drop_orphaned_jobs: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            client_listen_addr: SocketAddr::from(([127, 0, 0, 1], 7700)),
            worker_listen_addr: SocketAddr::from(([127, 0, 0, 1], 7701)),
            stats_addr: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_pending_jobs: DEFAULT_MAX_PENDING_JOBS,
            job_timeout_ms: None,
            sweep_interval_ms: 1000,
            stats_log_interval_ms: Some(30_000),
            drop_orphaned_jobs: true,
        }
    }
}

impl ProxyConfig {
    pub fn new(client_listen_addr: SocketAddr, worker_listen_addr: SocketAddr) -> Self {
        Self {
            client_listen_addr,
            worker_listen_addr,
            ..Default::default()
        }
    }

    pub fn with_stats_addr(mut self, addr: SocketAddr) -> Self {
        self.stats_addr = Some(addr);
        self
    }

    pub fn with_job_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.job_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.sweep_interval_ms = interval_ms;
        self
    }

    pub fn with_max_pending_jobs(mut self, max: usize) -> Self {
        self.max_pending_jobs = max;
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_drop_orphaned_jobs(mut self, drop_orphaned: bool) -> Self {
        self.drop_orphaned_jobs = drop_orphaned;
        self
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_config_default() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.client_listen_addr.to_string(), "127.0.0.1:7700");
        assert_eq!(cfg.worker_listen_addr.to_string(), "127.0.0.1:7701");
        assert!(cfg.stats_addr.is_none());
        assert_eq!(cfg.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(cfg.max_pending_jobs, 10_000);
        assert!(cfg.job_timeout_ms.is_none());
        assert_eq!(cfg.sweep_interval_ms, 1000);
        assert_eq!(cfg.stats_log_interval_ms, Some(30_000));
        assert!(cfg.drop_orphaned_jobs);
    }

    #[test]
    fn proxy_config_new() {
        let client: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let worker: SocketAddr = "10.0.0.1:9001".parse().unwrap();
        let cfg = ProxyConfig::new(client, worker);
        assert_eq!(cfg.client_listen_addr, client);
        assert_eq!(cfg.worker_listen_addr, worker);
        assert_eq!(cfg.max_pending_jobs, 10_000);
    }

    #[test]
    fn proxy_config_builders() {
        let stats: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ProxyConfig::default()
            .with_stats_addr(stats)
            .with_job_timeout_ms(250)
            .with_sweep_interval_ms(50)
            .with_max_pending_jobs(3)
            .with_max_frame_len(1024)
            .with_drop_orphaned_jobs(false);

        assert_eq!(cfg.stats_addr, Some(stats));
        assert_eq!(cfg.job_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.sweep_interval_ms, 50);
        assert_eq!(cfg.max_pending_jobs, 3);
        assert_eq!(cfg.max_frame_len, 1024);
        assert!(!cfg.drop_orphaned_jobs);
    }

    #[test]
    fn job_timeout_absent_by_default() {
        assert!(ProxyConfig::default().job_timeout().is_none());
    }
}
