use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use jobbox_proxy::client::JobClient;
use jobbox_proxy::config::ProxyConfig;
use jobbox_proxy::protocol::DEFAULT_MAX_FRAME_LEN;
use jobbox_proxy::server::ProxyServer;
use jobbox_proxy::shutdown::install_shutdown_handler;
use jobbox_proxy::worker::{EchoHandler, WorkerRunner};

#[derive(Parser, Debug)]
#[command(name = "jobbox-proxy")]
#[command(version)]
#[command(about = "A job-dispatch proxy between clients and a pool of TCP workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the proxy
    Serve(ServeArgs),

    /// Run an echo worker against a proxy
    Worker(WorkerArgs),

    /// Submit one job and print its result
    Submit(SubmitArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port clients submit jobs on
    #[arg(long, default_value = "7700")]
    client_port: u16,

    /// Port workers connect to
    #[arg(long, default_value = "7701")]
    worker_port: u16,

    /// Port for the HTTP stats API (optional)
    #[arg(long)]
    stats_port: Option<u16>,

    /// Disconnect a worker whose job runs longer than this (optional)
    #[arg(long)]
    job_timeout_ms: Option<u64>,

    /// How often to check job deadlines
    #[arg(long, default_value = "1000")]
    sweep_interval_ms: u64,

    /// Maximum number of queued jobs
    #[arg(long, default_value = "10000")]
    max_pending_jobs: usize,

    /// Maximum frame body size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Log a stats snapshot at this interval; 0 disables it
    #[arg(long, default_value = "30000")]
    stats_log_interval_ms: u64,

    /// Dispatch queued jobs even after their client has disconnected
    #[arg(long)]
    keep_orphaned_jobs: bool,
}

// =============================================================================
// Worker / Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Proxy worker address
    #[arg(long, short = 'a', default_value = "127.0.0.1:7701")]
    addr: String,

    /// Simulated work time per job
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Proxy client address
    #[arg(long, short = 'a', default_value = "127.0.0.1:7700")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Job body, sent as UTF-8 bytes
    body: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SubmitOutput {
    result: String,
    result_len: usize,
    elapsed_ms: u64,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn server_config(args: &ServeArgs) -> ProxyConfig {
    let mut config = ProxyConfig::new(
        SocketAddr::new(args.bind, args.client_port),
        SocketAddr::new(args.bind, args.worker_port),
    )
    .with_sweep_interval_ms(args.sweep_interval_ms)
    .with_max_pending_jobs(args.max_pending_jobs)
    .with_max_frame_len(args.max_frame_len)
    .with_drop_orphaned_jobs(!args.keep_orphaned_jobs);

    if let Some(port) = args.stats_port {
        config = config.with_stats_addr(SocketAddr::new(args.bind, port));
    }
    if let Some(timeout_ms) = args.job_timeout_ms {
        config = config.with_job_timeout_ms(timeout_ms);
    }
    config.stats_log_interval_ms =
        (args.stats_log_interval_ms > 0).then_some(args.stats_log_interval_ms);
    config
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone());

    let server = ProxyServer::bind(server_config(&args), shutdown).await?;
    server.run().await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone());

    let mut runner = WorkerRunner::new(EchoHandler);
    if let Some(delay_ms) = args.delay_ms {
        runner = runner.with_delay(Duration::from_millis(delay_ms));
    }

    let executed = runner.run(args.addr.as_str(), shutdown).await?;
    tracing::info!(executed, "Worker stopped");
    Ok(())
}

async fn handle_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let mut client = JobClient::connect(args.addr.as_str()).await?;
    let result = client.submit(args.body.into_bytes()).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match args.output {
        OutputFormat::Json => {
            let output = SubmitOutput {
                result: String::from_utf8_lossy(&result).into_owned(),
                result_len: result.len(),
                elapsed_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Result ({} bytes, {} ms):", result.len(), elapsed_ms);
            for line in String::from_utf8_lossy(&result).lines() {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await?,
        Commands::Worker(worker_args) => run_worker(worker_args).await?,
        Commands::Submit(submit_args) => handle_submit(submit_args).await?,
    }

    Ok(())
}
