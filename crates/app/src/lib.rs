use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use mrserve_core::algorithms::AlgorithmRegistry;
use mrserve_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use mrserve_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use mrserve_core::server::{app_router, app_state_with_config};
use mrserve_core::worker::{Worker, DEFAULT_POLL_INTERVAL_MS};

#[derive(Parser)]
#[command(
    name = "mrserve",
    about = "Web-facing MRI reconstruction job server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconstruction worker process
    Worker(WorkerArgs),
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(
        long,
        value_name = "MS",
        help = "Queue poll interval in milliseconds"
    )]
    poll_interval_ms: Option<u64>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Some(Commands::Worker(args)) => run_worker(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::select_log_filter(&options);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready(ready) => {
            let console_filter = parse_env_filter_with_fallback(&filter, "console");
            let file_filter = parse_env_filter_with_fallback(&filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_filter = parse_env_filter_with_fallback(&filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(error) = initialize_data_dir(data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %error, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides();
    config
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, data_dir)?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting mrserve server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);
    let state = app_state_with_config(config, data_dir)?;

    let worker = Worker::new(
        state.store().clone(),
        state.queue().clone(),
        Arc::new(AlgorithmRegistry::with_builtin()),
    );
    let poll_interval =
        Duration::from_millis(args.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS));
    worker.run(poll_interval).await
}
