//! gpud: on-host GPU node diagnostic and health-monitoring daemon.
//!
//! CLI shape follows the teacher's `heal` binary
//! (`crates/healer/src/main.rs`): a top-level `clap::Parser` with global
//! flags and a `Subcommand` enum, one variant per mode.

mod bootstrap;
mod config;
mod http;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::GpudConfig;

/// On-host GPU node diagnostic and health-monitoring daemon.
#[derive(Parser)]
#[command(name = "gpud")]
#[command(about = "On-host GPU node diagnostic and health-monitoring daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the daemon config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON instead of the default human-readable format.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon: bootstrap the registry, load plugins, and serve the
    /// HTTP API until a shutdown signal arrives.
    Serve,
    /// Run every built-in component once and print a human-readable
    /// report. Exit code is always 0 regardless of individual component
    /// health (see `gpud_scan::ScanReport::exit_code`).
    Scan {
        /// Node name used in the kubelet-pods component's reason strings.
        #[arg(long, default_value = "")]
        node_name: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config_path = cli.config.unwrap_or_else(GpudConfig::default_path);
    let config = GpudConfig::load_or_default(&config_path)?;

    match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Scan { node_name } => run_scan(&config, node_name).await,
    }
}

async fn run_serve(config: &GpudConfig) -> anyhow::Result<()> {
    let daemon = bootstrap::bootstrap(config, CancellationToken::new()).await?;
    http::serve(std::sync::Arc::new(daemon), &config.bind_addr).await
}

async fn run_scan(config: &GpudConfig, node_name: String) -> anyhow::Result<()> {
    let node_name = if node_name.is_empty() { config.node_name.clone() } else { node_name };

    let options = gpud_scan::ScanOptions {
        debug: false,
        infiniband_class_root_override: config.infiniband_class_root.clone(),
        failure_injector: None,
        kubelet_node_name: node_name,
    };

    let report = gpud_scan::run_scan(options, &gpud_scan::UnknownMachineInfo).await?;
    std::process::exit(report.exit_code());
}
