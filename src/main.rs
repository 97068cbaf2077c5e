//! Admin runtime server.
//!
//! # Architecture Overview
//!
//! ```text
//!   settings.toml ──▶ config ──▶ lifecycle::Orchestrator
//!                                   │
//!                   ┌───────────────┼──────────────────────┐
//!                   ▼               ▼                      ▼
//!            adapters::factory   runtime::Runtime      http::server
//!            cache/queue/locker  (adapters, dbs,       engine + middleware
//!                   │             queues, routes)           │
//!                   └──────────────▶│◀──────────────────────┘
//!                                   ▼
//!                        queue run loops ──▶ audit consumers
//! ```
//!
//! `server` starts the process and blocks until Ctrl+C; `version` prints the
//! build version.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use admin_runtime::config::load_config;
use admin_runtime::observability::logging::init_logging;
use admin_runtime::{LifecycleError, Orchestrator};

#[derive(Parser)]
#[command(name = "admin-runtime")]
#[command(about = "Admin service runtime: adapters, event queues and HTTP server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start API server
    Server {
        /// Configuration file
        #[arg(short, long, default_value = "config/settings.toml")]
        config: PathBuf,

        /// Check API data at startup
        #[arg(short, long)]
        api: bool,
    },
    /// Print the version
    Version,
}

async fn serve(config_path: PathBuf, api_check: bool) -> Result<(), LifecycleError> {
    let config = load_config(&config_path)?;
    init_logging(&config.logger)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %config_path.display(),
        mode = %config.application.mode,
        bind_address = %config.application.bind_address(),
        "Starting api server"
    );

    Orchestrator::new(config)
        .with_config_path(config_path)
        .with_api_check(api_check)
        .run()
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Server { config, api } => match serve(config, api).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Fatal error");
                eprintln!("admin-runtime: {e}");
                ExitCode::FAILURE
            }
        },
    }
}
