//! Orchestrator CLI entry point.

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use orchestrator_cli::cli::Cli;
use orchestrator_cli::commands;

#[tokio::main]
async fn main() {
    // Local overrides such as ORCHESTRATOR_ROOT or ORCHESTRATOR_HEARTBEAT_SECS
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = commands::execute(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}
