use clap::Parser;
use deskpilot_core::cli::{self, Cli, error::CliError};
use deskpilot_core::telemetry::logging as logctl;
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    cli::app::run(cli).await
}
