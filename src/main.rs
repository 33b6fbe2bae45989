// ABOUTME: Main entry point for the spool binary
// ABOUTME: Loads .env, installs logging, then dispatches the parsed subcommand

use anyhow::Result;
use clap::Parser;
use spool::{cli, logging, paths};

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\nPANIC: spool crashed: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    dotenvy::dotenv().ok();
    let cli = cli::Cli::parse();

    let _log_guard = logging::init(&paths::log_dir())?;
    tracing::debug!(command = ?cli.command, "Starting spool");

    if let Err(e) = cli::run(cli).await {
        tracing::error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}
