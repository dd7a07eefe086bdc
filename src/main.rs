mod app;
mod backend;
mod cli;
mod config;
mod ingest;
mod metrics;
mod plans;
mod pricing;
mod remote;
mod server;
mod storage;
mod sync;
mod tui;
mod usage;

use anyhow::{Context, Result};
use clap::Parser;
use std::{fs::OpenOptions, sync::Mutex};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = cli::Cli::parse();
    let config = config::AppConfig::load(cli.config_path.as_deref())?;
    let app = app::App::new(config).await?;
    app.run(cli.run_options()).await
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // The TUI owns the terminal, so tracing output goes to a file.
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("claude-usage.log")
        .context("failed to open claude-usage.log for tracing output")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .try_init();
    Ok(())
}
