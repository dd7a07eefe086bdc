use crate::app::RunOptions;
use clap::Parser;
use std::path::PathBuf;

const PLAN_IDS: [&str; 3] = ["pro", "max5", "max20"];

/// Command-line interface for the usage dashboard.
#[derive(Debug, Parser)]
#[command(author, version, about = "Local Claude usage dashboard and TUI", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to ./claude-usage.toml if present).
    #[arg(long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
    /// Rebuild usage data by clearing stored entries and re-reading all session logs.
    #[arg(long, conflicts_with = "remote")]
    pub rebuild: bool,
    /// Save this plan (pro, max5, max20) as the active one before starting.
    #[arg(long, value_name = "ID", value_parser = PLAN_IDS)]
    pub plan: Option<String>,
    /// Ingest and serve the JSON API without the TUI.
    #[arg(long, conflicts_with = "remote")]
    pub headless: bool,
    /// Show usage served by another instance instead of local logs.
    #[arg(long, value_name = "URL")]
    pub remote: Option<String>,
}

impl Cli {
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            rebuild: self.rebuild,
            plan: self.plan.clone(),
            headless: self.headless,
            remote: self.remote.clone(),
        }
    }
}
