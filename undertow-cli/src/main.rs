//! Undertow CLI - Command-line interface
//!
//! Runs the streaming server or a one-off transcode through the cache.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "On-the-fly transcoding media streamer", version)]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full debug log
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// JSON configuration file; environment overrides still apply
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("failed to initialize logging")?;

    let config = commands::load_config(cli.config.as_deref())?;
    commands::handle_command(cli.command, config).await
}
