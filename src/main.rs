//! mysqlbox - Main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mysqlbox::cli::{Cli, Command, run_box_command, run_prune_command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mysqlbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run_box_command(args).await,
        Command::Prune => run_prune_command().await,
    }
}
