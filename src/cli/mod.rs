//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running a MySQL box until interrupted (`run`)
//! - Removing containers left behind by crashed test runs (`prune`)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ColorChoice, Parser, Subcommand};
use secrecy::SecretString;

use crate::config::BoxConfig;
use crate::container::ContainerController;
use crate::instance::MySqlBox;
use crate::logs::ErrorLog;
use crate::runtime::DockerRuntime;
use crate::script::ScriptPayload;

#[derive(Parser, Debug)]
#[command(name = "mysqlbox")]
#[command(about = "Disposable MySQL servers in Docker containers")]
#[command(
    long_about = "Starts throwaway MySQL servers for integration tests.\nExamples:\n  mysqlbox run --schema schema.sql  # Start a server and print its DSN\n  mysqlbox prune  # Remove orphaned containers"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a server and keep it running until Ctrl-C
    #[command(
        about = "Run a MySQL box",
        long_about = "Starts a MySQL container, prints its DSN and stops it on Ctrl-C.\nExample: mysqlbox run --schema schema.sql --port 3307"
    )]
    Run(RunArgs),

    /// Remove every container started by mysqlbox
    #[command(
        about = "Remove orphaned containers",
        long_about = "Force-removes containers carrying the mysqlbox label.\nExample: mysqlbox prune"
    )]
    Prune,
}

#[derive(clap::Args, Debug, Default)]
pub struct RunArgs {
    /// Docker image
    #[arg(long, env = "MYSQLBOX_IMAGE")]
    pub image: Option<String>,

    /// Container name (generated when omitted)
    #[arg(long, env = "MYSQLBOX_CONTAINER_NAME")]
    pub name: Option<String>,

    /// Database to create
    #[arg(long, env = "MYSQLBOX_DATABASE")]
    pub database: Option<String>,

    /// Root password (empty password when omitted)
    #[arg(long, env = "MYSQLBOX_ROOT_PASSWORD", hide_env_values = true)]
    pub root_password: Option<String>,

    /// Host port (0 lets Docker choose)
    #[arg(long, env = "MYSQLBOX_PORT", default_value_t = 0)]
    pub port: u16,

    /// SQL script run on first boot
    #[arg(long, env = "MYSQLBOX_SCHEMA")]
    pub schema: Option<PathBuf>,

    /// Forward the container's stdout/stderr to this terminal
    #[arg(long)]
    pub show_logs: bool,
}

impl RunArgs {
    /// Build the box configuration. Collected error lines go to `errors`.
    pub fn into_config(self, errors: ErrorLog) -> anyhow::Result<BoxConfig> {
        let initial_sql = self
            .schema
            .as_ref()
            .map(|path| {
                ScriptPayload::from_file(path)
                    .with_context(|| format!("failed to read {}", path.display()))
            })
            .transpose()?;

        let mut config = BoxConfig {
            container_name: self.name.unwrap_or_default(),
            image: self.image.unwrap_or_default(),
            database: self.database.unwrap_or_default(),
            root_password: self.root_password.map(SecretString::from),
            port: self.port,
            initial_sql,
            logged_errors: Some(errors),
            ..Default::default()
        };

        if self.show_logs {
            config.stdout = Some(Box::new(tokio::io::stdout()));
            config.stderr = Some(Box::new(tokio::io::stderr()));
        }

        Ok(config)
    }
}

/// Start a box, print its DSN and stop it on Ctrl-C.
pub async fn run_box_command(args: RunArgs) -> anyhow::Result<()> {
    let errors = ErrorLog::new();
    let config = args.into_config(errors.clone())?;

    let mysql = match MySqlBox::start(config).await {
        Ok(mysql) => mysql,
        Err(e) => {
            print_error_lines(&errors);
            return Err(e).context("failed to start MySQL box");
        }
    };

    println!("{}", mysql.dsn());
    eprintln!(
        "MySQL box '{}' listening on {} (Ctrl-C to stop)",
        mysql.container_name(),
        mysql.addr()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let stopped = mysql.stop().await;
    print_error_lines(&errors);
    stopped.context("failed to stop MySQL box")
}

/// Remove containers carrying the mysqlbox label.
pub async fn run_prune_command() -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect().await?;
    let controller = ContainerController::new(Arc::new(runtime));

    let removed = controller.prune().await?;
    for id in &removed {
        println!("{}", id);
    }
    eprintln!("Removed {} container(s)", removed.len());
    Ok(())
}

fn print_error_lines(errors: &ErrorLog) {
    for line in errors.lines() {
        eprintln!("{}", line);
    }
}
