//! votebot: a multi-tenant topic-voting chat bot.
//!
//! `connect` registers a team from a bot credential; `daemon` runs one live
//! session per registered team until the process is killed.

mod config;
mod db;
mod grammar;
mod ledger;
mod manager;
mod roster;
mod session;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use manager::{AddTeamRequest, LocalManager, Manager, RemoteManager};
use transport::{Connector, SlackConnector};

#[derive(Parser)]
#[command(name = "votebot", version, about = "Topic voting chat bot")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "votebot.yaml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Add a team: run the identity handshake and store the credential
    Connect {
        /// Per-team bot credential issued by the chat provider
        authtoken: String,
    },
    /// Perform the botly duties: one live session per registered team
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    if let Some(db_path) = cli.db {
        config.database = db_path;
    }

    // The daemon also logs to a file; one-shot commands only to stdout.
    let _guard = init_logging(&config, matches!(cli.command, CliCommand::Daemon))?;

    let pool = db::init_pool(&config.database)
        .await
        .context("failed to open database")?;
    let connector: Arc<dyn Connector> = Arc::new(SlackConnector::new());

    match cli.command {
        CliCommand::Connect { authtoken } => {
            let manager: Arc<dyn Manager> = match &config.manager_url {
                Some(url) => Arc::new(RemoteManager::new(url.clone())),
                None => Arc::new(LocalManager::new(pool.clone(), connector.clone())),
            };
            match manager
                .add_team(AddTeamRequest {
                    auth_token: authtoken,
                })
                .await
            {
                Ok(resp) => println!("Connected to team {} as {}", resp.name, resp.bot_name),
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            }
        }
        CliCommand::Daemon => {
            tracing::info!(database = %config.database.display(), "starting votebot daemon");
            manager::run_sessions(pool, connector)
                .await
                .context("failed to list teams")?;
        }
    }

    Ok(())
}

/// Layered tracing setup: EnvFilter (RUST_LOG wins over the config file),
/// always a stdout layer, plus a non-blocking file layer for the daemon.
/// The returned guard must stay alive for the file writer to flush.
fn init_logging(config: &AppConfig, with_file: bool) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let stdout_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);

    if !with_file {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stdout_layer)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.log_dir).with_context(|| {
        format!("failed to create log directory {}", config.log_dir.display())
    })?;
    let file_appender = tracing_appender::rolling::never(&config.log_dir, "votebot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(Some(guard))
}
