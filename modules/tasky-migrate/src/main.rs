use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use tasky_migrate::file_config::{load_config, FileConfig};
use tasky_migrate::{telemetry, MigrateConfig, Migrator, PgConnector, Settings};

const DEFAULT_PATCH_DIR: &str = "./patches";

#[derive(Parser)]
#[command(name = "tasky-migrate", version, about = "Bootstrap the Tasky database and apply SQL patches")]
struct Cli {
    /// Path to an optional TOML config file (retry tuning, patch dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of .sql patch files
    #[arg(long, env = "PATCH_DIR")]
    patch_dir: Option<PathBuf>,

    /// App database URL: the database, role and password to provision
    #[arg(long, env = "POSTGRES_DB_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Privileged URL used to create the database and role
    #[arg(long, env = "POSTGRES_MIGRATION_URL", hide_env_values = true)]
    migration_database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Provision database and role, apply pending patches, grant privileges (default)
    Run {
        /// Exit non-zero when any patch failed
        #[arg(long)]
        fail_on_patch_error: bool,
    },
    /// Show applied and pending patches without changing anything
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    if let Err(e) = telemetry::init() {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "tasky-migrate failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    info!(
        service = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting"
    );

    let file_config = match &cli.config {
        Some(path) => {
            info!(config = %path.display(), "Loading config");
            load_config(path)?
        }
        None => FileConfig::default(),
    };

    let settings = Settings {
        database_url: cli.database_url,
        migration_database_url: cli.migration_database_url,
        patch_dir: cli
            .patch_dir
            .or(file_config.migrations.patch_dir)
            .or_else(|| Some(PathBuf::from(DEFAULT_PATCH_DIR))),
        retry: file_config.retry.into(),
    };
    let config = MigrateConfig::from_settings(settings).context("Invalid configuration")?;
    config.log_redacted();

    let migrator = Migrator::new(config, Arc::new(PgConnector));

    match cli.command.unwrap_or(Command::Run {
        fail_on_patch_error: false,
    }) {
        Command::Run {
            fail_on_patch_error,
        } => {
            let report = migrator.run().await?;
            let json = serde_json::to_string(&report)?;
            info!(report = %json, "Run report");
            if fail_on_patch_error && report.has_failures() {
                error!(failed = ?report.failed(), "Patches failed");
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status => {
            let status = migrator.status().await?;
            println!("Applied ({}):", status.applied.len());
            for record in &status.applied {
                println!("  {}  {}", record.created.to_rfc3339(), record.filename);
            }
            println!("Pending ({}):", status.pending.len());
            for patch in &status.pending {
                println!("  {}", patch.filename);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
