//! Tidal CLI - continuous micro-batch ingestion into versioned tables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidal_core::config::{LogFormat, StartPolicy, WriteMode};
use tidal_core::{CommitError, Config};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Source error (connection, assignment, data loss, undecodable input)
    SourceError = 2,
    /// Table error (schema mismatch, conflicts, missing table)
    TableError = 3,
    /// Storage error (S3, filesystem)
    StorageError = 4,
    /// Checkpoint error
    CheckpointError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by the kind of core error it carries.
    fn from_error(error: &anyhow::Error) -> Self {
        let Some(core) = error.downcast_ref::<tidal_core::Error>() else {
            return if error.downcast_ref::<toml::de::Error>().is_some() {
                ExitCode::ConfigError
            } else {
                ExitCode::RuntimeError
            };
        };

        match core {
            tidal_core::Error::Config(_) => ExitCode::ConfigError,
            tidal_core::Error::Source(_) | tidal_core::Error::Decode(_) => ExitCode::SourceError,
            tidal_core::Error::Commit(CommitError::StorageUnavailable(_)) => {
                ExitCode::StorageError
            }
            tidal_core::Error::Commit(_) | tidal_core::Error::Table(_) => ExitCode::TableError,
            tidal_core::Error::Io(_) => ExitCode::StorageError,
            tidal_core::Error::Checkpoint(_) => ExitCode::CheckpointError,
            tidal_core::Error::Serialization(_) | tidal_core::Error::Shutdown => {
                ExitCode::RuntimeError
            }
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "tidal")]
#[command(about = "Continuous micro-batch ingestion into versioned tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from Kafka into the table until interrupted
    Ingest {
        /// Override Kafka bootstrap servers (comma separated)
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override source topic
        #[arg(long)]
        topic: Option<String>,

        /// Override start policy
        #[arg(long, value_enum)]
        start_policy: Option<StartPolicyArg>,
    },

    /// Load a JSON-lines file into the table and exit
    Backfill {
        /// Input file, one JSON record per line
        #[arg(long)]
        file: PathBuf,

        /// Override write mode
        #[arg(long, value_enum)]
        mode: Option<WriteModeArg>,
    },

    /// Validate configuration file
    Validate,

    /// Show health and metrics of a running pipeline
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL
        #[arg(long, default_value = "http://localhost:9090")]
        metrics_url: String,
    },

    /// Print statistics of the table's current snapshot
    Inspect {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop and recreate the table (requires table.allow_rebuild)
    Rebuild {
        /// Confirm the destructive operation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StartPolicyArg {
    Earliest,
    Latest,
    Resume,
}

impl From<StartPolicyArg> for StartPolicy {
    fn from(arg: StartPolicyArg) -> Self {
        match arg {
            StartPolicyArg::Earliest => StartPolicy::Earliest,
            StartPolicyArg::Latest => StartPolicy::Latest,
            StartPolicyArg::Resume => StartPolicy::ResumeFromCheckpoint,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum WriteModeArg {
    Insert,
    Upsert,
}

impl From<WriteModeArg> for WriteMode {
    fn from(arg: WriteModeArg) -> Self {
        match arg {
            WriteModeArg::Insert => WriteMode::Insert,
            WriteModeArg::Upsert => WriteMode::Upsert,
        }
    }
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config when it parses; JSON otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map_or("info", |m| m.log_level.as_filter()),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = ?e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            bootstrap_servers,
            topic,
            start_policy,
        } => {
            let config = load_config(&cli.config)?;
            commands::ingest::run(config, bootstrap_servers, topic, start_policy.map(Into::into))
                .await?;
        }

        Commands::Backfill { file, mode } => {
            let config = load_config(&cli.config)?;
            commands::backfill::run(config, file, mode.map(Into::into)).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!(
                "Configuration is valid: {} -> {} ({:?})",
                config.source.topic,
                config.table.qualified_name(),
                config.table.write_mode
            );
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, &metrics_url).await?;
        }

        Commands::Inspect { json } => {
            let config = load_config(&cli.config)?;
            commands::inspect::run(config, json).await?;
        }

        Commands::Rebuild { yes } => {
            let config = load_config(&cli.config)?;
            commands::rebuild::run(config, yes).await?;
        }
    }

    Ok(())
}

/// Load and validate the configuration file.
fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Ok(Config::from_file(&path)?)
}
