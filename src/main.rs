//! rtconfig - Replicated Table Configuration CLI
//!
//! Operator tool for inspecting and changing the replicated chain
//! configuration kept in a set of blob locations.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtconfig::codec;
use rtconfig::config::{LoggingConfig, ServiceConfig};
use rtconfig::quorum::{QuorumReadResult, ReadStatus, UpdateMode};
use rtconfig::ConfigurationService;

/// rtconfig - Replicated Table Configuration Service
#[derive(Parser)]
#[command(name = "rtconfig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rtconfig.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration agreed by a majority of locations
    Show,

    /// Print what every location holds
    Dump,

    /// Print one view
    View {
        /// View name
        name: String,
    },

    /// Check whether a table is configured
    IsConfigured {
        /// Table name
        table: String,
    },

    /// Upload a configuration from a JSON file
    Upload {
        /// JSON file holding the configuration
        file: PathBuf,

        /// Overwrite regardless of the stored configuration id
        #[arg(long)]
        force: bool,
    },

    /// Switch a storage account off in every view
    TurnOff {
        /// Storage account name
        account: String,
    },

    /// Bring a storage account back (currently does nothing)
    TurnOn {
        /// Storage account name
        account: String,
    },

    /// Keep the service running and log configuration changes
    Watch,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "rtconfig.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = ServiceConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        command => {
            let config = ServiceConfig::from_file(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            let service = ConfigurationService::from_config(&config)?;
            let result = run_command(&service, command).await;
            service.shutdown().await;
            result
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run_command(service: &ConfigurationService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Show => {
            let (result, configuration) = service.retrieve_configuration().await;
            match (result, configuration) {
                (QuorumReadResult::Success, Some(configuration)) => {
                    println!("{}", codec::encode_pretty(&configuration)?);
                }
                (result, _) => bail!("quorum read failed: {}", result),
            }
        }
        Commands::Dump => {
            let reads = service.retrieve_all_configurations().await;
            let populated = reads
                .iter()
                .filter(|r| !matches!(r.status, ReadStatus::NotFound | ReadStatus::Unreachable(_)))
                .count();
            let unreachable = reads
                .iter()
                .filter(|r| matches!(r.status, ReadStatus::Unreachable(_)))
                .count();
            println!(
                "{} of {} locations hold a configuration, {} unreachable",
                populated,
                reads.len(),
                unreachable
            );
            for read in reads {
                let status = match &read.status {
                    ReadStatus::Success => "ok".to_string(),
                    ReadStatus::NotFound => "not found".to_string(),
                    ReadStatus::DecodeError(e) => format!("undecodable ({})", e),
                    ReadStatus::Unreachable(e) => format!("unreachable ({})", e),
                };
                println!(
                    "{:<60} {:<12} id={} etag={}",
                    read.location.to_string(),
                    status,
                    read.configuration.as_ref().map(|c| c.id.as_str()).unwrap_or("-"),
                    read.etag.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::View { name } => {
            let view = service.get_view(&name).await;
            if view.is_empty() {
                println!("View '{}' is empty", name);
            } else {
                println!("{}", serde_json::to_string_pretty(&view)?);
            }
        }
        Commands::IsConfigured { table } => {
            let configured = service.is_configured_table(&table).await;
            println!("{}: {}", table, if configured { "configured" } else { "not configured" });
        }
        Commands::Upload { file, force } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let mut configuration = codec::decode(&bytes)
                .with_context(|| format!("decoding {}", file.display()))?;
            let mode = if force { UpdateMode::Unconditional } else { UpdateMode::Conditional };

            let result = service.update_configuration(&mut configuration, mode).await?;
            if !result.is_success() {
                bail!("quorum write failed: {}", result);
            }
            println!("Configuration written, id={}", configuration.id);
        }
        Commands::TurnOff { account } => {
            service.turn_replica_off(&account).await?;
            println!("{} switched off", account);
        }
        Commands::TurnOn { account } => {
            service.turn_replica_on(&account);
            println!("{}: turning replicas on is not supported yet, nothing changed", account);
        }
        Commands::Watch => {
            tracing::info!("Watching configuration, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("Received shutdown signal");
        }
        Commands::Init { .. } | Commands::Validate => unreachable!("handled without a service"),
    }

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    ServiceConfig::sample().write_to(&output)?;
    println!("Configuration file created: {}", output.display());
    println!("Edit the locations, then run: rtconfig --config {} validate", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match ServiceConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Locations: {}", config.store.locations.len());
            for location in &config.store.locations {
                println!("    {}", location.url(config.store.use_https));
            }
            println!("  Quorum Size: {}", config.quorum_size());
            println!("  Lock Timeout: {:?}", config.lock_timeout());
            println!("  Monitor Interval: {:?}", config.monitor_interval());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
