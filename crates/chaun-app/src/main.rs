//! Chaun offline cache worker CLI.
//!
//! Drives the worker lifecycle against the real network and an on-disk
//! cache store.
//!
//! ## Usage
//!
//! ```bash
//! # Pre-cache the asset manifest
//! chaun-worker install
//!
//! # Roll over to a new cache version
//! chaun-worker --cache-version v2 install
//! chaun-worker --cache-version v2 activate
//!
//! # Resolve a request cache-first
//! chaun-worker fetch https://c106-chaun.s3.ap-northeast-2.amazonaws.com/character_animation/B5entry.glb
//!
//! # Full page-load sequence: register, install, activate, claim
//! chaun-worker run --client http://localhost:3000/home
//! ```

use std::path::PathBuf;

use chaun_common::{init_logging, LogConfig, LogFormat};
use chaun_core::{AppConfig, CoreResult};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "chaun-worker")]
#[command(about = "Offline asset cache worker for the Chaun client", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the cache stores
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Cache version, e.g. v2
    #[arg(long, global = true)]
    cache_version: Option<String>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Pre-cache the asset manifest into the current store
    Install,

    /// Delete every cache store except the current one
    Activate,

    /// Resolve one request through the fetch handler
    Fetch {
        /// Absolute request URL
        url: String,
        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Write the response body here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List cache stores with their entry counts
    Caches,

    /// Register the worker through a container and open page clients
    Run {
        /// Page URL to open as a controlled client (repeatable)
        #[arg(long = "client")]
        clients: Vec<String>,
    },
}

/// Config file (or defaults), then environment, then command-line flags.
fn resolve_config(cli: &Cli) -> CoreResult<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(version) = &cli.cache_version {
        config.cache.version = version.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache.cache_dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format))?;

    let config = resolve_config(&cli)?;
    info!(
        store = %config.cache.store_name(),
        cache_dir = %config.cache.cache_dir.display(),
        "Starting chaun-worker"
    );

    let ctx = commands::Context::new(config).await?;

    match cli.command {
        Commands::Install => {
            let report = ctx.install().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                std::process::exit(1);
            }
        }

        Commands::Activate => {
            let report = ctx.activate().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Fetch {
            url,
            method,
            output,
        } => {
            let summary = ctx.fetch(&method, &url, output.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Caches => {
            let stores = ctx.caches().await?;
            println!("{}", serde_json::to_string_pretty(&stores)?);
        }

        Commands::Run { clients } => {
            let summary = ctx.run(&clients).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
