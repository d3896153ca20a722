//! Token transfer decoder CLI.
//!
//! # Usage
//!
//! ```bash
//! # Create empty tables under the configured data directory
//! erc-transfers-sync init
//!
//! # Pull raw logs from the chain into the raw table
//! erc-transfers-sync ingest --from 17816428 --to 17816500
//!
//! # Decode the next block window and print the run report
//! erc-transfers-sync --config ./config.toml decode
//! ```

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use erc_transfers::{Pipeline, RunStatus};
use erc_transfers_sync::config::Config;
use erc_transfers_sync::ingest::{self, IngestDefaults, IngestRange};
use erc_transfers_sync::lock::RunLock;
use erc_transfers_sync::store::Tables;

/// Decode ERC-20 and ERC-721 Transfer events from raw Ethereum logs.
#[derive(Debug, Parser)]
#[command(name = "erc-transfers-sync", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Decode one block window and print the run report as JSON.
    Decode,

    /// Fetch raw logs over JSON-RPC and append them to the raw table.
    Ingest {
        /// First block to fetch. Defaults to one past the highest stored
        /// block, or the configured start block for an empty table.
        #[arg(long)]
        from: Option<u64>,

        /// Last block to fetch (inclusive). Defaults to the start block plus
        /// the configured block window; never past the chain tip.
        #[arg(long)]
        to: Option<u64>,

        /// Use this RPC endpoint instead of the configured ones.
        #[arg(long)]
        rpc: Option<String>,
    },

    /// Create any missing tables.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Decode => cmd_decode(&config),
        Command::Ingest { from, to, rpc } => cmd_ingest(&config, IngestRange { from, to }, rpc).await,
        Command::Init => cmd_init(&config),
    }
}

/// Execute the `decode` subcommand.
#[allow(clippy::print_stdout)]
fn cmd_decode(config: &Config) -> Result<()> {
    let run_config = config.run_config()?;
    let storage = &config.storage;
    let lock = RunLock::acquire(&storage.data_dir, &storage.raw_table, config.lease_ttl()?)?;
    tracing::info!(lease = %lock.path().display(), "decode lease held");

    let (source, sink, checkpoints) = Tables::new(storage).stores();
    let mut pipeline = Pipeline::new(run_config, source, sink, checkpoints)?;
    let report = pipeline.run_once();

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status == RunStatus::Error {
        bail!(
            "decode run failed: {}",
            report.message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Execute the `ingest` subcommand.
async fn cmd_ingest(config: &Config, range: IngestRange, rpc_override: Option<String>) -> Result<()> {
    let rpcs = rpc_override.map_or_else(|| config.rpc.urls.clone(), |url| vec![url]);
    let storage = &config.storage;
    let tables = Tables::new(storage);
    let lock = RunLock::acquire(&storage.data_dir, &storage.raw_table, config.lease_ttl()?)?;

    tracing::info!(
        table = %tables.raw.display(),
        rpcs = rpcs.len(),
        lease = %lock.path().display(),
        "starting ingest"
    );

    let defaults = IngestDefaults {
        start_block: config.decode.default_start_block,
        block_window: config.decode.block_window,
    };
    match ingest::ingest(&tables.raw, &rpcs, range, defaults).await? {
        Some(summary) => {
            tracing::info!(from = summary.from, to = summary.to, logs = summary.logs, "ingest complete");
        }
        None => tracing::info!("nothing to ingest"),
    }
    Ok(())
}

/// Execute the `init` subcommand.
fn cmd_init(config: &Config) -> Result<()> {
    let created = Tables::new(&config.storage).create_missing()?;
    for path in &created {
        tracing::info!(path = %path.display(), "created table");
    }
    tracing::info!(created = created.len(), "init finished");
    Ok(())
}
