//! Runtime configuration loaded from `config.toml`.
//!
//! The `[storage]` section is required: a run never guesses table names.
//! `[decode]` and `[rpc]` fall back to defaults. The `RPC_URL` environment
//! variable, when set, replaces `[rpc].urls` so node credentials can stay
//! out of the file.
//!
//! ```toml
//! [storage]
//! data_dir = "data"
//! raw_table = "raw_logs"
//! erc20_table = "erc20_transfers"
//! erc721_table = "erc721_transfers"
//! checkpoint_table = "checkpoints"
//!
//! [decode]
//! default_start_block = 17816428
//! recency_window_secs = 259200
//! block_window = 5
//!
//! [rpc]
//! urls = ["https://ethereum-rpc.publicnode.com"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use erc_transfers::RunConfig;
use erc_transfers::run::{DEFAULT_BLOCK_WINDOW, DEFAULT_START_BLOCK};
use serde::Deserialize;

/// Environment variable overriding `[rpc].urls`.
pub const RPC_URL_ENV: &str = "RPC_URL";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the tables live and what they are called.
    pub storage: StorageConfig,
    /// Decode run parameters.
    #[serde(default)]
    pub decode: DecodeConfig,
    /// JSON-RPC endpoints used by `ingest`.
    #[serde(default)]
    pub rpc: RpcConfig,
}

/// Table locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding one Parquet file per table, plus run leases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Raw event log table.
    pub raw_table: String,
    /// Decoded ERC-20 transfer table.
    pub erc20_table: String,
    /// Decoded ERC-721 transfer table.
    pub erc721_table: String,
    /// Append-only checkpoint table.
    pub checkpoint_table: String,
}

/// Decode run parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecodeConfig {
    /// Start block when no recent checkpoint exists.
    pub default_start_block: u64,
    /// Checkpoints older than this many seconds are ignored.
    pub recency_window_secs: u64,
    /// Blocks added to the start block to form the inclusive range.
    pub block_window: u64,
    /// Only decode 4-topic logs whose topic 0 is the Transfer hash.
    pub strict_erc721_signature: bool,
    /// A run lease older than this many seconds is considered abandoned.
    pub lease_ttl_secs: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            default_start_block: DEFAULT_START_BLOCK,
            recency_window_secs: 3 * 24 * 60 * 60,
            block_window: DEFAULT_BLOCK_WINDOW,
            strict_erc721_signature: false,
            lease_ttl_secs: 10 * 60,
        }
    }
}

/// RPC endpoint list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    /// Ordered list of RPC URLs (best first).
    #[serde(default)]
    pub urls: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file {} not found", path.display());
        }
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config =
            Self::from_toml(&text).with_context(|| format!("loading {}", path.display()))?;
        config.override_rpc(std::env::var(RPC_URL_ENV).ok());
        Ok(config)
    }

    /// Replace `[rpc].urls` with `url` unless it is unset or blank.
    fn override_rpc(&mut self, url: Option<String>) {
        if let Some(url) = url.map(|u| u.trim().to_owned()).filter(|u| !u.is_empty()) {
            self.rpc.urls = vec![url];
        }
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML, a required key is
    /// missing, or a value is out of range.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let s = &self.storage;
        let mut seen = HashSet::new();
        for (key, name) in [
            ("raw_table", &s.raw_table),
            ("erc20_table", &s.erc20_table),
            ("erc721_table", &s.erc721_table),
            ("checkpoint_table", &s.checkpoint_table),
        ] {
            if name.is_empty() {
                bail!("storage.{key} must not be empty");
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                bail!("storage.{key} {name:?} may only contain letters, digits, '_' and '-'");
            }
            if !seen.insert(name) {
                bail!("storage.{key} {name:?} is used for more than one table");
            }
        }
        self.run_config()?;
        Ok(())
    }

    /// Decode parameters in the form the pipeline takes them.
    ///
    /// # Errors
    ///
    /// Returns an error if the recency window is out of range or the
    /// resulting [`RunConfig`] is rejected.
    pub fn run_config(&self) -> Result<RunConfig> {
        let d = &self.decode;
        let config = RunConfig {
            default_start_block: d.default_start_block,
            recency_window: seconds(d.recency_window_secs)
                .context("decode.recency_window_secs out of range")?,
            block_window: d.block_window,
            strict_erc721_signature: d.strict_erc721_signature,
        };
        config.validate()?;
        Ok(config)
    }

    /// How long a run lease stays valid.
    ///
    /// # Errors
    ///
    /// Returns an error if `lease_ttl_secs` does not fit a duration.
    pub fn lease_ttl(&self) -> Result<TimeDelta> {
        seconds(self.decode.lease_ttl_secs).context("decode.lease_ttl_secs out of range")
    }
}

impl StorageConfig {
    /// Parquet file backing the table `name`.
    #[must_use]
    pub fn table_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.parquet"))
    }
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}
