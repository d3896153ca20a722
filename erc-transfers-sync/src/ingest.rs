//! Raw log ingestion from JSON-RPC into the raw log table.
//!
//! An ingest run:
//! 1. Resolves its start block from `--from`, else one past the highest
//!    block already in the raw table, else the configured start block.
//! 2. Queries `eth_getLogs` (no address or topic filter) in adaptive
//!    batches up to `--to`, else the start block plus the block window,
//!    never past the chain tip.
//! 3. Fills in block timestamps the node left out with one header lookup
//!    per block.
//! 4. Appends the logs to the raw table in one atomic rewrite.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use erc_transfers::RawLog;

use crate::tables;

/// Per-request timeout for RPC calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between consecutive RPC calls to avoid rate-limiting.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Maximum consecutive RPC errors before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Progress is logged every N batches.
const PROGRESS_INTERVAL: u64 = 50;

/// Tracks `eth_getLogs` batch size with an adaptive ceiling.
///
/// Unfiltered mainnet queries return thousands of logs per block, so the
/// batch starts small. On success the size doubles toward the ceiling; on
/// error the ceiling is permanently lowered.
#[derive(Debug)]
struct Batcher {
    size: u64,
    ceiling: u64,
}

impl Batcher {
    const DEFAULT: u64 = 50;
    const MIN: u64 = 1;

    const fn new() -> Self {
        Self {
            size: Self::DEFAULT,
            ceiling: Self::DEFAULT,
        }
    }

    fn grow(&mut self) {
        self.size = (self.size * 2).min(self.ceiling);
    }

    /// Returns `false` when already at the minimum (caller should bail).
    fn shrink(&mut self) -> bool {
        if self.size <= Self::MIN {
            return false;
        }
        self.ceiling = (self.size / 2).max(Self::MIN);
        self.size = self.ceiling;
        true
    }
}

/// Block range requested by the caller; unset bounds are resolved at run
/// time.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestRange {
    /// First block to fetch.
    pub from: Option<u64>,
    /// Last block to fetch (inclusive), capped at the chain tip.
    pub to: Option<u64>,
}

/// Fallbacks for the bounds an [`IngestRange`] leaves open.
#[derive(Debug, Clone, Copy)]
pub struct IngestDefaults {
    /// Start block for an empty raw table.
    pub start_block: u64,
    /// Blocks past the start block fetched when no end is given.
    pub block_window: u64,
}

impl IngestRange {
    /// Resolve both bounds against the stored table and the chain tip.
    /// Returns `None` when there is nothing to fetch.
    fn resolve(self, resume: u64, latest: u64, block_window: u64) -> Option<(u64, u64)> {
        let from = self.from.unwrap_or(resume);
        let to = self
            .to
            .unwrap_or_else(|| from.saturating_add(block_window))
            .min(latest);
        (from <= to).then_some((from, to))
    }
}

/// What an ingest run wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    /// First block fetched.
    pub from: u64,
    /// Last block fetched.
    pub to: u64,
    /// Rows appended to the raw table.
    pub logs: usize,
}

/// First block an ingest should fetch when the caller gave none.
///
/// # Errors
///
/// Returns an error if the raw table exists but cannot be read.
pub fn resume_block(raw_path: &Path, default_start: u64) -> Result<u64> {
    let batches = tables::read(raw_path)?;
    Ok(tables::max_block_number(&batches)?.map_or(default_start, |b| b + 1))
}

/// Ingest raw logs with automatic RPC fallback.
///
/// Tries each RPC in `rpcs` in order. The start block is re-resolved per
/// attempt, so a partial earlier attempt is never fetched twice.
///
/// Returns `None` when the raw table is already at the requested end.
///
/// # Errors
///
/// Returns an error if `rpcs` is empty or *all* RPCs fail.
pub async fn ingest(
    raw_path: &Path,
    rpcs: &[String],
    range: IngestRange,
    defaults: IngestDefaults,
) -> Result<Option<IngestSummary>> {
    if rpcs.is_empty() {
        bail!("no RPC endpoint configured; set [rpc].urls or RPC_URL");
    }
    let mut last_err = None;

    for (i, rpc_url) in rpcs.iter().enumerate() {
        match try_ingest(raw_path, rpc_url, range, defaults).await {
            Ok(summary) => return Ok(summary),
            Err(e) => {
                if let Some(next) = rpcs.get(i + 1) {
                    tracing::warn!(rpc = %rpc_url, next = %next, error = %e, "RPC failed, falling back");
                } else {
                    tracing::error!(rpc = %rpc_url, error = %e, "last RPC failed");
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no RPC endpoint attempted")))
}

/// Attempt a full ingest using a single RPC endpoint.
async fn try_ingest(
    raw_path: &Path,
    rpc_url: &str,
    range: IngestRange,
    defaults: IngestDefaults,
) -> Result<Option<IngestSummary>> {
    tracing::info!(rpc = rpc_url, "connecting");

    let provider = ProviderBuilder::new().connect_http(
        rpc_url
            .parse()
            .with_context(|| format!("invalid RPC URL: {rpc_url}"))?,
    );

    let latest = tokio::time::timeout(REQUEST_TIMEOUT, provider.get_block_number())
        .await
        .context("get_block_number timed out")?
        .context("get_block_number failed")?;

    let resume = match range.from {
        Some(from) => from,
        None => resume_block(raw_path, defaults.start_block)?,
    };
    let Some((from, to)) = range.resolve(resume, latest, defaults.block_window) else {
        tracing::info!(from = resume, latest, "already up to date");
        return Ok(None);
    };

    tracing::info!(from, to, blocks = to - from + 1, "fetching logs");
    let logs = fetch_logs(&provider, from, to).await?;
    let timestamps = fetch_timestamps(&provider, &logs).await?;
    let rows = to_raw_logs(&logs, &timestamps)?;

    let written = tables::append(
        raw_path,
        &tables::RAW_LOG_SCHEMA,
        tables::raw_logs_to_batch(&rows)?,
    )?;
    tracing::info!(from, to, logs = written, skipped = logs.len() - rows.len(), "raw logs appended");

    Ok(Some(IngestSummary {
        from,
        to,
        logs: written,
    }))
}

/// Fetch every log in `[from, to]` using adaptive batches.
async fn fetch_logs<P: Provider>(provider: &P, from: u64, to: u64) -> Result<Vec<Log>> {
    let mut logs = Vec::new();
    let mut block = from;
    let mut batch = Batcher::new();
    let mut count = 0u64;
    let mut errors = 0u32;

    while block <= to {
        let end = block.saturating_add(batch.size - 1).min(to);
        let filter = Filter::new().from_block(block).to_block(end);

        let result = tokio::time::timeout(REQUEST_TIMEOUT, provider.get_logs(&filter))
            .await
            .map_err(|_| anyhow::anyhow!("request timed out"))
            .and_then(|r| r.map_err(|e| anyhow::anyhow!("{e}")));

        match result {
            Ok(new) => {
                errors = 0;
                logs.extend(new);
                batch.grow();
                count += 1;
                if count.is_multiple_of(PROGRESS_INTERVAL) {
                    tracing::info!(batch = count, block = end, logs = logs.len(), progress = %pct(end, from, to), "fetching");
                }
                if end == u64::MAX {
                    break;
                }
                block = end + 1;
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
            Err(e) => {
                errors += 1;
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    bail!("{errors} consecutive errors at block {block}: {e}");
                }
                if !batch.shrink() {
                    bail!("failed at min batch size (block {block}): {e}");
                }
                tracing::warn!(block, batch_size = batch.size, error = %e, "retrying");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    Ok(logs)
}

/// Format progress as a percentage string.
fn pct(current: u64, from: u64, to: u64) -> String {
    if to <= from {
        return "100%".into();
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = (current - from) as f64 / (to - from) as f64 * 100.0;
    format!("{ratio:.0}%")
}

/// Look up the timestamp of every block whose logs arrived without one.
async fn fetch_timestamps<P: Provider>(provider: &P, logs: &[Log]) -> Result<BTreeMap<u64, u64>> {
    let mut timestamps = BTreeMap::new();
    for number in logs
        .iter()
        .filter(|l| l.block_timestamp.is_none())
        .filter_map(|l| l.block_number)
    {
        if timestamps.contains_key(&number) {
            continue;
        }
        let block = tokio::time::timeout(
            REQUEST_TIMEOUT,
            provider.get_block_by_number(BlockNumberOrTag::Number(number)),
        )
        .await
        .with_context(|| format!("block {number} header timed out"))?
        .with_context(|| format!("fetching block {number}"))?
        .with_context(|| format!("block {number} not found"))?;
        timestamps.insert(number, block.header.timestamp);
    }
    Ok(timestamps)
}

/// Convert RPC logs into raw table rows.
///
/// Pending logs (no block number, transaction hash, or indices) are
/// skipped. A log's own timestamp wins over `timestamps`.
///
/// # Errors
///
/// Returns an error if a mined log has no known block timestamp or the
/// timestamp is out of range.
pub fn to_raw_logs(logs: &[Log], timestamps: &BTreeMap<u64, u64>) -> Result<Vec<RawLog>> {
    let mut rows = Vec::with_capacity(logs.len());
    for log in logs {
        let (Some(block_number), Some(block_hash), Some(tx_hash), Some(tx_index), Some(log_index)) = (
            log.block_number,
            log.block_hash,
            log.transaction_hash,
            log.transaction_index,
            log.log_index,
        ) else {
            continue;
        };

        let secs = log
            .block_timestamp
            .or_else(|| timestamps.get(&block_number).copied())
            .with_context(|| format!("no timestamp for block {block_number}"))?;
        let block_timestamp = i64::try_from(secs)
            .ok()
            .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
            .with_context(|| format!("block {block_number} timestamp {secs} out of range"))?;

        rows.push(RawLog {
            address: format!("{:#x}", log.address()),
            block_hash: format!("{block_hash:#x}"),
            block_number,
            block_timestamp,
            data: format!("{}", log.data().data),
            log_index,
            removed: log.removed,
            topics: log.topics().iter().map(|t| format!("{t:#x}")).collect(),
            transaction_hash: format!("{tx_hash:#x}"),
            transaction_index: tx_index,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, Bytes, Log as PrimitiveLog};

    use super::*;

    fn rpc_log(block_number: Option<u64>, block_timestamp: Option<u64>) -> Log {
        Log {
            inner: PrimitiveLog::new_unchecked(
                Address::repeat_byte(0xaa),
                vec![B256::repeat_byte(1), B256::repeat_byte(2)],
                Bytes::from(vec![0x00, 0x64]),
            ),
            block_hash: Some(B256::repeat_byte(0xbb)),
            block_number,
            block_timestamp,
            transaction_hash: Some(B256::repeat_byte(0xcc)),
            transaction_index: Some(4),
            log_index: Some(9),
            removed: false,
        }
    }

    #[test]
    fn batcher_learns_ceiling() {
        let mut b = Batcher::new();
        b.grow();
        assert_eq!(b.size, Batcher::DEFAULT);
        assert!(b.shrink());
        assert_eq!(b.size, Batcher::DEFAULT / 2);
        b.grow();
        assert_eq!(b.size, Batcher::DEFAULT / 2);
        while b.shrink() {}
        assert_eq!(b.size, Batcher::MIN);
    }

    #[test]
    fn rpc_logs_become_raw_rows() {
        let rows = to_raw_logs(&[rpc_log(Some(100), Some(1_690_000_000))], &BTreeMap::new()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.address, format!("0x{}", "aa".repeat(20)));
        assert_eq!(row.block_number, 100);
        assert_eq!(row.block_timestamp.timestamp(), 1_690_000_000);
        assert_eq!(row.data, "0x0064");
        assert_eq!(row.log_index, 9);
        assert_eq!(row.transaction_index, 4);
        assert_eq!(
            row.topics,
            vec![format!("0x{}", "01".repeat(32)), format!("0x{}", "02".repeat(32))]
        );
    }

    #[test]
    fn header_timestamp_fills_gaps() {
        let timestamps = BTreeMap::from([(100, 1_690_000_012)]);
        let rows = to_raw_logs(&[rpc_log(Some(100), None)], &timestamps).unwrap();
        assert_eq!(rows[0].block_timestamp.timestamp(), 1_690_000_012);

        assert!(to_raw_logs(&[rpc_log(Some(101), None)], &timestamps).is_err());
    }

    #[test]
    fn pending_logs_are_skipped() {
        let rows = to_raw_logs(&[rpc_log(None, None)], &BTreeMap::new()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn resume_starts_after_highest_stored_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_logs.parquet");
        assert_eq!(resume_block(&path, 17_816_428).unwrap(), 17_816_428);

        let rows = to_raw_logs(&[rpc_log(Some(17_900_000), Some(1))], &BTreeMap::new()).unwrap();
        tables::append(&path, &tables::RAW_LOG_SCHEMA, tables::raw_logs_to_batch(&rows).unwrap())
            .unwrap();
        assert_eq!(resume_block(&path, 17_816_428).unwrap(), 17_900_001);
    }

    #[test]
    fn range_defaults_to_one_window_below_tip() {
        let open = IngestRange::default();
        assert_eq!(open.resolve(100, 1_000, 5), Some((100, 105)));
        assert_eq!(open.resolve(100, 102, 5), Some((100, 102)));
        assert_eq!(open.resolve(103, 102, 5), None);

        let fixed = IngestRange {
            from: Some(10),
            to: Some(20),
        };
        assert_eq!(fixed.resolve(500, 1_000, 5), Some((10, 20)));
        assert_eq!(fixed.resolve(500, 15, 5), Some((10, 15)));
    }

    #[test]
    fn progress_percentage() {
        assert_eq!(pct(5, 0, 10), "50%");
        assert_eq!(pct(3, 3, 3), "100%");
    }
}
