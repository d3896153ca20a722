//! One decode run: resolve range, fetch, decode, write, checkpoint.
//!
//! A run moves through its steps in a fixed order and stops early only when
//! the log source fails. Everything after a successful fetch is best-effort:
//! a failed sink write downgrades the run to
//! [`RunStatus::PartialError`], a failed checkpoint write is only logged.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::decode::{Decoded, Decoder};
use crate::error::{Error, ErrorKind, Result};
use crate::store::{CheckpointStore, LogSource, TransferSink};
use crate::types::{Checkpoint, TokenStandard, Transfers};

/// First block decoded when no recent checkpoint exists.
pub const DEFAULT_START_BLOCK: u64 = 17_816_428;

/// Blocks added to the start block to form a run's inclusive range.
pub const DEFAULT_BLOCK_WINDOW: u64 = 5;

/// Checkpoints older than this are ignored.
pub const DEFAULT_RECENCY_WINDOW: TimeDelta = TimeDelta::days(3);

/// Parameters of a decode run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Start block when no recent checkpoint exists.
    pub default_start_block: u64,
    /// Only checkpoints written this recently are trusted.
    pub recency_window: TimeDelta,
    /// `to_block = from_block + block_window`.
    pub block_window: u64,
    /// Require the Transfer signature on 4-topic logs.
    pub strict_erc721_signature: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_start_block: DEFAULT_START_BLOCK,
            recency_window: DEFAULT_RECENCY_WINDOW,
            block_window: DEFAULT_BLOCK_WINDOW,
            strict_erc721_signature: false,
        }
    }
}

impl RunConfig {
    /// Check the configuration before any store is touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a non-positive recency window or
    /// a window that overflows the block number range.
    pub fn validate(&self) -> Result<()> {
        if self.recency_window <= TimeDelta::zero() {
            return Err(Error::Configuration(format!(
                "recency window must be positive, got {}s",
                self.recency_window.num_seconds()
            )));
        }
        if self.default_start_block.checked_add(self.block_window).is_none() {
            return Err(Error::Configuration(format!(
                "block window {} overflows from start block {}",
                self.block_window, self.default_start_block
            )));
        }
        Ok(())
    }
}

/// Inclusive block range processed by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    /// First block, inclusive.
    #[serde(rename = "from_block")]
    pub from: u64,
    /// Last block, inclusive.
    #[serde(rename = "to_block")]
    pub to: u64,
}

impl BlockRange {
    /// `[from, from + window]`, saturating at `u64::MAX`.
    #[must_use]
    pub const fn starting_at(from: u64, window: u64) -> Self {
        Self {
            from,
            to: from.saturating_add(window),
        }
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step that had work to do succeeded (checkpoint writes aside).
    Success,
    /// Decoding succeeded but at least one sink write failed.
    PartialError,
    /// The run aborted before decoding.
    Error,
}

/// Structured outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Terminal state.
    pub status: RunStatus,
    /// Range the run covered.
    #[serde(flatten)]
    pub range: BlockRange,
    /// Raw logs returned by the source.
    pub fetched_count: usize,
    /// Records decoded (written or not).
    pub processed_count: usize,
    /// ERC-20 records written.
    pub erc20_count: usize,
    /// ERC-721 records written.
    pub erc721_count: usize,
    /// Logs skipped because they failed to decode.
    pub decode_failures: usize,
    /// Block recorded in the checkpoint log by this run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<u64>,
    /// Human-readable failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failure classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RunReport {
    const fn new(range: BlockRange) -> Self {
        Self {
            status: RunStatus::Success,
            range,
            fetched_count: 0,
            processed_count: 0,
            erc20_count: 0,
            erc721_count: 0,
            decode_failures: 0,
            checkpoint: None,
            message: None,
            error_kind: None,
        }
    }

    fn fail(mut self, err: &Error) -> Self {
        tracing::error!(range = %self.range, error = %err, "run failed");
        self.status = RunStatus::Error;
        self.message = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self
    }

    fn partial(&mut self, errors: &[Error]) {
        let Some(first) = errors.first() else {
            return;
        };
        self.status = RunStatus::PartialError;
        self.error_kind = Some(first.kind());
        self.message = Some(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        );
    }
}

/// Decode pipeline bound to its three stores.
#[derive(Debug)]
pub struct Pipeline<L, S, C> {
    config: RunConfig,
    decoder: Decoder,
    source: L,
    sink: S,
    checkpoints: C,
}

impl<L, S, C> Pipeline<L, S, C>
where
    L: LogSource,
    S: TransferSink,
    C: CheckpointStore,
{
    /// Bind a validated configuration to its stores.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` is invalid.
    pub fn new(config: RunConfig, source: L, sink: S, checkpoints: C) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            decoder: Decoder::new().strict_erc721_signature(config.strict_erc721_signature),
            source,
            sink,
            checkpoints,
        })
    }

    /// Give back the stores.
    pub fn into_parts(self) -> (L, S, C) {
        (self.source, self.sink, self.checkpoints)
    }

    /// Run once against the current wall clock.
    pub fn run_once(&mut self) -> RunReport {
        self.run_at(Utc::now())
    }

    /// Run once as if the current time were `now`.
    ///
    /// `now` bounds the checkpoint recency window and stamps every record
    /// and checkpoint written by the run.
    pub fn run_at(&mut self, now: DateTime<Utc>) -> RunReport {
        // Check the raw table first; the range is still resolved so a failed run
        // reports which blocks it would have covered.
        let table_check = self.source.table_exists();
        let range = self.resolve_range(now);
        let mut report = RunReport::new(range);

        match table_check {
            Ok(true) => {}
            Ok(false) => {
                return report.fail(&Error::SourceUnavailable {
                    message: "raw log table does not exist".to_owned(),
                    source: None,
                });
            }
            Err(e) => return report.fail(&Error::source_unavailable("checking raw log table", e)),
        }
        tracing::info!(from_block = range.from, to_block = range.to, "processing block range");

        let logs = match self.source.fetch(range.from, range.to) {
            Ok(logs) => logs,
            Err(e) => {
                return report.fail(&Error::source_unavailable(
                    format!("fetching logs for blocks {range}"),
                    e,
                ));
            }
        };
        report.fetched_count = logs.len();
        if logs.is_empty() {
            tracing::warn!(%range, "no logs found");
            return report;
        }

        let decoded = self.decoder.decode_logs(&logs, now);
        report.processed_count = decoded.len();
        report.decode_failures = decoded.failures;
        tracing::info!(
            fetched = logs.len(),
            erc20 = decoded.erc20.len(),
            erc721 = decoded.erc721.len(),
            failures = decoded.failures,
            unclassified = decoded.unclassified,
            "decoded logs"
        );

        let errors = self.write(&decoded, &mut report);
        report.checkpoint = self.checkpoint(&decoded, now);
        report.partial(&errors);

        tracing::info!(
            status = ?report.status,
            processed = report.processed_count,
            erc20 = report.erc20_count,
            erc721 = report.erc721_count,
            "run finished"
        );
        report
    }

    /// Start after the latest recent checkpoint, or at the default block.
    #[must_use]
    pub fn resolve_range(&self, now: DateTime<Utc>) -> BlockRange {
        let window = self.config.recency_window;
        let default = self.config.default_start_block;
        let from = match self.checkpoints.read_latest(window, now) {
            Ok(Some(block)) => {
                tracing::info!(checkpoint = block, "resuming from checkpoint");
                block.saturating_add(1)
            }
            Ok(None) => {
                tracing::info!(start_block = default, "no recent checkpoint, using default start block");
                default
            }
            Err(e) => {
                tracing::warn!(
                    start_block = default,
                    error = %Error::Checkpoint(e),
                    "checkpoint read failed, using default start block"
                );
                default
            }
        };
        BlockRange::starting_at(from, self.config.block_window)
    }

    /// Append both record sets, attempting each even if the other fails.
    fn write(&mut self, decoded: &Decoded, report: &mut RunReport) -> Vec<Error> {
        let mut errors = Vec::new();
        for batch in [
            Transfers::Erc20(&decoded.erc20),
            Transfers::Erc721(&decoded.erc721),
        ] {
            if batch.is_empty() {
                continue;
            }
            let kind = batch.kind();
            match self.sink.append(batch) {
                Ok(written) => {
                    tracing::info!(%kind, rows = written, "wrote transfers");
                    match kind {
                        TokenStandard::Erc20 => report.erc20_count = written,
                        TokenStandard::Erc721 => report.erc721_count = written,
                    }
                }
                Err(source) => {
                    let err = Error::SinkWrite { kind, source };
                    tracing::error!(%kind, rows = batch.len(), error = %err, "write failed");
                    errors.push(err);
                }
            }
        }
        errors
    }

    /// Record the highest decoded block; failures are logged, not returned.
    fn checkpoint(&mut self, decoded: &Decoded, now: DateTime<Utc>) -> Option<u64> {
        let Some(block) = decoded.max_block() else {
            tracing::warn!("no transfers decoded, checkpoint not advanced");
            return None;
        };
        let checkpoint = Checkpoint {
            last_processed_block: block,
            processed_at: now,
        };
        match self.checkpoints.append(&checkpoint) {
            Ok(()) => {
                tracing::info!(block, "checkpoint written");
                Some(block)
            }
            Err(e) => {
                tracing::error!(
                    block,
                    error = %Error::Checkpoint(e),
                    "checkpoint write failed, next run may reprocess these blocks"
                );
                None
            }
        }
    }
}
