//! Contracts for the three external stores a run talks to.
//!
//! Implementations are plain blocking calls; a run performs them one at a
//! time and never shares a store between threads.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::BoxError;
use crate::types::{Checkpoint, RawLog, Transfers};

/// The raw log table.
pub trait LogSource {
    /// Health check run before any processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn table_exists(&self) -> Result<bool, BoxError>;

    /// All logs with `from_block <= block_number <= to_block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, BoxError>;
}

/// The decoded ERC-20 and ERC-721 output tables.
pub trait TransferSink {
    /// Append a batch to the table matching [`Transfers::kind`] and return
    /// the number of rows written.
    ///
    /// Appends are not deduplicated: writing the same records twice stores
    /// them twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; no rows of the batch should be
    /// considered written in that case.
    fn append(&mut self, records: Transfers<'_>) -> Result<usize, BoxError>;
}

/// The append-only checkpoint log.
pub trait CheckpointStore {
    /// Highest checkpointed block among rows written within `window` of
    /// `now`, or `None` if there is no such row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn read_latest(&self, window: TimeDelta, now: DateTime<Utc>) -> Result<Option<u64>, BoxError>;

    /// Append a checkpoint row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, checkpoint: &Checkpoint) -> Result<(), BoxError>;
}
