//! Parquet-file implementations of the pipeline's stores.
//!
//! The data directory layout is:
//! ```text
//! <data_dir>/
//!   ├── <raw_table>.parquet
//!   ├── <erc20_table>.parquet
//!   ├── <erc721_table>.parquet
//!   ├── <checkpoint_table>.parquet
//!   └── <raw_table>.lock        (while a decode or ingest run is active)
//! ```

use std::path::PathBuf;

use chrono::{DateTime, TimeDelta, Utc};
use erc_transfers::{
    BoxError, Checkpoint, CheckpointStore, LogSource, RawLog, TransferSink, Transfers,
};

use crate::config::StorageConfig;
use crate::tables;

/// Resolved file paths for the four tables.
#[derive(Debug, Clone)]
pub struct Tables {
    /// Raw event logs.
    pub raw: PathBuf,
    /// Decoded ERC-20 transfers.
    pub erc20: PathBuf,
    /// Decoded ERC-721 transfers.
    pub erc721: PathBuf,
    /// Checkpoint log.
    pub checkpoints: PathBuf,
}

impl Tables {
    /// Paths for the tables named in `storage`.
    #[must_use]
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            raw: storage.table_path(&storage.raw_table),
            erc20: storage.table_path(&storage.erc20_table),
            erc721: storage.table_path(&storage.erc721_table),
            checkpoints: storage.table_path(&storage.checkpoint_table),
        }
    }

    /// Create every table file that does not exist yet, returning the paths
    /// that were created.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn create_missing(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        for (path, schema) in [
            (&self.raw, &*tables::RAW_LOG_SCHEMA),
            (&self.erc20, &*tables::ERC20_SCHEMA),
            (&self.erc721, &*tables::ERC721_SCHEMA),
            (&self.checkpoints, &*tables::CHECKPOINT_SCHEMA),
        ] {
            if tables::create(path, schema)? {
                created.push(path.clone());
            }
        }
        Ok(created)
    }

    /// Split into the three stores a pipeline needs.
    #[must_use]
    pub fn stores(self) -> (ParquetLogSource, ParquetSink, ParquetCheckpoints) {
        (
            ParquetLogSource { path: self.raw },
            ParquetSink {
                erc20: self.erc20,
                erc721: self.erc721,
            },
            ParquetCheckpoints {
                path: self.checkpoints,
            },
        )
    }
}

/// Raw log table backed by a Parquet file.
#[derive(Debug, Clone)]
pub struct ParquetLogSource {
    path: PathBuf,
}

impl LogSource for ParquetLogSource {
    fn table_exists(&self) -> Result<bool, BoxError> {
        Ok(self.path.try_exists()?)
    }

    fn fetch(&self, from_block: u64, to_block: u64) -> Result<Vec<RawLog>, BoxError> {
        let mut logs = Vec::new();
        for batch in tables::read(&self.path)? {
            logs.extend(tables::raw_logs_in_range(&batch, from_block, to_block)?);
        }
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }
}

/// ERC-20 and ERC-721 output tables backed by Parquet files.
#[derive(Debug, Clone)]
pub struct ParquetSink {
    erc20: PathBuf,
    erc721: PathBuf,
}

impl TransferSink for ParquetSink {
    fn append(&mut self, records: Transfers<'_>) -> Result<usize, BoxError> {
        let rows = match records {
            Transfers::Erc20(rows) => tables::append(
                &self.erc20,
                &tables::ERC20_SCHEMA,
                tables::erc20_to_batch(rows)?,
            )?,
            Transfers::Erc721(rows) => tables::append(
                &self.erc721,
                &tables::ERC721_SCHEMA,
                tables::erc721_to_batch(rows)?,
            )?,
        };
        Ok(rows)
    }
}

/// Checkpoint log backed by a Parquet file.
#[derive(Debug, Clone)]
pub struct ParquetCheckpoints {
    path: PathBuf,
}

impl CheckpointStore for ParquetCheckpoints {
    fn read_latest(&self, window: TimeDelta, now: DateTime<Utc>) -> Result<Option<u64>, BoxError> {
        let cutoff = now - window;
        let mut latest = None;
        for batch in tables::read(&self.path)? {
            let recent = tables::checkpoints_from_batch(&batch)?
                .into_iter()
                .filter(|c| c.processed_at >= cutoff)
                .map(|c| c.last_processed_block)
                .max();
            latest = latest.max(recent);
        }
        Ok(latest)
    }

    fn append(&mut self, checkpoint: &Checkpoint) -> Result<(), BoxError> {
        let batch = tables::checkpoints_to_batch(std::slice::from_ref(checkpoint))?;
        tables::append(&self.path, &tables::CHECKPOINT_SCHEMA, batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, U256};
    use chrono::TimeZone;
    use erc_transfers::{Erc20Transfer, Erc721Transfer};

    use super::*;

    fn storage(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            data_dir: dir.to_path_buf(),
            raw_table: "raw_logs".into(),
            erc20_table: "erc20".into(),
            erc721_table: "erc721".into(),
            checkpoint_table: "checkpoints".into(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn raw(block_number: u64, log_index: u64) -> RawLog {
        RawLog {
            address: format!("{:#x}", Address::repeat_byte(0xaa)),
            block_hash: format!("{:#x}", B256::repeat_byte(0xbb)),
            block_number,
            block_timestamp: at(1_690_000_000),
            data: "0x".to_owned(),
            log_index,
            removed: false,
            topics: vec![format!("{:#x}", B256::repeat_byte(1))],
            transaction_hash: format!("{:#x}", B256::repeat_byte(0xcc)),
            transaction_index: 0,
        }
    }

    #[test]
    fn missing_raw_table_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _, _) = Tables::new(&storage(dir.path())).stores();
        assert!(!source.table_exists().unwrap());
    }

    #[test]
    fn create_missing_only_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Tables::new(&storage(dir.path()));
        assert_eq!(layout.create_missing().unwrap().len(), 4);
        assert!(layout.create_missing().unwrap().is_empty());

        let (source, _, checkpoints) = layout.stores();
        assert!(source.table_exists().unwrap());
        assert!(source.fetch(0, u64::MAX).unwrap().is_empty());
        assert_eq!(
            checkpoints.read_latest(TimeDelta::days(3), at(0)).unwrap(),
            None
        );
    }

    #[test]
    fn fetch_returns_inclusive_range_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Tables::new(&storage(dir.path()));
        let logs = [raw(12, 1), raw(9, 0), raw(10, 2), raw(10, 0), raw(14, 0)];
        tables::append(
            &layout.raw,
            &tables::RAW_LOG_SCHEMA,
            tables::raw_logs_to_batch(&logs).unwrap(),
        )
        .unwrap();

        let (source, _, _) = layout.stores();
        let got: Vec<_> = source
            .fetch(10, 12)
            .unwrap()
            .iter()
            .map(|l| (l.block_number, l.log_index))
            .collect();
        assert_eq!(got, vec![(10, 0), (10, 2), (12, 1)]);
    }

    #[test]
    fn checkpoints_outside_window_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, mut checkpoints) = Tables::new(&storage(dir.path())).stores();
        let now = at(1_700_000_000);
        for (block, processed_at) in [
            (50, now - TimeDelta::days(5)),
            (20, now - TimeDelta::hours(1)),
            (30, now - TimeDelta::days(2)),
        ] {
            checkpoints
                .append(&Checkpoint {
                    last_processed_block: block,
                    processed_at,
                })
                .unwrap();
        }
        assert_eq!(
            checkpoints.read_latest(TimeDelta::days(3), now).unwrap(),
            Some(30)
        );
        assert_eq!(
            checkpoints.read_latest(TimeDelta::days(7), now).unwrap(),
            Some(50)
        );
        assert_eq!(
            checkpoints.read_latest(TimeDelta::minutes(1), now).unwrap(),
            None
        );
    }

    #[test]
    fn sink_routes_each_standard_to_its_table() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Tables::new(&storage(dir.path()));
        let (_, mut sink, _) = layout.clone().stores();

        let erc20 = Erc20Transfer {
            from_address: Address::repeat_byte(1),
            to_address: Address::repeat_byte(2),
            value: U256::from(100),
            contract_address: Address::repeat_byte(3),
            transaction_hash: B256::repeat_byte(4),
            block_number: 7,
            block_timestamp: at(1_690_000_000),
            processed_timestamp: at(1_700_000_000),
        };
        let erc721 = Erc721Transfer {
            block_number: 7,
            block_timestamp: at(1_690_000_000),
            transaction_hash: B256::repeat_byte(5),
            from_address: Address::ZERO,
            to_address: Address::repeat_byte(2),
            id: U256::from(42),
            contract_address: Address::repeat_byte(6),
            processed_timestamp: at(1_700_000_000),
        };

        assert_eq!(sink.append(Transfers::Erc20(&[erc20.clone(), erc20])).unwrap(), 2);
        assert_eq!(sink.append(Transfers::Erc721(&[erc721])).unwrap(), 1);

        let count = |path: &std::path::Path| tables::row_count(&tables::read(path).unwrap());
        assert_eq!(count(&layout.erc20), 2);
        assert_eq!(count(&layout.erc721), 1);
    }

    #[test]
    fn sink_failure_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Tables::new(&storage(dir.path()));
        // A directory where the file should be makes the write fail.
        std::fs::create_dir_all(layout.erc20.with_extension("parquet.tmp")).unwrap();
        let (_, mut sink, _) = layout.stores();
        assert!(sink.append(Transfers::Erc20(&[])).is_err());
    }
}
