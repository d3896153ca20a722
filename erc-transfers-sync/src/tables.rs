//! Arrow schemas and Parquet I/O for the raw, decoded, and checkpoint tables.
//!
//! Each logical table is a single Parquet file. Appending reads the existing
//! batches, adds one, and rewrites the file atomically, so a failed append
//! leaves the previous contents intact.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, bail, ensure};
use arrow_array::{
    Array, BooleanArray, RecordBatch, StringArray, TimestampMillisecondArray,
    TimestampSecondArray, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use erc_transfers::{Checkpoint, Erc20Transfer, Erc721Transfer, RawLog};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;

/// Highest number of topics an EVM log can carry.
const MAX_TOPICS: usize = 4;

const TOPIC_COLUMNS: [&str; MAX_TOPICS] = ["topic0", "topic1", "topic2", "topic3"];

fn seconds_utc() -> DataType {
    DataType::Timestamp(TimeUnit::Second, Some("UTC".into()))
}

fn millis_utc() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into()))
}

/// Raw event logs, one row per `eth_getLogs` entry.
pub static RAW_LOG_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("address", DataType::Utf8, false),
        Field::new("block_hash", DataType::Utf8, false),
        Field::new("block_number", DataType::UInt64, false),
        Field::new("block_timestamp", seconds_utc(), false),
        Field::new("data", DataType::Utf8, false),
        Field::new("log_index", DataType::UInt64, false),
        Field::new("removed", DataType::Boolean, false),
        Field::new(TOPIC_COLUMNS[0], DataType::Utf8, true),
        Field::new(TOPIC_COLUMNS[1], DataType::Utf8, true),
        Field::new(TOPIC_COLUMNS[2], DataType::Utf8, true),
        Field::new(TOPIC_COLUMNS[3], DataType::Utf8, true),
        Field::new("transaction_hash", DataType::Utf8, false),
        Field::new("transaction_index", DataType::UInt64, false),
    ]))
});

fn transfer_schema(amount_column: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        Field::new("block_timestamp", seconds_utc(), false),
        Field::new("transaction_hash", DataType::Utf8, false),
        Field::new("contract_address", DataType::Utf8, false),
        Field::new("from_address", DataType::Utf8, false),
        Field::new("to_address", DataType::Utf8, false),
        Field::new(amount_column, DataType::Utf8, false),
        Field::new("processed_timestamp", millis_utc(), false),
    ]))
}

/// Decoded ERC-20 transfers; `value` is a decimal string.
pub static ERC20_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| transfer_schema("value"));

/// Decoded ERC-721 transfers; `id` is a decimal string.
pub static ERC721_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| transfer_schema("id"));

/// Append-only checkpoint log.
pub static CHECKPOINT_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        Field::new("processed_timestamp", millis_utc(), false),
    ]))
});

/// Convert raw logs into a batch of [`RAW_LOG_SCHEMA`].
///
/// # Errors
///
/// Returns an error if a log has more than four topics or the batch cannot
/// be assembled.
pub fn raw_logs_to_batch(logs: &[RawLog]) -> Result<RecordBatch> {
    let mut topics: [Vec<Option<&str>>; MAX_TOPICS] = Default::default();
    for log in logs {
        ensure!(
            log.topics.len() <= MAX_TOPICS,
            "log {} of tx {} has {} topics",
            log.log_index,
            log.transaction_hash,
            log.topics.len()
        );
        for (i, column) in topics.iter_mut().enumerate() {
            column.push(log.topics.get(i).map(String::as_str));
        }
    }
    let [topic0, topic1, topic2, topic3] = topics;

    let batch = RecordBatch::try_new(
        Arc::clone(&RAW_LOG_SCHEMA),
        vec![
            Arc::new(StringArray::from_iter_values(logs.iter().map(|l| &l.address))),
            Arc::new(StringArray::from_iter_values(logs.iter().map(|l| &l.block_hash))),
            Arc::new(UInt64Array::from_iter_values(logs.iter().map(|l| l.block_number))),
            Arc::new(
                TimestampSecondArray::from_iter_values(
                    logs.iter().map(|l| l.block_timestamp.timestamp()),
                )
                .with_timezone("UTC"),
            ),
            Arc::new(StringArray::from_iter_values(logs.iter().map(|l| &l.data))),
            Arc::new(UInt64Array::from_iter_values(logs.iter().map(|l| l.log_index))),
            Arc::new(BooleanArray::from(
                logs.iter().map(|l| l.removed).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(topic0)),
            Arc::new(StringArray::from(topic1)),
            Arc::new(StringArray::from(topic2)),
            Arc::new(StringArray::from(topic3)),
            Arc::new(StringArray::from_iter_values(
                logs.iter().map(|l| &l.transaction_hash),
            )),
            Arc::new(UInt64Array::from_iter_values(
                logs.iter().map(|l| l.transaction_index),
            )),
        ],
    )?;
    Ok(batch)
}

/// Rows of a raw log batch with `from <= block_number <= to`.
///
/// # Errors
///
/// Returns an error if the batch does not match [`RAW_LOG_SCHEMA`].
pub fn raw_logs_in_range(batch: &RecordBatch, from: u64, to: u64) -> Result<Vec<RawLog>> {
    let address = column::<StringArray>(batch, "address")?;
    let block_hash = column::<StringArray>(batch, "block_hash")?;
    let block_number = column::<UInt64Array>(batch, "block_number")?;
    let block_timestamp = column::<TimestampSecondArray>(batch, "block_timestamp")?;
    let data = column::<StringArray>(batch, "data")?;
    let log_index = column::<UInt64Array>(batch, "log_index")?;
    let removed = column::<BooleanArray>(batch, "removed")?;
    let transaction_hash = column::<StringArray>(batch, "transaction_hash")?;
    let transaction_index = column::<UInt64Array>(batch, "transaction_index")?;
    let topic_columns = TOPIC_COLUMNS
        .iter()
        .map(|name| column::<StringArray>(batch, name))
        .collect::<Result<Vec<_>>>()?;

    let mut logs = Vec::new();
    for row in 0..batch.num_rows() {
        let number = block_number.value(row);
        if number < from || number > to {
            continue;
        }
        // Topics are stored left-aligned; the first null ends the list.
        let topics = topic_columns
            .iter()
            .take_while(|c| c.is_valid(row))
            .map(|c| c.value(row).to_owned())
            .collect();
        logs.push(RawLog {
            address: address.value(row).to_owned(),
            block_hash: block_hash.value(row).to_owned(),
            block_number: number,
            block_timestamp: from_seconds(block_timestamp.value(row))?,
            data: data.value(row).to_owned(),
            log_index: log_index.value(row),
            removed: removed.value(row),
            topics,
            transaction_hash: transaction_hash.value(row).to_owned(),
            transaction_index: transaction_index.value(row),
        });
    }
    Ok(logs)
}

/// Convert decoded ERC-20 transfers into a batch of [`ERC20_SCHEMA`].
///
/// # Errors
///
/// Returns an error if the batch cannot be assembled.
pub fn erc20_to_batch(rows: &[Erc20Transfer]) -> Result<RecordBatch> {
    let batch = RecordBatch::try_new(
        Arc::clone(&ERC20_SCHEMA),
        vec![
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|t| t.block_number))),
            Arc::new(
                TimestampSecondArray::from_iter_values(
                    rows.iter().map(|t| t.block_timestamp.timestamp()),
                )
                .with_timezone("UTC"),
            ),
            text_column(rows.iter().map(|t| format!("{:#x}", t.transaction_hash))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.contract_address))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.from_address))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.to_address))),
            text_column(rows.iter().map(|t| t.value.to_string())),
            Arc::new(
                TimestampMillisecondArray::from_iter_values(
                    rows.iter().map(|t| t.processed_timestamp.timestamp_millis()),
                )
                .with_timezone("UTC"),
            ),
        ],
    )?;
    Ok(batch)
}

/// Convert decoded ERC-721 transfers into a batch of [`ERC721_SCHEMA`].
///
/// # Errors
///
/// Returns an error if the batch cannot be assembled.
pub fn erc721_to_batch(rows: &[Erc721Transfer]) -> Result<RecordBatch> {
    let batch = RecordBatch::try_new(
        Arc::clone(&ERC721_SCHEMA),
        vec![
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|t| t.block_number))),
            Arc::new(
                TimestampSecondArray::from_iter_values(
                    rows.iter().map(|t| t.block_timestamp.timestamp()),
                )
                .with_timezone("UTC"),
            ),
            text_column(rows.iter().map(|t| format!("{:#x}", t.transaction_hash))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.contract_address))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.from_address))),
            text_column(rows.iter().map(|t| format!("{:#x}", t.to_address))),
            text_column(rows.iter().map(|t| t.id.to_string())),
            Arc::new(
                TimestampMillisecondArray::from_iter_values(
                    rows.iter().map(|t| t.processed_timestamp.timestamp_millis()),
                )
                .with_timezone("UTC"),
            ),
        ],
    )?;
    Ok(batch)
}

fn text_column(values: impl Iterator<Item = String>) -> Arc<StringArray> {
    Arc::new(StringArray::from_iter_values(values))
}

/// Convert checkpoints into a batch of [`CHECKPOINT_SCHEMA`].
///
/// # Errors
///
/// Returns an error if the batch cannot be assembled.
pub fn checkpoints_to_batch(rows: &[Checkpoint]) -> Result<RecordBatch> {
    let batch = RecordBatch::try_new(
        Arc::clone(&CHECKPOINT_SCHEMA),
        vec![
            Arc::new(UInt64Array::from_iter_values(
                rows.iter().map(|c| c.last_processed_block),
            )),
            Arc::new(
                TimestampMillisecondArray::from_iter_values(
                    rows.iter().map(|c| c.processed_at.timestamp_millis()),
                )
                .with_timezone("UTC"),
            ),
        ],
    )?;
    Ok(batch)
}

/// All checkpoint rows of a batch.
///
/// # Errors
///
/// Returns an error if the batch does not match [`CHECKPOINT_SCHEMA`].
pub fn checkpoints_from_batch(batch: &RecordBatch) -> Result<Vec<Checkpoint>> {
    let blocks = column::<UInt64Array>(batch, "block_number")?;
    let stamps = column::<TimestampMillisecondArray>(batch, "processed_timestamp")?;
    (0..batch.num_rows())
        .map(|row| {
            let millis = stamps.value(row);
            Ok(Checkpoint {
                last_processed_block: blocks.value(row),
                processed_at: DateTime::from_timestamp_millis(millis)
                    .with_context(|| format!("checkpoint timestamp {millis}ms out of range"))?,
            })
        })
        .collect()
}

/// Return the maximum `block_number` value across all batches.
///
/// # Errors
///
/// Returns an error if a non-empty batch has no `block_number` column.
pub fn max_block_number(batches: &[RecordBatch]) -> Result<Option<u64>> {
    let mut max = None;
    for batch in batches.iter().filter(|b| b.num_rows() > 0) {
        let col = column::<UInt64Array>(batch, "block_number")?;
        max = max.max(col.values().iter().copied().max());
    }
    Ok(max)
}

/// Total rows across batches.
#[must_use]
pub fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(RecordBatch::num_rows).sum()
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("column {name} has an unexpected type"))
}

fn from_seconds(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).with_context(|| format!("timestamp {secs}s out of range"))
}

/// Read all existing record batches from a Parquet file.
///
/// Returns an empty vec if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read(path: &Path) -> Result<Vec<RecordBatch>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet header: {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader: {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("reading batches from {}", path.display()))
}

/// Write record batches to a Parquet file using Zstd compression.
///
/// Uses atomic write (temp file + rename) to prevent corruption.
///
/// # Errors
///
/// Returns an error on I/O failure or if the Parquet writer rejects the data.
pub fn write(path: &Path, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("parquet.tmp");
    let file =
        std::fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;

    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::ZSTD(
            parquet::basic::ZstdLevel::try_new(3).context("invalid zstd level")?,
        ))
        .build();

    let mut writer = ArrowWriter::try_new(file, Arc::clone(schema), Some(props))?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;

    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} → {}", tmp.display(), path.display()))?;

    Ok(())
}

/// Append one batch to a table file, creating it if needed.
///
/// Returns the number of rows appended.
///
/// # Errors
///
/// Returns an error if the existing file cannot be read, was written with a
/// different schema, or the rewrite fails.
pub fn append(path: &Path, schema: &SchemaRef, batch: RecordBatch) -> Result<usize> {
    let mut batches = read(path)?;
    if let Some(existing) = batches.first() {
        if existing.schema().fields() != schema.fields() {
            bail!("{} has an unexpected schema", path.display());
        }
    }
    let rows = batch.num_rows();
    batches.push(batch);
    write(path, schema, &batches)?;
    tracing::debug!(path = %path.display(), appended = rows, total = row_count(&batches), "table rewritten");
    Ok(rows)
}

/// Create an empty table file if none exists. Returns whether one was created.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn create(path: &Path, schema: &SchemaRef) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write(path, schema, &[])?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, U256};
    use chrono::TimeZone;

    use super::*;

    fn raw(block_number: u64, topics: usize) -> RawLog {
        RawLog {
            address: format!("{:#x}", Address::repeat_byte(0xaa)),
            block_hash: format!("{:#x}", B256::repeat_byte(0xbb)),
            block_number,
            block_timestamp: Utc.timestamp_opt(1_690_000_000, 0).unwrap(),
            data: "0x64".to_owned(),
            log_index: 3,
            removed: false,
            topics: (0..topics).map(|i| format!("0x{i:064x}")).collect(),
            transaction_hash: format!("{:#x}", B256::repeat_byte(0xcc)),
            transaction_index: 7,
        }
    }

    #[test]
    fn raw_logs_survive_parquet_and_range_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw_logs.parquet");
        let logs = vec![raw(9, 3), raw(10, 4), raw(12, 0), raw(16, 1)];
        append(&path, &RAW_LOG_SCHEMA, raw_logs_to_batch(&logs).unwrap()).unwrap();

        let batches = read(&path).unwrap();
        let mut found = Vec::new();
        for batch in &batches {
            found.extend(raw_logs_in_range(batch, 10, 15).unwrap());
        }
        assert_eq!(found, vec![logs[1].clone(), logs[2].clone()]);
        assert_eq!(max_block_number(&batches).unwrap(), Some(16));
    }

    #[test]
    fn too_many_topics_are_rejected() {
        assert!(raw_logs_to_batch(&[raw(1, 5)]).is_err());
    }

    #[test]
    fn append_accumulates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.parquet");
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        for block in [5, 8] {
            let rows = [Checkpoint {
                last_processed_block: block,
                processed_at: at,
            }];
            append(&path, &CHECKPOINT_SCHEMA, checkpoints_to_batch(&rows).unwrap()).unwrap();
        }
        let batches = read(&path).unwrap();
        assert_eq!(row_count(&batches), 2);
        let rows = checkpoints_from_batch(&batches[1]).unwrap();
        assert_eq!(rows[0].last_processed_block, 8);
        assert_eq!(rows[0].processed_at, at);
    }

    #[test]
    fn append_refuses_foreign_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.parquet");
        append(&path, &RAW_LOG_SCHEMA, raw_logs_to_batch(&[raw(1, 3)]).unwrap()).unwrap();
        let batch = checkpoints_to_batch(&[]).unwrap();
        assert!(append(&path, &CHECKPOINT_SCHEMA, batch).is_err());
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("erc721.parquet");
        assert!(create(&path, &ERC721_SCHEMA).unwrap());
        assert!(!create(&path, &ERC721_SCHEMA).unwrap());
        assert_eq!(row_count(&read(&path).unwrap()), 0);
    }

    #[test]
    fn erc20_values_are_decimal_text() {
        let at = Utc.timestamp_opt(1_690_000_000, 0).unwrap();
        let row = Erc20Transfer {
            from_address: Address::repeat_byte(1),
            to_address: Address::repeat_byte(2),
            value: U256::MAX,
            contract_address: Address::repeat_byte(3),
            transaction_hash: B256::repeat_byte(4),
            block_number: 11,
            block_timestamp: at,
            processed_timestamp: at,
        };
        let batch = erc20_to_batch(&[row]).unwrap();
        let value = column::<StringArray>(&batch, "value").unwrap();
        assert_eq!(value.value(0), U256::MAX.to_string());
        let from = column::<StringArray>(&batch, "from_address").unwrap();
        assert_eq!(from.value(0), format!("0x{}", "01".repeat(20)));
    }
}
