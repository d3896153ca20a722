//! Core data model: raw log rows, decoded transfers, and checkpoints.

use std::fmt;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One event log row as stored in the raw log table.
///
/// Hex-encoded fields are kept as text: turning them into bytes is the
/// decoder's job, and a malformed row must not prevent the rest of a batch
/// from loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    /// Emitting contract, `0x`-prefixed hex.
    pub address: String,
    /// Hash of the containing block.
    pub block_hash: String,
    /// Number of the containing block.
    pub block_number: u64,
    /// Timestamp of the containing block.
    pub block_timestamp: DateTime<Utc>,
    /// Non-indexed payload, `0x`-prefixed hex (may be `0x`).
    pub data: String,
    /// Position of the log within the block.
    pub log_index: u64,
    /// Set when the log was dropped by a reorg.
    pub removed: bool,
    /// Indexed topics; `topics[0]` is the event signature hash.
    pub topics: Vec<String>,
    /// Hash of the emitting transaction.
    pub transaction_hash: String,
    /// Position of the transaction within the block.
    pub transaction_index: u64,
}

/// Token standard of a decoded transfer, also the sink discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStandard {
    /// Fungible token transfer (3 topics, amount in data).
    Erc20,
    /// Non-fungible token transfer (4 topics, token id indexed).
    Erc721,
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Erc20 => "erc20",
            Self::Erc721 => "erc721",
        })
    }
}

/// A decoded ERC-20 `Transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Transfer {
    /// Sender (`topics[1]`).
    pub from_address: Address,
    /// Recipient (`topics[2]`).
    pub to_address: Address,
    /// Amount transferred, in token base units.
    pub value: U256,
    /// Token contract that emitted the log.
    pub contract_address: Address,
    /// Transaction that emitted the log.
    pub transaction_hash: B256,
    /// Block containing the log.
    pub block_number: u64,
    /// Timestamp of that block.
    pub block_timestamp: DateTime<Utc>,
    /// When this record was decoded.
    pub processed_timestamp: DateTime<Utc>,
}

/// A decoded ERC-721 `Transfer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc721Transfer {
    /// Block containing the log.
    pub block_number: u64,
    /// Timestamp of that block.
    pub block_timestamp: DateTime<Utc>,
    /// Transaction that emitted the log.
    pub transaction_hash: B256,
    /// Previous owner (`topics[1]`).
    pub from_address: Address,
    /// New owner (`topics[2]`).
    pub to_address: Address,
    /// Token id (`topics[3]`).
    pub id: U256,
    /// Collection contract that emitted the log.
    pub contract_address: Address,
    /// When this record was decoded.
    pub processed_timestamp: DateTime<Utc>,
}

/// Result of decoding a single classified log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedTransfer {
    /// An ERC-20 transfer.
    Erc20(Erc20Transfer),
    /// An ERC-721 transfer.
    Erc721(Erc721Transfer),
}

/// A batch of decoded records handed to a [`TransferSink`](crate::TransferSink).
#[derive(Debug, Clone, Copy)]
pub enum Transfers<'a> {
    /// Records for the ERC-20 table.
    Erc20(&'a [Erc20Transfer]),
    /// Records for the ERC-721 table.
    Erc721(&'a [Erc721Transfer]),
}

impl Transfers<'_> {
    /// Which output table the batch belongs to.
    #[must_use]
    pub const fn kind(&self) -> TokenStandard {
        match self {
            Self::Erc20(_) => TokenStandard::Erc20,
            Self::Erc721(_) => TokenStandard::Erc721,
        }
    }

    /// Number of records in the batch.
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Erc20(rows) => rows.len(),
            Self::Erc721(rows) => rows.len(),
        }
    }

    /// Whether the batch has no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A processing checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Highest block with decoded records in the run that wrote this row.
    pub last_processed_block: u64,
    /// When the row was written.
    pub processed_at: DateTime<Utc>,
}
