//! Decode ERC-20 and ERC-721 `Transfer` events from raw Ethereum logs.
//!
//! The crate is storage-agnostic. A [`Pipeline`] is bound to three stores
//! ([`LogSource`], [`TransferSink`], [`CheckpointStore`]) and each call to
//! [`Pipeline::run_once`] processes one small block range:
//!
//! 1. resolve the range from the latest recent checkpoint,
//! 2. fetch raw logs for it,
//! 3. classify and decode them with a [`Decoder`],
//! 4. append ERC-20 and ERC-721 records to their tables,
//! 5. append a checkpoint for the highest decoded block.
//!
//! The outcome is always a [`RunReport`]; store failures never escape as
//! errors.
//!
//! ```
//! use erc_transfers::{Decoder, RawLog, TokenStandard, TRANSFER_TOPIC};
//!
//! let word = |b: u8| format!("0x{}{}", "00".repeat(12), format!("{b:02x}").repeat(20));
//! let log = RawLog {
//!     address: format!("0x{}", "aa".repeat(20)),
//!     block_hash: format!("0x{}", "bb".repeat(32)),
//!     block_number: 17_816_430,
//!     block_timestamp: chrono::Utc::now(),
//!     data: "0x64".to_owned(),
//!     log_index: 0,
//!     removed: false,
//!     topics: vec![format!("{TRANSFER_TOPIC:#x}"), word(1), word(2)],
//!     transaction_hash: format!("0x{}", "cc".repeat(32)),
//!     transaction_index: 0,
//! };
//! assert_eq!(Decoder::new().classify(&log), Some(TokenStandard::Erc20));
//! ```

pub mod decode;
pub mod error;
pub mod run;
pub mod store;
pub mod types;

pub use decode::{Decoded, Decoder, TRANSFER_EVENT_SIGNATURE, TRANSFER_TOPIC};
pub use error::{BoxError, DecodeError, Error, ErrorKind, Result};
pub use run::{BlockRange, Pipeline, RunConfig, RunReport, RunStatus};
pub use store::{CheckpointStore, LogSource, TransferSink};
pub use types::{Checkpoint, DecodedTransfer, Erc20Transfer, Erc721Transfer, RawLog, TokenStandard, Transfers};
