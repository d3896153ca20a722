//! Error types for the transfer decoder.
//!
//! Run-level errors ([`Error`]) are never returned out of
//! [`Pipeline::run_once`](crate::Pipeline::run_once); they are folded into
//! the [`RunReport`](crate::RunReport) together with an [`ErrorKind`].
//! Per-log problems are [`DecodeError`]s; they only skip the log and are
//! counted in the report, so they have no run-level variant.

use serde::Serialize;

use crate::types::TokenStandard;

/// Boxed error returned by store implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while running the decode pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The raw log table could not be checked or queried.
    #[error("log source unavailable: {message}")]
    SourceUnavailable {
        /// What the run was doing when the source failed.
        message: String,
        /// Underlying store error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Appending a decoded record set failed.
    #[error("writing {kind} transfers failed: {source}")]
    SinkWrite {
        /// Which record set failed.
        kind: TokenStandard,
        /// Underlying store error.
        #[source]
        source: BoxError,
    },

    /// Reading or appending a checkpoint failed.
    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[source] BoxError),
}

impl Error {
    /// Classification used in run reports.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::SinkWrite { .. } => ErrorKind::SinkWrite,
            Self::Checkpoint(_) => ErrorKind::Checkpoint,
        }
    }

    pub(crate) fn source_unavailable(message: impl Into<String>, source: BoxError) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Error classification reported alongside a non-successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::Configuration`].
    Configuration,
    /// See [`Error::SourceUnavailable`].
    SourceUnavailable,
    /// See [`Error::SinkWrite`].
    SinkWrite,
    /// See [`Error::Checkpoint`].
    Checkpoint,
}

/// Why a single raw log could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A topic is not valid hex.
    #[error("topic {index} is not valid hex: {reason}")]
    TopicHex {
        /// Position of the topic in the log.
        index: usize,
        /// Parser message.
        reason: String,
    },

    /// A topic does not decode to 32 bytes.
    #[error("topic {index} is {len} bytes, expected 32")]
    TopicLength {
        /// Position of the topic in the log.
        index: usize,
        /// Decoded byte length.
        len: usize,
    },

    /// The data payload is not valid hex.
    #[error("data is not valid hex: {0}")]
    DataHex(String),

    /// The data payload has more than 256 significant bits.
    #[error("data is {0} bytes, does not fit in uint256")]
    ValueOverflow(usize),

    /// The emitting contract address is not a 20-byte hex value.
    #[error("contract address {0:?} is not a valid address")]
    ContractAddress(String),

    /// The transaction hash is not a 32-byte hex value.
    #[error("transaction hash {0:?} is not a valid hash")]
    TransactionHash(String),
}
