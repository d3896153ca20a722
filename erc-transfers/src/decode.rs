//! Classification and decoding of `Transfer` logs.
//!
//! ERC-20 and ERC-721 share the event signature
//! `Transfer(address,address,uint256)`; they differ only in whether the
//! third parameter is indexed. A log is therefore classified by its topic
//! count first and its signature hash second:
//!
//! | topics | topic 0            | result   |
//! |--------|--------------------|----------|
//! | 4      | any (see [`Decoder::strict_erc721_signature`]) | ERC-721 |
//! | 3      | Transfer hash      | ERC-20   |
//! | other  |                    | skipped  |

use alloy::hex;
use alloy::primitives::{Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::types::{DecodedTransfer, Erc20Transfer, Erc721Transfer, RawLog, TokenStandard};

sol! {
    /// The shared ERC-20 / ERC-721 transfer event.
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Canonical signature of the transfer event.
pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// `keccak256("Transfer(address,address,uint256)")`, the expected `topics[0]`.
pub const TRANSFER_TOPIC: B256 = Transfer::SIGNATURE_HASH;

/// Stateless log classifier and decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    strict_erc721_signature: bool,
}

/// Output of [`Decoder::decode_logs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Decoded ERC-20 transfers, in input order.
    pub erc20: Vec<Erc20Transfer>,
    /// Decoded ERC-721 transfers, in input order.
    pub erc721: Vec<Erc721Transfer>,
    /// Logs that matched a transfer shape but could not be decoded.
    pub failures: usize,
    /// Logs that matched neither shape.
    pub unclassified: usize,
}

impl Decoded {
    /// Total number of decoded records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.erc20.len() + self.erc721.len()
    }

    /// Whether nothing was decoded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.erc20.is_empty() && self.erc721.is_empty()
    }

    /// Highest block number across all decoded records.
    #[must_use]
    pub fn max_block(&self) -> Option<u64> {
        let erc20 = self.erc20.iter().map(|t| t.block_number);
        let erc721 = self.erc721.iter().map(|t| t.block_number);
        erc20.chain(erc721).max()
    }
}

impl Decoder {
    /// Decoder that treats every 4-topic log as an ERC-721 transfer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            strict_erc721_signature: false,
        }
    }

    /// Require `topics[0]` to be the Transfer hash for ERC-721 logs too.
    ///
    /// Off by default: without it any 4-topic log, whatever its event, is
    /// decoded as an ERC-721 transfer.
    #[must_use]
    pub const fn strict_erc721_signature(mut self, strict: bool) -> Self {
        self.strict_erc721_signature = strict;
        self
    }

    /// Classify a log by shape without decoding any field.
    #[must_use]
    pub fn classify(&self, log: &RawLog) -> Option<TokenStandard> {
        let signature_matches = || log.topics.first().is_some_and(|t| is_transfer_topic(t));
        match log.topics.len() {
            4 if !self.strict_erc721_signature || signature_matches() => {
                Some(TokenStandard::Erc721)
            }
            3 if signature_matches() => Some(TokenStandard::Erc20),
            _ => None,
        }
    }

    /// Decode one log.
    ///
    /// Returns `Ok(None)` for logs that are not transfers.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the log has a transfer shape but one of
    /// its fields is malformed.
    pub fn decode_log(
        &self,
        log: &RawLog,
        processed_at: DateTime<Utc>,
    ) -> Result<Option<DecodedTransfer>, DecodeError> {
        let Some(standard) = self.classify(log) else {
            return Ok(None);
        };

        let from_address = topic_address(&log.topics, 1)?;
        let to_address = topic_address(&log.topics, 2)?;
        let contract_address = log
            .address
            .parse::<Address>()
            .map_err(|_| DecodeError::ContractAddress(log.address.clone()))?;
        let transaction_hash = log
            .transaction_hash
            .parse::<B256>()
            .map_err(|_| DecodeError::TransactionHash(log.transaction_hash.clone()))?;

        let decoded = match standard {
            TokenStandard::Erc20 => DecodedTransfer::Erc20(Erc20Transfer {
                from_address,
                to_address,
                value: decode_uint(&log.data)?,
                contract_address,
                transaction_hash,
                block_number: log.block_number,
                block_timestamp: log.block_timestamp,
                processed_timestamp: processed_at,
            }),
            TokenStandard::Erc721 => DecodedTransfer::Erc721(Erc721Transfer {
                block_number: log.block_number,
                block_timestamp: log.block_timestamp,
                transaction_hash,
                from_address,
                to_address,
                id: U256::from_be_bytes(topic_word(&log.topics, 3)?.0),
                contract_address,
                processed_timestamp: processed_at,
            }),
        };
        Ok(Some(decoded))
    }

    /// Decode a batch, skipping logs that are not transfers or fail to decode.
    ///
    /// Failures are logged with enough context to find the offending row and
    /// counted in [`Decoded::failures`]; they never abort the batch.
    #[must_use]
    pub fn decode_logs(&self, logs: &[RawLog], processed_at: DateTime<Utc>) -> Decoded {
        let mut out = Decoded::default();
        for (index, log) in logs.iter().enumerate() {
            match self.decode_log(log, processed_at) {
                Ok(Some(DecodedTransfer::Erc20(t))) => out.erc20.push(t),
                Ok(Some(DecodedTransfer::Erc721(t))) => out.erc721.push(t),
                Ok(None) => out.unclassified += 1,
                Err(e) => {
                    out.failures += 1;
                    tracing::warn!(
                        index,
                        block_number = log.block_number,
                        log_index = log.log_index,
                        transaction_hash = %log.transaction_hash,
                        error = %e,
                        "skipping undecodable log"
                    );
                }
            }
        }
        out
    }
}

/// Whether `topic` is the Transfer signature hash, compared as bytes so hex
/// case and the `0x` prefix do not matter.
#[must_use]
pub fn is_transfer_topic(topic: &str) -> bool {
    topic.parse::<B256>().is_ok_and(|t| t == TRANSFER_TOPIC)
}

/// Decode `topics[index]` as a 32-byte word.
fn topic_word(topics: &[String], index: usize) -> Result<B256, DecodeError> {
    let topic = topics
        .get(index)
        .ok_or(DecodeError::TopicLength { index, len: 0 })?;
    let bytes = hex::decode(topic).map_err(|e| DecodeError::TopicHex {
        index,
        reason: e.to_string(),
    })?;
    B256::try_from(bytes.as_slice()).map_err(|_| DecodeError::TopicLength {
        index,
        len: bytes.len(),
    })
}

/// The address held in the low 20 bytes of `topics[index]`.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the topic is missing, not hex, or not
/// exactly 32 bytes.
pub fn topic_address(topics: &[String], index: usize) -> Result<Address, DecodeError> {
    topic_word(topics, index).map(Address::from_word)
}

/// Decode a hex payload as a big-endian unsigned integer; empty is zero.
///
/// # Errors
///
/// Returns a [`DecodeError`] if `data` is not hex or has more than 32
/// significant bytes.
pub fn decode_uint(data: &str) -> Result<U256, DecodeError> {
    let bytes = hex::decode(data).map_err(|e| DecodeError::DataHex(e.to_string()))?;
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = bytes.get(start..).unwrap_or_default();
    if significant.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::try_from_be_slice(significant).ok_or(DecodeError::ValueOverflow(significant.len()))
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, keccak256};
    use chrono::TimeZone;

    use super::*;

    const FROM: Address = address!("1111111111111111111111111111111111111111");
    const TO: Address = address!("2222222222222222222222222222222222222222");
    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const TX: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";

    fn padded(addr: Address) -> String {
        format!("{:#x}", addr.into_word())
    }

    fn log(block_number: u64, topics: Vec<String>, data: &str) -> RawLog {
        RawLog {
            address: TOKEN.to_owned(),
            block_hash: format!("{:#x}", B256::repeat_byte(0xbb)),
            block_number,
            block_timestamp: Utc.timestamp_opt(1_690_000_000, 0).unwrap(),
            data: data.to_owned(),
            log_index: 0,
            removed: false,
            topics,
            transaction_hash: TX.to_owned(),
            transaction_index: 0,
        }
    }

    fn erc20_log(data: &str) -> RawLog {
        log(
            17_816_430,
            vec![format!("{TRANSFER_TOPIC:#x}"), padded(FROM), padded(TO)],
            data,
        )
    }

    fn erc721_log(topic0: &str, id: u64) -> RawLog {
        log(
            17_816_431,
            vec![
                topic0.to_owned(),
                padded(FROM),
                padded(TO),
                format!("{:#x}", B256::from(U256::from(id).to_be_bytes::<32>())),
            ],
            "0x",
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn transfer_topic_is_keccak_of_signature() {
        assert_eq!(TRANSFER_TOPIC, keccak256(TRANSFER_EVENT_SIGNATURE));
        assert_eq!(
            format!("{TRANSFER_TOPIC:#x}"),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn decodes_erc20_transfer() {
        let decoded = Decoder::new()
            .decode_log(&erc20_log("0x64"), now())
            .unwrap()
            .unwrap();
        let DecodedTransfer::Erc20(t) = decoded else {
            panic!("expected erc20, got {decoded:?}");
        };
        assert_eq!(t.from_address, FROM);
        assert_eq!(t.to_address, TO);
        assert_eq!(t.value, U256::from(100));
        assert_eq!(t.contract_address, TOKEN.parse::<Address>().unwrap());
        assert_eq!(t.transaction_hash, TX.parse::<B256>().unwrap());
        assert_eq!(t.block_number, 17_816_430);
        assert_eq!(t.processed_timestamp, now());
    }

    #[test]
    fn erc20_signature_compare_ignores_case() {
        let mut l = erc20_log("0x01");
        l.topics[0] = l.topics[0].to_uppercase().replacen("0X", "0x", 1);
        assert_eq!(Decoder::new().classify(&l), Some(TokenStandard::Erc20));
    }

    #[test]
    fn empty_data_is_zero_value() {
        for data in ["", "0x"] {
            let Some(DecodedTransfer::Erc20(t)) =
                Decoder::new().decode_log(&erc20_log(data), now()).unwrap()
            else {
                panic!("expected erc20 for data {data:?}");
            };
            assert_eq!(t.value, U256::ZERO);
        }
    }

    #[test]
    fn full_word_value_decodes() {
        let wei = U256::from(10u64).pow(U256::from(18));
        let data = format!("{:#x}", B256::from(wei.to_be_bytes::<32>()));
        let Some(DecodedTransfer::Erc20(t)) =
            Decoder::new().decode_log(&erc20_log(&data), now()).unwrap()
        else {
            panic!("expected erc20");
        };
        assert_eq!(t.value, U256::from(1_000_000_000_000_000_000u64));
    }

    #[test]
    fn three_topics_with_other_signature_is_unclassified() {
        let mut l = erc20_log("0x64");
        // Approval(address,address,uint256)
        l.topics[0] =
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925".to_owned();
        assert_eq!(Decoder::new().decode_log(&l, now()), Ok(None));
    }

    #[test]
    fn four_topics_decode_as_erc721_with_indexed_id() {
        let decoded = Decoder::new()
            .decode_log(&erc721_log(&format!("{TRANSFER_TOPIC:#x}"), 42), now())
            .unwrap()
            .unwrap();
        let DecodedTransfer::Erc721(t) = decoded else {
            panic!("expected erc721, got {decoded:?}");
        };
        assert_eq!(t.from_address, FROM);
        assert_eq!(t.to_address, TO);
        assert_eq!(t.id, U256::from(42));
        assert_eq!(t.block_number, 17_816_431);
    }

    #[test]
    fn four_topics_ignore_signature_unless_strict() {
        let other = format!("{:#x}", B256::repeat_byte(0x01));
        let l = erc721_log(&other, 7);
        assert_eq!(Decoder::new().classify(&l), Some(TokenStandard::Erc721));
        assert_eq!(
            Decoder::new().strict_erc721_signature(true).classify(&l),
            None
        );
        let l = erc721_log(&format!("{TRANSFER_TOPIC:#x}"), 7);
        assert_eq!(
            Decoder::new().strict_erc721_signature(true).classify(&l),
            Some(TokenStandard::Erc721)
        );
    }

    #[test]
    fn other_shapes_produce_nothing() {
        let topic0 = format!("{TRANSFER_TOPIC:#x}");
        for topics in [
            vec![],
            vec![topic0.clone()],
            vec![topic0.clone(), padded(FROM)],
            vec![topic0.clone(), padded(FROM), padded(TO), padded(TO), padded(TO)],
        ] {
            let decoded = Decoder::new().decode_logs(&[log(1, topics, "0x64")], now());
            assert!(decoded.is_empty());
            assert_eq!(decoded.failures, 0);
            assert_eq!(decoded.unclassified, 1);
        }
    }

    #[test]
    fn non_hex_data_is_skipped_without_aborting_batch() {
        let logs = vec![
            erc20_log("0xnothex"),
            erc20_log("0x0a"),
            erc721_log("0x00", 1),
        ];
        let decoded = Decoder::new().decode_logs(&logs, now());
        assert_eq!(decoded.failures, 1);
        assert_eq!(decoded.erc20.len(), 1);
        assert_eq!(decoded.erc20[0].value, U256::from(10));
        assert_eq!(decoded.erc721.len(), 1);
    }

    #[test]
    fn short_topic_is_a_decode_error() {
        let mut l = erc20_log("0x01");
        l.topics[1] = format!("{FROM:#x}");
        assert_eq!(
            Decoder::new().decode_log(&l, now()),
            Err(DecodeError::TopicLength { index: 1, len: 20 })
        );
    }

    #[test]
    fn oversized_value_is_a_decode_error() {
        let data = format!("0x01{}", "00".repeat(32));
        assert_eq!(decode_uint(&data), Err(DecodeError::ValueOverflow(33)));
        let padded_zero = format!("0x{}", "00".repeat(40));
        assert_eq!(decode_uint(&padded_zero), Ok(U256::ZERO));
    }

    #[test]
    fn max_block_spans_both_standards() {
        let decoded = Decoder::new().decode_logs(
            &[erc20_log("0x64"), erc721_log("0x00", 3)],
            now(),
        );
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.max_block(), Some(17_816_431));
        assert_eq!(Decoded::default().max_block(), None);
    }
}
