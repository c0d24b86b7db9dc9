//! ERC1155 event decoder (TransferSingle, TransferBatch)

use anyhow::Result;
use ethabi::{Event, Log, ParamType};
use nftwatch::etl::decoder::{abi, Decoder};
use nftwatch::etl::event::{Address, EventKind, RawLog, TokenStandard, TransferEvent, U256};

/// ERC1155 event decoder
///
/// Decodes:
/// - TransferSingle(operator, from, to, id, value)
/// - TransferBatch(operator, from, to, ids[], values[])
///
/// A batch yields one event per (id, value) pair, in array order; all of them
/// share the log's from, to, transaction hash and log index.
pub struct Erc1155Decoder {
    transfer_single: Event,
    transfer_batch: Event,
}

impl Erc1155Decoder {
    pub fn new() -> Self {
        let parties = [
            ("operator", ParamType::Address, true),
            ("from", ParamType::Address, true),
            ("to", ParamType::Address, true),
        ];

        let mut single = parties.to_vec();
        single.extend([("id", ParamType::Uint(256), false), ("value", ParamType::Uint(256), false)]);

        let mut batch = parties.to_vec();
        batch.extend([("ids", abi::uint256_array(), false), ("values", abi::uint256_array(), false)]);

        Self {
            transfer_single: abi::event("TransferSingle", &single),
            transfer_batch: abi::event("TransferBatch", &batch),
        }
    }

    fn malformed(log: &RawLog, kind: &str, reason: &str) {
        tracing::warn!(
            target: "nftwatch_erc1155::decoder",
            token = %format!("{:#x}", log.address),
            tx_hash = %format!("{:#x}", log.transaction_hash),
            block_number = log.block_number,
            topics_len = log.topics.len(),
            data_len = log.data.len(),
            reason,
            "Malformed ERC1155 {} event",
            kind
        );
    }

    /// `from` and `to`; topics[1] is the operator and is not recorded.
    fn parties(parsed: &Log) -> Option<(Address, Address)> {
        Some((abi::address(parsed, "from")?, abi::address(parsed, "to")?))
    }

    fn event(log: &RawLog, (from, to): (Address, Address), token_id: U256, value: U256) -> TransferEvent {
        TransferEvent {
            contract: log.address,
            token_id,
            from,
            to,
            block_num: log.block_number,
            log_index: log.log_index,
            tx_hash: log.transaction_hash,
            standard: TokenStandard::Erc1155,
            value: Some(value),
        }
    }

    fn decode_single(&self, log: &RawLog) -> Vec<TransferEvent> {
        let parsed = match abi::parse_log(&self.transfer_single, log) {
            Ok(parsed) => parsed,
            Err(e) => {
                Self::malformed(log, "TransferSingle", &e.to_string());
                return Vec::new();
            }
        };
        let (Some(parties), Some(id), Some(value)) = (
            Self::parties(&parsed),
            abi::uint(&parsed, "id"),
            abi::uint(&parsed, "value"),
        ) else {
            Self::malformed(log, "TransferSingle", "missing parameter");
            return Vec::new();
        };

        vec![Self::event(log, parties, id, value)]
    }

    fn decode_batch(&self, log: &RawLog) -> Vec<TransferEvent> {
        let parsed = match abi::parse_log(&self.transfer_batch, log) {
            Ok(parsed) => parsed,
            Err(e) => {
                Self::malformed(log, "TransferBatch", &e.to_string());
                return Vec::new();
            }
        };
        let (Some(parties), Some(ids), Some(values)) = (
            Self::parties(&parsed),
            abi::uint_array(&parsed, "ids"),
            abi::uint_array(&parsed, "values"),
        ) else {
            Self::malformed(log, "TransferBatch", "missing parameter");
            return Vec::new();
        };
        if ids.len() != values.len() {
            Self::malformed(log, "TransferBatch", "id and value arrays differ in length");
            return Vec::new();
        }

        ids.into_iter()
            .zip(values)
            .map(|(id, value)| Self::event(log, parties, id, value))
            .collect()
    }
}

impl Default for Erc1155Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Erc1155Decoder {
    fn decoder_name(&self) -> &str {
        "erc1155"
    }

    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc1155
    }

    fn decode_log(&self, log: &RawLog) -> Result<Vec<TransferEvent>> {
        Ok(match log.kind() {
            Some(EventKind::TransferSingle) => self.decode_single(log),
            Some(EventKind::TransferBatch) => self.decode_batch(log),
            _ => Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethabi::Token;
    use nftwatch::etl::event::{H256, TRANSFER_BATCH_SIGNATURE, TRANSFER_SINGLE_SIGNATURE};

    fn address_topic(byte: u8) -> H256 {
        H256::from(Address::repeat_byte(byte))
    }

    fn uints(values: &[u64]) -> Token {
        Token::Array(values.iter().map(|v| Token::Uint(U256::from(*v))).collect())
    }

    fn log(signature: H256, data: Vec<u8>) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xbb),
            topics: vec![signature, address_topic(0x0f), address_topic(0x01), address_topic(0x02)],
            data,
            block_number: 99,
            transaction_hash: H256::repeat_byte(0x33),
            log_index: 4,
        }
    }

    #[test]
    fn test_event_signatures() {
        let decoder = Erc1155Decoder::new();
        assert_eq!(decoder.transfer_single.signature(), TRANSFER_SINGLE_SIGNATURE);
        assert_eq!(decoder.transfer_batch.signature(), TRANSFER_BATCH_SIGNATURE);
    }

    #[test]
    fn test_decode_transfer_single() {
        let data = ethabi::encode(&[Token::Uint(U256::from(7)), Token::Uint(U256::from(25))]);
        let events = Erc1155Decoder::new()
            .decode_log(&log(TRANSFER_SINGLE_SIGNATURE, data))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token_id, U256::from(7));
        assert_eq!(events[0].value, Some(U256::from(25)));
        // topics[1] is the operator, not the sender.
        assert_eq!(events[0].from, Address::repeat_byte(0x01));
        assert_eq!(events[0].to, Address::repeat_byte(0x02));
    }

    #[test]
    fn test_transfer_single_short_data() {
        let data = ethabi::encode(&[Token::Uint(U256::from(7))]);
        let events = Erc1155Decoder::new()
            .decode_log(&log(TRANSFER_SINGLE_SIGNATURE, data))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_decode_transfer_batch_fans_out() {
        let data = ethabi::encode(&[uints(&[1, 2, 3]), uints(&[10, 20, 30])]);
        let events = Erc1155Decoder::new()
            .decode_log(&log(TRANSFER_BATCH_SIGNATURE, data))
            .unwrap();

        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.token_id, U256::from(i as u64 + 1));
            assert_eq!(event.value, Some(U256::from((i as u64 + 1) * 10)));
            assert_eq!(event.from, Address::repeat_byte(0x01));
            assert_eq!(event.to, Address::repeat_byte(0x02));
            assert_eq!(event.tx_hash, H256::repeat_byte(0x33));
            assert_eq!(event.log_index, 4);
        }
    }

    #[test]
    fn test_transfer_batch_mismatched_arrays() {
        let data = ethabi::encode(&[uints(&[1, 2]), uints(&[10])]);
        let events = Erc1155Decoder::new()
            .decode_log(&log(TRANSFER_BATCH_SIGNATURE, data))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_transfer_batch_truncated() {
        let mut data = ethabi::encode(&[uints(&[1, 2, 3]), uints(&[10, 20, 30])]);
        data.truncate(5 * 32);
        let events = Erc1155Decoder::new()
            .decode_log(&log(TRANSFER_BATCH_SIGNATURE, data))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_missing_topics() {
        let data = ethabi::encode(&[Token::Uint(U256::from(7)), Token::Uint(U256::from(25))]);
        let mut short = log(TRANSFER_SINGLE_SIGNATURE, data);
        short.topics.truncate(3);
        assert!(Erc1155Decoder::new().decode_log(&short).unwrap().is_empty());
    }
}
