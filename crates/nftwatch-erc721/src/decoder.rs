//! ERC721 Transfer decoder

use anyhow::Result;
use ethabi::{Event, ParamType};
use nftwatch::etl::decoder::{abi, Decoder};
use nftwatch::etl::event::{EventKind, RawLog, TokenStandard, TransferEvent};

/// ERC721 event decoder
///
/// Decodes `Transfer(address indexed from, address indexed to, uint256 indexed tokenId)`.
///
/// ERC-20 emits the same signature with only `from` and `to` indexed. Such a
/// log has 3 topics, does not match the event definition and yields nothing.
pub struct Erc721Decoder {
    transfer: Event,
}

impl Erc721Decoder {
    pub fn new() -> Self {
        Self {
            transfer: abi::event(
                "Transfer",
                &[
                    ("from", ParamType::Address, true),
                    ("to", ParamType::Address, true),
                    ("tokenId", ParamType::Uint(256), true),
                ],
            ),
        }
    }

    fn decode_transfer(&self, log: &RawLog) -> Option<TransferEvent> {
        let decoded = abi::parse_log(&self.transfer, log).ok().and_then(|parsed| {
            Some((
                abi::address(&parsed, "from")?,
                abi::address(&parsed, "to")?,
                abi::uint(&parsed, "tokenId")?,
            ))
        });

        let Some((from, to, token_id)) = decoded else {
            tracing::warn!(
                target: "nftwatch_erc721::decoder",
                token = %format!("{:#x}", log.address),
                tx_hash = %format!("{:#x}", log.transaction_hash),
                block_number = log.block_number,
                topics_len = log.topics.len(),
                "Malformed ERC721 Transfer event"
            );
            return None;
        };

        Some(TransferEvent {
            contract: log.address,
            token_id,
            from,
            to,
            block_num: log.block_number,
            log_index: log.log_index,
            tx_hash: log.transaction_hash,
            standard: TokenStandard::Erc721,
            value: None,
        })
    }
}

impl Default for Erc721Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Erc721Decoder {
    fn decoder_name(&self) -> &str {
        "erc721"
    }

    fn standard(&self) -> TokenStandard {
        TokenStandard::Erc721
    }

    fn decode_log(&self, log: &RawLog) -> Result<Vec<TransferEvent>> {
        match log.kind() {
            Some(EventKind::Transfer) => Ok(self.decode_transfer(log).into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }
}
